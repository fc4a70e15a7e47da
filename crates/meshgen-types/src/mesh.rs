//! Indexed triangle mesh shared by the stages and the file writers.

/// Indexed triangle mesh.
///
/// `uvs`, when present, run parallel to `vertices` and use the glTF
/// convention (origin top-left, v pointing down). Writers for formats with
/// a bottom-left origin flip v themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub uvs: Option<Vec<[f32; 2]>>,
}

impl Mesh {
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            uvs: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty() || self.vertices.is_empty()
    }

    /// Axis-aligned bounds, `None` for a mesh without vertices.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.vertices.first()?;
        let mut min = first;
        let mut max = first;
        for v in &self.vertices[1..] {
            for axis in 0..3 {
                min[axis] = min[axis].min(v[axis]);
                max[axis] = max[axis].max(v[axis]);
            }
        }
        Some((min, max))
    }

    /// Every face index points at an existing vertex and uvs match vertices.
    pub fn is_consistent(&self) -> bool {
        let n = self.vertices.len() as u32;
        let faces_ok = self.faces.iter().all(|f| f.iter().all(|&i| i < n));
        let uvs_ok = self
            .uvs
            .as_ref()
            .map_or(true, |uvs| uvs.len() == self.vertices.len());
        faces_ok && uvs_ok
    }

    /// Unnormalized face normal (cross product of two edges).
    pub fn face_normal(&self, face: [u32; 3]) -> [f32; 3] {
        let a = self.vertices[face[0] as usize];
        let b = self.vertices[face[1] as usize];
        let c = self.vertices[face[2] as usize];
        cross(sub(b, a), sub(c, a))
    }

    /// Area-weighted, normalized per-vertex normals.
    pub fn vertex_normals(&self) -> Vec<[f32; 3]> {
        let mut normals = vec![[0.0f32; 3]; self.vertices.len()];
        for &face in &self.faces {
            let n = self.face_normal(face);
            for &i in &face {
                let acc = &mut normals[i as usize];
                acc[0] += n[0];
                acc[1] += n[1];
                acc[2] += n[2];
            }
        }
        normals.into_iter().map(normalize).collect()
    }

    /// Drop vertices no face references, remapping indices and uvs.
    pub fn compact(self) -> Mesh {
        let mut remap = vec![u32::MAX; self.vertices.len()];
        let mut vertices = Vec::new();
        let mut uvs = self.uvs.as_ref().map(|_| Vec::new());
        let mut faces = Vec::with_capacity(self.faces.len());

        for face in &self.faces {
            let mut mapped = [0u32; 3];
            for (slot, &old) in mapped.iter_mut().zip(face.iter()) {
                let old = old as usize;
                if remap[old] == u32::MAX {
                    remap[old] = vertices.len() as u32;
                    vertices.push(self.vertices[old]);
                    if let (Some(dst), Some(src)) = (uvs.as_mut(), self.uvs.as_ref()) {
                        dst.push(src[old]);
                    }
                }
                *slot = remap[old];
            }
            faces.push(mapped);
        }

        Mesh {
            vertices,
            faces,
            uvs,
        }
    }
}

pub fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len <= f32::EPSILON {
        [0.0, 0.0, 1.0]
    } else {
        [v[0] / len, v[1] / len, v[2] / len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_with_orphan() -> Mesh {
        Mesh::new(
            vec![
                [0.0, 0.0, 0.0],
                [9.0, 9.0, 9.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            vec![[0, 2, 3], [0, 3, 4]],
        )
    }

    #[test]
    fn test_compact_drops_unreferenced_vertices() {
        let mesh = quad_with_orphan().compact();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.face_count(), 2);
        assert!(mesh.is_consistent());
        assert!(!mesh.vertices.contains(&[9.0, 9.0, 9.0]));
    }

    #[test]
    fn test_bounds() {
        let (min, max) = quad_with_orphan().bounds().unwrap();
        assert_eq!(min, [0.0, 0.0, 0.0]);
        assert_eq!(max, [9.0, 9.0, 9.0]);
        assert!(Mesh::default().bounds().is_none());
    }

    #[test]
    fn test_vertex_normals_face_up() {
        let mesh = quad_with_orphan().compact();
        for n in mesh.vertex_normals() {
            assert!((n[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_inconsistent_uvs_detected() {
        let mut mesh = quad_with_orphan();
        mesh.uvs = Some(vec![[0.0, 0.0]]);
        assert!(!mesh.is_consistent());
    }
}
