use std::collections::{HashMap, HashSet};

use meshgen_types::Mesh;

use super::MIB;
use crate::stages::{FaceReduction, Stage};

pub const DEFAULT_MAX_FACES: usize = 40_000;
const SHRINK: f64 = 0.85;

/// Vertex-clustering decimation: snap vertices to a uniform grid, merge
/// each cell into its centroid and drop collapsed faces. The grid is
/// coarsened until the face budget is met.
#[derive(Debug, Clone)]
pub struct ClusterDecimator {
    default_max_faces: usize,
}

impl Default for ClusterDecimator {
    fn default() -> Self {
        Self {
            default_max_faces: DEFAULT_MAX_FACES,
        }
    }
}

impl ClusterDecimator {
    pub fn new(default_max_faces: usize) -> Self {
        Self {
            default_max_faces: default_max_faces.max(1),
        }
    }
}

impl Stage for ClusterDecimator {
    fn name(&self) -> &'static str {
        "cluster decimator"
    }

    fn footprint_bytes(&self) -> u64 {
        32 * MIB
    }
}

impl FaceReduction for ClusterDecimator {
    fn reduce(&self, mesh: Mesh, max_faces: Option<usize>) -> anyhow::Result<Mesh> {
        let target = max_faces.unwrap_or(self.default_max_faces).max(1);
        if mesh.face_count() <= target {
            return Ok(mesh);
        }
        let Some((min, max)) = mesh.bounds() else {
            return Ok(mesh);
        };
        let extent = (0..3).map(|a| max[a] - min[a]).fold(f32::EPSILON, f32::max);

        let mut resolution = ((mesh.face_count() as f64).sqrt() * 2.0).ceil() as u32;
        loop {
            let reduced = cluster(&mesh, min, extent, resolution.max(1));
            if reduced.face_count() <= target || resolution <= 1 {
                log::debug!(
                    target: "pipeline",
                    "Face reduction {} -> {} (grid {resolution})",
                    mesh.face_count(),
                    reduced.face_count()
                );
                return Ok(reduced);
            }
            resolution = ((resolution as f64 * SHRINK).floor() as u32).min(resolution - 1);
        }
    }
}

fn cluster(mesh: &Mesh, min: [f32; 3], extent: f32, resolution: u32) -> Mesh {
    let cell_of = |v: [f32; 3]| -> [u32; 3] {
        let mut cell = [0u32; 3];
        for axis in 0..3 {
            let t = ((v[axis] - min[axis]) / extent * resolution as f32).floor();
            cell[axis] = (t.max(0.0) as u32).min(resolution - 1);
        }
        cell
    };

    let mut cell_index: HashMap<[u32; 3], u32> = HashMap::new();
    let mut sums: Vec<([f64; 3], u32)> = Vec::new();
    let mut remap = Vec::with_capacity(mesh.vertex_count());
    for &v in &mesh.vertices {
        let next = sums.len() as u32;
        let idx = *cell_index.entry(cell_of(v)).or_insert(next);
        if idx == next {
            sums.push(([0.0; 3], 0));
        }
        let (sum, count) = &mut sums[idx as usize];
        for axis in 0..3 {
            sum[axis] += v[axis] as f64;
        }
        *count += 1;
        remap.push(idx);
    }

    let vertices = sums
        .iter()
        .map(|(sum, count)| {
            let n = *count as f64;
            [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32]
        })
        .collect();

    let mut seen = HashSet::new();
    let mut faces = Vec::new();
    for f in &mesh.faces {
        let mapped = [remap[f[0] as usize], remap[f[1] as usize], remap[f[2] as usize]];
        if mapped[0] == mapped[1] || mapped[1] == mapped[2] || mapped[0] == mapped[2] {
            continue;
        }
        let mut key = mapped;
        key.sort_unstable();
        if seen.insert(key) {
            faces.push(mapped);
        }
    }

    Mesh::new(vertices, faces).compact()
}
