use meshgen_types::mesh::cross;
use meshgen_types::mesh::sub;
use meshgen_types::Mesh;

use super::MIB;
use crate::stages::{MeshCleanup, Stage};

const MIN_DOUBLE_AREA: f32 = 1e-12;

/// Drops degenerate faces and floaters, then compacts the vertex buffer.
#[derive(Debug, Clone, Default)]
pub struct TopologyCleaner;

impl Stage for TopologyCleaner {
    fn name(&self) -> &'static str {
        "topology cleaner"
    }

    fn footprint_bytes(&self) -> u64 {
        64 * MIB
    }
}

impl MeshCleanup for TopologyCleaner {
    fn clean(&self, mesh: Mesh) -> anyhow::Result<Mesh> {
        let before = mesh.face_count();
        let mut mesh = remove_degenerate(mesh);
        mesh = keep_largest_component(mesh);
        let mesh = mesh.compact();
        if mesh.face_count() != before {
            log::debug!(target: "pipeline", "Mesh cleanup removed {} faces", before - mesh.face_count());
        }
        anyhow::ensure!(!mesh.is_empty(), "mesh cleanup removed every face");
        Ok(mesh)
    }
}

fn remove_degenerate(mut mesh: Mesh) -> Mesh {
    let vertices = &mesh.vertices;
    mesh.faces.retain(|f| {
        if f[0] == f[1] || f[1] == f[2] || f[0] == f[2] {
            return false;
        }
        let [a, b, c] = [vertices[f[0] as usize], vertices[f[1] as usize], vertices[f[2] as usize]];
        let n = cross(sub(b, a), sub(c, a));
        n[0] * n[0] + n[1] * n[1] + n[2] * n[2] > MIN_DOUBLE_AREA * MIN_DOUBLE_AREA
    });
    mesh
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Keep the connected component (by shared vertices) with the most faces.
fn keep_largest_component(mut mesh: Mesh) -> Mesh {
    if mesh.faces.is_empty() {
        return mesh;
    }
    let mut parent: Vec<usize> = (0..mesh.vertices.len()).collect();
    for f in &mesh.faces {
        let root = find(&mut parent, f[0] as usize);
        for &other in &f[1..] {
            let other_root = find(&mut parent, other as usize);
            if other_root != root {
                parent[other_root] = root;
            }
        }
    }

    let mut face_counts = std::collections::HashMap::new();
    let roots: Vec<usize> = mesh
        .faces
        .iter()
        .map(|f| find(&mut parent, f[0] as usize))
        .collect();
    for &root in &roots {
        *face_counts.entry(root).or_insert(0usize) += 1;
    }
    // Ties go to the lowest root so the result does not depend on hash order.
    let Some(largest) = face_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(root, _)| *root)
    else {
        return mesh;
    };

    let mut keep = roots.iter().map(|&r| r == largest);
    mesh.faces.retain(|_| keep.next().unwrap_or(false));
    mesh
}
