use meshgen_types::mesh::normalize;
use meshgen_types::Mesh;

const HEADER: &[u8] = b"meshgen binary STL";

/// Binary STL: 80-byte header, face count, then one 50-byte record per face.
pub fn encode(mesh: &Mesh) -> Vec<u8> {
    let mut out = Vec::with_capacity(84 + mesh.face_count() * 50);
    let mut header = [0u8; 80];
    header[..HEADER.len()].copy_from_slice(HEADER);
    out.extend_from_slice(&header);
    out.extend_from_slice(&(mesh.face_count() as u32).to_le_bytes());

    for &face in &mesh.faces {
        let normal = normalize(mesh.face_normal(face));
        for c in normal {
            out.extend_from_slice(&c.to_le_bytes());
        }
        for &i in &face {
            for c in mesh.vertices[i as usize] {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    out
}
