//! Wavefront OBJ/MTL text writers.

use std::fmt::Write as _;

use meshgen_types::Mesh;

#[derive(Debug, Clone, Default)]
pub struct ObjOptions<'a> {
    /// File name written as `mtllib`, with `usemtl material_0`.
    pub material_lib: Option<&'a str>,
}

pub const MATERIAL_NAME: &str = "material_0";

pub fn encode(mesh: &Mesh, options: &ObjOptions<'_>) -> Vec<u8> {
    let mut out = String::with_capacity(mesh.vertex_count() * 40 + mesh.face_count() * 24);
    out.push_str("# meshgen\n");
    if let Some(lib) = options.material_lib {
        let _ = writeln!(out, "mtllib {lib}");
    }
    for v in &mesh.vertices {
        let _ = writeln!(out, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2]);
    }

    let textured = mesh.uvs.is_some();
    if let Some(uvs) = &mesh.uvs {
        for uv in uvs {
            // OBJ puts the texture origin bottom-left.
            let _ = writeln!(out, "vt {:.6} {:.6}", uv[0], 1.0 - uv[1]);
        }
    }
    if options.material_lib.is_some() {
        let _ = writeln!(out, "usemtl {MATERIAL_NAME}");
    }
    for f in &mesh.faces {
        let (a, b, c) = (f[0] + 1, f[1] + 1, f[2] + 1);
        if textured {
            let _ = writeln!(out, "f {a}/{a} {b}/{b} {c}/{c}");
        } else {
            let _ = writeln!(out, "f {a} {b} {c}");
        }
    }
    out.into_bytes()
}

/// MTL referencing an albedo map plus the PBR metallic and roughness maps.
pub fn encode_material(albedo: &str, metallic: &str, roughness: &str) -> Vec<u8> {
    format!(
        "newmtl {MATERIAL_NAME}\nKa 1.000000 1.000000 1.000000\nKd 1.000000 1.000000 1.000000\nKs 0.000000 0.000000 0.000000\nillum 2\nmap_Kd {albedo}\nmap_Pm {metallic}\nmap_Pr {roughness}\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Mesh {
        Mesh::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], vec![[0, 1, 2]])
    }

    #[test]
    fn test_plain_obj() {
        let text = String::from_utf8(encode(&triangle(), &ObjOptions::default())).unwrap();
        assert!(text.contains("v 1.000000 0.000000 0.000000\n"));
        assert!(text.ends_with("f 1 2 3\n"));
        assert!(!text.contains("mtllib"));
    }

    #[test]
    fn test_textured_obj_flips_v() {
        let mut mesh = triangle();
        mesh.uvs = Some(vec![[0.0, 0.0], [1.0, 0.25], [0.0, 1.0]]);
        let options = ObjOptions {
            material_lib: Some("textured_mesh.mtl"),
        };
        let text = String::from_utf8(encode(&mesh, &options)).unwrap();
        assert!(text.contains("mtllib textured_mesh.mtl\n"));
        assert!(text.contains("vt 1.000000 0.750000\n"));
        assert!(text.contains("usemtl material_0\n"));
        assert!(text.contains("f 1/1 2/2 3/3\n"));
    }

    #[test]
    fn test_material_references_maps() {
        let text = String::from_utf8(encode_material("a.jpg", "a_metallic.jpg", "a_roughness.jpg")).unwrap();
        assert!(text.contains("map_Kd a.jpg"));
        assert!(text.contains("map_Pm a_metallic.jpg"));
        assert!(text.contains("map_Pr a_roughness.jpg"));
    }
}
