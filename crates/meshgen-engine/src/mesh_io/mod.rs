//! Mesh file writers (glb, obj, ply, stl) and a GLB reader for the files
//! this service writes itself.

pub mod glb;
pub mod obj;
pub mod ply;
pub mod stl;

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use meshgen_types::Mesh;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshFormat {
    Glb,
    Obj,
    Ply,
    Stl,
}

impl MeshFormat {
    pub const ALL: [MeshFormat; 4] = [MeshFormat::Glb, MeshFormat::Obj, MeshFormat::Ply, MeshFormat::Stl];

    pub fn extension(&self) -> &'static str {
        match self {
            MeshFormat::Glb => "glb",
            MeshFormat::Obj => "obj",
            MeshFormat::Ply => "ply",
            MeshFormat::Stl => "stl",
        }
    }

    /// Formats able to carry a material with texture maps.
    pub fn supports_texture(&self) -> bool {
        matches!(self, MeshFormat::Glb | MeshFormat::Obj)
    }
}

impl fmt::Display for MeshFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for MeshFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('.');
        MeshFormat::ALL
            .into_iter()
            .find(|f| f.extension().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unsupported file type '{s}' (expected glb, obj, ply or stl)"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Emit per-vertex normals where the format has a slot for them.
    pub include_normals: bool,
    /// Free-form metadata stored in the GLB `asset.extras`.
    pub extras: Option<serde_json::Value>,
}

pub fn encode_mesh(mesh: &Mesh, format: MeshFormat, options: &WriteOptions) -> io::Result<Vec<u8>> {
    if mesh.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot export an empty mesh"));
    }
    if !mesh.is_consistent() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "mesh has out-of-range face indices"));
    }
    match format {
        MeshFormat::Glb => glb::encode(
            mesh,
            &glb::GlbOptions {
                include_normals: options.include_normals,
                extras: options.extras.as_ref(),
                material: None,
            },
        ),
        MeshFormat::Obj => Ok(obj::encode(mesh, &obj::ObjOptions::default())),
        MeshFormat::Ply => Ok(ply::encode(mesh)),
        MeshFormat::Stl => Ok(stl::encode(mesh)),
    }
}

pub fn write_mesh(mesh: &Mesh, format: MeshFormat, path: &Path, options: &WriteOptions) -> io::Result<()> {
    let bytes = encode_mesh(mesh, format, options)?;
    fs::write(path, bytes)
}
