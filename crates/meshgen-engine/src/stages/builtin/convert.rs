use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use super::MIB;
use crate::mesh_io::glb::{self, EmbeddedImage, GlbOptions, PbrMaterial};
use crate::stages::{FormatConversion, Stage, TexturedAsset};

/// Packs a textured OBJ asset into a single GLB with a PBR material.
#[derive(Debug, Clone, Default)]
pub struct GlbPacker;

impl Stage for GlbPacker {
    fn name(&self) -> &'static str {
        "glb packer"
    }

    fn footprint_bytes(&self) -> u64 {
        16 * MIB
    }
}

impl FormatConversion for GlbPacker {
    fn convert(&self, asset: &TexturedAsset, glb_path: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(asset.mesh.uvs.is_some(), "textured asset has no UV coordinates");
        let albedo = fs::read(&asset.albedo_path)
            .with_context(|| format!("reading {}", asset.albedo_path.display()))?;
        let metallic_roughness = pack_metallic_roughness(&asset.metallic_path, &asset.roughness_path)?;

        let options = GlbOptions {
            include_normals: true,
            extras: None,
            material: Some(PbrMaterial {
                base_color: EmbeddedImage {
                    mime_type: "image/jpeg",
                    bytes: &albedo,
                },
                metallic_roughness: Some(EmbeddedImage {
                    mime_type: "image/png",
                    bytes: &metallic_roughness,
                }),
                metallic_factor: 1.0,
                roughness_factor: 1.0,
            }),
        };
        glb::write(&asset.mesh, glb_path, &options).with_context(|| format!("writing {}", glb_path.display()))
    }
}

/// glTF wants roughness in green and metallic in blue of one texture.
fn pack_metallic_roughness(metallic: &Path, roughness: &Path) -> anyhow::Result<Vec<u8>> {
    let metallic = image::open(metallic)
        .with_context(|| format!("reading {}", metallic.display()))?
        .to_luma8();
    let roughness = image::open(roughness)
        .with_context(|| format!("reading {}", roughness.display()))?
        .to_luma8();
    anyhow::ensure!(
        metallic.dimensions() == roughness.dimensions(),
        "metallic and roughness maps differ in size"
    );

    let (w, h) = metallic.dimensions();
    let packed = RgbImage::from_fn(w, h, |x, y| Rgb([0, roughness.get_pixel(x, y)[0], metallic.get_pixel(x, y)[0]]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(packed).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
