use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use meshgen_types::Mesh;

use super::GIB;
use crate::mesh_io::obj::{self, ObjOptions};
use crate::stages::{Stage, TexturedAsset, TextureSynthesis};

const ALPHA_THRESHOLD: u8 = 128;
const FILL: [u8; 3] = [128, 128, 128];
const METALLIC: u8 = 0;
const ROUGHNESS: u8 = 204;

/// Projects the reference view onto the mesh along the view axis.
#[derive(Debug, Clone)]
pub struct ProjectionPainter {
    model: String,
    texture_size: u32,
}

impl ProjectionPainter {
    pub fn new(model: impl Into<String>, texture_size: u32) -> Self {
        Self {
            model: model.into(),
            texture_size: texture_size.max(8),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Default for ProjectionPainter {
    fn default() -> Self {
        Self::new("builtin", 512)
    }
}

impl Stage for ProjectionPainter {
    fn name(&self) -> &'static str {
        "projection painter"
    }

    fn footprint_bytes(&self) -> u64 {
        6 * GIB
    }
}

/// `textured_mesh.obj` -> `textured_mesh<suffix>.<ext>` next to it.
pub(crate) fn sibling(obj_path: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = obj_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "textured_mesh".to_string());
    obj_path.with_file_name(format!("{stem}{suffix}.{ext}"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl TextureSynthesis for ProjectionPainter {
    fn paint(&self, mesh: &Mesh, reference: &RgbaImage, output_obj: &Path) -> anyhow::Result<TexturedAsset> {
        let (min, max) = mesh.bounds().context("cannot texture an empty mesh")?;
        ensure!(reference.width() > 0 && reference.height() > 0, "reference image has no pixels");

        let dx = (max[0] - min[0]).max(f32::EPSILON);
        let dy = (max[1] - min[1]).max(f32::EPSILON);
        let uvs = mesh
            .vertices
            .iter()
            .map(|v| [(v[0] - min[0]) / dx, 1.0 - (v[1] - min[1]) / dy])
            .collect();
        let mut textured = mesh.clone();
        textured.uvs = Some(uvs);

        let albedo = self.albedo_from(reference);
        let size = self.texture_size;
        let albedo_path = sibling(output_obj, "", "jpg");
        let metallic_path = sibling(output_obj, "_metallic", "jpg");
        let roughness_path = sibling(output_obj, "_roughness", "jpg");
        let mtl_path = sibling(output_obj, "", "mtl");

        albedo
            .save(&albedo_path)
            .with_context(|| format!("writing {}", albedo_path.display()))?;
        GrayImage::from_pixel(size, size, Luma([METALLIC]))
            .save(&metallic_path)
            .with_context(|| format!("writing {}", metallic_path.display()))?;
        GrayImage::from_pixel(size, size, Luma([ROUGHNESS]))
            .save(&roughness_path)
            .with_context(|| format!("writing {}", roughness_path.display()))?;

        fs::write(
            &mtl_path,
            obj::encode_material(&file_name(&albedo_path), &file_name(&metallic_path), &file_name(&roughness_path)),
        )
        .with_context(|| format!("writing {}", mtl_path.display()))?;

        let mtl_name = file_name(&mtl_path);
        let options = ObjOptions {
            material_lib: Some(&mtl_name),
        };
        fs::write(output_obj, obj::encode(&textured, &options))
            .with_context(|| format!("writing {}", output_obj.display()))?;

        Ok(TexturedAsset {
            mesh: textured,
            obj_path: output_obj.to_path_buf(),
            mtl_path,
            albedo_path,
            metallic_path,
            roughness_path,
        })
    }
}

impl ProjectionPainter {
    /// Crop to the foreground, flatten alpha onto grey, resize to a square.
    fn albedo_from(&self, reference: &RgbaImage) -> RgbImage {
        let (x0, y0, w, h) = foreground_bounds(reference).unwrap_or((0, 0, reference.width(), reference.height()));
        let cropped = imageops::crop_imm(reference, x0, y0, w, h).to_image();
        let resized = imageops::resize(&cropped, self.texture_size, self.texture_size, FilterType::Triangle);
        RgbImage::from_fn(self.texture_size, self.texture_size, |x, y| {
            let px = resized.get_pixel(x, y);
            let a = px[3] as f32 / 255.0;
            Rgb([0, 1, 2].map(|c| (px[c] as f32 * a + FILL[c] as f32 * (1.0 - a)).round() as u8))
        })
    }
}

fn foreground_bounds(image: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, px) in image.enumerate_pixels() {
        if px[3] >= ALPHA_THRESHOLD {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 - x0 + 1, y1 - y0 + 1))
}
