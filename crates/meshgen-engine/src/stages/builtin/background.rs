use anyhow::ensure;
use image::RgbaImage;

use super::MIB;
use crate::stages::{BackgroundRemoval, Stage};

/// Keys out the colour found along the image border, with a soft edge.
#[derive(Debug, Clone)]
pub struct BorderKeyRemover {
    tolerance: f32,
    feather: f32,
}

impl Default for BorderKeyRemover {
    fn default() -> Self {
        Self {
            tolerance: 40.0,
            feather: 24.0,
        }
    }
}

impl BorderKeyRemover {
    pub fn new(tolerance: f32, feather: f32) -> Self {
        Self {
            tolerance: tolerance.max(0.0),
            feather: feather.max(1.0),
        }
    }

    fn border_color(image: &RgbaImage) -> [f32; 3] {
        let (w, h) = image.dimensions();
        let mut sum = [0.0f64; 3];
        let mut count = 0u64;
        for (x, y, px) in image.enumerate_pixels() {
            if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                for c in 0..3 {
                    sum[c] += px[c] as f64;
                }
                count += 1;
            }
        }
        let n = count.max(1) as f64;
        [(sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32]
    }
}

impl Stage for BorderKeyRemover {
    fn name(&self) -> &'static str {
        "border-key background remover"
    }

    fn footprint_bytes(&self) -> u64 {
        176 * MIB
    }
}

impl BackgroundRemoval for BorderKeyRemover {
    fn remove_background(&self, image: &RgbaImage) -> anyhow::Result<RgbaImage> {
        ensure!(image.width() > 0 && image.height() > 0, "image has no pixels");
        let key = Self::border_color(image);
        let mut out = image.clone();
        for px in out.pixels_mut() {
            let d = ((px[0] as f32 - key[0]).powi(2) + (px[1] as f32 - key[1]).powi(2) + (px[2] as f32 - key[2]).powi(2)).sqrt();
            let coverage = ((d - self.tolerance) / self.feather).clamp(0.0, 1.0);
            let alpha = (coverage * 255.0).round() as u8;
            px[3] = px[3].min(alpha);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_keys_out_uniform_border() {
        let mut image = RgbaImage::from_pixel(16, 16, Rgba([250, 250, 250, 255]));
        for y in 5..11 {
            for x in 5..11 {
                image.put_pixel(x, y, Rgba([200, 30, 30, 255]));
            }
        }
        let out = BorderKeyRemover::default().remove_background(&image).unwrap();
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(out.get_pixel(8, 8)[3], 255);
        assert_eq!(out.get_pixel(8, 8)[0], 200);
    }

    #[test]
    fn test_existing_transparency_kept() {
        let mut image = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        image.put_pixel(4, 4, Rgba([255, 255, 255, 10]));
        let out = BorderKeyRemover::default().remove_background(&image).unwrap();
        assert_eq!(out.get_pixel(4, 4)[3], 10);
    }
}
