use image::{Rgb, RgbImage};
use meshgen_types::InputImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::GIB;
use crate::stages::{Stage, TextToImage};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Draws a caption-keyed blob on a white canvas. The same caption always
/// gives the same picture.
#[derive(Debug, Clone)]
pub struct CaptionSketch {
    size: u32,
}

impl Default for CaptionSketch {
    fn default() -> Self {
        Self { size: 512 }
    }
}

impl CaptionSketch {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(16) }
    }
}

fn caption_key(caption: &str) -> u64 {
    caption
        .trim()
        .to_lowercase()
        .bytes()
        .fold(FNV_OFFSET, |hash, b| (hash ^ b as u64).wrapping_mul(FNV_PRIME))
}

impl Stage for CaptionSketch {
    fn name(&self) -> &'static str {
        "caption sketch"
    }

    fn footprint_bytes(&self) -> u64 {
        3 * GIB
    }
}

impl TextToImage for CaptionSketch {
    fn generate(&self, caption: &str) -> anyhow::Result<InputImage> {
        anyhow::ensure!(!caption.trim().is_empty(), "caption is empty");
        let mut rng = StdRng::seed_from_u64(caption_key(caption));
        let size = self.size as f32;
        let rx = size * rng.gen_range(0.22..0.4);
        let ry = size * rng.gen_range(0.22..0.4);
        let color = Rgb([rng.gen_range(20..200), rng.gen_range(20..200), rng.gen_range(20..200)]);
        let (cx, cy) = (size / 2.0, size / 2.0);

        let image = RgbImage::from_fn(self.size, self.size, |x, y| {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                color
            } else {
                Rgb([255, 255, 255])
            }
        });
        Ok(InputImage::from_dynamic(image.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_caption_same_image() {
        let sketch = CaptionSketch::new(64);
        let a = sketch.generate("A red chair").unwrap();
        let b = sketch.generate("  a red chair ").unwrap();
        assert_eq!(a.pixels().as_raw(), b.pixels().as_raw());
        assert!(!a.has_alpha());
    }

    #[test]
    fn test_center_is_painted() {
        let image = CaptionSketch::new(64).generate("lamp").unwrap();
        assert_ne!(image.pixels().get_pixel(32, 32).0[..3], [255, 255, 255]);
        assert_eq!(image.pixels().get_pixel(0, 0).0[..3], [255, 255, 255]);
    }

    #[test]
    fn test_empty_caption_rejected() {
        assert!(CaptionSketch::default().generate(" ").is_err());
    }
}
