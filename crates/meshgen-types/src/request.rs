//! Generation request and its inputs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const MAX_SEED: u64 = 10_000_000;

pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 100;
pub const MIN_OCTREE_RESOLUTION: u32 = 16;
pub const MAX_OCTREE_RESOLUTION: u32 = 512;
pub const MIN_NUM_CHUNKS: u32 = 1_000;
pub const MAX_NUM_CHUNKS: u32 = 5_000_000;

pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_TURBO_STEPS: u32 = 5;
pub const DEFAULT_GUIDANCE_SCALE: f32 = 5.0;
pub const DEFAULT_SEED: u64 = 1234;
pub const DEFAULT_OCTREE_RESOLUTION: u32 = 256;
pub const DEFAULT_NUM_CHUNKS: u32 = 8_000;

/// Named camera view for multi-view input. Ordering is the priority order
/// used when picking the primary view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewName {
    Front,
    Back,
    Left,
    Right,
}

impl ViewName {
    pub const ALL: [ViewName; 4] = [ViewName::Front, ViewName::Back, ViewName::Left, ViewName::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewName::Front => "front",
            ViewName::Back => "back",
            ViewName::Left => "left",
            ViewName::Right => "right",
        }
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewName::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown view '{s}'"))
    }
}

/// Decoded input picture. Pixels are always held as RGBA; `has_alpha`
/// remembers whether the source actually carried an alpha channel, which
/// decides whether background removal is mandatory.
#[derive(Clone)]
pub struct InputImage {
    pixels: RgbaImage,
    has_alpha: bool,
}

impl InputImage {
    pub fn from_rgba(pixels: RgbaImage) -> Self {
        Self {
            pixels,
            has_alpha: true,
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        let has_alpha = image.color().has_alpha();
        Self {
            pixels: image.to_rgba8(),
            has_alpha,
        }
    }

    /// Decode PNG or JPEG bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        image::load_from_memory(bytes).map(Self::from_dynamic)
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

impl fmt::Debug for InputImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("has_alpha", &self.has_alpha)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum GenerationInput {
    Image(InputImage),
    MultiView(BTreeMap<ViewName, InputImage>),
    Caption(String),
}

impl GenerationInput {
    pub fn caption(&self) -> Option<&str> {
        match self {
            GenerationInput::Caption(text) => Some(text),
            _ => None,
        }
    }

    pub fn views(&self) -> Vec<ViewName> {
        match self {
            GenerationInput::MultiView(views) => views.keys().copied().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Fixed(u64),
    Randomize,
}

impl Seed {
    /// `Fixed` verbatim, `Randomize` drawn uniformly from `[0, MAX_SEED]`.
    pub fn resolve_with<R: FnOnce() -> u64>(self, draw: R) -> u64 {
        match self {
            Seed::Fixed(seed) => seed,
            Seed::Randomize => draw(),
        }
    }
}

/// One generation job. Constructed once, then only read.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub input: GenerationInput,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: Seed,
    pub octree_resolution: u32,
    pub remove_background: bool,
    pub num_chunks: u32,
}

impl GenerationRequest {
    pub fn new(input: GenerationInput) -> Self {
        Self {
            input,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: Seed::Fixed(DEFAULT_SEED),
            octree_resolution: DEFAULT_OCTREE_RESOLUTION,
            remove_background: true,
            num_chunks: DEFAULT_NUM_CHUNKS,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_octree_resolution(mut self, octree_resolution: u32) -> Self {
        self.octree_resolution = octree_resolution;
        self
    }

    pub fn with_remove_background(mut self, remove_background: bool) -> Self {
        self.remove_background = remove_background;
        self
    }

    pub fn with_num_chunks(mut self, num_chunks: u32) -> Self {
        self.num_chunks = num_chunks;
        self
    }

    /// Reject malformed requests before any side effect happens.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match &self.input {
            GenerationInput::Caption(text) if text.trim().is_empty() => {
                return Err(invalid("caption must not be empty"));
            }
            GenerationInput::MultiView(views) if views.is_empty() => {
                return Err(invalid("at least one view image is required"));
            }
            GenerationInput::MultiView(views) => {
                if let Some((name, _)) = views.iter().find(|(_, img)| is_blank(img)) {
                    return Err(invalid(format!("view '{name}' has no pixels")));
                }
            }
            GenerationInput::Image(img) if is_blank(img) => {
                return Err(invalid("input image has no pixels"));
            }
            _ => {}
        }

        if !(MIN_STEPS..=MAX_STEPS).contains(&self.steps) {
            return Err(invalid(format!(
                "steps must be between {MIN_STEPS} and {MAX_STEPS}, got {}",
                self.steps
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(invalid("guidance_scale must be a positive number"));
        }
        if !(MIN_OCTREE_RESOLUTION..=MAX_OCTREE_RESOLUTION).contains(&self.octree_resolution) {
            return Err(invalid(format!(
                "octree_resolution must be between {MIN_OCTREE_RESOLUTION} and {MAX_OCTREE_RESOLUTION}, got {}",
                self.octree_resolution
            )));
        }
        if !(MIN_NUM_CHUNKS..=MAX_NUM_CHUNKS).contains(&self.num_chunks) {
            return Err(invalid(format!(
                "num_chunks must be between {MIN_NUM_CHUNKS} and {MAX_NUM_CHUNKS}, got {}",
                self.num_chunks
            )));
        }
        if let Seed::Fixed(seed) = self.seed {
            if seed > MAX_SEED {
                return Err(invalid(format!("seed must be at most {MAX_SEED}, got {seed}")));
            }
        }
        Ok(())
    }
}

fn is_blank(image: &InputImage) -> bool {
    image.width() == 0 || image.height() == 0
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidRequest(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba};

    fn rgba(w: u32, h: u32) -> InputImage {
        InputImage::from_rgba(RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255])))
    }

    #[test]
    fn test_defaults_validate() {
        let request = GenerationRequest::new(GenerationInput::Image(rgba(4, 4)));
        assert_eq!(request.steps, DEFAULT_STEPS);
        assert_eq!(request.seed, Seed::Fixed(DEFAULT_SEED));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_parameters() {
        let base = || GenerationRequest::new(GenerationInput::Image(rgba(4, 4)));
        assert!(base().with_steps(0).validate().is_err());
        assert!(base().with_steps(101).validate().is_err());
        assert!(base().with_octree_resolution(8).validate().is_err());
        assert!(base().with_num_chunks(10).validate().is_err());
        assert!(base().with_guidance_scale(f32::NAN).validate().is_err());
        assert!(base().with_guidance_scale(0.0).validate().is_err());
        assert!(base().with_seed(Seed::Fixed(MAX_SEED + 1)).validate().is_err());
        assert!(base().with_seed(Seed::Fixed(MAX_SEED)).validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_inputs() {
        let caption = GenerationRequest::new(GenerationInput::Caption("   ".into()));
        assert!(matches!(caption.validate(), Err(PipelineError::InvalidRequest(_))));

        let views = GenerationRequest::new(GenerationInput::MultiView(BTreeMap::new()));
        assert!(views.validate().is_err());

        let blank = GenerationRequest::new(GenerationInput::Image(rgba(0, 0)));
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_alpha_detection_on_decode() {
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])));
        let image = InputImage::from_dynamic(rgb);
        assert!(!image.has_alpha());
        assert_eq!(image.pixels().get_pixel(0, 0)[3], 255);
    }

    #[test]
    fn test_seed_resolution() {
        assert_eq!(Seed::Fixed(7).resolve_with(|| 99), 7);
        assert_eq!(Seed::Randomize.resolve_with(|| 99), 99);
    }

    #[test]
    fn test_view_name_parsing_and_order() {
        assert_eq!("Front".parse::<ViewName>(), Ok(ViewName::Front));
        assert!("top".parse::<ViewName>().is_err());
        assert!(ViewName::Front < ViewName::Back && ViewName::Left < ViewName::Right);
    }
}
