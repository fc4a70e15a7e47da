//! Stage capability traits.
//!
//! Each heavy capability is an opaque trait object produced by a loader in
//! the [`StageRegistry`](crate::registry::StageRegistry). The orchestrator
//! only ever talks to these traits, so any implementation (the built-in
//! reference stages, a remote model, a test fake) can be swapped in.

pub mod builtin;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use meshgen_types::{InputImage, Mesh, ViewName};

/// Common metadata every stage exposes.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Nominal device memory held while the stage is loaded.
    fn footprint_bytes(&self) -> u64 {
        0
    }
}

pub trait BackgroundRemoval: Stage {
    fn remove_background(&self, image: &RgbaImage) -> anyhow::Result<RgbaImage>;
}

pub trait ImageTo3D: Stage {
    fn generate(&self, views: &ViewSet, params: &ShapeParams) -> anyhow::Result<Mesh>;
}

pub trait TextToImage: Stage {
    fn generate(&self, caption: &str) -> anyhow::Result<InputImage>;
}

pub trait MeshCleanup: Stage {
    fn clean(&self, mesh: Mesh) -> anyhow::Result<Mesh>;
}

pub trait FaceReduction: Stage {
    /// Reduce to at most `max_faces`, or the stage's own default budget.
    fn reduce(&self, mesh: Mesh, max_faces: Option<usize>) -> anyhow::Result<Mesh>;
}

pub trait TextureSynthesis: Stage {
    /// Paint `mesh` from `reference`, writing the textured OBJ to `output_obj`
    /// and its material files next to it.
    fn paint(&self, mesh: &Mesh, reference: &RgbaImage, output_obj: &Path) -> anyhow::Result<TexturedAsset>;
}

pub trait FormatConversion: Stage {
    fn convert(&self, asset: &TexturedAsset, glb_path: &Path) -> anyhow::Result<()>;
}

/// Parameters forwarded to the image-to-3D stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeParams {
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: u64,
    pub octree_resolution: u32,
    pub num_chunks: u32,
}

/// The views actually supplied for one run, background already handled.
#[derive(Debug, Clone, Default)]
pub struct ViewSet {
    views: BTreeMap<ViewName, RgbaImage>,
}

impl ViewSet {
    pub fn single(image: RgbaImage) -> Self {
        Self::from_map(BTreeMap::from([(ViewName::Front, image)]))
    }

    pub fn from_map(views: BTreeMap<ViewName, RgbaImage>) -> Self {
        Self { views }
    }

    pub fn get(&self, view: ViewName) -> Option<&RgbaImage> {
        self.views.get(&view)
    }

    /// `front` when supplied, otherwise the first supplied view.
    pub fn primary(&self) -> Option<(ViewName, &RgbaImage)> {
        self.views.iter().next().map(|(name, image)| (*name, image))
    }

    pub fn names(&self) -> Vec<ViewName> {
        self.views.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Output of texture synthesis: the UV-mapped mesh and the files written.
#[derive(Debug, Clone)]
pub struct TexturedAsset {
    pub mesh: Mesh,
    pub obj_path: PathBuf,
    pub mtl_path: PathBuf,
    pub albedo_path: PathBuf,
    pub metallic_path: PathBuf,
    pub roughness_path: PathBuf,
}

impl TexturedAsset {
    pub fn files(&self) -> Vec<&Path> {
        vec![
            self.obj_path.as_path(),
            self.mtl_path.as_path(),
            self.albedo_path.as_path(),
            self.metallic_path.as_path(),
            self.roughness_path.as_path(),
        ]
    }
}

pub struct TexturePipeline {
    pub synthesis: Box<dyn TextureSynthesis>,
    pub conversion: Box<dyn FormatConversion>,
}

/// Every stage instance produced by one successful load.
pub struct StageSet {
    pub background_removal: Box<dyn BackgroundRemoval>,
    pub image_to_3d: Box<dyn ImageTo3D>,
    pub mesh_cleanup: Box<dyn MeshCleanup>,
    pub face_reduction: Box<dyn FaceReduction>,
    pub texture: Option<TexturePipeline>,
    pub text_to_image: Option<Box<dyn TextToImage>>,
}

impl StageSet {
    pub fn footprint_bytes(&self) -> u64 {
        let mut total = self.background_removal.footprint_bytes()
            + self.image_to_3d.footprint_bytes()
            + self.mesh_cleanup.footprint_bytes()
            + self.face_reduction.footprint_bytes();
        if let Some(texture) = &self.texture {
            total += texture.synthesis.footprint_bytes() + texture.conversion.footprint_bytes();
        }
        if let Some(t2i) = &self.text_to_image {
            total += t2i.footprint_bytes();
        }
        total
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec![
            self.background_removal.name(),
            self.image_to_3d.name(),
            self.mesh_cleanup.name(),
            self.face_reduction.name(),
        ];
        if let Some(texture) = &self.texture {
            names.push(texture.synthesis.name());
            names.push(texture.conversion.name());
        }
        if let Some(t2i) = &self.text_to_image {
            names.push(t2i.name());
        }
        names
    }
}
