//! Swappable loaders for every stage capability.
//!
//! The registry only knows how to *build* stages; instantiation happens in
//! the lifecycle manager, which decides when and in what order.

use std::sync::Arc;

use meshgen_config::ServerConfig;
use meshgen_types::Device;

use crate::stages::builtin::{
    BorderKeyRemover, CaptionSketch, ClusterDecimator, GlbPacker, ProjectionPainter, SilhouetteLifter,
    TopologyCleaner,
};
use crate::stages::{
    BackgroundRemoval, FaceReduction, FormatConversion, ImageTo3D, MeshCleanup, TextToImage, TextureSynthesis,
};

/// What a loader gets to know about the deployment.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub device: Device,
    pub shapegen_model: String,
    pub texgen_model: String,
    pub compile: bool,
}

impl LoadContext {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            device: config.device,
            shapegen_model: config.shapegen_model(),
            texgen_model: config.texgen_model(),
            compile: config.compile,
        }
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            shapegen_model: "builtin".into(),
            texgen_model: "builtin".into(),
            compile: false,
        }
    }
}

type Loader<T> = Arc<dyn Fn(&LoadContext) -> anyhow::Result<Box<T>> + Send + Sync>;

fn loader<T: ?Sized, F>(f: F) -> Loader<T>
where
    F: Fn(&LoadContext) -> anyhow::Result<Box<T>> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct TextureLoaders {
    synthesis: Loader<dyn TextureSynthesis>,
    conversion: Loader<dyn FormatConversion>,
}

#[derive(Clone)]
pub struct StageRegistry {
    background_removal: Loader<dyn BackgroundRemoval>,
    image_to_3d: Loader<dyn ImageTo3D>,
    mesh_cleanup: Loader<dyn MeshCleanup>,
    face_reduction: Loader<dyn FaceReduction>,
    texture: Option<TextureLoaders>,
    text_to_image: Option<Loader<dyn TextToImage>>,
}

impl StageRegistry {
    /// Built-in reference stages, with texture and text-to-image toggled by
    /// the server flags.
    pub fn builtin(config: &ServerConfig) -> Self {
        let mut registry = Self::builtin_core();
        if config.texture_enabled() {
            registry = registry.with_builtin_texture();
        }
        if config.enable_t23d {
            registry = registry.with_text_to_image(|_| Ok(Box::new(CaptionSketch::default())));
        }
        registry
    }

    /// Built-in shape-only stages; texture and text-to-image disabled.
    pub fn builtin_core() -> Self {
        Self {
            background_removal: loader::<dyn BackgroundRemoval, _>(|_| Ok(Box::new(BorderKeyRemover::default()))),
            image_to_3d: loader::<dyn ImageTo3D, _>(|ctx| {
                if ctx.compile {
                    log::info!(target: "lifecycle", "Compiling shape stage for {}", ctx.shapegen_model);
                }
                Ok(Box::new(SilhouetteLifter::new(ctx.shapegen_model.clone(), ctx.compile)))
            }),
            mesh_cleanup: loader::<dyn MeshCleanup, _>(|_| Ok(Box::new(TopologyCleaner))),
            face_reduction: loader::<dyn FaceReduction, _>(|_| Ok(Box::new(ClusterDecimator::default()))),
            texture: None,
            text_to_image: None,
        }
    }

    pub fn with_builtin_texture(self) -> Self {
        self.with_texture(
            |ctx| Ok(Box::new(ProjectionPainter::new(ctx.texgen_model.clone(), 512))),
            |_| Ok(Box::new(GlbPacker)),
        )
    }

    pub fn with_background_removal<F>(mut self, build: F) -> Self
    where
        F: Fn(&LoadContext) -> anyhow::Result<Box<dyn BackgroundRemoval>> + Send + Sync + 'static,
    {
        self.background_removal = Arc::new(build);
        self
    }

    pub fn with_image_to_3d<F>(mut self, build: F) -> Self
    where
        F: Fn(&LoadContext) -> anyhow::Result<Box<dyn ImageTo3D>> + Send + Sync + 'static,
    {
        self.image_to_3d = Arc::new(build);
        self
    }

    pub fn with_mesh_cleanup<F>(mut self, build: F) -> Self
    where
        F: Fn(&LoadContext) -> anyhow::Result<Box<dyn MeshCleanup>> + Send + Sync + 'static,
    {
        self.mesh_cleanup = Arc::new(build);
        self
    }

    pub fn with_face_reduction<F>(mut self, build: F) -> Self
    where
        F: Fn(&LoadContext) -> anyhow::Result<Box<dyn FaceReduction>> + Send + Sync + 'static,
    {
        self.face_reduction = Arc::new(build);
        self
    }

    pub fn with_texture<S, C>(mut self, synthesis: S, conversion: C) -> Self
    where
        S: Fn(&LoadContext) -> anyhow::Result<Box<dyn TextureSynthesis>> + Send + Sync + 'static,
        C: Fn(&LoadContext) -> anyhow::Result<Box<dyn FormatConversion>> + Send + Sync + 'static,
    {
        self.texture = Some(TextureLoaders {
            synthesis: Arc::new(synthesis),
            conversion: Arc::new(conversion),
        });
        self
    }

    pub fn without_texture(mut self) -> Self {
        self.texture = None;
        self
    }

    pub fn with_text_to_image<F>(mut self, build: F) -> Self
    where
        F: Fn(&LoadContext) -> anyhow::Result<Box<dyn TextToImage>> + Send + Sync + 'static,
    {
        self.text_to_image = Some(Arc::new(build));
        self
    }

    pub fn texture_enabled(&self) -> bool {
        self.texture.is_some()
    }

    pub fn text_to_image_enabled(&self) -> bool {
        self.text_to_image.is_some()
    }

    pub(crate) fn load_background_removal(&self, ctx: &LoadContext) -> anyhow::Result<Box<dyn BackgroundRemoval>> {
        (self.background_removal)(ctx)
    }

    pub(crate) fn load_image_to_3d(&self, ctx: &LoadContext) -> anyhow::Result<Box<dyn ImageTo3D>> {
        (self.image_to_3d)(ctx)
    }

    pub(crate) fn load_mesh_cleanup(&self, ctx: &LoadContext) -> anyhow::Result<Box<dyn MeshCleanup>> {
        (self.mesh_cleanup)(ctx)
    }

    pub(crate) fn load_face_reduction(&self, ctx: &LoadContext) -> anyhow::Result<Box<dyn FaceReduction>> {
        (self.face_reduction)(ctx)
    }

    pub(crate) fn load_texture_synthesis(&self, ctx: &LoadContext) -> Option<anyhow::Result<Box<dyn TextureSynthesis>>> {
        self.texture.as_ref().map(|t| (t.synthesis)(ctx))
    }

    pub(crate) fn load_format_conversion(&self, ctx: &LoadContext) -> Option<anyhow::Result<Box<dyn FormatConversion>>> {
        self.texture.as_ref().map(|t| (t.conversion)(ctx))
    }

    pub(crate) fn load_text_to_image(&self, ctx: &LoadContext) -> Option<anyhow::Result<Box<dyn TextToImage>>> {
        self.text_to_image.as_ref().map(|loader| loader(ctx))
    }
}
