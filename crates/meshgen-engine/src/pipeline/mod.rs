//! Composes loaded stages into shape-only and shape-and-texture runs.
//!
//! A run validates before touching anything, resolves the seed, makes sure
//! the stages are loaded, allocates an output folder and then walks the
//! stages in order. The first failing stage aborts the run; the failure
//! still carries the timings of every stage that ran.

pub mod export;
mod run;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use meshgen_config::ServerConfig;
use meshgen_types::stats::TOTAL_TIME_KEY;
use meshgen_types::{
    GenerationInput, GenerationRequest, GenerationStats, InputImage, LoadError, ModelInfo, PipelineError,
    StatsParams, ViewName, MAX_SEED,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::{LoadedStages, ProgressSender, SharedLifecycle};
use crate::mesh_io::{self, MeshFormat, WriteOptions};
use crate::output_cache::{OutputCache, OutputFolder};
use crate::stages::{ShapeParams, ViewSet};
use crate::viewer::{self, ViewerLayout};

pub use export::{ExportOptions, ExportOutput, DEFAULT_TARGET_FACES, MAX_TARGET_FACES, MIN_TARGET_FACES};
pub use run::{AbandonedStage, StagePayload, StageResult};
use run::PipelineRun;

pub const STAGE_TEXT_TO_IMAGE: &str = "text2image";
pub const STAGE_REMOVE_BACKGROUND: &str = "remove background";
pub const STAGE_SHAPE: &str = "shape generation";
pub const STAGE_EXPORT_WHITE: &str = "export white mesh";
pub const STAGE_MESH_CLEANUP: &str = "mesh cleanup";
pub const STAGE_FACE_REDUCTION: &str = "face reduction";
pub const STAGE_TEXTURE: &str = "texture generation";
pub const STAGE_FORMAT_CONVERSION: &str = "format conversion";
pub const STAGE_VIEWER: &str = "viewer";

pub const WHITE_MESH_GLB: &str = "white_mesh.glb";
pub const WHITE_MESH_OBJ: &str = "white_mesh.obj";
pub const TEXTURED_MESH_OBJ: &str = "textured_mesh.obj";
pub const TEXTURED_MESH_GLB: &str = "textured_mesh.glb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    ShapeOnly,
    ShapeAndTexture,
}

impl PipelineMode {
    pub fn textured(&self) -> bool {
        matches!(self, PipelineMode::ShapeAndTexture)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound for a single stage call; `None` waits forever.
    pub stage_timeout: Option<Duration>,
    pub low_vram_mode: bool,
    pub viewer: ViewerLayout,
    pub models: ModelInfo,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_timeout: None,
            low_vram_mode: false,
            viewer: ViewerLayout::default(),
            models: ModelInfo {
                shapegen: "builtin".into(),
                texgen: "builtin".into(),
            },
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            low_vram_mode: config.low_vram_mode,
            viewer: ViewerLayout::from_config(config),
            models: ModelInfo {
                shapegen: config.shapegen_model(),
                texgen: config.texgen_model(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub folder: OutputFolder,
    /// Every mesh and texture file written, in the order written.
    pub artifacts: Vec<PathBuf>,
    pub viewer_path: PathBuf,
    pub stats: GenerationStats,
    pub seed: u64,
    pub stages: Vec<StageResult>,
}

impl PipelineOutput {
    pub fn folder_id(&self) -> &str {
        self.folder.id()
    }
}

/// A failed run: the error plus whatever stats were gathered before it.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub stats: GenerationStats,
    /// Set when a stage timed out and its thread is still running. The
    /// stages are not free for another run until it has been waited on.
    pub abandoned: Option<AbandonedStage>,
}

pub struct PipelineOrchestrator {
    lifecycle: SharedLifecycle,
    cache: Arc<OutputCache>,
    options: PipelineOptions,
}

impl PipelineOrchestrator {
    pub fn new(lifecycle: SharedLifecycle, cache: Arc<OutputCache>, options: PipelineOptions) -> Self {
        Self {
            lifecycle,
            cache,
            options,
        }
    }

    pub fn lifecycle(&self) -> &SharedLifecycle {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<OutputCache> {
        &self.cache
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Stages for this run, loading them first when needed.
    fn acquire_stages(&self, progress: Option<&ProgressSender>) -> Result<Arc<LoadedStages>, PipelineError> {
        if let Some(stages) = self.lifecycle.stages() {
            return Ok(stages);
        }
        log::info!(target: "pipeline", "Models not loaded, loading before the run");
        self.lifecycle.load(progress)?;
        self.lifecycle.stages().ok_or_else(|| {
            PipelineError::LoadFailed(LoadError::new("stages", "models were unloaded before the run could start"))
        })
    }

    pub fn run(
        &self,
        request: &GenerationRequest,
        mode: PipelineMode,
        progress: Option<&ProgressSender>,
    ) -> Result<PipelineOutput, PipelineFailure> {
        let started = Instant::now();
        let mut stats = GenerationStats::new(self.options.models.clone(), StatsParams::default());
        let fail = |error: PipelineError, stats: &GenerationStats| PipelineFailure {
            error,
            stats: stats.clone(),
            abandoned: None,
        };

        request.validate().map_err(|e| fail(e, &stats))?;
        if mode.textured() && !self.lifecycle.texture_enabled() {
            return Err(fail(
                PipelineError::InvalidRequest("texture generation is disabled on this server".into()),
                &stats,
            ));
        }

        let seed = request.seed.resolve_with(|| rand::thread_rng().gen_range(0..=MAX_SEED));
        stats.params = StatsParams::from_request(request, seed);
        log::info!(target: "pipeline", "Starting {mode:?} run with seed {seed}");

        let stages = self.acquire_stages(progress).map_err(|e| fail(e, &stats))?;
        let folder = self.cache.allocate().map_err(|e| fail(e.into(), &stats))?;

        let mut run = PipelineRun::new(stages, seed, stats, self.options.stage_timeout);
        let outcome = self.execute(&mut run, request, mode, &folder, started);

        if self.options.low_vram_mode {
            self.lifecycle.monitor().release_cached();
        }

        match outcome {
            Ok((artifacts, viewer_path)) => {
                log::info!(
                    target: "pipeline",
                    "Run finished in {:.2}s, output folder {}",
                    run.stats.total().unwrap_or_default(),
                    folder.id()
                );
                Ok(PipelineOutput {
                    folder,
                    artifacts,
                    viewer_path,
                    stats: run.stats,
                    seed: run.seed,
                    stages: run.results,
                })
            }
            Err(error) => {
                log::error!(target: "pipeline", "Run aborted: {error}");
                // A timed-out stage may still be writing; its folder goes once it exits.
                let abandoned = match run.abandoned.take() {
                    Some(stage) => Some(stage.discarding(self.cache.clone(), folder)),
                    None => {
                        self.cache.discard(&folder);
                        None
                    }
                };
                Err(PipelineFailure {
                    error,
                    stats: run.stats,
                    abandoned,
                })
            }
        }
    }

    fn execute(
        &self,
        run: &mut PipelineRun,
        request: &GenerationRequest,
        mode: PipelineMode,
        folder: &OutputFolder,
        started: Instant,
    ) -> Result<(Vec<PathBuf>, PathBuf), PipelineError> {
        let inputs = self.input_views(run, &request.input)?;
        let views = remove_backgrounds(run, inputs, request.remove_background)?;

        let params = ShapeParams {
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            seed: run.seed,
            octree_resolution: request.octree_resolution,
            num_chunks: request.num_chunks,
        };
        let shape_views = views.clone();
        let mesh = run.call(
            STAGE_SHAPE,
            move |set| {
                let mesh = set.image_to_3d.generate(&shape_views, &params)?;
                anyhow::ensure!(!mesh.is_empty(), "shape stage returned an empty mesh");
                Ok(mesh)
            },
            |mesh| StagePayload::Mesh {
                faces: mesh.face_count(),
                vertices: mesh.vertex_count(),
            },
        )?;
        run.stats.number_of_faces = Some(mesh.face_count());
        run.stats.number_of_vertices = Some(mesh.vertex_count());

        let mut artifacts = Vec::new();
        let white_glb = folder.join(WHITE_MESH_GLB);
        let extras = serde_json::json!({
            "model": run.stats.model,
            "params": run.stats.params,
        });
        let path = white_glb.clone();
        let mesh = run.call(
            STAGE_EXPORT_WHITE,
            move |_| {
                let options = WriteOptions {
                    include_normals: false,
                    extras: Some(extras),
                };
                mesh_io::write_mesh(&mesh, MeshFormat::Glb, &path, &options)
                    .with_context(|| format!("could not write {WHITE_MESH_GLB}"))?;
                Ok(mesh)
            },
            |_| StagePayload::Files {
                paths: vec![white_glb.clone()],
            },
        )?;
        artifacts.push(white_glb);

        if mode.textured() {
            artifacts.extend(self.texture(run, mesh, &views, folder)?);
        }

        run.stats.time.insert(TOTAL_TIME_KEY.to_string(), started.elapsed().as_secs_f64());

        let viewer_path = viewer::write_viewer(folder.path(), self.options.viewer, mode.textured())
            .map_err(|e| PipelineError::stage_failed(STAGE_VIEWER, format!("could not write viewer page: {e}")))?;

        Ok((artifacts, viewer_path))
    }

    /// Supplied views, or the caption rendered through text-to-image.
    fn input_views(
        &self,
        run: &mut PipelineRun,
        input: &GenerationInput,
    ) -> Result<BTreeMap<ViewName, InputImage>, PipelineError> {
        match input {
            GenerationInput::Image(image) => Ok(BTreeMap::from([(ViewName::Front, image.clone())])),
            GenerationInput::MultiView(views) => Ok(views.clone()),
            GenerationInput::Caption(caption) => {
                let caption = caption.clone();
                let image = run.call(
                    STAGE_TEXT_TO_IMAGE,
                    move |set| {
                        let stage = set
                            .text_to_image
                            .as_ref()
                            .context("text-to-image is disabled, restart the server with --enable_t23d")?;
                        stage.generate(&caption)
                    },
                    |image| StagePayload::Image {
                        width: image.width(),
                        height: image.height(),
                    },
                )?;
                Ok(BTreeMap::from([(ViewName::Front, image)]))
            }
        }
    }

    /// Cleanup, reduction, painting and GLB packing. Returns the files written.
    fn texture(
        &self,
        run: &mut PipelineRun,
        mesh: meshgen_types::Mesh,
        views: &ViewSet,
        folder: &OutputFolder,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let mut files = Vec::new();

        let mesh = run.call(
            STAGE_MESH_CLEANUP,
            move |set| set.mesh_cleanup.clean(mesh),
            |mesh| StagePayload::Mesh {
                faces: mesh.face_count(),
                vertices: mesh.vertex_count(),
            },
        )?;

        let white_obj = folder.join(WHITE_MESH_OBJ);
        let path = white_obj.clone();
        let mesh = run.call(
            STAGE_FACE_REDUCTION,
            move |set| {
                let mesh = set.face_reduction.reduce(mesh, None)?;
                mesh_io::write_mesh(&mesh, MeshFormat::Obj, &path, &WriteOptions::default())
                    .with_context(|| format!("could not write {WHITE_MESH_OBJ}"))?;
                Ok(mesh)
            },
            |mesh| StagePayload::Mesh {
                faces: mesh.face_count(),
                vertices: mesh.vertex_count(),
            },
        )?;
        files.push(white_obj);

        let reference = views
            .primary()
            .map(|(_, image)| image.clone())
            .ok_or_else(|| PipelineError::stage_failed(STAGE_TEXTURE, "no reference view for texturing"))?;
        let textured_obj = folder.join(TEXTURED_MESH_OBJ);
        let asset = run.call(
            STAGE_TEXTURE,
            move |set| {
                let texture = set.texture.as_ref().context("texture pipeline is not loaded")?;
                texture.synthesis.paint(&mesh, &reference, &textured_obj)
            },
            |asset| StagePayload::Files {
                paths: asset.files().into_iter().map(PathBuf::from).collect(),
            },
        )?;
        files.extend(asset.files().into_iter().map(PathBuf::from));

        let textured_glb = folder.join(TEXTURED_MESH_GLB);
        let path = textured_glb.clone();
        run.call(
            STAGE_FORMAT_CONVERSION,
            move |set| {
                let texture = set.texture.as_ref().context("texture pipeline is not loaded")?;
                texture.conversion.convert(&asset, &path)
            },
            |_| StagePayload::Files {
                paths: vec![textured_glb.clone()],
            },
        )?;
        files.push(textured_glb);

        Ok(files)
    }
}

/// Key out backgrounds where asked for, or where a view carries no alpha.
fn remove_backgrounds(
    run: &mut PipelineRun,
    inputs: BTreeMap<ViewName, InputImage>,
    always: bool,
) -> Result<ViewSet, PipelineError> {
    let needs_removal = |image: &InputImage| always || !image.has_alpha();
    if !inputs.values().any(needs_removal) {
        let views = inputs.into_iter().map(|(name, image)| (name, image.into_pixels())).collect();
        return Ok(ViewSet::from_map(views));
    }

    run.call(
        STAGE_REMOVE_BACKGROUND,
        move |set| {
            let mut views = BTreeMap::new();
            for (name, image) in inputs {
                let pixels = if always || !image.has_alpha() {
                    set.background_removal
                        .remove_background(image.pixels())
                        .map_err(|e| anyhow::anyhow!("{name} view: {e}"))?
                } else {
                    image.into_pixels()
                };
                views.insert(name, pixels);
            }
            Ok(ViewSet::from_map(views))
        },
        |views| StagePayload::Views { count: views.len() },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_monitor::DeviceMemoryMonitor;
    use crate::lifecycle::ResourceLifecycleManager;
    use crate::mesh_io::glb;
    use crate::registry::{LoadContext, StageRegistry};
    use crate::stages::builtin::{CaptionSketch, GlbPacker};
    use crate::stages::{FormatConversion, ImageTo3D, MeshCleanup, Stage, TexturedAsset, TextureSynthesis};
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use meshgen_types::{Device, Mesh, Seed};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        lifecycle: SharedLifecycle,
        cache: Arc<OutputCache>,
        orchestrator: PipelineOrchestrator,
    }

    fn harness_with(registry: StageRegistry, options: PipelineOptions) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(DeviceMemoryMonitor::with_total(Device::Cpu, 1 << 36));
        let lifecycle = Arc::new(ResourceLifecycleManager::new(registry, monitor, LoadContext::default(), false));
        let cache = Arc::new(OutputCache::new(dir.path().join("save_dir"), 20).unwrap());
        let orchestrator = PipelineOrchestrator::new(lifecycle.clone(), cache.clone(), options);
        Harness {
            _dir: dir,
            lifecycle,
            cache,
            orchestrator,
        }
    }

    fn harness(registry: StageRegistry) -> Harness {
        harness_with(registry, PipelineOptions::default())
    }

    /// Opaque red disk on a transparent canvas.
    fn disk_image() -> InputImage {
        InputImage::from_rgba(RgbaImage::from_fn(64, 64, |x, y| {
            let (dx, dy) = (x as f32 - 32.0, y as f32 - 32.0);
            if dx * dx + dy * dy < 400.0 {
                Rgba([220, 40, 40, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }

    fn image_request() -> GenerationRequest {
        GenerationRequest::new(GenerationInput::Image(disk_image()))
            .with_steps(5)
            .with_seed(Seed::Fixed(42))
            .with_octree_resolution(256)
            .with_remove_background(false)
    }

    struct FailingPainter;

    impl Stage for FailingPainter {
        fn name(&self) -> &'static str {
            "failing painter"
        }
    }

    impl TextureSynthesis for FailingPainter {
        fn paint(&self, _mesh: &Mesh, _reference: &RgbaImage, _output_obj: &Path) -> anyhow::Result<TexturedAsset> {
            anyhow::bail!("out of device memory")
        }
    }

    struct CountingConverter(Arc<AtomicUsize>);

    impl Stage for CountingConverter {
        fn name(&self) -> &'static str {
            "counting converter"
        }
    }

    impl FormatConversion for CountingConverter {
        fn convert(&self, asset: &TexturedAsset, glb_path: &Path) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            GlbPacker.convert(asset, glb_path)
        }
    }

    struct SleepyShape(Arc<AtomicUsize>);

    impl Stage for SleepyShape {
        fn name(&self) -> &'static str {
            "sleepy shape"
        }
    }

    impl ImageTo3D for SleepyShape {
        fn generate(&self, _views: &ViewSet, _params: &ShapeParams) -> anyhow::Result<Mesh> {
            thread::sleep(Duration::from_millis(400));
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Mesh::new(
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                vec![[0, 1, 2]],
            ))
        }
    }

    struct SleepyCleanup(Arc<AtomicUsize>);

    impl Stage for SleepyCleanup {
        fn name(&self) -> &'static str {
            "sleepy cleanup"
        }
    }

    impl MeshCleanup for SleepyCleanup {
        fn clean(&self, mesh: Mesh) -> anyhow::Result<Mesh> {
            thread::sleep(Duration::from_millis(300));
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(mesh)
        }
    }

    #[test]
    fn test_shape_scenario() {
        let h = harness(StageRegistry::builtin_core());
        let output = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();

        assert_eq!(h.cache.folder_count(), 1);
        assert!(output.folder.join(WHITE_MESH_GLB).is_file());
        assert!(output.viewer_path.ends_with("white_mesh.html"));
        assert!(output.stats.number_of_faces.unwrap() > 0);
        assert_eq!(output.stats.params.seed, 42);
        assert_eq!(output.seed, 42);
        assert!(output.stats.total().is_some());
        assert!(output.stats.time.contains_key(STAGE_SHAPE));
        // Alpha input with removal off skips the stage.
        assert!(!output.stats.time.contains_key(STAGE_REMOVE_BACKGROUND));
        assert_eq!(output.artifacts, vec![output.folder.join(WHITE_MESH_GLB)]);
    }

    #[test]
    fn test_exported_glb_reads_back() {
        let h = harness(StageRegistry::builtin_core());
        let output = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();
        let mesh = glb::read_mesh(&output.folder.join(WHITE_MESH_GLB)).unwrap();
        assert_eq!(Some(mesh.face_count()), output.stats.number_of_faces);
        assert_eq!(Some(mesh.vertex_count()), output.stats.number_of_vertices);
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let h = harness(StageRegistry::builtin_core());
        let first = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();
        let second = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();

        assert_ne!(first.folder_id(), second.folder_id());
        assert_eq!(first.stats.number_of_faces, second.stats.number_of_faces);
        assert_eq!(first.stats.number_of_vertices, second.stats.number_of_vertices);
        let a = fs::read(first.folder.join(WHITE_MESH_GLB)).unwrap();
        let b = fs::read(second.folder.join(WHITE_MESH_GLB)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_randomized_seed_in_range() {
        let h = harness(StageRegistry::builtin_core());
        let request = image_request().with_seed(Seed::Randomize);
        let output = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap();
        assert!(output.seed <= MAX_SEED);
        assert_eq!(output.stats.params.seed, output.seed);
    }

    #[test]
    fn test_empty_multiview_has_no_side_effects() {
        let h = harness(StageRegistry::builtin_core());
        let request = GenerationRequest::new(GenerationInput::MultiView(BTreeMap::new()));
        let failure = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap_err();

        assert!(matches!(failure.error, PipelineError::InvalidRequest(_)));
        assert_eq!(h.cache.folder_count(), 0);
        assert_eq!(h.lifecycle.instantiation_count(), 0);
        assert!(failure.stats.time.is_empty());
    }

    #[test]
    fn test_texture_failure_stops_before_conversion() {
        let conversions = Arc::new(AtomicUsize::new(0));
        let counter = conversions.clone();
        let registry = StageRegistry::builtin_core().with_texture(
            |_| Ok(Box::new(FailingPainter)),
            move |_| Ok(Box::new(CountingConverter(counter.clone()))),
        );
        let h = harness(registry);
        let failure = h
            .orchestrator
            .run(&image_request(), PipelineMode::ShapeAndTexture, None)
            .unwrap_err();

        assert_eq!(
            failure.error,
            PipelineError::stage_failed(STAGE_TEXTURE, "out of device memory")
        );
        assert_eq!(conversions.load(Ordering::SeqCst), 0);
        assert!(failure.abandoned.is_none());
        assert_eq!(h.cache.folder_count(), 0, "partial output must not stay servable");
        let timed: Vec<&str> = failure.stats.time.keys().map(String::as_str).collect();
        assert_eq!(
            timed,
            vec![STAGE_EXPORT_WHITE, STAGE_FACE_REDUCTION, STAGE_MESH_CLEANUP, STAGE_SHAPE, STAGE_TEXTURE]
        );
        assert!(failure.stats.total().is_none());
    }

    #[test]
    fn test_textured_run_writes_everything() {
        let h = harness(StageRegistry::builtin_core().with_builtin_texture());
        let output = h
            .orchestrator
            .run(&image_request(), PipelineMode::ShapeAndTexture, None)
            .unwrap();

        for name in [
            WHITE_MESH_GLB,
            WHITE_MESH_OBJ,
            TEXTURED_MESH_OBJ,
            "textured_mesh.mtl",
            "textured_mesh.jpg",
            "textured_mesh_metallic.jpg",
            "textured_mesh_roughness.jpg",
            TEXTURED_MESH_GLB,
            "textured_mesh.html",
        ] {
            assert!(output.folder.join(name).is_file(), "{name} missing");
        }
        assert_eq!(output.artifacts.last(), Some(&output.folder.join(TEXTURED_MESH_GLB)));
        assert!(output.stats.time.contains_key(STAGE_FORMAT_CONVERSION));
        let names: Vec<&str> = output.stages.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                STAGE_SHAPE,
                STAGE_EXPORT_WHITE,
                STAGE_MESH_CLEANUP,
                STAGE_FACE_REDUCTION,
                STAGE_TEXTURE,
                STAGE_FORMAT_CONVERSION
            ]
        );
    }

    #[test]
    fn test_textured_mode_refused_when_disabled() {
        let h = harness(StageRegistry::builtin_core());
        let failure = h
            .orchestrator
            .run(&image_request(), PipelineMode::ShapeAndTexture, None)
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::InvalidRequest(_)));
        assert_eq!(h.cache.folder_count(), 0);
    }

    #[test]
    fn test_stage_timeout_aborts_run() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let registry =
            StageRegistry::builtin_core().with_image_to_3d(move |_| Ok(Box::new(SleepyShape(counter.clone()))));
        let options = PipelineOptions {
            stage_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let h = harness_with(registry, options);
        let failure = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap_err();

        assert!(matches!(failure.error, PipelineError::StageTimeout { ref stage, .. } if stage == STAGE_SHAPE));
        assert!(!failure.stats.time.contains_key(STAGE_EXPORT_WHITE));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        let folders: Vec<_> = fs::read_dir(h.cache.root()).unwrap().collect();
        assert_eq!(folders.len(), 1);
        let folder = folders.into_iter().next().unwrap().unwrap().path();
        assert!(!folder.join(WHITE_MESH_GLB).exists());

        let abandoned = failure.abandoned.expect("timed-out stage is handed back");
        assert_eq!(abandoned.stage(), STAGE_SHAPE);
        abandoned.wait();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!folder.exists());
        assert_eq!(h.cache.folder_count(), 0);
    }

    #[test]
    fn test_load_failure_runs_nothing() {
        let registry = StageRegistry::builtin_core().with_image_to_3d(|_| anyhow::bail!("weights not found"));
        let h = harness(registry);
        let failure = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap_err();
        assert!(matches!(failure.error, PipelineError::LoadFailed(ref e) if e.message.contains("weights not found")));
        assert_eq!(h.cache.folder_count(), 0);
        assert!(failure.stats.time.is_empty());
    }

    #[test]
    fn test_caption_needs_text_to_image() {
        let h = harness(StageRegistry::builtin_core());
        let request = GenerationRequest::new(GenerationInput::Caption("a wooden chair".into())).with_steps(5);
        let failure = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap_err();
        assert_eq!(failure.error.stage(), Some(STAGE_TEXT_TO_IMAGE));
        assert!(failure.error.to_string().contains("enable_t23d"));
    }

    #[test]
    fn test_caption_run() {
        let registry = StageRegistry::builtin_core().with_text_to_image(|_| Ok(Box::new(CaptionSketch::new(64))));
        let h = harness(registry);
        let request = GenerationRequest::new(GenerationInput::Caption("a wooden chair".into()))
            .with_steps(5)
            .with_remove_background(false);
        let output = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap();
        assert!(output.stats.time.contains_key(STAGE_TEXT_TO_IMAGE));
        // The sketch has no alpha, so its background is keyed out anyway.
        assert!(output.stats.time.contains_key(STAGE_REMOVE_BACKGROUND));
        assert_eq!(output.stats.params.caption.as_deref(), Some("a wooden chair"));
        assert!(output.stats.number_of_faces.unwrap() > 0);
    }

    #[test]
    fn test_opaque_image_gets_background_removed() {
        let h = harness(StageRegistry::builtin_core());
        let image = RgbImage::from_fn(64, 64, |x, y| {
            let (dx, dy) = (x as f32 - 32.0, y as f32 - 32.0);
            if dx * dx + dy * dy < 400.0 {
                Rgb([30, 90, 200])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let request = GenerationRequest::new(GenerationInput::Image(InputImage::from_dynamic(image.into())))
            .with_steps(5)
            .with_remove_background(false);
        let output = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap();
        assert!(output.stats.time.contains_key(STAGE_REMOVE_BACKGROUND));
        assert_eq!(output.stages[0].payload, StagePayload::Views { count: 1 });
    }

    #[test]
    fn test_multiview_forwards_supplied_views() {
        let h = harness(StageRegistry::builtin_core());
        let views = BTreeMap::from([(ViewName::Back, disk_image()), (ViewName::Left, disk_image())]);
        let request = GenerationRequest::new(GenerationInput::MultiView(views))
            .with_steps(5)
            .with_remove_background(false);
        let output = h.orchestrator.run(&request, PipelineMode::ShapeOnly, None).unwrap();
        assert_eq!(output.stats.params.views, vec![ViewName::Back, ViewName::Left]);
        assert!(output.stats.number_of_faces.unwrap() > 0);
    }

    #[test]
    fn test_export_white_mesh_formats() {
        let h = harness(StageRegistry::builtin_core());
        let output = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();

        for format in MeshFormat::ALL {
            let options = ExportOptions {
                file_type: format,
                reduce_face: true,
                target_face_num: 1000,
                ..Default::default()
            };
            let exported = h.orchestrator.export(output.folder_id(), &options).unwrap();
            assert_ne!(exported.folder_id(), output.folder_id());
            assert!(exported.path.is_file());
            assert_eq!(exported.path.extension().unwrap(), format.extension());
            assert!(exported.folder.join(WHITE_MESH_GLB).is_file());
            assert!(exported.viewer_path.ends_with("white_mesh.html"));
        }

        let options = ExportOptions {
            reduce_face: true,
            target_face_num: 1000,
            ..Default::default()
        };
        let exported = h.orchestrator.export(output.folder_id(), &options).unwrap();
        let reduced = glb::read_mesh(&exported.path).unwrap();
        assert!(reduced.face_count() <= 1000);
    }

    #[test]
    fn test_export_textured() {
        let h = harness(StageRegistry::builtin_core().with_builtin_texture());
        let output = h
            .orchestrator
            .run(&image_request(), PipelineMode::ShapeAndTexture, None)
            .unwrap();

        let options = ExportOptions {
            file_type: MeshFormat::Obj,
            export_texture: true,
            ..Default::default()
        };
        let exported = h.orchestrator.export(output.folder_id(), &options).unwrap();
        assert!(exported.path.ends_with(TEXTURED_MESH_OBJ));
        assert!(exported.folder.join("textured_mesh.mtl").is_file());
        assert!(exported.folder.join("textured_mesh_roughness.jpg").is_file());
        assert!(exported.viewer_path.ends_with("textured_mesh.html"));

        let options = ExportOptions {
            file_type: MeshFormat::Ply,
            export_texture: true,
            ..Default::default()
        };
        let err = h.orchestrator.export(output.folder_id(), &options).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    #[test]
    fn test_export_timeout_waits_for_stage() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let registry =
            StageRegistry::builtin_core().with_mesh_cleanup(move |_| Ok(Box::new(SleepyCleanup(counter.clone()))));
        let h = harness(registry);
        let output = h.orchestrator.run(&image_request(), PipelineMode::ShapeOnly, None).unwrap();

        let options = PipelineOptions {
            stage_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let timed = PipelineOrchestrator::new(h.lifecycle.clone(), h.cache.clone(), options);
        let err = timed.export(output.folder_id(), &ExportOptions::default()).unwrap_err();

        assert!(matches!(err, PipelineError::StageTimeout { ref stage, .. } if stage == STAGE_MESH_CLEANUP));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.folder_count(), 1);
    }

    #[test]
    fn test_export_unknown_folder() {
        let h = harness(StageRegistry::builtin_core());
        let err = h
            .orchestrator
            .export("00000000-0000-4000-8000-000000000000", &ExportOptions::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        let err = h.orchestrator.export("../etc", &ExportOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }
}
