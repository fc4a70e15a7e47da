//! Load / unload state machine for the heavy stage set.
//!
//! The state lock is only held for transitions, never while stages are being
//! instantiated or dropped, so `status()` stays responsive during a load.
//! Concurrent `load()` callers coalesce onto the in-flight attempt and see
//! its outcome.

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};

use meshgen_types::{LifecycleStatus, LoadError, LoadProgress, LoadReport, ResourceState};

use crate::gpu_monitor::MemoryMonitor;
use crate::registry::{LoadContext, StageRegistry};
use crate::stages::{Stage, StageSet, TexturePipeline};

pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<LoadProgress>;
pub type SharedLifecycle = Arc<ResourceLifecycleManager>;

pub const SUB_STAGE_BACKGROUND: &str = "background removal";
pub const SUB_STAGE_SHAPE: &str = "image-to-3D";
pub const SUB_STAGE_MESH_TOOLS: &str = "mesh tools";
pub const SUB_STAGE_TEXTURE: &str = "texture pipeline";
pub const SUB_STAGE_TEXT_TO_IMAGE: &str = "text-to-image";

/// A loaded stage set whose footprint is returned to the monitor when the
/// last holder drops it.
pub struct LoadedStages {
    stages: StageSet,
    accounted_bytes: u64,
    monitor: Arc<dyn MemoryMonitor>,
    // Disconnects `released` once the footprint has been returned.
    _alive: Sender<()>,
    released: Receiver<()>,
}

impl Deref for LoadedStages {
    type Target = StageSet;

    fn deref(&self) -> &StageSet {
        &self.stages
    }
}

impl Drop for LoadedStages {
    fn drop(&mut self) {
        self.monitor.record_release(self.accounted_bytes);
    }
}

struct LifecycleInner {
    state: ResourceState,
    stages: Option<Arc<LoadedStages>>,
    attempt: u64,
    last_failure: Option<(u64, LoadError)>,
    instantiations: u64,
}

pub struct ResourceLifecycleManager {
    registry: StageRegistry,
    monitor: Arc<dyn MemoryMonitor>,
    context: LoadContext,
    low_vram_mode: bool,
    inner: Mutex<LifecycleInner>,
    transition_done: Condvar,
}

impl ResourceLifecycleManager {
    pub fn new(
        registry: StageRegistry,
        monitor: Arc<dyn MemoryMonitor>,
        context: LoadContext,
        low_vram_mode: bool,
    ) -> Self {
        Self {
            registry,
            monitor,
            context,
            low_vram_mode,
            inner: Mutex::new(LifecycleInner {
                state: ResourceState::Unloaded,
                stages: None,
                attempt: 0,
                last_failure: None,
                instantiations: 0,
            }),
            transition_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!(target: "lifecycle", "Lifecycle mutex was poisoned, recovering...");
            poisoned.into_inner()
        })
    }

    fn wait<'a, F>(&self, guard: MutexGuard<'a, LifecycleInner>, condition: F) -> MutexGuard<'a, LifecycleInner>
    where
        F: FnMut(&mut LifecycleInner) -> bool,
    {
        self.transition_done
            .wait_while(guard, condition)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn monitor(&self) -> &Arc<dyn MemoryMonitor> {
        &self.monitor
    }

    pub fn texture_enabled(&self) -> bool {
        self.registry.texture_enabled()
    }

    pub fn text_to_image_enabled(&self) -> bool {
        self.registry.text_to_image_enabled()
    }

    pub fn low_vram_mode(&self) -> bool {
        self.low_vram_mode
    }

    /// Bring every enabled stage to `Ready`.
    ///
    /// Returns immediately when already ready, joins an in-flight load, and
    /// waits out an in-flight unload before starting a fresh attempt.
    pub fn load(&self, progress: Option<&ProgressSender>) -> Result<LoadReport, LoadError> {
        let reporter = ProgressReporter { sender: progress };
        let mut inner = self.lock();

        loop {
            match inner.state {
                ResourceState::Ready => {
                    drop(inner);
                    reporter.report(1.0, "Models already loaded");
                    return Ok(self.report());
                }
                ResourceState::Loading => {
                    let awaited = inner.attempt;
                    log::debug!(target: "lifecycle", "Load attempt {awaited} in flight, waiting for it");
                    inner = self.wait(inner, |i| i.attempt == awaited && i.state == ResourceState::Loading);
                    if let Some((attempt, err)) = &inner.last_failure {
                        if *attempt == awaited {
                            let err = err.clone();
                            drop(inner);
                            reporter.report(1.0, format!("Error loading models: {err}"));
                            return Err(err);
                        }
                    }
                }
                ResourceState::Unloading => {
                    inner = self.wait(inner, |i| i.state == ResourceState::Unloading);
                }
                ResourceState::Unloaded | ResourceState::Failed(_) => break,
            }
        }

        inner.state = ResourceState::Loading;
        inner.attempt += 1;
        inner.instantiations += 1;
        let attempt = inner.attempt;
        drop(inner);

        log::info!(target: "lifecycle", "Loading models (attempt {attempt})");
        let outcome = self.instantiate(&reporter);

        let mut inner = self.lock();
        match outcome {
            Ok(stages) => {
                inner.stages = Some(Arc::new(stages));
                inner.state = ResourceState::Ready;
                drop(inner);
                self.transition_done.notify_all();
                let report = self.report();
                log::info!(target: "lifecycle", "All models loaded successfully. {}", report.memory.summary());
                reporter.report(1.0, "All models loaded successfully");
                Ok(report)
            }
            Err(err) => {
                inner.state = ResourceState::Failed(err.to_string());
                inner.last_failure = Some((attempt, err.clone()));
                drop(inner);
                self.transition_done.notify_all();
                log::error!(target: "lifecycle", "Error loading models: {err}");
                reporter.report(1.0, format!("Error loading models: {err}"));
                Err(err)
            }
        }
    }

    fn instantiate(&self, reporter: &ProgressReporter<'_>) -> Result<LoadedStages, LoadError> {
        let ctx = &self.context;
        let mut partial = PartialLoad::new(self.monitor.clone());

        reporter.report(0.05, format!("Initializing {} device context", ctx.device));
        self.monitor.release_cached();

        reporter.report(0.15, "Loading background removal model");
        let background_removal = partial.track(SUB_STAGE_BACKGROUND, self.registry.load_background_removal(ctx))?;

        let label = if ctx.compile {
            "Loading and compiling shape generation model"
        } else {
            "Loading shape generation model"
        };
        reporter.report(0.35, label);
        let image_to_3d = partial.track(SUB_STAGE_SHAPE, self.registry.load_image_to_3d(ctx))?;

        reporter.report(0.55, "Loading mesh processing tools");
        let mesh_cleanup = partial.track(SUB_STAGE_MESH_TOOLS, self.registry.load_mesh_cleanup(ctx))?;
        let face_reduction = partial.track(SUB_STAGE_MESH_TOOLS, self.registry.load_face_reduction(ctx))?;

        let texture = if self.registry.texture_enabled() {
            reporter.report(0.75, "Loading texture generation model");
            let synthesis = self
                .registry
                .load_texture_synthesis(ctx)
                .map(|loaded| partial.track(SUB_STAGE_TEXTURE, loaded))
                .transpose()?;
            let conversion = self
                .registry
                .load_format_conversion(ctx)
                .map(|loaded| partial.track(SUB_STAGE_TEXTURE, loaded))
                .transpose()?;
            synthesis
                .zip(conversion)
                .map(|(synthesis, conversion)| TexturePipeline { synthesis, conversion })
        } else {
            None
        };

        let text_to_image = if self.registry.text_to_image_enabled() {
            reporter.report(0.90, "Loading text-to-image model");
            self.registry
                .load_text_to_image(ctx)
                .map(|loaded| partial.track(SUB_STAGE_TEXT_TO_IMAGE, loaded))
                .transpose()?
        } else {
            None
        };

        reporter.report(0.95, "Finalizing");
        if self.low_vram_mode {
            self.monitor.release_cached();
        }

        Ok(partial.commit(StageSet {
            background_removal,
            image_to_3d,
            mesh_cleanup,
            face_reduction,
            texture,
            text_to_image,
        }))
    }

    /// Drop every stage and release pooled memory. Valid from any state.
    ///
    /// Stays in `Unloading` until every lease from `stages()` is gone, so a
    /// load queued behind it never builds a second set next to the old one.
    pub fn unload(&self) -> String {
        let mut inner = self.lock();
        inner = self.wait(inner, |i| i.state.is_transitioning());

        let previous = inner.stages.take();
        inner.state = ResourceState::Unloading;
        drop(inner);

        if let Some(stages) = previous {
            log::info!(target: "lifecycle", "Unloading stages: {}", stages.stage_names().join(", "));
            let released = stages.released.clone();
            let leases = Arc::strong_count(&stages) - 1;
            drop(stages);
            if leases > 0 {
                log::info!(target: "lifecycle", "Waiting for {leases} running job(s) to release the stages");
            }
            let _ = released.recv();
        }
        self.monitor.release_cached();

        let mut inner = self.lock();
        inner.state = ResourceState::Unloaded;
        drop(inner);
        self.transition_done.notify_all();

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let memory = self.monitor.snapshot();
        log::info!(target: "lifecycle", "Models unloaded at {timestamp}. {}", memory.summary());
        format!("Models unloaded at {timestamp}\n\n{}", memory.summary())
    }

    pub fn status(&self) -> LifecycleStatus {
        let state = self.lock().state.clone();
        LifecycleStatus {
            state,
            memory: self.monitor.snapshot(),
        }
    }

    /// Read-only lease on the loaded stages, `None` unless `Ready`.
    pub fn stages(&self) -> Option<Arc<LoadedStages>> {
        let inner = self.lock();
        match inner.state {
            ResourceState::Ready => inner.stages.clone(),
            _ => None,
        }
    }

    /// Load attempts that actually started instantiating.
    pub fn instantiation_count(&self) -> u64 {
        self.lock().instantiations
    }

    fn report(&self) -> LoadReport {
        LoadReport {
            ready: self.lock().state.is_ready(),
            memory: self.monitor.snapshot(),
        }
    }
}

struct ProgressReporter<'a> {
    sender: Option<&'a ProgressSender>,
}

impl ProgressReporter<'_> {
    fn report(&self, fraction: f32, description: impl Into<String>) {
        let event = LoadProgress::new(fraction, description);
        log::info!(target: "lifecycle", "[{:>3.0}%] {}", event.fraction * 100.0, event.description);
        if let Some(sender) = self.sender {
            // Observer may have gone away; loading carries on regardless.
            let _ = sender.send(event);
        }
    }
}

/// Footprint accounting for one load attempt. Handles dropped on the error
/// path give their accounted bytes back.
struct PartialLoad {
    monitor: Arc<dyn MemoryMonitor>,
    accounted: u64,
    committed: bool,
}

impl PartialLoad {
    fn new(monitor: Arc<dyn MemoryMonitor>) -> Self {
        Self {
            monitor,
            accounted: 0,
            committed: false,
        }
    }

    fn track<T: ?Sized + Stage>(&mut self, sub_stage: &str, loaded: anyhow::Result<Box<T>>) -> Result<Box<T>, LoadError> {
        let stage = loaded.map_err(|e| LoadError::new(sub_stage, format!("{e:#}")))?;
        let bytes = stage.footprint_bytes();
        self.monitor.record_allocation(bytes);
        self.accounted += bytes;
        log::debug!(target: "lifecycle", "Loaded {} ({} MiB)", stage.name(), bytes / (1024 * 1024));
        Ok(stage)
    }

    fn commit(mut self, stages: StageSet) -> LoadedStages {
        self.committed = true;
        let (alive, released) = crossbeam_channel::bounded(0);
        LoadedStages {
            stages,
            accounted_bytes: self.accounted,
            monitor: self.monitor.clone(),
            _alive: alive,
            released,
        }
    }
}

impl Drop for PartialLoad {
    fn drop(&mut self) {
        if !self.committed && self.accounted > 0 {
            self.monitor.record_release(self.accounted);
            self.monitor.release_cached();
        }
    }
}
