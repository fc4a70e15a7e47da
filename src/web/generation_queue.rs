//! Generation job queue.
//!
//! Routes submit generation and export jobs to a bounded MPSC channel.
//! A single worker task processes them sequentially via `spawn_blocking`,
//! so only one pipeline run touches the loaded stages at a time and
//! requests are served in arrival order. A run whose stage timed out is
//! answered at once, but the next job waits until that stage has exited.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use meshgen_engine::{
    AbandonedStage, ExportOptions, ExportOutput, PipelineFailure, PipelineMode, PipelineOrchestrator, PipelineOutput, ProgressSender,
};
use meshgen_types::{GenerationRequest, PipelineError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("generation queue closed")]
    Closed,
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Generate(#[from] PipelineFailure),
    #[error(transparent)]
    Export(#[from] PipelineError),
}

pub type JobReply<T> = oneshot::Sender<Result<T, JobError>>;

/// One unit of work for the worker.
pub enum QueuedJob {
    Generate {
        request: Box<GenerationRequest>,
        mode: PipelineMode,
        /// Receives model load progress when the run has to load first.
        progress: Option<ProgressSender>,
        reply: JobReply<PipelineOutput>,
    },
    Export {
        folder_id: String,
        options: ExportOptions,
        reply: JobReply<ExportOutput>,
    },
}

impl QueuedJob {
    fn label(&self) -> &'static str {
        match self {
            QueuedJob::Generate { mode, .. } if mode.textured() => "textured generation",
            QueuedJob::Generate { .. } => "shape generation",
            QueuedJob::Export { .. } => "export",
        }
    }

    /// The caller stopped waiting (disconnected) before the job started.
    fn abandoned(&self) -> bool {
        match self {
            QueuedJob::Generate { reply, .. } => reply.is_closed(),
            QueuedJob::Export { reply, .. } => reply.is_closed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: bool,
    pub completed: u64,
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    active: AtomicBool,
    completed: AtomicU64,
}

impl Counters {
    // Called before the reply goes out, unless a timed-out stage is still draining.
    fn finish(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable handle that route handlers use to submit work.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::Sender<QueuedJob>,
    counters: Arc<Counters>,
}

pub type SharedGenerationQueue = Arc<GenerationQueue>;

impl GenerationQueue {
    /// Create the queue and spawn the background worker.
    pub fn spawn(orchestrator: Arc<PipelineOrchestrator>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let counters = Arc::new(Counters::default());

        tokio::spawn(generation_worker(rx, orchestrator, counters.clone()));

        Self { tx, counters }
    }

    /// Submit a job. Waits if the queue is full.
    pub async fn submit(&self, job: QueuedJob) -> Result<(), JobError> {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).await.map_err(|_| {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            JobError::Closed
        })
    }

    /// Enqueue a generation and hand back the receiver for its result.
    pub async fn enqueue_generate(
        &self,
        request: GenerationRequest,
        mode: PipelineMode,
        progress: Option<ProgressSender>,
    ) -> Result<oneshot::Receiver<Result<PipelineOutput, JobError>>, JobError> {
        let (reply, rx) = oneshot::channel();
        self.submit(QueuedJob::Generate {
            request: Box::new(request),
            mode,
            progress,
            reply,
        })
        .await?;
        Ok(rx)
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
        mode: PipelineMode,
        progress: Option<ProgressSender>,
    ) -> Result<PipelineOutput, JobError> {
        let rx = self.enqueue_generate(request, mode, progress).await?;
        rx.await.map_err(|_| JobError::Closed)?
    }

    pub async fn export(&self, folder_id: String, options: ExportOptions) -> Result<ExportOutput, JobError> {
        let (reply, rx) = oneshot::channel();
        self.submit(QueuedJob::Export {
            folder_id,
            options,
            reply,
        })
        .await?;
        rx.await.map_err(|_| JobError::Closed)?
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.counters.pending.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }
}

fn panicked(e: tokio::task::JoinError) -> JobError {
    log::error!(target: "queue", "Job task panicked: {e}");
    JobError::Panicked(e.to_string())
}

/// Hold the worker until a timed-out stage thread has let go of the stages.
async fn drain_abandoned(stage: AbandonedStage) {
    log::warn!(target: "queue", "Waiting for timed-out {} to exit before the next job", stage.stage());
    if let Err(e) = tokio::task::spawn_blocking(move || stage.wait()).await {
        panicked(e);
    }
}

/// Long-lived task that pulls jobs off the channel one at a time.
async fn generation_worker(
    mut rx: mpsc::Receiver<QueuedJob>,
    orchestrator: Arc<PipelineOrchestrator>,
    counters: Arc<Counters>,
) {
    while let Some(job) = rx.recv().await {
        counters.pending.fetch_sub(1, Ordering::SeqCst);

        // Skip jobs whose caller already went away.
        if job.abandoned() {
            log::info!(target: "queue", "Skipping abandoned {} job", job.label());
            continue;
        }

        log::info!(target: "queue", "Starting {} job", job.label());
        counters.active.store(true, Ordering::SeqCst);
        let orchestrator = orchestrator.clone();

        // Heavy work goes on the blocking thread pool.
        match job {
            QueuedJob::Generate {
                request,
                mode,
                progress,
                reply,
            } => {
                let joined =
                    tokio::task::spawn_blocking(move || orchestrator.run(&request, mode, progress.as_ref())).await;
                let result = joined.map_err(panicked).and_then(|r| r.map_err(JobError::from));
                let abandoned = match &result {
                    Err(JobError::Generate(failure)) => failure.abandoned.clone(),
                    _ => None,
                };
                match abandoned {
                    None => {
                        counters.finish();
                        // Caller may have dropped the receiver (disconnected), ignore error.
                        let _ = reply.send(result);
                    }
                    Some(stage) => {
                        let _ = reply.send(result);
                        drain_abandoned(stage).await;
                        counters.finish();
                    }
                }
            }
            QueuedJob::Export {
                folder_id,
                options,
                reply,
            } => {
                let joined = tokio::task::spawn_blocking(move || orchestrator.export(&folder_id, &options)).await;
                let result = joined.map_err(panicked).and_then(|r| r.map_err(JobError::from));
                counters.finish();
                let _ = reply.send(result);
            }
        }
    }
    log::info!(target: "queue", "Generation queue closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use meshgen_engine::stages::{ImageTo3D, ShapeParams, Stage, ViewSet};
    use meshgen_engine::{DeviceMemoryMonitor, LoadContext, OutputCache, PipelineOptions, ResourceLifecycleManager, StageRegistry};
    use meshgen_types::{Device, GenerationInput, InputImage, Mesh, Seed};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the seed of every call and the highest concurrency seen.
    struct RecordingShape {
        seeds: Arc<Mutex<Vec<u64>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl Stage for RecordingShape {
        fn name(&self) -> &'static str {
            "recording shape"
        }
    }

    impl ImageTo3D for RecordingShape {
        fn generate(&self, _views: &ViewSet, params: &ShapeParams) -> anyhow::Result<Mesh> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.seeds.lock().unwrap().push(params.seed);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Mesh::new(
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                vec![[0, 1, 2]],
            ))
        }
    }

    fn request(seed: u64) -> GenerationRequest {
        let image = InputImage::from_rgba(RgbaImage::from_pixel(16, 16, Rgba([200, 10, 10, 255])));
        GenerationRequest::new(GenerationInput::Image(image))
            .with_steps(5)
            .with_seed(Seed::Fixed(seed))
            .with_remove_background(false)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = Arc::new(Mutex::new(Vec::new()));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (s, m) = (seeds.clone(), max_in_flight.clone());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let registry = StageRegistry::builtin_core().with_image_to_3d(move |_| {
            Ok(Box::new(RecordingShape {
                seeds: s.clone(),
                in_flight: in_flight.clone(),
                max_in_flight: m.clone(),
            }))
        });
        let monitor = Arc::new(DeviceMemoryMonitor::with_total(Device::Cpu, 1 << 36));
        let lifecycle = Arc::new(ResourceLifecycleManager::new(registry, monitor, LoadContext::default(), false));
        let cache = Arc::new(OutputCache::new(dir.path().join("save_dir"), 20).unwrap());
        let orchestrator = Arc::new(PipelineOrchestrator::new(lifecycle, cache, PipelineOptions::default()));
        let queue = GenerationQueue::spawn(orchestrator, 8);

        let mut receivers = Vec::new();
        for seed in [11, 22, 33] {
            receivers.push(
                queue
                    .enqueue_generate(request(seed), PipelineMode::ShapeOnly, None)
                    .await
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(*seeds.lock().unwrap(), vec![11, 22, 33]);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        let status = queue.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.completed, 3);
        assert!(!status.active);
    }

    /// Sleeps well past the stage timeout while tracking overlap.
    struct StuckShape {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl Stage for StuckShape {
        fn name(&self) -> &'static str {
            "stuck shape"
        }
    }

    impl ImageTo3D for StuckShape {
        fn generate(&self, _views: &ViewSet, _params: &ShapeParams) -> anyhow::Result<Mesh> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("finished too late")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timed_out_stage_holds_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (i, m) = (in_flight.clone(), max_in_flight.clone());
        let registry = StageRegistry::builtin_core().with_image_to_3d(move |_| {
            Ok(Box::new(StuckShape {
                in_flight: i.clone(),
                max_in_flight: m.clone(),
            }))
        });
        let monitor = Arc::new(DeviceMemoryMonitor::with_total(Device::Cpu, 1 << 36));
        let lifecycle = Arc::new(ResourceLifecycleManager::new(registry, monitor, LoadContext::default(), false));
        let cache = Arc::new(OutputCache::new(dir.path().join("save_dir"), 20).unwrap());
        let options = PipelineOptions {
            stage_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let orchestrator = Arc::new(PipelineOrchestrator::new(lifecycle, cache.clone(), options));
        let queue = GenerationQueue::spawn(orchestrator, 8);

        let mut receivers = Vec::new();
        for seed in [1, 2, 3] {
            receivers.push(
                queue
                    .enqueue_generate(request(seed), PipelineMode::ShapeOnly, None)
                    .await
                    .unwrap(),
            );
        }

        let first = std::time::Instant::now();
        let mut answered = Vec::new();
        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(
                matches!(err, JobError::Generate(ref f) if matches!(f.error, PipelineError::StageTimeout { .. })),
                "{err:?}"
            );
            answered.push(first.elapsed());
        }

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        // Each job starts only after the previous stuck stage has exited.
        assert!(answered[2] >= Duration::from_millis(800), "{answered:?}");

        while queue.status().active {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(queue.status().completed, 3);
        assert_eq!(cache.folder_count(), 0);
    }

    #[tokio::test]
    async fn test_export_of_unknown_folder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(DeviceMemoryMonitor::with_total(Device::Cpu, 1 << 36));
        let lifecycle = Arc::new(ResourceLifecycleManager::new(
            StageRegistry::builtin_core(),
            monitor,
            LoadContext::default(),
            false,
        ));
        let cache = Arc::new(OutputCache::new(dir.path().join("save_dir"), 20).unwrap());
        let orchestrator = Arc::new(PipelineOrchestrator::new(lifecycle, cache, PipelineOptions::default()));
        let queue = GenerationQueue::spawn(orchestrator, 2);

        let err = queue
            .export("not-a-folder".to_string(), ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Export(PipelineError::InvalidRequest(_))), "{err:?}");
    }
}
