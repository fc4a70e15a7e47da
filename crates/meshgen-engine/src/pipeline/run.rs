//! Bookkeeping for one orchestrated run: stage calls, timings, timeouts.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use meshgen_types::{GenerationStats, PipelineError};
use serde::Serialize;

use crate::lifecycle::LoadedStages;
use crate::output_cache::{OutputCache, OutputFolder};
use crate::stages::StageSet;

/// What a finished stage handed on, for logging and the API response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Image { width: u32, height: u32 },
    Views { count: usize },
    Mesh { faces: usize, vertices: usize },
    Files { paths: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub name: &'static str,
    pub duration: Duration,
    pub payload: StagePayload,
}

/// A stage thread that outlived its timeout and is still holding the
/// stages. The next run must not start before `wait` returns.
#[derive(Clone)]
pub struct AbandonedStage {
    stage: &'static str,
    // Disconnects when the thread exits, panics included.
    done: Receiver<()>,
    discard: Option<(Arc<OutputCache>, OutputFolder)>,
}

impl AbandonedStage {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }

    /// Remove `folder` once the thread is done writing into it.
    pub(crate) fn discarding(mut self, cache: Arc<OutputCache>, folder: OutputFolder) -> Self {
        self.discard = Some((cache, folder));
        self
    }

    /// Block until the stage thread exits, then drop its output folder.
    pub fn wait(&self) {
        let started = Instant::now();
        let _ = self.done.recv();
        log::info!(
            target: "pipeline",
            "Timed-out {} finished {:.1}s after it was abandoned",
            self.stage,
            started.elapsed().as_secs_f32()
        );
        if let Some((cache, folder)) = &self.discard {
            cache.discard(folder);
        }
    }
}

impl fmt::Debug for AbandonedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbandonedStage")
            .field("stage", &self.stage)
            .field("finished", &self.is_finished())
            .field("discard", &self.discard.as_ref().map(|(_, folder)| folder.id()))
            .finish()
    }
}

pub(crate) struct PipelineRun {
    stages: Arc<LoadedStages>,
    timeout: Option<Duration>,
    pub(crate) seed: u64,
    pub(crate) stats: GenerationStats,
    pub(crate) results: Vec<StageResult>,
    pub(crate) abandoned: Option<AbandonedStage>,
}

impl PipelineRun {
    pub(crate) fn new(stages: Arc<LoadedStages>, seed: u64, stats: GenerationStats, timeout: Option<Duration>) -> Self {
        Self {
            stages,
            timeout,
            seed,
            stats,
            results: Vec::new(),
            abandoned: None,
        }
    }

    /// Run one stage, time it under `name`, and turn its error into a
    /// `StageFailed` carrying only the outermost message.
    ///
    /// With a timeout configured the work runs on its own thread. On expiry
    /// the error comes back at once and the thread is kept in `abandoned`.
    pub(crate) fn call<T, F, D>(&mut self, name: &'static str, work: F, describe: D) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&StageSet) -> anyhow::Result<T> + Send + 'static,
        D: FnOnce(&T) -> StagePayload,
    {
        log::debug!(target: "pipeline", "Starting {name}");
        let started = Instant::now();

        let outcome = match self.timeout {
            None => {
                let stages: &StageSet = &self.stages;
                work(stages)
            }
            Some(limit) => {
                let stages = self.stages.clone();
                let (tx, rx) = crossbeam_channel::bounded(1);
                let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
                thread::Builder::new()
                    .name(format!("stage-{}", name.replace(' ', "-")))
                    .spawn(move || {
                        let set: &StageSet = &stages;
                        let outcome = work(set);
                        // Lease goes before the done signal.
                        drop(stages);
                        // Receiver is gone once the run timed out.
                        let _ = tx.send(outcome);
                        drop(done_tx);
                    })
                    .map_err(|e| PipelineError::stage_failed(name, format!("could not start stage thread: {e}")))?;

                match rx.recv_timeout(limit) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => {
                        self.stats.record_time(name, started.elapsed());
                        log::error!(target: "pipeline", "{name} timed out after {:.1}s", limit.as_secs_f32());
                        self.abandoned = Some(AbandonedStage {
                            stage: name,
                            done: done_rx,
                            discard: None,
                        });
                        return Err(PipelineError::StageTimeout {
                            stage: name.to_string(),
                            timeout: limit,
                        });
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(anyhow::anyhow!("stage thread exited without a result")),
                }
            }
        };

        let elapsed = started.elapsed();
        self.stats.record_time(name, elapsed);
        match outcome {
            Ok(value) => {
                log::info!(target: "pipeline", "---{name} takes {:.3} seconds---", elapsed.as_secs_f64());
                self.results.push(StageResult {
                    name,
                    duration: elapsed,
                    payload: describe(&value),
                });
                Ok(value)
            }
            Err(e) => {
                log::error!(target: "pipeline", "{name} failed after {:.3}s: {e:#}", elapsed.as_secs_f64());
                Err(PipelineError::stage_failed(name, e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_monitor::DeviceMemoryMonitor;
    use crate::lifecycle::ResourceLifecycleManager;
    use crate::registry::{LoadContext, StageRegistry};
    use meshgen_types::Device;

    fn loaded() -> Arc<LoadedStages> {
        let monitor = Arc::new(DeviceMemoryMonitor::with_total(Device::Cpu, 1 << 34));
        let manager = ResourceLifecycleManager::new(StageRegistry::builtin_core(), monitor, LoadContext::default(), false);
        manager.load(None).unwrap();
        manager.stages().unwrap()
    }

    #[test]
    fn test_call_records_time_and_result() {
        let mut run = PipelineRun::new(loaded(), 7, GenerationStats::default(), None);
        let value = run
            .call("counting", |set| Ok(set.stage_names().len()), |n| StagePayload::Views { count: *n })
            .unwrap();
        assert_eq!(value, 4);
        assert!(run.stats.time.contains_key("counting"));
        assert_eq!(run.results[0].payload, StagePayload::Views { count: 4 });
    }

    #[test]
    fn test_error_keeps_outermost_message() {
        let mut run = PipelineRun::new(loaded(), 7, GenerationStats::default(), None);
        let err = run
            .call(
                "broken",
                |_| -> anyhow::Result<()> {
                    Err(anyhow::anyhow!("disk detail").context("could not write mesh"))
                },
                |_| StagePayload::Views { count: 0 },
            )
            .unwrap_err();
        assert_eq!(err, PipelineError::stage_failed("broken", "could not write mesh"));
        assert!(run.results.is_empty());
        assert!(run.stats.time.contains_key("broken"));
    }

    #[test]
    fn test_timeout_abandons_stage() {
        let mut run = PipelineRun::new(loaded(), 7, GenerationStats::default(), Some(Duration::from_millis(50)));
        let started = Instant::now();
        let err = run
            .call(
                "sleepy",
                |_| {
                    thread::sleep(Duration::from_millis(500));
                    Ok(())
                },
                |_| StagePayload::Views { count: 0 },
            )
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, PipelineError::StageTimeout { ref stage, .. } if stage == "sleepy"));

        let abandoned = run.abandoned.take().unwrap();
        assert_eq!(abandoned.stage(), "sleepy");
        assert!(!abandoned.is_finished());
        abandoned.wait();
        assert!(abandoned.is_finished());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn test_abandoned_stage_discards_folder_after_it_exits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(OutputCache::new(dir.path(), 10).unwrap());
        let folder = cache.allocate().unwrap();
        let path = folder.join("white_mesh.glb");

        let mut run = PipelineRun::new(loaded(), 7, GenerationStats::default(), Some(Duration::from_millis(30)));
        run.call(
            "slow writer",
            move |_| {
                thread::sleep(Duration::from_millis(200));
                std::fs::write(&path, b"late")?;
                Ok(())
            },
            |_| StagePayload::Views { count: 0 },
        )
        .unwrap_err();

        let abandoned = run.abandoned.take().unwrap().discarding(cache.clone(), folder.clone());
        assert!(folder.path().exists());
        abandoned.wait();
        assert!(!folder.path().exists());
        assert_eq!(cache.folder_count(), 0);
    }

    #[test]
    fn test_abandoned_stage_releases_lease_before_finishing() {
        let stages = loaded();
        let mut run = PipelineRun::new(stages.clone(), 7, GenerationStats::default(), Some(Duration::from_millis(20)));
        run.call(
            "sleepy",
            |_| {
                thread::sleep(Duration::from_millis(150));
                Ok(())
            },
            |_| StagePayload::Views { count: 0 },
        )
        .unwrap_err();
        let abandoned = run.abandoned.take().unwrap();
        drop(run);
        assert_eq!(Arc::strong_count(&stages), 2);

        abandoned.wait();
        assert_eq!(Arc::strong_count(&stages), 1);
    }

    #[test]
    fn test_fast_stage_within_timeout() {
        let mut run = PipelineRun::new(loaded(), 7, GenerationStats::default(), Some(Duration::from_secs(5)));
        let value = run.call("quick", |_| Ok(3_u32), |_| StagePayload::Views { count: 1 }).unwrap();
        assert_eq!(value, 3);
    }
}
