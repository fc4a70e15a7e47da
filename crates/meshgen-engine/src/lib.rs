//! Generation engine: stage capabilities and their built-in implementations,
//! the lifecycle manager that loads them, the orchestrator that runs them,
//! and the output cache the results land in.

pub mod gpu_monitor;
pub mod lifecycle;
pub mod mesh_io;
pub mod output_cache;
pub mod pipeline;
pub mod registry;
pub mod stages;
pub mod viewer;

pub use gpu_monitor::{DeviceMemoryMonitor, MemoryMonitor};
pub use lifecycle::{LoadedStages, ProgressSender, ResourceLifecycleManager, SharedLifecycle};
pub use output_cache::{OutputCache, OutputFolder};
pub use pipeline::{
    AbandonedStage, ExportOptions, ExportOutput, PipelineFailure, PipelineMode, PipelineOptions, PipelineOrchestrator,
    PipelineOutput,
};
pub use registry::{LoadContext, StageRegistry};
