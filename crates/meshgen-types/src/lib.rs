//! Shared value types for the meshgen workspace.
//!
//! Everything here is plain data: requests, lifecycle state, memory
//! snapshots, generation stats, meshes and the error taxonomy. Behaviour
//! lives in `meshgen-engine` and the web crate.

pub mod error;
pub mod memory;
pub mod mesh;
pub mod request;
pub mod state;
pub mod stats;

pub use error::{CacheError, LoadError, PipelineError};
pub use memory::{Device, MemoryInfo};
pub use mesh::Mesh;
pub use request::{
    GenerationInput, GenerationRequest, InputImage, Seed, ViewName, MAX_SEED,
};
pub use state::{LifecycleStatus, LoadProgress, LoadReport, ResourceState};
pub use stats::{GenerationStats, ModelInfo, StatsParams};
