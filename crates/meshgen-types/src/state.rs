use serde::{Deserialize, Serialize};

use crate::memory::MemoryInfo;

/// Lifecycle of the heavy stage set. Exactly one per manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ResourceState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed(String),
}

impl ResourceState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ResourceState::Ready)
    }

    /// A transition is in flight and callers must wait for it.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ResourceState::Loading | ResourceState::Unloading)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceState::Unloaded => "unloaded",
            ResourceState::Loading => "loading",
            ResourceState::Ready => "ready",
            ResourceState::Unloading => "unloading",
            ResourceState::Failed(_) => "failed",
        }
    }
}

/// One load progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub fraction: f32,
    pub description: String,
}

impl LoadProgress {
    pub fn new(fraction: f32, description: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub ready: bool,
    pub memory: MemoryInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub state: ResourceState,
    pub memory: MemoryInfo,
}
