use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::{GenerationRequest, ViewName};

pub const TOTAL_TIME_KEY: &str = "total";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub shapegen: String,
    pub texgen: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub views: Vec<ViewName>,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: u64,
    pub octree_resolution: u32,
    pub check_box_rembg: bool,
    pub num_chunks: u32,
}

impl StatsParams {
    pub fn from_request(request: &GenerationRequest, seed: u64) -> Self {
        Self {
            caption: request.input.caption().map(str::to_string),
            views: request.input.views(),
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            seed,
            octree_resolution: request.octree_resolution,
            check_box_rembg: request.remove_background,
            num_chunks: request.num_chunks,
        }
    }
}

/// Per-run statistics returned with every generation, also on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub model: ModelInfo,
    pub params: StatsParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_faces: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_vertices: Option<usize>,
    /// Seconds per stage name, plus `total`.
    pub time: BTreeMap<String, f64>,
}

impl GenerationStats {
    pub fn new(model: ModelInfo, params: StatsParams) -> Self {
        Self {
            model,
            params,
            ..Default::default()
        }
    }

    pub fn record_time(&mut self, stage: &str, elapsed: Duration) {
        self.time.insert(stage.to_string(), elapsed.as_secs_f64());
    }

    pub fn total(&self) -> Option<f64> {
        self.time.get(TOTAL_TIME_KEY).copied()
    }
}
