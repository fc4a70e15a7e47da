// Lifecycle, memory and queue status

use chrono::Local;
use hyper::{Body, Response, StatusCode};
use meshgen_types::LifecycleStatus;
use serde::Serialize;

use crate::web::generation_queue::QueueStatus;
use crate::web::response_helpers::json_response;
use crate::web::server::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub lifecycle: LifecycleStatus,
    pub instantiation_count: u64,
    pub texture_enabled: bool,
    pub text_to_image_enabled: bool,
    pub queue: QueueStatus,
    pub output_folders: usize,
    pub timestamp: String,
}

pub fn collect(state: &AppState) -> StatusResponse {
    StatusResponse {
        lifecycle: state.lifecycle.status(),
        instantiation_count: state.lifecycle.instantiation_count(),
        texture_enabled: state.lifecycle.texture_enabled(),
        text_to_image_enabled: state.lifecycle.text_to_image_enabled(),
        queue: state.queue.status(),
        output_folders: state.cache.folder_count(),
        timestamp: Local::now().to_rfc3339(),
    }
}

pub fn handle_status(state: &AppState) -> Response<Body> {
    json_response(StatusCode::OK, &collect(state))
}
