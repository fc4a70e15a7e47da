// Generation route handlers

use hyper::{Body, Request, Response, StatusCode};
use meshgen_engine::viewer::{self, ViewerLayout};
use meshgen_engine::{OutputFolder, PipelineMode, PipelineOutput};
use meshgen_types::{GenerationStats, PipelineError};
use serde::Serialize;

use crate::web::generation_queue::JobError;
use crate::web::request_parsing::{parse_json_body, GenerateBody};
use crate::web::response_helpers::{json_error, json_response};
use crate::web::server::AppState;

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub folder_id: String,
    pub files: Vec<String>,
    pub viewer: String,
    pub viewer_html: String,
    pub stats: GenerationStats,
    pub seed: u64,
}

/// Static URL of a file that lives directly inside `folder`.
pub fn static_url_of(folder: &OutputFolder, path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    Some(folder.static_url(name))
}

impl GenerateResponse {
    pub fn from_output(output: PipelineOutput, layout: ViewerLayout) -> Self {
        let files = output
            .artifacts
            .iter()
            .filter_map(|path| static_url_of(&output.folder, path))
            .collect();
        let viewer = static_url_of(&output.folder, &output.viewer_path).unwrap_or_default();
        Self {
            folder_id: output.folder_id().to_string(),
            files,
            viewer_html: viewer::iframe_snippet(&viewer, layout.height),
            viewer,
            stats: output.stats,
            seed: output.seed,
        }
    }
}

pub fn pipeline_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::LoadFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::StageFailed { .. } | PipelineError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::StageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn pipeline_error_body(error: &PipelineError, stats: Option<&GenerationStats>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
    });
    if let Some(stage) = error.stage() {
        body["stage"] = stage.into();
    }
    if let Some(stats) = stats {
        body["stats"] = serde_json::to_value(stats).unwrap_or_default();
    }
    body
}

/// Map a queued job failure to a JSON error response.
pub fn job_error_response(error: JobError) -> Response<Body> {
    match error {
        JobError::Closed => json_error(StatusCode::SERVICE_UNAVAILABLE, "Generation queue is not accepting work"),
        JobError::Panicked(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Generation crashed"),
        JobError::Generate(failure) => json_response(
            pipeline_status(&failure.error),
            &pipeline_error_body(&failure.error, Some(&failure.stats)),
        ),
        JobError::Export(error) => json_response(pipeline_status(&error), &pipeline_error_body(&error, None)),
    }
}

/// POST /api/generate/shape and /api/generate/textured
pub async fn handle_generate(req: Request<Body>, state: &AppState, mode: PipelineMode) -> Response<Body> {
    if mode.textured() && !state.lifecycle.texture_enabled() {
        return json_error(StatusCode::NOT_FOUND, "Texture generation is disabled on this server");
    }

    let body: GenerateBody = match parse_json_body(req.into_body(), state.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let request = match body.into_request(state.default_steps) {
        Ok(request) => request,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message),
    };

    match state.queue.generate(request, mode, None).await {
        Ok(output) => {
            log::info!(target: "server", "Generation finished in folder {}", output.folder_id());
            json_response(StatusCode::OK, &GenerateResponse::from_output(output, state.viewer))
        }
        Err(e) => {
            log::warn!(target: "server", "Generation failed: {e}");
            job_error_response(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgen_engine::PipelineFailure;
    use meshgen_types::LoadError;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            pipeline_status(&PipelineError::InvalidRequest("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            pipeline_status(&LoadError::new("image-to-3D", "oom").into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            pipeline_status(&PipelineError::stage_failed("texture generation", "oom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            pipeline_status(&PipelineError::StageTimeout {
                stage: "shape generation".into(),
                timeout: Duration::from_secs(5),
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_failure_body_names_stage_and_keeps_stats() {
        let mut stats = GenerationStats::default();
        stats.record_time("shape generation", Duration::from_millis(250));
        let response = job_error_response(JobError::Generate(PipelineFailure {
            error: PipelineError::stage_failed("texture generation", "out of device memory"),
            stats,
            abandoned: None,
        }));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "texture generation: out of device memory");
        assert_eq!(body["stage"], "texture generation");
        assert_eq!(body["stats"]["time"]["shape generation"], 0.25);
    }

    #[test]
    fn test_closed_queue_is_unavailable() {
        assert_eq!(job_error_response(JobError::Closed).status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
