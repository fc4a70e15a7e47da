// Export route handler

use hyper::{Body, Request, Response, StatusCode};
use meshgen_engine::viewer;
use serde::Serialize;

use super::generate::{job_error_response, static_url_of};
use crate::web::request_parsing::{parse_json_body, ExportBody};
use crate::web::response_helpers::json_response;
use crate::web::server::AppState;

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub folder_id: String,
    pub file: String,
    pub viewer: String,
    pub viewer_html: String,
}

/// POST /api/export
pub async fn handle_export(req: Request<Body>, state: &AppState) -> Response<Body> {
    let body: ExportBody = match parse_json_body(req.into_body(), state.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    match state.queue.export(body.folder_id, body.options).await {
        Ok(output) => {
            let viewer = static_url_of(&output.folder, &output.viewer_path).unwrap_or_default();
            json_response(
                StatusCode::OK,
                &ExportResponse {
                    folder_id: output.folder_id().to_string(),
                    file: static_url_of(&output.folder, &output.path).unwrap_or_default(),
                    viewer_html: viewer::iframe_snippet(&viewer, state.viewer.height),
                    viewer,
                },
            )
        }
        Err(e) => {
            log::warn!(target: "server", "Export failed: {e}");
            job_error_response(e)
        }
    }
}
