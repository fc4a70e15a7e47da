// Health check route handler

use hyper::{Body, Response, StatusCode};

use crate::web::response_helpers::json_response;

pub fn handle() -> Response<Body> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({"status": "ok", "service": "meshgen-web"}),
    )
}
