// HTTP response helper functions to reduce duplication across route handlers

use hyper::header::LOCATION;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

// The builder only fails on invalid header input, which these helpers never pass.
fn finish(builder: hyper::http::response::Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|e| {
        log::error!(target: "server", "Failed to build response: {e}");
        let mut fallback = Response::new(Body::from(r#"{"error":"Internal server error"}"#));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

fn with_cors(status: StatusCode) -> hyper::http::response::Builder {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    finish(with_cors(status).header("content-type", "application/json"), Body::from(json))
}

/// Build a JSON error response
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build a JSON success response
pub fn json_success(message: &str) -> Response<Body> {
    json_response(StatusCode::OK, &serde_json::json!({ "success": true, "message": message }))
}

pub fn html_response(status: StatusCode, html: impl Into<Body>) -> Response<Body> {
    finish(with_cors(status).header("content-type", "text/html; charset=utf-8"), html.into())
}

pub fn file_response(content_type: &str, bytes: Vec<u8>) -> Response<Body> {
    finish(
        with_cors(StatusCode::OK)
            .header("content-type", content_type)
            .header("cache-control", "no-cache"),
        Body::from(bytes),
    )
}

/// Streaming response for server-sent events
pub fn sse_response(body: Body) -> Response<Body> {
    finish(
        with_cors(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .header("x-accel-buffering", "no"),
        body,
    )
}

/// One `data:` frame carrying a JSON payload
pub fn sse_frame<T: Serialize>(event: &T) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| r#"{"type":"error","message":"Serialization failed"}"#.to_string());
    format!("data: {json}\n\n")
}

pub fn redirect_permanent(location: &str) -> Response<Body> {
    finish(
        Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(LOCATION, location),
        Body::empty(),
    )
}

pub fn not_found() -> Response<Body> {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    finish(with_cors(StatusCode::OK), Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_json_error_escapes_quotes() {
        let response = json_error(StatusCode::BAD_REQUEST, r#"Error "quoted""#);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], r#"Error "quoted""#);
    }

    #[test]
    fn test_redirect() {
        let response = redirect_permanent("/4iframe_fast3d");
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "/4iframe_fast3d");
    }

    #[test]
    fn test_sse_frame() {
        let frame = sse_frame(&serde_json::json!({"type": "progress", "fraction": 0.5}));
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }
}
