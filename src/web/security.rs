// Security headers applied to every response

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Response};

pub const STATIC_PREFIX: &str = "/static/";

/// Sent on every response regardless of route or status.
pub const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("x-frame-options", "SAMEORIGIN"),
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "no-referrer"),
];

/// Only under `/static/`, where the generated viewer pages live.
pub const STATIC_CSP: &str = "default-src 'self' 'unsafe-inline' 'unsafe-eval' https://cdn.jsdelivr.net data: blob:; \
frame-ancestors 'self'; img-src 'self' data: blob:; script-src 'self' 'unsafe-inline' 'unsafe-eval' https://cdn.jsdelivr.net;";

pub fn is_static_path(path: &str) -> bool {
    path.starts_with(STATIC_PREFIX)
}

/// Add the header set for `path` to `response`, overwriting any handler values.
pub fn apply(path: &str, response: &mut Response<Body>) {
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    if is_static_path(path) {
        headers.insert(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(STATIC_CSP),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_on_any_response() {
        let mut response = Response::new(Body::empty());
        apply("/health", &mut response);
        assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["referrer-policy"], "no-referrer");
        assert!(response.headers().get("content-security-policy").is_none());
    }

    #[test]
    fn test_csp_only_under_static() {
        let mut response = Response::new(Body::empty());
        apply("/static/abc/white_mesh.html", &mut response);
        let csp = response.headers()["content-security-policy"].to_str().unwrap();
        assert!(csp.contains("frame-ancestors 'self'"));
        assert!(csp.contains("https://cdn.jsdelivr.net"));
        assert!(!is_static_path("/statics/x"));
        assert!(!is_static_path("/static"));
    }
}
