// Static file serving from the output cache

use std::path::Path;

use hyper::{Body, Response};
use meshgen_engine::OutputCache;
use tokio::fs;

use crate::web::response_helpers::{file_response, not_found};
use crate::web::security::STATIC_PREFIX;

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "html" | "htm" => "text/html; charset=utf-8",
        "obj" | "mtl" | "txt" => "text/plain; charset=utf-8",
        "ply" => "application/ply",
        "stl" => "model/stl",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        "js" => "application/javascript",
        "css" => "text/css",
        _ => "application/octet-stream",
    }
}

/// GET /static/<path>
///
/// Directories serve their `index.html` when present; anything else that
/// is not a file under the cache root is a 404.
pub async fn handle_static(path: &str, cache: &OutputCache) -> Response<Body> {
    let relative = path.strip_prefix(STATIC_PREFIX).unwrap_or_default();
    let decoded = match urlencoding::decode(relative) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return not_found(),
    };
    let Some(mut file_path) = cache.resolve(&decoded) else {
        log::warn!(target: "server", "Rejected static path {path}");
        return not_found();
    };
    if file_path.is_dir() {
        file_path.push("index.html");
    }

    match fs::read(&file_path).await {
        Ok(content) => file_response(content_type_for(&file_path), content),
        Err(_) => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a/white_mesh.glb")), "model/gltf-binary");
        assert_eq!(content_type_for(Path::new("a/WHITE_MESH.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a/textured_mesh.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a/noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_directory_serves_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OutputCache::new(dir.path(), 10).unwrap();
        let folder = cache.allocate().unwrap();

        let missing = handle_static(&format!("/static/{}/", folder.id()), &cache).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        std::fs::write(folder.join("index.html"), "<p>hi</p>").unwrap();
        let response = handle_static(&format!("/static/{}", folder.id()), &cache).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_traversal_and_encoded_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OutputCache::new(dir.path().join("root"), 10).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "no").unwrap();
        assert_eq!(handle_static("/static/../secret.txt", &cache).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(handle_static("/static/%2e%2e/secret.txt", &cache).await.status(), StatusCode::NOT_FOUND);

        std::fs::write(cache.root().join("my mesh.obj"), "v 0 0 0").unwrap();
        let response = handle_static("/static/my%20mesh.obj", &cache).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
