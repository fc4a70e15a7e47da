// Index page served at the mount path

use hyper::{Body, Response, StatusCode};

use crate::web::response_helpers::html_response;
use crate::web::server::AppState;

pub fn render_index(mount_path: &str, texture_enabled: bool, text_to_image_enabled: bool) -> String {
    let enabled = |on: bool| if on { "enabled" } else { "disabled" };
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Mesh Generation Server</title></head>
<body>
<h1>Mesh Generation Server</h1>
<p>Mounted at <code>{mount_path}</code>. Texture generation is {texture}, text-to-3D is {t2i}.</p>
<ul>
<li>GET /health - Health check</li>
<li>GET /api/status - Model state, memory and queue depth</li>
<li>POST /api/models/load - Load the models (server-sent progress events)</li>
<li>POST /api/models/unload - Release the models</li>
<li>POST /api/generate/shape - Generate a white mesh</li>
<li>POST /api/generate/textured - Generate a textured mesh</li>
<li>POST /api/export - Export a generated mesh as glb, obj, ply or stl</li>
<li>GET /static/&lt;folder&gt;/&lt;file&gt; - Generated files and viewer pages</li>
</ul>
</body>
</html>"#,
        texture = enabled(texture_enabled),
        t2i = enabled(text_to_image_enabled),
    )
}

pub fn handle_index(state: &AppState) -> Response<Body> {
    html_response(
        StatusCode::OK,
        render_index(
            &state.mount_path,
            state.lifecycle.texture_enabled(),
            state.lifecycle.text_to_image_enabled(),
        ),
    )
}
