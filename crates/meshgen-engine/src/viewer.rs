//! Standalone `<model-viewer>` pages written next to each generated mesh,
//! plus the iframe snippet API clients can embed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use meshgen_config::{ServerConfig, VIEWER_HEIGHT, VIEWER_WIDTH};

pub const WHITE_VIEWER: &str = "white_mesh.html";
pub const TEXTURED_VIEWER: &str = "textured_mesh.html";

const WHITE_SRC: &str = "./white_mesh.glb";
const TEXTURED_SRC: &str = "./textured_mesh.glb";

const SECURITY_META: &str = r#"
    <meta http-equiv="Content-Security-Policy" content="default-src 'self' 'unsafe-inline' 'unsafe-eval' https://cdn.jsdelivr.net data: blob:; frame-ancestors 'self';">
    <meta http-equiv="X-Frame-Options" content="SAMEORIGIN">
    <meta name="referrer" content="no-referrer">
"#;

const WHITE_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>meshgen viewer</title>
    <script type="module" src="https://cdn.jsdelivr.net/npm/@google/model-viewer@3.5.0/dist/model-viewer.min.js"></script>
    <style>
        body { margin: 0; background: #ffffff; }
        model-viewer { width: #width#px; height: #height#px; max-width: 100%; }
    </style>
</head>
<body>
    <model-viewer src="#src#" camera-controls auto-rotate shadow-intensity="1"
        exposure="1.0" environment-image="neutral" alt="Generated white mesh">
    </model-viewer>
</body>
</html>
"##;

const TEXTURED_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>meshgen viewer</title>
    <script type="module" src="https://cdn.jsdelivr.net/npm/@google/model-viewer@3.5.0/dist/model-viewer.min.js"></script>
    <style>
        body { margin: 0; background: #ffffff; font-family: sans-serif; }
        model-viewer { width: #width#px; height: #height#px; max-width: 100%; }
        .controls { display: flex; gap: 8px; justify-content: center; padding: 8px; }
    </style>
</head>
<body>
    <model-viewer id="viewer" src="#src#" camera-controls auto-rotate shadow-intensity="1"
        exposure="1.0" environment-image="neutral" tone-mapping="neutral" alt="Generated textured mesh">
    </model-viewer>
    <div class="controls">
        <button onclick="document.getElementById('viewer').environmentImage='neutral'">Neutral light</button>
        <button onclick="document.getElementById('viewer').environmentImage='legacy'">Studio light</button>
    </div>
</body>
</html>
"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerLayout {
    pub height: u32,
    pub width: u32,
}

impl Default for ViewerLayout {
    fn default() -> Self {
        Self {
            height: VIEWER_HEIGHT,
            width: VIEWER_WIDTH,
        }
    }
}

impl ViewerLayout {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            height: config.viewer_height(),
            width: config.viewer_width(),
        }
    }
}

pub fn viewer_file(textured: bool) -> &'static str {
    if textured {
        TEXTURED_VIEWER
    } else {
        WHITE_VIEWER
    }
}

/// Fill a template. The asset reference loses any trailing slash so the
/// browser never resolves it as a directory.
pub fn render_viewer(layout: ViewerLayout, textured: bool) -> String {
    let (template, src, offset) = if textured {
        (TEXTURED_TEMPLATE, TEXTURED_SRC, 50)
    } else {
        (WHITE_TEMPLATE, WHITE_SRC, 10)
    };
    template
        .replacen("<head>", &format!("<head>{SECURITY_META}"), 1)
        .replace("#height#", &layout.height.saturating_sub(offset).to_string())
        .replace("#width#", &layout.width.to_string())
        .replace("#src#", src.trim_end_matches('/'))
}

/// Write the viewer page into `folder` and return its path.
pub fn write_viewer(folder: &Path, layout: ViewerLayout, textured: bool) -> io::Result<PathBuf> {
    let path = folder.join(viewer_file(textured));
    fs::write(&path, render_viewer(layout, textured))?;
    Ok(path)
}

/// Sandboxed iframe pointing at a viewer page under `/static/`.
pub fn iframe_snippet(static_url: &str, height: u32) -> String {
    format!(
        r#"<div style='height: {height}px; width: 100%; position: relative;'>
    <iframe
        src="{static_url}"
        height="{height}"
        width="100%"
        frameborder="0"
        loading="lazy"
        allow="fullscreen; xr-spatial-tracking"
        sandbox="allow-same-origin allow-scripts allow-popups allow-forms"
        referrerpolicy="no-referrer"
        style="border: 1px solid #ddd; border-radius: 8px;">
        <p>Your browser does not support iframes. Please <a href="{static_url}" target="_blank">open the viewer</a>.</p>
    </iframe>
</div>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_white_viewer_placeholders_filled() {
        let html = render_viewer(ViewerLayout { height: 650, width: 500 }, false);
        assert!(html.contains(r#"src="./white_mesh.glb""#));
        assert!(html.contains("height: 640px"));
        assert!(html.contains("width: 500px"));
        assert!(!html.contains("#src#"));
        assert!(!html.contains("#width#"));
    }

    #[test]
    fn test_textured_viewer_offset_and_meta() {
        let html = render_viewer(ViewerLayout { height: 690, width: 500 }, true);
        assert!(html.contains("./textured_mesh.glb"));
        assert!(html.contains("height: 640px"));
        let head = html.find("<head>").unwrap();
        let meta = html.find("Content-Security-Policy").unwrap();
        let title = html.find("<title>").unwrap();
        assert!(head < meta && meta < title);
        assert!(!html.contains("#height#"));
    }

    #[test]
    fn test_write_viewer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_viewer(dir.path(), ViewerLayout::default(), false).unwrap();
        assert_eq!(path.file_name().unwrap(), WHITE_VIEWER);
        let html = fs::read_to_string(path).unwrap();
        assert!(html.contains("model-viewer"));
    }

    #[test]
    fn test_iframe_snippet() {
        let snippet = iframe_snippet("/static/abc/white_mesh.html", 650);
        assert!(snippet.contains(r#"src="/static/abc/white_mesh.html""#));
        assert!(snippet.contains("height: 650px"));
        assert!(snippet.contains("sandbox="));
    }
}
