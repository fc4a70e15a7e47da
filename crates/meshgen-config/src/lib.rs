//! Server configuration: the `meshgen_web` command line and the settings
//! derived from it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meshgen_types::request::{DEFAULT_STEPS, DEFAULT_TURBO_STEPS};
use meshgen_types::Device;

pub const DEFAULT_MOUNT_PATH: &str = "/4iframe_fast3d";
pub const DEFAULT_CACHE_SIZE: usize = 200;
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_MAX_BODY_MB: u64 = 64;
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_DEFAULT_PORT: u16 = 80;

pub const VIEWER_HEIGHT: u32 = 650;
pub const VIEWER_HEIGHT_MULTIVIEW: u32 = 690;
pub const VIEWER_WIDTH: u32 = 500;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "meshgen_web",
    version,
    about = "Image-to-3D mesh generation server with lazily loaded stages"
)]
pub struct ServerConfig {
    /// Shape model repository.
    #[arg(long = "model-path", alias = "model_path", default_value = "tencent/Hunyuan3D-2.1")]
    pub model_path: String,

    /// Shape model variant inside the repository.
    #[arg(long, default_value = "hunyuan3d-dit-v2-1")]
    pub subfolder: String,

    /// Texture model repository.
    #[arg(
        long = "texgen-model-path",
        alias = "texgen_model_path",
        default_value = "tencent/Hunyuan3D-2.1"
    )]
    pub texgen_model_path: String,

    #[arg(long, default_value_t = HTTP_DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Serve over HTTPS with the configured certificate.
    #[arg(long)]
    pub ssl: bool,

    /// Generate a self-signed certificate if none exists, then serve HTTPS.
    #[arg(long = "auto-ssl", alias = "auto_ssl")]
    pub auto_ssl: bool,

    #[arg(long = "ssl-cert", alias = "ssl_cert", default_value = "./certs/cert.pem")]
    pub ssl_cert: PathBuf,

    #[arg(long = "ssl-key", alias = "ssl_key", default_value = "./certs/key.pem")]
    pub ssl_key: PathBuf,

    /// Exit instead of falling back to plain HTTP when TLS cannot start.
    #[arg(long = "require-tls", alias = "require_tls")]
    pub require_tls: bool,

    #[arg(long, default_value = "cuda")]
    pub device: Device,

    /// Root directory for generated output folders.
    #[arg(long = "cache-path", alias = "cache_path", default_value = "./save_dir")]
    pub cache_path: PathBuf,

    /// Maximum number of output folders kept before the oldest is evicted.
    #[arg(long = "cache-size", alias = "cache_size", default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Enable caption input through the text-to-image stage.
    #[arg(long = "enable-t23d", alias = "enable_t23d")]
    pub enable_t23d: bool,

    /// Skip loading the texture pipeline.
    #[arg(long = "disable-tex", alias = "disable_tex")]
    pub disable_tex: bool,

    /// Release cached device memory after every run.
    #[arg(long = "low-vram-mode", alias = "low_vram_mode")]
    pub low_vram_mode: bool,

    /// Ask the shape stage to compile itself on load.
    #[arg(long)]
    pub compile: bool,

    #[arg(
        long = "mount-path",
        alias = "mount_path",
        default_value = DEFAULT_MOUNT_PATH,
        value_parser = parse_mount_path
    )]
    pub mount_path: String,

    /// Abort a run when a single stage exceeds this many seconds.
    #[arg(long = "stage-timeout-secs", alias = "stage_timeout_secs")]
    pub stage_timeout_secs: Option<u64>,

    /// Maximum number of generation jobs waiting for the worker.
    #[arg(long = "queue-capacity", alias = "queue_capacity", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Largest accepted JSON request body, in MiB.
    #[arg(long = "max-body-mb", alias = "max_body_mb", default_value_t = DEFAULT_MAX_BODY_MB)]
    pub max_body_mb: u64,

    #[arg(long = "log-dir", alias = "log_dir", default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["meshgen_web"])
    }
}

impl ServerConfig {
    /// Parse flags as if given on the command line after the binary name.
    pub fn from_flags(flags: &[&str]) -> Self {
        Self::parse_from(std::iter::once("meshgen_web").chain(flags.iter().copied()))
    }

    /// `<model_path>/<subfolder>`, as reported in generation stats.
    pub fn shapegen_model(&self) -> String {
        format!("{}/{}", self.model_path.trim_end_matches('/'), self.subfolder)
    }

    pub fn texgen_model(&self) -> String {
        self.texgen_model_path.clone()
    }

    pub fn texture_enabled(&self) -> bool {
        !self.disable_tex
    }

    pub fn multiview_mode(&self) -> bool {
        self.model_path.contains("mv")
    }

    pub fn turbo_mode(&self) -> bool {
        self.subfolder.contains("turbo")
    }

    pub fn default_steps(&self) -> u32 {
        if self.turbo_mode() {
            DEFAULT_TURBO_STEPS
        } else {
            DEFAULT_STEPS
        }
    }

    pub fn tls_requested(&self) -> bool {
        self.ssl || self.auto_ssl
    }

    /// Port to bind; plain port 80 becomes 443 once TLS is active.
    pub fn effective_port(&self, tls_active: bool) -> u16 {
        if tls_active && self.port == HTTP_DEFAULT_PORT {
            HTTPS_PORT
        } else {
            self.port
        }
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_mb.max(1).saturating_mul(1024 * 1024)
    }

    pub fn viewer_height(&self) -> u32 {
        if self.multiview_mode() {
            VIEWER_HEIGHT_MULTIVIEW
        } else {
            VIEWER_HEIGHT
        }
    }

    pub fn viewer_width(&self) -> u32 {
        VIEWER_WIDTH
    }
}

/// Normalize a mount path to a single leading slash and no trailing slash.
pub fn parse_mount_path(raw: &str) -> Result<String, String> {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err("mount path must name at least one segment, '/' is reserved for the redirect".into());
    }
    if segments[0] == "static" || segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(format!("mount path '{raw}' is not allowed"));
    }
    Ok(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 80);
        assert_eq!(config.cache_size, 200);
        assert_eq!(config.mount_path, "/4iframe_fast3d");
        assert_eq!(config.device, Device::Cuda);
        assert!(config.texture_enabled());
        assert!(!config.enable_t23d);
        assert_eq!(config.stage_timeout(), None);
        assert_eq!(config.shapegen_model(), "tencent/Hunyuan3D-2.1/hunyuan3d-dit-v2-1");
        assert_eq!(config.max_body_bytes(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_body_limit_flag() {
        let config = ServerConfig::parse_from(["meshgen_web", "--max_body_mb", "8"]);
        assert_eq!(config.max_body_bytes(), 8 * 1024 * 1024);
        let config = ServerConfig::parse_from(["meshgen_web", "--max-body-mb", "0"]);
        assert_eq!(config.max_body_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_underscore_aliases_accepted() {
        let config = ServerConfig::parse_from([
            "meshgen_web",
            "--model_path",
            "tencent/Hunyuan3D-2mv",
            "--enable_t23d",
            "--low_vram_mode",
            "--cache-size",
            "3",
            "--device",
            "cpu",
        ]);
        assert!(config.multiview_mode());
        assert!(config.enable_t23d);
        assert!(config.low_vram_mode);
        assert_eq!(config.cache_size, 3);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.viewer_height(), VIEWER_HEIGHT_MULTIVIEW);
    }

    #[test]
    fn test_turbo_default_steps() {
        let config = ServerConfig::parse_from(["meshgen_web", "--subfolder", "hunyuan3d-dit-v2-0-turbo"]);
        assert_eq!(config.default_steps(), 5);
        assert_eq!(ServerConfig::default().default_steps(), 30);
    }

    #[test]
    fn test_tls_port_switch() {
        let config = ServerConfig::parse_from(["meshgen_web", "--auto-ssl"]);
        assert!(config.tls_requested());
        assert_eq!(config.effective_port(true), 443);
        assert_eq!(config.effective_port(false), 80);

        let custom = ServerConfig::parse_from(["meshgen_web", "--ssl", "--port", "8443"]);
        assert_eq!(custom.effective_port(true), 8443);
    }

    #[test]
    fn test_mount_path_normalization() {
        assert_eq!(parse_mount_path("//viewer//app/").unwrap(), "/viewer/app");
        assert_eq!(parse_mount_path("demo").unwrap(), "/demo");
        assert!(parse_mount_path("/").is_err());
        assert!(parse_mount_path("/a/../b").is_err());
        assert!(parse_mount_path("/static").is_err());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config = ServerConfig::parse_from(["meshgen_web", "--stage-timeout-secs", "0"]);
        assert_eq!(config.stage_timeout(), None);
        let config = ServerConfig::parse_from(["meshgen_web", "--stage_timeout_secs", "90"]);
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(90)));
    }
}
