// Mesh generation web server
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use meshgen_config::ServerConfig;
use meshgen_engine::{DeviceMemoryMonitor, MemoryMonitor};
use meshgen_server::web::logger::setup_logging;
use meshgen_server::web::server::{serve, AppState};
use meshgen_server::web::tls::resolve_tls;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let log_path = setup_logging(&config.log_dir).context("failed to set up logging")?;
    log::info!("Logging to {}", log_path.display());

    let monitor: Arc<dyn MemoryMonitor> = Arc::new(DeviceMemoryMonitor::probe(config.device));
    log::info!("Device memory: {}", monitor.snapshot().summary());

    let state = Arc::new(AppState::build(&config, monitor).context("failed to initialize server state")?);
    log::info!(
        "Models: shape {} / texture {} (texture {}, text-to-3D {}, low VRAM {})",
        config.shapegen_model(),
        config.texgen_model(),
        if config.texture_enabled() { "on" } else { "off" },
        if config.enable_t23d { "on" } else { "off" },
        if config.low_vram_mode { "on" } else { "off" },
    );

    let tls = match resolve_tls(&config) {
        Ok(tls) => tls,
        Err(e) if config.require_tls => return Err(e).context("TLS is required but could not be set up"),
        Err(e) => {
            log::warn!("TLS unavailable ({e}), falling back to HTTP");
            None
        }
    };

    let port = config.effective_port(tls.is_some());
    let addr = tokio::net::lookup_host((config.host.as_str(), port))
        .await
        .with_context(|| format!("cannot resolve {}:{port}", config.host))?
        .next()
        .with_context(|| format!("no address for {}:{port}", config.host))?;

    log::info!("Mesh generation server starting, viewer mounted at {}", config.mount_path);
    log::info!("Available endpoints:");
    log::info!("  GET  /health                 - Health check");
    log::info!("  GET  /api/status             - Model state, memory, queue");
    log::info!("  POST /api/models/load        - Load models (SSE progress)");
    log::info!("  POST /api/models/unload      - Release models");
    log::info!("  POST /api/generate/shape     - Generate a white mesh");
    log::info!("  POST /api/generate/textured  - Generate a textured mesh");
    log::info!("  POST /api/export             - Export a generated mesh");
    log::info!("  GET  /static/...             - Generated files");

    serve(state, addr, tls).await
}
