//! HTTP(S) server: state wiring, the request router and the accept loops.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use meshgen_config::ServerConfig;
use meshgen_engine::viewer::ViewerLayout;
use meshgen_engine::{
    LoadContext, MemoryMonitor, OutputCache, PipelineMode, PipelineOptions, PipelineOrchestrator,
    ResourceLifecycleManager, SharedLifecycle, StageRegistry,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::generation_queue::{GenerationQueue, SharedGenerationQueue};
use super::path::collapse;
use super::response_helpers::{cors_preflight, not_found, redirect_permanent};
use super::routes::{export, generate, health, index, model, static_files, status};
use super::security;

/// Everything the handlers share.
pub struct AppState {
    pub lifecycle: SharedLifecycle,
    pub cache: Arc<OutputCache>,
    pub queue: SharedGenerationQueue,
    pub mount_path: String,
    pub default_steps: u32,
    pub max_body_bytes: u64,
    pub viewer: ViewerLayout,
}

pub type SharedAppState = Arc<AppState>;

impl AppState {
    /// Wire registry, lifecycle, cache, orchestrator and queue from the config.
    ///
    /// Must be called inside a tokio runtime; the queue worker is spawned here.
    pub fn build(config: &ServerConfig, monitor: Arc<dyn MemoryMonitor>) -> anyhow::Result<Self> {
        let registry = StageRegistry::builtin(config);
        let lifecycle = Arc::new(ResourceLifecycleManager::new(
            registry,
            monitor,
            LoadContext::from_config(config),
            config.low_vram_mode,
        ));
        let cache = Arc::new(OutputCache::new(&config.cache_path, config.cache_size)?);
        let options = PipelineOptions::from_config(config);
        let viewer = options.viewer;
        let orchestrator = Arc::new(PipelineOrchestrator::new(lifecycle.clone(), cache.clone(), options));
        let queue = Arc::new(GenerationQueue::spawn(orchestrator, config.queue_capacity));

        Ok(Self {
            lifecycle,
            cache,
            queue,
            mount_path: config.mount_path.clone(),
            default_steps: config.default_steps(),
            max_body_bytes: config.max_body_bytes(),
            viewer,
        })
    }

    fn is_mount(&self, path: &str) -> bool {
        path == self.mount_path || path.strip_suffix('/') == Some(self.mount_path.as_str())
    }
}

/// Entry point for every request: collapse the path, route, add security headers.
pub async fn handle_request(req: Request<Body>, state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = collapse(req.uri().path());

    let mut response = route(req, &method, &path, &state).await;
    security::apply(&path, &mut response);

    log::info!(target: "server", "{method} {path} -> {}", response.status().as_u16());
    Ok(response)
}

async fn route(req: Request<Body>, method: &Method, path: &str, state: &AppState) -> Response<Body> {
    match (method, path) {
        (&Method::OPTIONS, _) => cors_preflight(),
        (&Method::GET, "/") => redirect_permanent(&state.mount_path),
        (&Method::GET, "/health") => health::handle(),
        (&Method::GET, p) if state.is_mount(p) => index::handle_index(state),
        (&Method::GET, "/api/status") => status::handle_status(state),
        (&Method::POST, "/api/models/load") => model::handle_load(state),
        (&Method::POST, "/api/models/unload") => model::handle_unload(state).await,
        (&Method::POST, "/api/generate/shape") => {
            generate::handle_generate(req, state, PipelineMode::ShapeOnly).await
        }
        (&Method::POST, "/api/generate/textured") => {
            generate::handle_generate(req, state, PipelineMode::ShapeAndTexture).await
        }
        (&Method::POST, "/api/export") => export::handle_export(req, state).await,
        (&Method::GET | &Method::HEAD, p) if security::is_static_path(p) => {
            static_files::handle_static(p, &state.cache).await
        }
        _ => not_found(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!(target: "server", "Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!(target: "server", "Shutdown signal received");
}

/// Serve until ctrl-c. With an acceptor every connection is TLS.
pub async fn serve(state: SharedAppState, addr: SocketAddr, tls: Option<TlsAcceptor>) -> anyhow::Result<()> {
    match tls {
        None => serve_plain(state, addr).await,
        Some(acceptor) => serve_tls(state, addr, acceptor).await,
    }
}

async fn serve_plain(state: SharedAppState, addr: SocketAddr) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone()))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    log::info!(target: "server", "Listening on http://{addr}");
    server.with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn serve_tls(state: SharedAppState, addr: SocketAddr, acceptor: TlsAcceptor) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!(target: "server", "Listening on https://{addr}");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!(target: "server", "Accept failed: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!(target: "server", "TLS handshake with {peer} failed: {e}");
                            return;
                        }
                    };
                    let service = service_fn(move |req| handle_request(req, state.clone()));
                    if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                        log::debug!(target: "server", "Connection with {peer} ended: {e}");
                    }
                });
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}
