// Model load/unload route handlers

use hyper::body::Bytes;
use hyper::{Body, Response, StatusCode};
use meshgen_types::{LoadError, LoadProgress, LoadReport};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

use crate::web::response_helpers::{json_error, json_success, sse_frame, sse_response};
use crate::web::server::AppState;

/// One server-sent event of the load stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadEvent {
    Progress(LoadProgress),
    Done(LoadReport),
    Error { message: String },
}

impl LoadEvent {
    pub fn finished(result: Result<LoadReport, LoadError>) -> Self {
        match result {
            Ok(report) => LoadEvent::Done(report),
            Err(e) => LoadEvent::Error { message: e.to_string() },
        }
    }
}

/// POST /api/models/load
///
/// Streams `progress` events while the stages are instantiated, then one
/// `done` or `error` event. A load already in flight is joined, not restarted.
pub fn handle_load(state: &AppState) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<LoadProgress>();
    let lifecycle = state.lifecycle.clone();

    // The sender is dropped when the load returns, which ends the forwarding loop.
    let load = spawn_blocking(move || lifecycle.load(Some(&progress_tx)));

    tokio::spawn(async move {
        let mut connected = true;
        while let Some(progress) = progress_rx.recv().await {
            if connected && sender.send_data(Bytes::from(sse_frame(&LoadEvent::Progress(progress)))).await.is_err() {
                log::info!(target: "server", "Load progress client disconnected, load continues");
                connected = false;
            }
        }

        let event = match load.await {
            Ok(result) => LoadEvent::finished(result),
            Err(e) => {
                log::error!(target: "server", "Load task panicked: {e}");
                LoadEvent::Error {
                    message: "model loading crashed".to_string(),
                }
            }
        };
        if connected {
            let _ = sender.send_data(Bytes::from(sse_frame(&event))).await;
        }
    });

    sse_response(body)
}

/// POST /api/models/unload
pub async fn handle_unload(state: &AppState) -> Response<Body> {
    let lifecycle = state.lifecycle.clone();
    match spawn_blocking(move || lifecycle.unload()).await {
        Ok(message) => json_success(&message),
        Err(e) => {
            log::error!(target: "server", "Unload task panicked: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to unload models")
        }
    }
}
