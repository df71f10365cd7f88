//! Shared fixtures: an HTTP file server with range support

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct ServerState {
    pub user_agents: Mutex<Vec<String>>,
    pub ranges: Mutex<Vec<String>>,
}

pub struct FileServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
}

impl FileServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/blob/:size", get(serve_blob))
            .route("/guarded/:size", get(serve_guarded))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn blob_url(&self, size: usize) -> String {
        format!("{}/blob/{}", self.base_url, size)
    }

    /// Served only when the request carries `XCustom1: someData`
    pub fn guarded_url(&self, size: usize) -> String {
        format!("{}/guarded/{}", self.base_url, size)
    }

    pub fn missing_url(&self) -> String {
        format!("{}/missing/file.bin", self.base_url)
    }
}

/// Deterministic content so resumed files can be checked byte for byte
pub fn blob(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn range_start(headers: &HeaderMap) -> Option<usize> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    value
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

async fn serve_blob(
    Path(size): Path<usize>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if let Some(ua) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        state.user_agents.lock().push(ua.to_string());
    }

    let body = blob(size);
    match range_start(&headers) {
        Some(start) if start >= size => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        Some(start) => {
            state.ranges.lock().push(format!("{}-", start));
            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, size - 1, size),
                )],
                body[start..].to_vec(),
            )
                .into_response()
        }
        None => body.into_response(),
    }
}

async fn serve_guarded(
    path: Path<usize>,
    headers: HeaderMap,
    state: State<Arc<ServerState>>,
) -> Response {
    let allowed = headers
        .get("xcustom1")
        .map(|v| v == "someData")
        .unwrap_or(false);
    if !allowed {
        return StatusCode::BAD_REQUEST.into_response();
    }
    serve_blob(path, headers, state).await
}

/// Accepts connections and never answers them
pub struct SilentServer {
    pub base_url: String,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        Self {
            base_url: format!("http://{}", addr),
        }
    }

    pub fn url(&self) -> String {
        format!("{}/hangs.bin", self.base_url)
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
