//! REST transport against a fake delivery-optimization agent

mod common;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::eventually;
use dosdk_core::{
    errc, AgentService, AgentSettings, DeliveryService, DoError, Download, DownloadOptions,
    DownloadProperty, DownloadState, DownloadStatus, PropertyValue, ToleratedErrors,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Params = Query<HashMap<String, String>>;

/// Agent that accepts a fixed property set and completes transfers instantly
#[derive(Default)]
struct FakeAgent {
    states: Mutex<HashMap<String, DownloadState>>,
    properties: Mutex<HashMap<(String, String), String>>,
    next_id: AtomicUsize,
}

const KNOWN_PROPERTIES: [&str; 3] = ["CallerName", "HttpCustomHeaders", "UseForegroundPriority"];

fn error(status: StatusCode, code: i32) -> Response {
    (status, Json(json!({ "ErrorCode": code }))).into_response()
}

impl FakeAgent {
    fn transition(&self, params: &HashMap<String, String>, from: &[DownloadState], to: DownloadState) -> Response {
        let Some(id) = params.get("Id") else {
            return error(StatusCode::BAD_REQUEST, errc::E_INVALIDARG);
        };
        let mut states = self.states.lock();
        match states.get_mut(id) {
            Some(state) if from.contains(state) => {
                *state = to;
                StatusCode::OK.into_response()
            }
            Some(_) => error(StatusCode::BAD_REQUEST, errc::DO_E_INVALID_STATE),
            None => error(StatusCode::NOT_FOUND, errc::E_INVALIDARG),
        }
    }
}

async fn create(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    match params.get("Uri") {
        Some(uri) if uri.starts_with("http") => {}
        _ => return error(StatusCode::BAD_REQUEST, errc::E_INVALIDARG),
    }
    let id = format!("dl-{}", agent.next_id.fetch_add(1, Ordering::SeqCst));
    agent.states.lock().insert(id.clone(), DownloadState::Created);
    Json(json!({ "Id": id })).into_response()
}

async fn start(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    // Transfers complete as soon as they start
    agent.transition(
        &params,
        &[DownloadState::Created, DownloadState::Paused],
        DownloadState::Transferred,
    )
}

async fn pause(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    agent.transition(&params, &[DownloadState::Created], DownloadState::Paused)
}

async fn finalize(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    agent.transition(&params, &[DownloadState::Transferred], DownloadState::Finalized)
}

async fn abort(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    agent.transition(
        &params,
        &[
            DownloadState::Created,
            DownloadState::Transferring,
            DownloadState::Transferred,
            DownloadState::Paused,
        ],
        DownloadState::Aborted,
    )
}

async fn get_status(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    let state = params
        .get("Id")
        .and_then(|id| agent.states.lock().get(id).copied());
    match state {
        Some(state) => {
            let size = if state == DownloadState::Created { 0 } else { 100 };
            let status = DownloadStatus {
                bytes_total: size,
                bytes_transferred: size,
                ..DownloadStatus::new(state)
            };
            Json(status).into_response()
        }
        // Not the JSON error shape on purpose
        None => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
    }
}

async fn set_property(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    let Some(id) = params.get("Id").cloned() else {
        return error(StatusCode::BAD_REQUEST, errc::E_INVALIDARG);
    };
    for (name, value) in params.iter().filter(|(k, _)| k.as_str() != "Id") {
        if !KNOWN_PROPERTIES.contains(&name.as_str()) {
            return error(StatusCode::BAD_REQUEST, errc::DO_E_UNKNOWN_PROPERTY_ID);
        }
        agent
            .properties
            .lock()
            .insert((id.clone(), name.clone()), value.clone());
    }
    StatusCode::OK.into_response()
}

async fn get_property(State(agent): State<Arc<FakeAgent>>, Query(params): Params) -> Response {
    let (Some(id), Some(name)) = (params.get("Id"), params.get("PropertyName")) else {
        return error(StatusCode::BAD_REQUEST, errc::E_INVALIDARG);
    };
    match agent.properties.lock().get(&(id.clone(), name.clone())) {
        Some(value) => Json(json!({ "Value": value })).into_response(),
        None => error(StatusCode::BAD_REQUEST, errc::DO_E_UNKNOWN_PROPERTY_ID),
    }
}

async fn start_agent() -> (Arc<dyn DeliveryService>, String) {
    let agent = Arc::new(FakeAgent::default());
    let app = Router::new()
        .route("/download/create", post(create))
        .route("/download/start", post(start))
        .route("/download/pause", post(pause))
        .route("/download/finalize", post(finalize))
        .route("/download/abort", post(abort))
        .route("/download/getstatus", get(get_status))
        .route("/download/setproperty", post(set_property))
        .route("/download/getproperty", get(get_property))
        .with_state(agent);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base_url = format!("http://{}", addr);
    let service = AgentService::with_base_url(base_url.clone(), Duration::from_secs(5)).unwrap();
    (Arc::new(service), base_url)
}

fn fast_options() -> DownloadOptions {
    DownloadOptions {
        wait_poll_interval: Duration::from_millis(20),
        callback_poll_interval: Duration::from_millis(20),
        ..DownloadOptions::default()
    }
}

#[tokio::test]
async fn test_agent_download_lifecycle() {
    let (service, _) = start_agent().await;
    let download = Download::with_options(
        service,
        "http://example.com/file.bin",
        "/tmp/dosdk-agent.bin",
        fast_options(),
    )
    .await
    .unwrap();

    download
        .set_property(DownloadProperty::CallerName, "dosdk_tests")
        .await
        .unwrap();
    assert_eq!(
        download.get_property(DownloadProperty::CallerName).await.unwrap().as_str(),
        Some("dosdk_tests")
    );

    download
        .set_property(DownloadProperty::UseForegroundPriority, true)
        .await
        .unwrap();
    assert_eq!(
        download
            .get_property(DownloadProperty::UseForegroundPriority)
            .await
            .unwrap()
            .as_bool(),
        Some(true)
    );

    download.start_and_wait_until_completion().await.unwrap();
    let status = download.get_status().await.unwrap();
    assert_eq!(status.state, DownloadState::Finalized);
    assert_eq!(status.bytes_transferred, 100);
}

#[tokio::test]
async fn test_agent_error_codes_map_to_errors() {
    let (service, _) = start_agent().await;

    let err = service
        .create("not-a-url", std::path::Path::new("/tmp/x"))
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::InvalidArgument(_)));

    let download = Download::with_options(
        service.clone(),
        "http://example.com/file.bin",
        "/tmp/dosdk-agent-codes.bin",
        fast_options(),
    )
    .await
    .unwrap();

    let err = download.finalize().await.unwrap_err();
    assert_eq!(err.code(), errc::DO_E_INVALID_STATE);

    // Unknown property rejected by the agent, tolerated per compat settings
    let code = download
        .set_property_nothrow(DownloadProperty::CorrelationVector, "g+Vo71JZwkmJdYfF.0")
        .await;
    assert_eq!(code, errc::DO_E_UNKNOWN_PROPERTY_ID);
    let code = download
        .set_property_tolerant(
            DownloadProperty::IntegrityCheckMandatory,
            false,
            &ToleratedErrors::from_settings(&Default::default()),
        )
        .await
        .unwrap();
    assert_eq!(code, errc::DO_E_UNKNOWN_PROPERTY_ID);

    // Error bodies without a code surface as unexpected
    let err = service
        .get_status(&dosdk_core::DownloadId("missing".into()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), errc::E_UNEXPECTED);
}

#[tokio::test]
async fn test_agent_callbacks_are_polled() {
    let (service, _) = start_agent().await;
    let download = Download::with_options(
        service,
        "http://example.com/file.bin",
        "/tmp/dosdk-agent-cb.bin",
        fast_options(),
    )
    .await
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    download
        .set_property(
            DownloadProperty::CallbackInterface,
            PropertyValue::callback(move |_, status| sink.lock().push(status.state)),
        )
        .await
        .unwrap();

    download.start().await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || seen
            .lock()
            .contains(&DownloadState::Transferred))
        .await
    );
    // Identical snapshots are delivered once
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(download.control().get_status().state, DownloadState::Transferred);
}

#[tokio::test]
async fn test_agent_from_settings_uses_port() {
    let (_, base_url) = start_agent().await;
    let port: u16 = base_url.rsplit(':').next().unwrap().parse().unwrap();

    let settings = AgentSettings {
        port: Some(port),
        ..AgentSettings::default()
    };
    let agent = AgentService::from_settings(&settings).await.unwrap();
    assert_eq!(agent.base_url(), format!("http://127.0.0.1:{}", port));

    let id = agent
        .create("http://example.com/a", std::path::Path::new("/tmp/a"))
        .await
        .unwrap();
    agent.pause(&id).await.unwrap();
    assert_eq!(agent.get_status(&id).await.unwrap().state, DownloadState::Paused);
    agent.abort(&id).await.unwrap();
    assert_eq!(agent.get_status(&id).await.unwrap().state, DownloadState::Aborted);
}
