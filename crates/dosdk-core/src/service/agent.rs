//! REST transport to the delivery-optimization agent
//!
//! The agent listens on a localhost port it publishes in a `restport*` file.
//! Mutating calls are POSTs, queries are GETs, and failures come back as a
//! non-2xx response with an `ErrorCode` body.

use crate::error::DoError;
use crate::property::WireValue;
use crate::service::DeliveryService;
use async_trait::async_trait;
use dosdk_types::{errc, AgentSettings, DownloadId, DownloadProperty, DownloadStatus};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const PORT_FILE_PREFIX: &str = "restport";

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct PropertyResponse {
    #[serde(rename = "Value")]
    value: WireValue,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "ErrorCode")]
    error_code: i32,
}

/// Client for the agent's REST interface
#[derive(Clone, Debug)]
pub struct AgentService {
    client: Client,
    base_url: String,
}

impl AgentService {
    /// Connect to an agent on `127.0.0.1:<port>`
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self, DoError> {
        Self::with_base_url(format!("http://127.0.0.1:{}", port), request_timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, DoError> {
        let client = Client::builder()
            .user_agent(format!("dosdk/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| DoError::NoService(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Connect using a configured port or the one the agent published
    pub async fn from_settings(settings: &AgentSettings) -> Result<Self, DoError> {
        let port = match settings.port {
            Some(port) => port,
            None => discover_port(&settings.port_file_dir).await?,
        };
        info!("Using delivery-optimization agent on port {}", port);
        Self::new(port, Duration::from_secs(settings.request_timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        action: &str,
        query: &[(&str, String)],
    ) -> Result<T, DoError> {
        let body = self.call_raw(method, action, query).await?;
        serde_json::from_slice(&body).map_err(DoError::from)
    }

    async fn call_raw(
        &self,
        method: Method,
        action: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, DoError> {
        let url = format!("{}/download/{}", self.base_url, action);
        debug!("Agent request: {} {}", method, url);

        let response = self
            .client
            .request(method, &url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    DoError::NoService(format!("agent not reachable at {}", self.base_url))
                } else {
                    DoError::Network(e)
                }
            })?;

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            return Ok(body.to_vec());
        }

        let code = serde_json::from_slice::<ErrorResponse>(&body)
            .map(|e| e.error_code)
            .unwrap_or(errc::E_UNEXPECTED);
        Err(DoError::from_code(
            code,
            format!("agent {} failed with HTTP {}", action, status.as_u16()),
        ))
    }
}

/// Find the agent's port from the `restport*` file it writes on startup.
///
/// A restarted agent can leave older files behind; the most recently written
/// one wins, ties broken by the highest file name.
pub async fn discover_port(dir: &Path) -> Result<u16, DoError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| DoError::NoService(format!("{}: {}", dir.display(), e)))?;

    let mut newest: Option<(SystemTime, String, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(PORT_FILE_PREFIX) {
            continue;
        }
        let modified = entry
            .metadata()
            .await?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let candidate = (modified, name, entry.path());
        if newest.as_ref().map_or(true, |best| (&candidate.0, &candidate.1) > (&best.0, &best.1)) {
            newest = Some(candidate);
        }
    }

    let (_, _, path) = newest.ok_or_else(|| {
        DoError::NoService(format!("no {} file in {}", PORT_FILE_PREFIX, dir.display()))
    })?;
    debug!("Reading agent port from {}", path.display());

    let content = tokio::fs::read_to_string(&path).await?;
    content
        .trim()
        .parse::<u16>()
        .map_err(|_| DoError::NoService(format!("malformed port file {}", path.display())))
}

#[async_trait]
impl DeliveryService for AgentService {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn create(&self, uri: &str, path: &Path) -> Result<DownloadId, DoError> {
        let response: CreateResponse = self
            .call(
                Method::POST,
                "create",
                &[
                    ("Uri", uri.to_string()),
                    ("DownloadFilePath", path.to_string_lossy().into_owned()),
                ],
            )
            .await?;
        Ok(DownloadId(response.id))
    }

    async fn start(&self, id: &DownloadId) -> Result<(), DoError> {
        self.call_raw(Method::POST, "start", &[("Id", id.to_string())])
            .await
            .map(|_| ())
    }

    async fn pause(&self, id: &DownloadId) -> Result<(), DoError> {
        self.call_raw(Method::POST, "pause", &[("Id", id.to_string())])
            .await
            .map(|_| ())
    }

    async fn finalize(&self, id: &DownloadId) -> Result<(), DoError> {
        self.call_raw(Method::POST, "finalize", &[("Id", id.to_string())])
            .await
            .map(|_| ())
    }

    async fn abort(&self, id: &DownloadId) -> Result<(), DoError> {
        self.call_raw(Method::POST, "abort", &[("Id", id.to_string())])
            .await
            .map(|_| ())
    }

    async fn get_status(&self, id: &DownloadId) -> Result<DownloadStatus, DoError> {
        self.call(Method::GET, "getstatus", &[("Id", id.to_string())])
            .await
    }

    async fn set_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
        value: WireValue,
    ) -> Result<(), DoError> {
        self.call_raw(
            Method::POST,
            "setproperty",
            &[("Id", id.to_string()), (property.as_str(), value.to_query_value())],
        )
        .await
        .map(|_| ())
    }

    async fn get_property(
        &self,
        id: &DownloadId,
        property: DownloadProperty,
    ) -> Result<WireValue, DoError> {
        let response: PropertyResponse = self
            .call(
                Method::GET,
                "getproperty",
                &[("Id", id.to_string()), ("PropertyName", property.as_str().to_string())],
            )
            .await?;
        // The agent answers with text whatever the property's type
        response.value.coerce(property.expected_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_port_reads_restport_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("unrelated.txt"), "1").await.unwrap();
        tokio::fs::write(dir.path().join("restport.1234"), "50000\n").await.unwrap();

        let port = discover_port(dir.path()).await.unwrap();
        assert_eq!(port, 50000);
    }

    #[tokio::test]
    async fn test_discover_port_prefers_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("restport.900");
        let fresh = dir.path().join("restport.100");
        std::fs::write(&stale, "50002").unwrap();
        std::fs::write(&fresh, "50001").unwrap();

        let now = SystemTime::now();
        let set_mtime = |path: &Path, time: SystemTime| {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(time)
                .unwrap();
        };
        set_mtime(&stale, now - Duration::from_secs(3600));
        set_mtime(&fresh, now);

        for _ in 0..3 {
            assert_eq!(discover_port(dir.path()).await.unwrap(), 50001);
        }
    }

    #[tokio::test]
    async fn test_discover_port_missing_is_no_service() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_port(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), errc::DO_E_NO_SERVICE);

        let err = discover_port(&dir.path().join("missing")).await.unwrap_err();
        assert_eq!(err.code(), errc::DO_E_NO_SERVICE);
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_no_service() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let agent = AgentService::new(port, Duration::from_secs(2)).unwrap();
        let err = agent
            .get_status(&DownloadId("x".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), errc::DO_E_NO_SERVICE);
    }
}
