//! Shared types for DOSDK
//!
//! This crate contains the plain data structures shared by the SDK core,
//! the service transports and the CLI: property ids, states, status
//! snapshots, numeric error codes and settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Error Codes
// ============================================================================

/// Numeric error codes shared with the delivery service.
///
/// The values are HRESULT bit patterns reinterpreted as `i32`. They are part of
/// the wire contract with the service and must never change.
pub mod errc {
    pub const S_OK: i32 = 0;
    pub const E_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
    pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
    /// HRESULT_FROM_WIN32(ERROR_TIMEOUT)
    pub const E_TIMEOUT: i32 = 0x8007_05B4_u32 as i32;
    /// HRESULT_FROM_WIN32(ERROR_OPERATION_ABORTED)
    pub const E_ABORTED: i32 = 0x8007_03E3_u32 as i32;

    pub const DO_E_NO_SERVICE: i32 = 0x80D0_1001_u32 as i32;
    pub const DO_E_DOWNLOAD_NO_PROGRESS: i32 = 0x80D0_2002_u32 as i32;
    pub const DO_E_UNKNOWN_PROPERTY_ID: i32 = 0x80D0_2011_u32 as i32;
    pub const DO_E_READ_ONLY_PROPERTY: i32 = 0x80D0_2012_u32 as i32;
    pub const DO_E_INVALID_STATE: i32 = 0x80D0_2013_u32 as i32;
    pub const DO_E_HTTP_BLOCKSIZE_MISMATCH: i32 = 0x80D0_5001_u32 as i32;
    pub const DO_E_HTTP_STATUS: i32 = 0x80D0_5002_u32 as i32;
    pub const DO_E_TRANSIENT_NETWORK: i32 = 0x80D0_5010_u32 as i32;

    /// Errors the service retries on its own
    pub fn is_transient(code: i32) -> bool {
        code == DO_E_TRANSIENT_NETWORK
    }

    /// Symbolic name for a known code
    pub fn name(code: i32) -> Option<&'static str> {
        let name = match code {
            S_OK => "S_OK",
            E_UNEXPECTED => "E_UNEXPECTED",
            E_INVALIDARG => "E_INVALIDARG",
            E_NOTIMPL => "E_NOTIMPL",
            E_TIMEOUT => "E_TIMEOUT",
            E_ABORTED => "E_ABORTED",
            DO_E_NO_SERVICE => "DO_E_NO_SERVICE",
            DO_E_DOWNLOAD_NO_PROGRESS => "DO_E_DOWNLOAD_NO_PROGRESS",
            DO_E_UNKNOWN_PROPERTY_ID => "DO_E_UNKNOWN_PROPERTY_ID",
            DO_E_READ_ONLY_PROPERTY => "DO_E_READ_ONLY_PROPERTY",
            DO_E_INVALID_STATE => "DO_E_INVALID_STATE",
            DO_E_HTTP_BLOCKSIZE_MISMATCH => "DO_E_HTTP_BLOCKSIZE_MISMATCH",
            DO_E_HTTP_STATUS => "DO_E_HTTP_STATUS",
            DO_E_TRANSIENT_NETWORK => "DO_E_TRANSIENT_NETWORK",
            _ => return None,
        };
        Some(name)
    }
}

// ============================================================================
// Download Types
// ============================================================================

/// Identifier the service assigns to a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub String);

impl DownloadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DownloadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// State of a transfer as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadState {
    Created,
    Transferring,
    /// All bytes are on disk; the download still has to be finalized
    Transferred,
    Finalized,
    Aborted,
    Paused,
}

impl DownloadState {
    /// Finalized and aborted transfers never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Finalized | DownloadState::Aborted)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Created => "created",
            DownloadState::Transferring => "transferring",
            DownloadState::Transferred => "transferred",
            DownloadState::Finalized => "finalized",
            DownloadState::Aborted => "aborted",
            DownloadState::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadStatus {
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub error_code: i32,
    pub extended_error_code: i32,
    #[serde(rename = "Status")]
    pub state: DownloadState,
}

impl DownloadStatus {
    pub fn new(state: DownloadState) -> Self {
        Self {
            bytes_total: 0,
            bytes_transferred: 0,
            error_code: errc::S_OK,
            extended_error_code: errc::S_OK,
            state,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != errc::S_OK
    }

    pub fn is_transient_error(&self) -> bool {
        self.state == DownloadState::Paused && errc::is_transient(self.error_code)
    }

    /// All bytes arrived (finalized downloads count as complete too)
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            DownloadState::Transferred | DownloadState::Finalized
        )
    }

    /// Progress in percent, 0 when the size is not known yet
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}, 0x{:x}, 0x{:x}, {}",
            self.bytes_transferred,
            self.bytes_total,
            self.error_code,
            self.extended_error_code,
            self.state
        )
    }
}

// ============================================================================
// Property Types
// ============================================================================

/// Payload type a property expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Bool,
    String,
    UInt,
    /// 64-bit sizes
    UInt64,
    Callback,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyKind::Bool => "bool",
            PropertyKind::String => "string",
            PropertyKind::UInt => "uint",
            PropertyKind::UInt64 => "uint64",
            PropertyKind::Callback => "callback",
        };
        f.write_str(s)
    }
}

/// Fixed set of properties a download can carry.
///
/// The serialized name of each variant is also its wire name on the service's
/// REST interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadProperty {
    Id,
    Uri,
    CatalogId,
    CallerName,
    DownloadFilePath,
    HttpCustomHeaders,
    CostPolicy,
    SecurityFlags,
    CallbackFreqPercent,
    CallbackFreqSeconds,
    NoProgressTimeoutSeconds,
    UseForegroundPriority,
    BlockingMode,
    CallbackInterface,
    CorrelationVector,
    IntegrityCheckInfo,
    IntegrityCheckMandatory,
    TotalSizeBytes,
    DisallowOnCellular,
    HttpCustomAuthHeaders,
    HttpAllowSslDisable,
    NonVolatile,
}

impl DownloadProperty {
    pub const ALL: [DownloadProperty; 22] = [
        DownloadProperty::Id,
        DownloadProperty::Uri,
        DownloadProperty::CatalogId,
        DownloadProperty::CallerName,
        DownloadProperty::DownloadFilePath,
        DownloadProperty::HttpCustomHeaders,
        DownloadProperty::CostPolicy,
        DownloadProperty::SecurityFlags,
        DownloadProperty::CallbackFreqPercent,
        DownloadProperty::CallbackFreqSeconds,
        DownloadProperty::NoProgressTimeoutSeconds,
        DownloadProperty::UseForegroundPriority,
        DownloadProperty::BlockingMode,
        DownloadProperty::CallbackInterface,
        DownloadProperty::CorrelationVector,
        DownloadProperty::IntegrityCheckInfo,
        DownloadProperty::IntegrityCheckMandatory,
        DownloadProperty::TotalSizeBytes,
        DownloadProperty::DisallowOnCellular,
        DownloadProperty::HttpCustomAuthHeaders,
        DownloadProperty::HttpAllowSslDisable,
        DownloadProperty::NonVolatile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadProperty::Id => "Id",
            DownloadProperty::Uri => "Uri",
            DownloadProperty::CatalogId => "CatalogId",
            DownloadProperty::CallerName => "CallerName",
            DownloadProperty::DownloadFilePath => "DownloadFilePath",
            DownloadProperty::HttpCustomHeaders => "HttpCustomHeaders",
            DownloadProperty::CostPolicy => "CostPolicy",
            DownloadProperty::SecurityFlags => "SecurityFlags",
            DownloadProperty::CallbackFreqPercent => "CallbackFreqPercent",
            DownloadProperty::CallbackFreqSeconds => "CallbackFreqSeconds",
            DownloadProperty::NoProgressTimeoutSeconds => "NoProgressTimeoutSeconds",
            DownloadProperty::UseForegroundPriority => "UseForegroundPriority",
            DownloadProperty::BlockingMode => "BlockingMode",
            DownloadProperty::CallbackInterface => "CallbackInterface",
            DownloadProperty::CorrelationVector => "CorrelationVector",
            DownloadProperty::IntegrityCheckInfo => "IntegrityCheckInfo",
            DownloadProperty::IntegrityCheckMandatory => "IntegrityCheckMandatory",
            DownloadProperty::TotalSizeBytes => "TotalSizeBytes",
            DownloadProperty::DisallowOnCellular => "DisallowOnCellular",
            DownloadProperty::HttpCustomAuthHeaders => "HttpCustomAuthHeaders",
            DownloadProperty::HttpAllowSslDisable => "HttpAllowSslDisable",
            DownloadProperty::NonVolatile => "NonVolatile",
        }
    }

    pub fn expected_kind(&self) -> PropertyKind {
        match self {
            DownloadProperty::Id
            | DownloadProperty::Uri
            | DownloadProperty::CatalogId
            | DownloadProperty::CallerName
            | DownloadProperty::DownloadFilePath
            | DownloadProperty::HttpCustomHeaders
            | DownloadProperty::CorrelationVector
            | DownloadProperty::IntegrityCheckInfo
            | DownloadProperty::HttpCustomAuthHeaders => PropertyKind::String,
            DownloadProperty::CostPolicy
            | DownloadProperty::SecurityFlags
            | DownloadProperty::CallbackFreqPercent
            | DownloadProperty::CallbackFreqSeconds
            | DownloadProperty::NoProgressTimeoutSeconds => PropertyKind::UInt,
            DownloadProperty::TotalSizeBytes => PropertyKind::UInt64,
            DownloadProperty::UseForegroundPriority
            | DownloadProperty::BlockingMode
            | DownloadProperty::IntegrityCheckMandatory
            | DownloadProperty::DisallowOnCellular
            | DownloadProperty::HttpAllowSslDisable
            | DownloadProperty::NonVolatile => PropertyKind::Bool,
            DownloadProperty::CallbackInterface => PropertyKind::Callback,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, DownloadProperty::Id | DownloadProperty::TotalSizeBytes)
    }
}

impl fmt::Display for DownloadProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadProperty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadProperty::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown property: {}", s))
    }
}

/// Descriptor carried by the `IntegrityCheckInfo` property.
///
/// Points the service at the piece hash file of the content and the hash
/// over all piece hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckInfo {
    #[serde(rename = "PiecesHashFileUrl")]
    pub pieces_hash_file_url: String,
    #[serde(rename = "HashOfHashes")]
    pub hash_of_hashes: String,
}

impl IntegrityCheckInfo {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// SDK settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentSettings,
    pub local: LocalServiceSettings,
    pub compat: CompatSettings,
    /// Status poll interval of the blocking wait
    pub wait_poll_interval_ms: u64,
    /// Status poll interval of callback delivery when the service has no event stream
    pub callback_poll_interval_ms: u64,
    /// Upper bound for start_and_wait_until_completion
    pub completion_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            local: LocalServiceSettings::default(),
            compat: CompatSettings::default(),
            wait_poll_interval_ms: 500,
            callback_poll_interval_ms: 1000,
            completion_timeout_secs: 24 * 60 * 60,
        }
    }
}

/// Where to find the delivery-optimization agent's REST endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Fixed port; discovered from `port_file_dir` when unset
    pub port: Option<u16>,
    /// Directory holding the agent's `restport*` file
    pub port_file_dir: PathBuf,
    pub request_timeout_secs: u64,
}

fn default_port_file_dir() -> PathBuf {
    PathBuf::from("/var/run/deliveryoptimization-agent")
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            port: None,
            port_file_dir: default_port_file_dir(),
            request_timeout_secs: 30,
        }
    }
}

/// Tuning of the in-process delivery service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalServiceSettings {
    /// Global cap in bytes/sec (0 = unlimited)
    pub max_bandwidth_bps: u64,
    /// Cap for background transfers in bytes/sec (0 = unlimited)
    pub background_limit_bps: u64,
    /// Cap for background transfers while a foreground transfer runs
    pub contended_background_limit_bps: u64,
    /// Properties the service accepts; `None` accepts all of them
    pub supported_properties: Option<Vec<DownloadProperty>>,
    pub user_agent: String,
    /// A transfer without progress for this long fails with DO_E_DOWNLOAD_NO_PROGRESS
    pub no_progress_timeout_secs: u64,
    /// Delay between attempts after a transient network failure
    pub retry_delay_ms: u64,
}

impl Default for LocalServiceSettings {
    fn default() -> Self {
        Self {
            max_bandwidth_bps: 0,
            background_limit_bps: 0,
            contended_background_limit_bps: 512 * 1024,
            supported_properties: None,
            user_agent: format!("dosdk/{}", env!("CARGO_PKG_VERSION")),
            no_progress_timeout_secs: 60,
            retry_delay_ms: 1000,
        }
    }
}

/// Error codes accepted per property when the service version is unknown.
///
/// Older services reject newer properties with `DO_E_UNKNOWN_PROPERTY_ID`;
/// callers that only want to use such a property opportunistically list the
/// codes they are willing to accept here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatSettings {
    pub tolerated: HashMap<DownloadProperty, Vec<i32>>,
}

impl Default for CompatSettings {
    fn default() -> Self {
        let unknown = vec![errc::S_OK, errc::DO_E_UNKNOWN_PROPERTY_ID];
        let tolerated = [
            DownloadProperty::IntegrityCheckInfo,
            DownloadProperty::IntegrityCheckMandatory,
            DownloadProperty::CorrelationVector,
        ]
        .into_iter()
        .map(|p| (p, unknown.clone()))
        .collect();

        Self { tolerated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_names_round_trip_through_from_str() {
        for property in DownloadProperty::ALL {
            assert_eq!(property.as_str().parse::<DownloadProperty>(), Ok(property));
        }
        assert!("NotAProperty".parse::<DownloadProperty>().is_err());
    }

    #[test]
    fn test_error_code_values_are_stable() {
        assert_eq!(errc::E_INVALIDARG, -2147024809);
        assert_eq!(errc::DO_E_UNKNOWN_PROPERTY_ID, -2133843951);
        assert_eq!(errc::name(errc::DO_E_NO_SERVICE), Some("DO_E_NO_SERVICE"));
    }

    #[test]
    fn test_status_deserializes_from_agent_json() {
        let json = r#"{"Status":"Paused","BytesTotal":100,"BytesTransferred":40,"ErrorCode":-2133831664,"ExtendedErrorCode":0}"#;
        let status: DownloadStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, DownloadState::Paused);
        assert_eq!(status.bytes_transferred, 40);
        assert!(status.is_error());
        assert!(status.is_transient_error());
        assert!(!status.is_complete());

        let failed = DownloadStatus {
            error_code: errc::DO_E_DOWNLOAD_NO_PROGRESS,
            ..status
        };
        assert!(!failed.is_transient_error());
    }

    #[test]
    fn test_integrity_info_parse() {
        let info = IntegrityCheckInfo::parse(
            r#"{"PiecesHashFileUrl":"http://example.com/file.phf","HashOfHashes":"abc="}"#,
        )
        .unwrap();
        assert_eq!(info.hash_of_hashes, "abc=");
        assert!(IntegrityCheckInfo::parse("blah").is_err());
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"agent":{"port":50000},"wait_poll_interval_ms":100}"#).unwrap();
        assert_eq!(settings.agent.port, Some(50000));
        assert_eq!(settings.agent.request_timeout_secs, 30);
        assert_eq!(settings.wait_poll_interval_ms, 100);
        assert_eq!(settings.completion_timeout_secs, 24 * 60 * 60);
    }

    #[test]
    fn test_default_compat_tolerates_unknown_property() {
        let compat = CompatSettings::default();
        let codes = &compat.tolerated[&DownloadProperty::IntegrityCheckInfo];
        assert!(codes.contains(&errc::DO_E_UNKNOWN_PROPERTY_ID));
        assert!(!compat.tolerated.contains_key(&DownloadProperty::CallerName));
    }
}
