//! Property values and their validation
//!
//! A property value is a tagged union. Before anything reaches the service the
//! tag is checked against the kind the property expects and payloads with a
//! structure (integrity descriptor, header lists) are parsed.

use crate::download::DownloadControl;
use crate::error::DoError;
use dosdk_types::{CompatSettings, DownloadProperty, DownloadStatus, IntegrityCheckInfo, PropertyKind};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Status handler registered through [`DownloadProperty::CallbackInterface`]
pub type StatusCallback = Arc<dyn Fn(&DownloadControl, &DownloadStatus) + Send + Sync>;

/// Typed value set on a download
#[derive(Clone)]
pub enum PropertyValue {
    Bool(bool),
    String(String),
    UInt(u32),
    UInt64(u64),
    Callback(StatusCallback),
}

impl PropertyValue {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&DownloadControl, &DownloadStatus) + Send + Sync + 'static,
    {
        PropertyValue::Callback(Arc::new(f))
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::UInt(_) => PropertyKind::UInt,
            PropertyValue::UInt64(_) => PropertyKind::UInt64,
            PropertyValue::Callback(_) => PropertyKind::Callback,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v as u64),
            PropertyValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// Wire form of the value; callbacks never leave the process
    pub fn to_wire(&self) -> Option<WireValue> {
        match self {
            PropertyValue::Bool(b) => Some(WireValue::Bool(*b)),
            PropertyValue::String(s) => Some(WireValue::String(s.clone())),
            PropertyValue::UInt(v) => Some(WireValue::UInt(*v)),
            PropertyValue::UInt64(v) => Some(WireValue::UInt64(*v)),
            PropertyValue::Callback(_) => None,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            PropertyValue::String(s) => f.debug_tuple("String").field(s).finish(),
            PropertyValue::UInt(v) => f.debug_tuple("UInt").field(v).finish(),
            PropertyValue::UInt64(v) => f.debug_tuple("UInt64").field(v).finish(),
            PropertyValue::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::UInt(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::UInt64(value)
    }
}

impl From<WireValue> for PropertyValue {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Bool(b) => PropertyValue::Bool(b),
            WireValue::UInt(v) => PropertyValue::UInt(v),
            WireValue::UInt64(v) => PropertyValue::UInt64(v),
            WireValue::String(s) => PropertyValue::String(s),
        }
    }
}

/// Property value as exchanged with a delivery service
///
/// Untagged JSON numbers decode as the narrowest integer that fits; use
/// [`WireValue::coerce`] to get the kind a property expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Bool(bool),
    UInt(u32),
    UInt64(u64),
    String(String),
}

impl WireValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            WireValue::Bool(_) => PropertyKind::Bool,
            WireValue::UInt(_) => PropertyKind::UInt,
            WireValue::UInt64(_) => PropertyKind::UInt64,
            WireValue::String(_) => PropertyKind::String,
        }
    }

    /// Reinterpret a decoded value as `kind`.
    ///
    /// The agent reports every property as a string, so text is parsed into
    /// the expected payload. Integers widen freely and narrow only when they fit.
    pub fn coerce(self, kind: PropertyKind) -> Result<WireValue, DoError> {
        let coerced = match (kind, self) {
            (PropertyKind::Bool, WireValue::Bool(b)) => Some(WireValue::Bool(b)),
            (PropertyKind::Bool, WireValue::String(s)) => parse_bool(&s).map(WireValue::Bool),
            (PropertyKind::UInt, WireValue::UInt(v)) => Some(WireValue::UInt(v)),
            (PropertyKind::UInt, WireValue::UInt64(v)) => u32::try_from(v).ok().map(WireValue::UInt),
            (PropertyKind::UInt, WireValue::String(s)) => s.trim().parse().ok().map(WireValue::UInt),
            (PropertyKind::UInt64, WireValue::UInt(v)) => Some(WireValue::UInt64(v as u64)),
            (PropertyKind::UInt64, WireValue::UInt64(v)) => Some(WireValue::UInt64(v)),
            (PropertyKind::UInt64, WireValue::String(s)) => s.trim().parse().ok().map(WireValue::UInt64),
            (PropertyKind::String, WireValue::String(s)) => Some(WireValue::String(s)),
            (PropertyKind::String, other) => Some(WireValue::String(other.to_query_value())),
            (kind, other) => {
                return Err(DoError::Serialization(format!(
                    "expected a {} value, got {:?}",
                    kind, other
                )))
            }
        };
        coerced.ok_or_else(|| DoError::Serialization(format!("value is not a valid {}", kind)))
    }

    /// Render for a query string parameter
    pub fn to_query_value(&self) -> String {
        match self {
            WireValue::Bool(b) => b.to_string(),
            WireValue::UInt(v) => v.to_string(),
            WireValue::UInt64(v) => v.to_string(),
            WireValue::String(s) => s.clone(),
        }
    }
}

/// Check that `value` fits `property` before it is handed to the service
pub fn validate(property: DownloadProperty, value: &PropertyValue) -> Result<(), DoError> {
    let expected = property.expected_kind();
    if value.kind() != expected {
        return Err(DoError::InvalidArgument(format!(
            "{} expects a {} value, got {}",
            property,
            expected,
            value.kind()
        )));
    }

    if property.is_read_only() {
        return Err(DoError::ReadOnlyProperty(property.to_string()));
    }

    match (property, value) {
        (DownloadProperty::IntegrityCheckInfo, PropertyValue::String(json)) => {
            IntegrityCheckInfo::parse(json).map_err(|e| {
                DoError::InvalidArgument(format!("malformed integrity check info: {}", e))
            })?;
        }
        (
            DownloadProperty::HttpCustomHeaders | DownloadProperty::HttpCustomAuthHeaders,
            PropertyValue::String(raw),
        ) => {
            parse_headers(raw)?;
        }
        (DownloadProperty::CallbackFreqPercent, PropertyValue::UInt(percent)) if *percent > 100 => {
            return Err(DoError::InvalidArgument(format!(
                "callback frequency {}% is above 100%",
                percent
            )));
        }
        (
            DownloadProperty::Uri
            | DownloadProperty::DownloadFilePath
            | DownloadProperty::CallerName,
            PropertyValue::String(s),
        ) if s.is_empty() => {
            return Err(DoError::InvalidArgument(format!("{} must not be empty", property)));
        }
        _ => {}
    }

    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a custom header list.
///
/// One header per line, `Name: value` or `Name=value`. Blank lines are skipped.
pub fn parse_headers(raw: &str) -> Result<Vec<(HeaderName, HeaderValue)>, DoError> {
    let mut headers = Vec::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let split = line
            .find(|c: char| c == ':' || c == '=')
            .ok_or_else(|| DoError::InvalidArgument(format!("header without separator: {}", line)))?;
        let (name, value) = (line[..split].trim(), line[split + 1..].trim());

        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DoError::InvalidArgument(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| DoError::InvalidArgument(format!("invalid header value for {}", name)))?;
        headers.push((name, value));
    }

    if headers.is_empty() {
        return Err(DoError::InvalidArgument("empty header list".to_string()));
    }

    Ok(headers)
}

/// Error codes a caller accepts per property.
///
/// Capability probing: a newer property set against an older service fails
/// with `DO_E_UNKNOWN_PROPERTY_ID`, which callers that only use the property
/// opportunistically want to shrug off. Success is always accepted.
#[derive(Debug, Clone, Default)]
pub struct ToleratedErrors {
    codes: HashMap<DownloadProperty, HashSet<i32>>,
}

impl ToleratedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(compat: &CompatSettings) -> Self {
        let codes = compat
            .tolerated
            .iter()
            .map(|(property, codes)| (*property, codes.iter().copied().collect()))
            .collect();
        Self { codes }
    }

    pub fn tolerate(mut self, property: DownloadProperty, codes: &[i32]) -> Self {
        self.codes.entry(property).or_default().extend(codes);
        self
    }

    pub fn is_tolerated(&self, property: DownloadProperty, code: i32) -> bool {
        code == dosdk_types::errc::S_OK
            || self
                .codes
                .get(&property)
                .map(|codes| codes.contains(&code))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosdk_types::errc;

    const PHF_INFO: &str =
        r#"{"PiecesHashFileUrl":"http://localhost/file.phf","HashOfHashes":"ND8vr1EgMCEYJw=="}"#;

    #[test]
    fn test_tag_mismatch_is_invalid_argument() {
        let err = validate(DownloadProperty::UseForegroundPriority, &"yes".into()).unwrap_err();
        assert_eq!(err.code(), errc::E_INVALIDARG);

        let err = validate(DownloadProperty::CallerName, &true.into()).unwrap_err();
        assert_eq!(err.code(), errc::E_INVALIDARG);

        let cb = PropertyValue::callback(|_, _| {});
        let err = validate(DownloadProperty::CallerName, &cb).unwrap_err();
        assert_eq!(err.code(), errc::E_INVALIDARG);
    }

    #[test]
    fn test_well_formed_values_pass() {
        validate(DownloadProperty::CallerName, &"dosdk_tests".into()).unwrap();
        validate(DownloadProperty::IntegrityCheckMandatory, &true.into()).unwrap();
        validate(DownloadProperty::IntegrityCheckInfo, &PHF_INFO.into()).unwrap();
        validate(DownloadProperty::CorrelationVector, &"g+Vo71JZwkmJdYfF.0".into()).unwrap();
        validate(DownloadProperty::CallbackFreqSeconds, &5u32.into()).unwrap();
        validate(
            DownloadProperty::CallbackInterface,
            &PropertyValue::callback(|_, _| {}),
        )
        .unwrap();
    }

    #[test]
    fn test_malformed_integrity_info() {
        let err = validate(DownloadProperty::IntegrityCheckInfo, &"blah".into()).unwrap_err();
        assert!(matches!(err, DoError::InvalidArgument(_)));
    }

    #[test]
    fn test_read_only_property() {
        let err = validate(DownloadProperty::Id, &"abc".into()).unwrap_err();
        assert_eq!(err.code(), errc::DO_E_READ_ONLY_PROPERTY);
    }

    #[test]
    fn test_callback_frequency_bound() {
        assert!(validate(DownloadProperty::CallbackFreqPercent, &100u32.into()).is_ok());
        assert!(validate(DownloadProperty::CallbackFreqPercent, &101u32.into()).is_err());
    }

    #[test]
    fn test_parse_headers_accepts_both_separators() {
        let headers = parse_headers("XCustom1=someData\nXCustom2: moreData\n\n").unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0.as_str(), "xcustom1");
        assert_eq!(headers[0].1, "someData");
        assert_eq!(headers[1].1, "moreData");

        assert!(parse_headers("no separator here").is_err());
        assert!(parse_headers("   \n").is_err());
    }

    #[test]
    fn test_wire_value_untagged_json() {
        let v: WireValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, WireValue::Bool(true));
        let v: WireValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, WireValue::UInt(42));
        let v: WireValue = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, WireValue::String("x".to_string()));
        let v: WireValue = serde_json::from_str("5000000000").unwrap();
        assert_eq!(v, WireValue::UInt64(5_000_000_000));
    }

    #[test]
    fn test_coerce_agent_strings() {
        let s = |v: &str| WireValue::String(v.to_string());
        assert_eq!(s("true").coerce(PropertyKind::Bool).unwrap(), WireValue::Bool(true));
        assert_eq!(s("0").coerce(PropertyKind::Bool).unwrap(), WireValue::Bool(false));
        assert_eq!(s("30").coerce(PropertyKind::UInt).unwrap(), WireValue::UInt(30));
        assert_eq!(
            s("5000000000").coerce(PropertyKind::UInt64).unwrap(),
            WireValue::UInt64(5_000_000_000)
        );
        assert!(s("maybe").coerce(PropertyKind::Bool).is_err());
        assert!(s("5000000000").coerce(PropertyKind::UInt).is_err());
    }

    #[test]
    fn test_coerce_integers() {
        assert_eq!(
            WireValue::UInt(7).coerce(PropertyKind::UInt64).unwrap(),
            WireValue::UInt64(7)
        );
        assert_eq!(
            WireValue::UInt64(7).coerce(PropertyKind::UInt).unwrap(),
            WireValue::UInt(7)
        );
        assert_eq!(
            WireValue::UInt64(u32::MAX as u64 + 1).coerce(PropertyKind::UInt).unwrap_err().code(),
            dosdk_types::errc::E_UNEXPECTED
        );
        assert_eq!(
            WireValue::Bool(true).coerce(PropertyKind::String).unwrap(),
            WireValue::String("true".to_string())
        );
        assert!(WireValue::String("x".into()).coerce(PropertyKind::Callback).is_err());
    }

    #[test]
    fn test_tolerated_errors() {
        let tolerated = ToleratedErrors::from_settings(&CompatSettings::default());
        assert!(tolerated.is_tolerated(DownloadProperty::CallerName, errc::S_OK));
        assert!(tolerated.is_tolerated(
            DownloadProperty::IntegrityCheckInfo,
            errc::DO_E_UNKNOWN_PROPERTY_ID
        ));
        assert!(!tolerated.is_tolerated(DownloadProperty::IntegrityCheckInfo, errc::E_INVALIDARG));
        assert!(!tolerated.is_tolerated(
            DownloadProperty::CallerName,
            errc::DO_E_UNKNOWN_PROPERTY_ID
        ));

        let tolerated = ToleratedErrors::new()
            .tolerate(DownloadProperty::CallerName, &[errc::DO_E_UNKNOWN_PROPERTY_ID]);
        assert!(tolerated.is_tolerated(
            DownloadProperty::CallerName,
            errc::DO_E_UNKNOWN_PROPERTY_ID
        ));
    }
}
