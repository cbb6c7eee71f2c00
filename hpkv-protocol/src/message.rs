//! JSON message types for the HPKV WebSocket and REST interfaces.

use crate::error::ProtocolError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// WebSocket operation codes.
///
/// Encoded on the wire as the bare integer (`1` = get ... `4` = delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Returns the numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Operation::Get => 1,
            Operation::Insert => 2,
            Operation::Update => 3,
            Operation::Delete => 4,
        }
    }

    /// Returns the upper-case name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl TryFrom<u8> for Operation {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Operation::Get),
            2 => Ok(Operation::Insert),
            3 => Ok(Operation::Update),
            4 => Ok(Operation::Delete),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        Operation::try_from(code).map_err(serde::de::Error::custom)
    }
}

/// A stored record value.
///
/// The service stores strings. Callers decide explicitly whether a value is
/// plain text or structured JSON; JSON values are sent as their compact
/// string form.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Text(String),
    Json(Value),
}

impl RecordValue {
    pub fn text(s: impl Into<String>) -> Self {
        RecordValue::Text(s.into())
    }

    pub fn json(value: Value) -> Self {
        RecordValue::Json(value)
    }

    /// Returns the string that goes on the wire.
    pub fn encode(&self) -> String {
        match self {
            RecordValue::Text(s) => s.clone(),
            RecordValue::Json(v) => v.to_string(),
        }
    }

    /// Decodes a stored string, preferring JSON and falling back to text.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => RecordValue::Json(value),
            Err(_) => RecordValue::Text(raw.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RecordValue::Json(v) => Some(v),
            RecordValue::Text(_) => None,
        }
    }
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordValue::Text(s) => f.write_str(s),
            RecordValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<String> for RecordValue {
    fn from(s: String) -> Self {
        RecordValue::Text(s)
    }
}

impl From<&str> for RecordValue {
    fn from(s: &str) -> Self {
        RecordValue::Text(s.to_string())
    }
}

impl From<Value> for RecordValue {
    fn from(v: Value) -> Self {
        RecordValue::Json(v)
    }
}

/// Accepts a string, `null`, or any other JSON value (stringified).
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_required_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

// ============================================================================
// WebSocket messages
// ============================================================================

/// Request message sent over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation identifier, unique among pending requests.
    pub message_id: u64,

    pub op: Operation,

    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Request {
    pub fn new(message_id: u64, op: Operation, key: impl Into<String>) -> Self {
        Self {
            message_id,
            op,
            key: key.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Response message received over the WebSocket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Identifier of the request this response answers.
    pub message_id: u64,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(message_id: u64) -> Self {
        Self {
            message_id,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn error(message_id: u64, error: impl Into<String>) -> Self {
        Self {
            message_id,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Returns the error message, if present and non-empty.
    pub fn remote_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    pub fn is_ok(&self) -> bool {
        self.remote_error().is_none()
    }
}

/// Key-change notification pushed to token-authenticated subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Message type, always "notification".
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,

    /// Change time in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Notification {
    pub const TYPE: &'static str = "notification";

    pub fn new(key: impl Into<String>, value: impl Into<String>, timestamp: i64) -> Self {
        Self {
            msg_type: Self::TYPE.to_string(),
            key: Some(key.into()),
            value: Some(value.into()),
            timestamp: Some(timestamp),
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Parses the value as a number (prices are stored as decimal strings).
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

// ============================================================================
// REST payloads
// ============================================================================

/// Body of `POST /record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_update: Option<bool>,
}

/// Body returned by `GET /record/{key}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,
}

/// Body of `POST /record/atomic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicIncrementParams {
    pub key: String,
    pub increment: i64,
}

/// Result of an atomic increment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicResult {
    #[serde(default)]
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Counter value after the increment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<i64>,

    /// Additional fields (for forward compatibility).
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Query parameters of `GET /records`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeParams {
    pub start_key: String,
    pub end_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A record returned by a range scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRecord {
    pub key: String,
    #[serde(default, deserialize_with = "lenient_required_string")]
    pub value: String,
}

impl RangeRecord {
    pub fn decoded(&self) -> RecordValue {
        RecordValue::decode(&self.value)
    }
}

/// Result of `GET /records`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeResult {
    #[serde(default)]
    pub records: Vec<RangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

/// Body of `POST /token/websocket`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenParams {
    pub subscribe_keys: Vec<String>,
}

/// Result of `POST /token/websocket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResult {
    pub token: String,
}

/// Error body returned by REST endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiErrorBody {
    pub fn describe(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }
}
