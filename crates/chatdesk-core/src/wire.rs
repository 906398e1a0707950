use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Push protocol revision. Gateways write it as `1` or as `"v1"`; it is
/// always written back as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "VersionField")]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(1);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl From<ProtocolVersion> for u16 {
    fn from(version: ProtocolVersion) -> Self {
        version.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionField {
    Number(i64),
    Label(String),
}

impl TryFrom<VersionField> for ProtocolVersion {
    type Error = String;

    fn try_from(field: VersionField) -> Result<Self, Self::Error> {
        let parsed = match &field {
            VersionField::Number(number) => u16::try_from(*number).ok(),
            VersionField::Label(label) => {
                let label = label.trim();
                label.strip_prefix('v').unwrap_or(label).parse().ok()
            }
        };
        parsed.map(ProtocolVersion).ok_or_else(|| match field {
            VersionField::Number(number) => format!("version {number} out of range"),
            VersionField::Label(label) => format!("unreadable version label {label:?}"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub session_id: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

/// Every frame the push channel can carry.
///
/// `Hello`, `Subscribe` and `Heartbeat` belong to the session itself; the
/// remaining variants describe conversation events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Subscribe(SubscribePayload),
    Heartbeat(HeartbeatPayload),
    NewMessage(RawMessage),
    SendConfirmed(RawMessage),
    SendFailed(SendFailedPayload),
    LineReallocated(RawMessage),
    ConversationRemoved(ConversationRefPayload),
    ConversationReopened(ConversationRefPayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::Subscribe(_) => "subscribe",
            WireMsg::Heartbeat(_) => "heartbeat",
            WireMsg::NewMessage(_) => "new_message",
            WireMsg::SendConfirmed(_) => "send_confirmed",
            WireMsg::SendFailed(_) => "send_failed",
            WireMsg::LineReallocated(_) => "line_reallocated",
            WireMsg::ConversationRemoved(_) => "conversation_removed",
            WireMsg::ConversationReopened(_) => "conversation_reopened",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribePayload {
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub sent_at_ms: i64,
}

/// Message-shaped payload as produced by the push and poll sources.
///
/// Fields stay loosely typed here; `ingest` turns them into a `Message` or
/// rejects the payload as malformed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawMessage {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default, alias = "phone", alias = "contact_id")]
    pub contact: Option<String>,
    #[serde(default, alias = "line_id")]
    pub channel: Option<Value>,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default, alias = "text")]
    pub body: Option<String>,
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub from_operator: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, alias = "tabulation")]
    pub disposition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendFailedPayload {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRefPayload {
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub channel: Option<Value>,
    #[serde(default)]
    pub all_channels: bool,
}

/// Accept an id given either as a string or a number.
fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(de::Error::custom("expected string or number for id")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line of {size} bytes over the {max} byte limit")]
    Oversized { size: usize, max: usize },
    #[error("protocol version {0} not supported")]
    UnsupportedVersion(u16),
    #[error("cannot encode envelope: {0}")]
    Encode(String),
    #[error("undecodable envelope: {0}")]
    Decode(String),
}

/// Result of splitting one push text message.
#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub envelopes: Vec<WireEnvelope>,
    pub errors: Vec<FrameError>,
}

/// Serializes one envelope as a single NDJSON line, without the newline.
pub fn encode_line(envelope: &WireEnvelope, max_line_bytes: usize) -> Result<String, FrameError> {
    let line = serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if line.len() > max_line_bytes {
        return Err(FrameError::Oversized {
            size: line.len(),
            max: max_line_bytes,
        });
    }
    Ok(line)
}

/// Joins envelopes into one text message, one per line.
pub fn encode_batch(envelopes: &[WireEnvelope], max_line_bytes: usize) -> Result<String, FrameError> {
    let lines = envelopes
        .iter()
        .map(|envelope| encode_line(envelope, max_line_bytes))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

/// Splits a push text message into envelopes.
///
/// Blank lines are skipped. A bad line is reported and never hides the
/// lines after it, so one garbled event costs exactly one error entry.
pub fn decode_batch(text: &str, max_line_bytes: usize) -> DecodeReport {
    let mut report = DecodeReport::default();
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if line.len() > max_line_bytes {
            report.errors.push(FrameError::Oversized {
                size: line.len(),
                max: max_line_bytes,
            });
            continue;
        }
        match serde_json::from_str::<WireEnvelope>(line) {
            Ok(envelope) if envelope.version != ProtocolVersion::CURRENT => report
                .errors
                .push(FrameError::UnsupportedVersion(envelope.version.0)),
            Ok(envelope) => report.envelopes.push(envelope),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
    report
}
