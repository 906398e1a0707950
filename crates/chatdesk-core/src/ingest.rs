use crate::model::{ConversationKey, Direction, DispositionRef, Message, MessageId, MessageKind};
use crate::wire::{ConversationRefPayload, RawMessage, SendFailedPayload, WireMsg};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("malformed event: missing {field}")]
    MissingField { field: &'static str },
    #[error("malformed event: invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl IngestError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Where a removal or reopen applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationTarget {
    Conversation(ConversationKey),
    Contact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub message_id: Option<MessageId>,
    pub contact: Option<String>,
    pub code: String,
    pub message: String,
}

/// Conversation event after boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(Message),
    SendConfirmed(Message),
    SendFailed(SendFailure),
    LineReallocated(Message),
    ConversationRemoved(ConversationTarget),
    ConversationReopened(ConversationTarget),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage(_) => "new_message",
            InboundEvent::SendConfirmed(_) => "send_confirmed",
            InboundEvent::SendFailed(_) => "send_failed",
            InboundEvent::LineReallocated(_) => "line_reallocated",
            InboundEvent::ConversationRemoved(_) => "conversation_removed",
            InboundEvent::ConversationReopened(_) => "conversation_reopened",
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            InboundEvent::NewMessage(message)
            | InboundEvent::SendConfirmed(message)
            | InboundEvent::LineReallocated(message) => Some(message),
            _ => None,
        }
    }
}

/// Turns a push frame into a conversation event.
///
/// Session frames (hello, subscribe, heartbeat) yield `Ok(None)`.
pub fn inbound_from_wire(msg: WireMsg) -> Result<Option<InboundEvent>, IngestError> {
    let event = match msg {
        WireMsg::Hello(_) | WireMsg::Subscribe(_) | WireMsg::Heartbeat(_) => return Ok(None),
        WireMsg::NewMessage(raw) => InboundEvent::NewMessage(message_from_raw(raw)?),
        WireMsg::SendConfirmed(raw) => {
            let mut message = message_from_raw(raw)?;
            message.direction = Direction::FromOperator;
            InboundEvent::SendConfirmed(message)
        }
        WireMsg::SendFailed(payload) => InboundEvent::SendFailed(send_failure(payload)?),
        WireMsg::LineReallocated(raw) => InboundEvent::LineReallocated(message_from_raw(raw)?),
        WireMsg::ConversationRemoved(payload) => {
            InboundEvent::ConversationRemoved(conversation_target(payload)?)
        }
        WireMsg::ConversationReopened(payload) => {
            InboundEvent::ConversationReopened(conversation_target(payload)?)
        }
    };
    Ok(Some(event))
}

pub fn message_from_raw(raw: RawMessage) -> Result<Message, IngestError> {
    let id = non_blank(raw.id, "id")?;
    let contact = non_blank(raw.contact, "contact")?;
    let channel = parse_channel(raw.channel.as_ref())?;
    let timestamp = match raw.timestamp.as_ref() {
        Some(value) => parse_timestamp(value)?,
        None => return Err(IngestError::MissingField { field: "timestamp" }),
    };
    let direction = match (raw.direction.as_deref(), raw.from_operator) {
        (Some(value), _) => value
            .parse::<Direction>()
            .map_err(|err| IngestError::invalid("direction", err))?,
        (None, Some(true)) => Direction::FromOperator,
        (None, Some(false)) => Direction::FromContact,
        (None, None) => return Err(IngestError::MissingField { field: "direction" }),
    };
    let kind = match raw.kind.as_deref() {
        Some(value) => value
            .parse::<MessageKind>()
            .map_err(|err| IngestError::invalid("kind", err))?,
        None => MessageKind::default(),
    };
    let display_name = raw
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| contact.clone());

    Ok(Message {
        id: MessageId(id),
        key: ConversationKey { contact, channel },
        display_name,
        body: raw.body.unwrap_or_default(),
        kind,
        media_ref: raw.media_ref.filter(|value| !value.trim().is_empty()),
        direction,
        timestamp,
        disposition: raw
            .disposition
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(DispositionRef),
    })
}

fn send_failure(payload: SendFailedPayload) -> Result<SendFailure, IngestError> {
    if payload.message_id.is_none() && payload.contact.is_none() {
        return Err(IngestError::MissingField {
            field: "message_id or contact",
        });
    }
    Ok(SendFailure {
        message_id: payload.message_id.map(MessageId),
        contact: payload.contact,
        code: payload.code,
        message: payload.message,
    })
}

fn conversation_target(payload: ConversationRefPayload) -> Result<ConversationTarget, IngestError> {
    let contact = non_blank(payload.contact, "contact")?;
    if payload.all_channels {
        return Ok(ConversationTarget::Contact(contact));
    }
    let channel = parse_channel(payload.channel.as_ref())?;
    Ok(ConversationTarget::Conversation(ConversationKey {
        contact,
        channel,
    }))
}

fn non_blank(value: Option<String>, field: &'static str) -> Result<String, IngestError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(IngestError::MissingField { field }),
    }
}

/// Channels arrive as integers, numeric strings, or null.
pub fn parse_channel(value: Option<&Value>) -> Result<Option<i64>, IngestError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| IngestError::invalid("channel", format!("not an integer: {number}"))),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|err| IngestError::invalid("channel", err.to_string())),
        Some(other) => Err(IngestError::invalid(
            "channel",
            format!("unexpected value: {other}"),
        )),
    }
}

/// RFC 3339 strings, or integers counted in epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, IngestError> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| IngestError::invalid("timestamp", err.to_string())),
        Value::Number(number) => {
            let millis = number.as_i64().ok_or_else(|| {
                IngestError::invalid("timestamp", format!("not an integer: {number}"))
            })?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| IngestError::invalid("timestamp", format!("out of range: {millis}")))
        }
        other => Err(IngestError::invalid(
            "timestamp",
            format!("unexpected value: {other}"),
        )),
    }
}
