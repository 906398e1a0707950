use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identity of one conversation: the contact plus the line it talks on.
///
/// A missing channel is its own key and never matches a concrete channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub contact: String,
    #[serde(default)]
    pub channel: Option<i64>,
}

impl ConversationKey {
    pub fn new(contact: impl Into<String>, channel: Option<i64>) -> Self {
        Self {
            contact: contact.into(),
            channel,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "{}@{}", self.contact, channel),
            None => write!(f, "{}@-", self.contact),
        }
    }
}

/// Source-assigned message identity.
///
/// Ids that both parse as unsigned integers compare numerically; numeric ids
/// sort before non-numeric ones, which compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(left), Some(right)) => left.cmp(&right).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Terminal tag applied to a conversation when it is closed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispositionRef(pub String);

impl DispositionRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DispositionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Document,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" | "text" | "chat" => Ok(MessageKind::Text),
            "image" | "photo" | "sticker" => Ok(MessageKind::Image),
            "video" => Ok(MessageKind::Video),
            "audio" | "ptt" | "voice" => Ok(MessageKind::Audio),
            "document" | "file" => Ok(MessageKind::Document),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    FromContact,
    FromOperator,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::FromContact => "from_contact",
            Direction::FromOperator => "from_operator",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "from_contact" | "contact" | "inbound" | "in" => Ok(Direction::FromContact),
            "from_operator" | "operator" | "outbound" | "out" => Ok(Direction::FromOperator),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub key: ConversationKey,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<DispositionRef>,
}

impl Message {
    /// Position of the message inside its group.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            timestamp: self.timestamp,
            id: self.id.clone(),
        }
    }

    pub fn is_from_contact(&self) -> bool {
        self.direction == Direction::FromContact
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub timestamp: DateTime<Utc>,
    pub id: MessageId,
}

/// Read-only view of one conversation, rebuilt on every store change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationGroup {
    pub key: ConversationKey,
    pub display_name: String,
    pub messages: Vec<Message>,
    pub is_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_disposition: Option<DispositionRef>,
}

impl ConversationGroup {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message().map(|message| message.timestamp)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|message| &message.id == id)
    }
}

/// Listing order for groups: most recent activity first.
///
/// Ties on the last timestamp fall back to the last message id (larger first)
/// and then the key, so the listing never depends on insertion order.
pub fn compare_recent_first(left: &ConversationGroup, right: &ConversationGroup) -> Ordering {
    let left_last = left.last_message().map(Message::order_key);
    let right_last = right.last_message().map(Message::order_key);
    right_last
        .cmp(&left_last)
        .then_with(|| left.key.cmp(&right.key))
}
