//! Thread and message models shared by the store, the run coordinator and the
//! wire protocol.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of characters kept when previewing the last message of a thread.
pub const PREVIEW_CHARS: usize = 50;

/// Current time truncated to microseconds, the precision the durable store keeps.
#[must_use]
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// === Core Message Types ===

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Human,
    #[serde(alias = "assistant")]
    Ai,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }

    /// Parse a stored or client-supplied role name, accepting chat-style aliases.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "human" | "user" => Some(Role::Human),
            "ai" | "assistant" => Some(Role::Ai),
            _ => None,
        }
    }

    /// Role name used by OpenAI-compatible chat APIs.
    #[must_use]
    pub fn chat_role(self) -> &'static str {
        match self {
            Role::Human => "user",
            Role::Ai => "assistant",
        }
    }
}

/// A single typed part of structured message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
}

/// Message content: either a plain string or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    PlainText(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Canonical string form: text parts concatenated in order.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Content::PlainText(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.as_str(),
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Content::PlainText(text) => text.trim().is_empty(),
            Content::Parts(parts) => parts.iter().all(|part| match part {
                ContentPart::Text { text } => text.trim().is_empty(),
            }),
        }
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::PlainText(String::new())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::PlainText(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::PlainText(value.to_string())
    }
}

/// A persisted conversation message. Immutable once appended to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Content,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn with_id(id: impl Into<String>, role: Role, content: impl Into<Content>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at: now_micros(),
        }
    }

    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id.clone(),
            role: self.role,
            content: self.content.clone(),
        }
    }
}

#[cfg(test)]
impl Message {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self::with_id(new_message_id(), role, content)
    }

    pub fn human(content: impl Into<Content>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn ai(content: impl Into<Content>) -> Self {
        Self::new(Role::Ai, content)
    }
}

#[must_use]
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Message shape exchanged with clients: `{id, type, content}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub role: Role,
    pub content: Content,
}

/// A message as submitted in a run request. `type` may also be spelled `role`.
#[derive(Debug, Clone, Deserialize)]
pub struct InputMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", alias = "role")]
    pub role: Role,
    #[serde(default)]
    pub content: Content,
}

impl InputMessage {
    #[must_use]
    pub fn into_message(self) -> Message {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_message_id);
        Message::with_id(id, self.role, self.content)
    }
}

// === Threads ===

/// A durable, ordered conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Thread {
    #[must_use]
    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|message| message.created_at)
    }

    #[must_use]
    pub fn wire_messages(&self) -> Vec<WireMessage> {
        self.messages.iter().map(Message::to_wire).collect()
    }
}

/// Listing entry for a thread, without its messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[must_use]
pub fn preview_text(content: &Content) -> String {
    content.to_text().chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn content_accepts_string_or_parts() {
        let plain: Content = serde_json::from_value(json!("Hello")).unwrap();
        assert_eq!(plain, Content::PlainText("Hello".to_string()));

        let parts: Content = serde_json::from_value(json!([
            { "type": "text", "text": "Hel" },
            { "type": "text", "text": "lo" }
        ]))
        .unwrap();
        assert_eq!(parts.to_text(), "Hello");
        assert_eq!(
            serde_json::to_value(&parts).unwrap(),
            json!([
                { "type": "text", "text": "Hel" },
                { "type": "text", "text": "lo" }
            ])
        );
    }

    #[test]
    fn non_text_parts_are_rejected() {
        let parsed = serde_json::from_value::<Content>(json!([
            { "type": "image_url", "image_url": "http://example.com/cat.png" }
        ]));
        assert!(parsed.is_err());
    }

    #[test]
    fn input_message_accepts_role_aliases() {
        let msg: InputMessage =
            serde_json::from_value(json!({ "role": "user", "content": "hi" })).unwrap();
        assert_eq!(msg.role, Role::Human);

        let msg: InputMessage =
            serde_json::from_value(json!({ "type": "assistant", "content": "yo" })).unwrap();
        assert_eq!(msg.role, Role::Ai);

        let converted = msg.into_message();
        assert!(!converted.id.is_empty());
        assert_eq!(converted.content.to_text(), "yo");
    }

    #[test]
    fn wire_message_uses_type_key() {
        let message = Message::with_id("m1", Role::Ai, "done");
        assert_eq!(
            serde_json::to_value(message.to_wire()).unwrap(),
            json!({ "id": "m1", "type": "ai", "content": "done" })
        );
    }

    #[test]
    fn preview_keeps_leading_characters() {
        let long = Content::from("é".repeat(80));
        assert_eq!(preview_text(&long).chars().count(), PREVIEW_CHARS);
        let parts = Content::Parts(vec![
            ContentPart::Text { text: "ab".into() },
            ContentPart::Text { text: "cd".into() },
        ]);
        assert_eq!(preview_text(&parts), "abcd");
    }

    #[test]
    fn role_parse_handles_aliases() {
        assert_eq!(Role::parse("Assistant"), Some(Role::Ai));
        assert_eq!(Role::parse("human"), Some(Role::Human));
        assert_eq!(Role::parse("system"), None);
    }
}
