//! Typed documents for the chat collections. Documents are camelCase JSON at
//! rest (matching the remote wire format); these structs are the typed
//! boundary the UI works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidepool_store::now_ms;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Data,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// One segment of a message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        url: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_message_at: i64,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Thread {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            title: "New Chat".to_string(),
            created_at: now,
            updated_at: now,
            last_message_at: now,
            visibility: Visibility::Private,
            last_modified_by: None,
            deleted: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl ChatMessage {
    pub fn new(thread_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        let now = now_ms();
        let content = content.into();
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            role,
            parts: vec![MessagePart::Text {
                text: content.clone(),
            }],
            content,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: String,
    pub message_id: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl MessageSummary {
    pub fn new(
        thread_id: impl Into<String>,
        message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }
}

pub(crate) fn to_doc<T: Serialize>(value: &T) -> tidepool_store::Result<Value> {
    serde_json::to_value(value).map_err(Into::into)
}

pub(crate) fn from_doc<T: for<'de> Deserialize<'de>>(doc: Value) -> tidepool_store::Result<T> {
    serde_json::from_value(doc).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_serializes_camel_case() {
        let thread = Thread::new("t1");
        let doc = serde_json::to_value(&thread).unwrap();
        assert_eq!(doc["id"], "t1");
        assert_eq!(doc["title"], "New Chat");
        assert_eq!(doc["visibility"], "private");
        assert!(doc["createdAt"].is_i64());
        assert!(doc["lastMessageAt"].is_i64());
        assert!(doc.get("last_message_at").is_none());
    }

    #[test]
    fn message_parts_are_tagged() {
        let mut msg = ChatMessage::new("t1", Role::Assistant, "hello");
        msg.parts.push(MessagePart::File {
            media_type: "image/png".to_string(),
            url: "https://example.com/x.png".to_string(),
        });
        let doc = serde_json::to_value(&msg).unwrap();
        assert_eq!(doc["role"], "assistant");
        assert_eq!(doc["parts"][0], json!({"type": "text", "text": "hello"}));
        assert_eq!(
            doc["parts"][1],
            json!({"type": "file", "mediaType": "image/png", "url": "https://example.com/x.png"})
        );

        let back: ChatMessage = serde_json::from_value(doc).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn summary_round_trips() {
        let summary = MessageSummary::new("t1", "m1", "a summary");
        let doc = serde_json::to_value(&summary).unwrap();
        assert_eq!(doc["threadId"], "t1");
        assert_eq!(doc["messageId"], "m1");
        let back: MessageSummary = serde_json::from_value(doc).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn optional_fields_default_on_deserialize() {
        let doc = json!({
            "id": "m1",
            "threadId": "t1",
            "role": "user",
            "content": "hi",
            "createdAt": 1,
            "updatedAt": 1,
        });
        let msg: ChatMessage = serde_json::from_value(doc).unwrap();
        assert!(msg.parts.is_empty());
        assert!(!msg.deleted);
    }
}
