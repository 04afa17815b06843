use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::{SUBSYSTEM_AUTH, SUBSYSTEM_CHAT, SUBSYSTEM_GATEWAY};

/// Upper bound on `messageText`, in bytes. Keeps a fanout envelope within
/// the payload budget of the distributed broadcast backend (a Postgres
/// NOTIFY payload tops out near 8000 bytes).
pub const MAX_MESSAGE_TEXT_BYTES: usize = 4096;

/// Per-frame headers. The credential is optional: frames without one are
/// anonymous, frames with one (re)authenticate the connection before the
/// frame is dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Headers {
    pub fn is_empty(&self) -> bool {
        self.credential.is_none()
    }
}

/// The message envelope shared by both directions of the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub subsystem: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize the `data` body into an action payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    fn outbound(subsystem: &str, action: &str, data: impl Serialize) -> Self {
        Self {
            subsystem: subsystem.to_owned(),
            action: action.to_owned(),
            headers: Headers::default(),
            // Outbound payloads are plain data structs; serialization cannot fail.
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// Server → chat group: a newly persisted message.
    pub fn new_message(data: NewMessageData) -> Self {
        Self::outbound(SUBSYSTEM_CHAT, "newMessage", data)
    }

    /// Server → sender: sendMessage succeeded.
    pub fn message_sent(data: MessageSentData) -> Self {
        Self::outbound(SUBSYSTEM_CHAT, "messageSent", data)
    }

    /// Server → sender: reply to an explicit `auth/authenticate` probe.
    pub fn auth_state(data: AuthStateData) -> Self {
        Self::outbound(SUBSYSTEM_AUTH, "state", data)
    }

    /// Server → sender: the frame it just sent was rejected.
    pub fn error(data: ErrorData) -> Self {
        Self::outbound(SUBSYSTEM_GATEWAY, "error", data)
    }
}

/// Author block embedded in fanout envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorSummary {
    pub id: i64,
    pub username: String,
}

/// `chat/sendMessage` request body. Exactly one of `user_id` / `chat_id`
/// names the target; the gateway rejects both-or-neither.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    pub message_text: String,
}

/// `chat/markRead` request body: the peer of the personal chat and the
/// message the reader has reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadData {
    pub user_id: i64,
    pub message_id: i64,
}

/// `chat/newMessage` fanout body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageData {
    pub message_id: i64,
    pub message_text: String,
    pub created_at: DateTime<Utc>,
    pub author: AuthorSummary,
}

/// `chat/messageSent` acknowledgment body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentData {
    pub chat_id: i64,
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
}

/// `auth/state` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthStateData {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// `gateway/error` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}
