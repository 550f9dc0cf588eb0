// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// A registered user. The password is stored as given and never serialized.
#[derive(sqlx::FromRow, Serialize, Clone, Debug, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// A named group. Members live in the `chat_members` join table.
#[derive(sqlx::FromRow, Serialize, Clone, Debug, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub from_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub from_id: UserId,
    pub content: String,
}

/// Reasons an incoming frame is rejected. None of these end the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `Type` field")]
    MissingType,

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A frame sent from a client to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    JoinChat(JoinChat),
    SendMessage(SendMessage),
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct JoinChat {
    #[serde(rename = "ChatID", alias = "chatID", alias = "chat_id")]
    pub chat_id: ChatId,
    #[serde(rename = "UserID", alias = "userID", alias = "user_id")]
    pub user_id: UserId,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct SendMessage {
    #[serde(rename = "ChatID", alias = "chatID", alias = "chat_id")]
    pub chat_id: ChatId,
    #[serde(rename = "UserID", alias = "userID", alias = "user_id")]
    pub user_id: UserId,
    #[serde(rename = "Message", alias = "message")]
    pub message: String,
}

impl ClientMessage {
    pub const JOIN_CHAT: &'static str = "join_chat";
    pub const SEND_MESSAGE: &'static str = "send_message";

    /// Decode a text frame. Reads the `Type` discriminator first,
    /// then the payload for that variant.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let object = match &value {
            Value::Object(object) => object,
            _ => return Err(FrameError::NotAnObject),
        };

        let kind = match object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("type"))
            .and_then(|(_, v)| v.as_str())
        {
            Some(Self::JOIN_CHAT) => Self::JOIN_CHAT,
            Some(Self::SEND_MESSAGE) => Self::SEND_MESSAGE,
            Some(other) => return Err(FrameError::UnknownType(other.to_string())),
            None => return Err(FrameError::MissingType),
        };

        if kind == Self::JOIN_CHAT {
            decode(kind, value).map(Self::JoinChat)
        } else {
            decode(kind, value).map(Self::SendMessage)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => Self::JOIN_CHAT,
            Self::SendMessage(_) => Self::SEND_MESSAGE,
        }
    }
}

fn decode<T>(kind: &'static str, value: Value) -> Result<T, FrameError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(value).map_err(|source| FrameError::InvalidPayload { kind, source })
}

/// A frame sent from the server to a client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "Type", rename_all = "snake_case")]
pub enum ServerMessage {
    NewMessage {
        #[serde(rename = "FromUserEmail")]
        from_user_email: String,
        #[serde(rename = "Message")]
        message: String,
    },
    Error {
        #[serde(rename = "Message")]
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
