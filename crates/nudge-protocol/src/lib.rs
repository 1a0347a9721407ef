pub mod paths;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

/// Identifier of a principal (user account).
pub type PrincipalId = i64;

/// Identifier of a stored notification.
pub type NotificationId = i64;

/// Identifier of the resource a notification talks about (a todo).
pub type SubjectId = i64;

/// What happened to the subject of a notification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Updated,
    Completed,
    Uncompleted,
    Deleted,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Updated => "updated",
            ActionKind::Completed => "completed",
            ActionKind::Uncompleted => "uncompleted",
            ActionKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updated" => Ok(ActionKind::Updated),
            "completed" => Ok(ActionKind::Completed),
            "uncompleted" => Ok(ActionKind::Uncompleted),
            "deleted" => Ok(ActionKind::Deleted),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// Type tag of an event pushed to a live connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionAck,
    NewNotification,
    NotificationMarkedRead,
    NotificationsAllMarkedRead,
    Pong,
    MarkReadAck,
    Error,
}

/// Server-to-client event envelope sent as one JSON text frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl WireEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_ack(user_id: PrincipalId, username: &str) -> Self {
        Self::new(
            EventKind::ConnectionAck,
            json!({
                "user_id": user_id,
                "username": username,
                "message": "Connected to notifications",
            }),
        )
    }

    pub fn new_notification(view: &NotificationView) -> Self {
        Self::new(
            EventKind::NewNotification,
            serde_json::to_value(view).unwrap_or(Value::Null),
        )
    }

    pub fn notification_marked_read(id: NotificationId, view: Option<&NotificationView>) -> Self {
        Self::new(
            EventKind::NotificationMarkedRead,
            json!({
                "notification_id": id,
                "notification": view,
            }),
        )
    }

    pub fn all_marked_read(ids: &[NotificationId]) -> Self {
        Self::new(
            EventKind::NotificationsAllMarkedRead,
            json!({
                "marked_count": ids.len(),
                "notification_ids": ids,
                "new_unread_count": 0,
            }),
        )
    }

    /// Echo of a client ping; the client's own timestamp is returned untouched.
    pub fn pong(client_timestamp: Option<Value>) -> Self {
        Self::new(
            EventKind::Pong,
            json!({ "timestamp": client_timestamp.unwrap_or(Value::Null) }),
        )
    }

    pub fn mark_read_ack(id: NotificationId) -> Self {
        Self::new(
            EventKind::MarkReadAck,
            json!({
                "notification_id": id,
                "success": true,
            }),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, json!({ "message": message.into() }))
    }
}

/// Client-to-server control messages received on a live connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    /// Advisory only; the read state changes through the HTTP API.
    MarkRead { notification_id: NotificationId },
}

/// Stable machine-readable rejection codes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    InvalidSession,
    InvalidCredentials,
    UserInactive,
    ResourceNotFound,
    ResourceExists,
    ValidationError,
    DatabaseError,
    InternalError,
}

/// Body of every rejection returned to a remote caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub detail: String,
    pub error_code: ErrorCode,
}

/// A notification as shown to its recipient, enriched with display fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationView {
    pub id: NotificationId,
    pub user_id: PrincipalId,
    pub todo_id: Option<SubjectId>,
    pub actor_id: PrincipalId,
    pub action_type: ActionKind,
    pub message: String,
    pub is_read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub actor_username: String,
    pub todo_title: Option<String>,
}
