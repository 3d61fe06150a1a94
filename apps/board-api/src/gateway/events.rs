//! Envelope types, event payloads, and wire-format decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::models::member::{BoardMember, MemberRole};
use crate::models::presence::PresenceStatus;
use crate::models::task::{Task, TaskPatch};

/// Sender id used for events the hub itself originates.
pub const SYSTEM_USER_ID: &str = "system";

/// Longest identifier accepted in any payload field.
const MAX_IDENTIFIER_LEN: usize = 64;

/// Longest focus element id accepted from a cursor event.
const MAX_FOCUS_ELEMENT_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskMove,
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    UserPresence,
    CursorMove,
    Error,
    BoardSnapshot,
    MemberAdded,
    MemberRemoved,
    PresenceUpdate,
    HtmxUpdate,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        Self::TaskMove,
        Self::TaskCreate,
        Self::TaskUpdate,
        Self::TaskDelete,
        Self::UserPresence,
        Self::CursorMove,
        Self::Error,
        Self::BoardSnapshot,
        Self::MemberAdded,
        Self::MemberRemoved,
        Self::PresenceUpdate,
        Self::HtmxUpdate,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskMove => "task_move",
            Self::TaskCreate => "task_create",
            Self::TaskUpdate => "task_update",
            Self::TaskDelete => "task_delete",
            Self::UserPresence => "user_presence",
            Self::CursorMove => "cursor_move",
            Self::Error => "error",
            Self::BoardSnapshot => "board_snapshot",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
            Self::PresenceUpdate => "presence_update",
            Self::HtmxUpdate => "htmx_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A raw frame received from a client.
///
/// Client-supplied `userId` and `timestamp` are deliberately not read: the
/// server stamps identity and time itself.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub board_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMovePayload {
    pub task_id: String,
    pub column_id: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdatePayload {
    pub task_id: String,
    /// Raw field map; filtered against the update whitelist before use.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovePayload {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub focus_element: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresencePayload {
    pub is_typing: bool,
    #[serde(default)]
    pub active_task_id: Option<String>,
}

/// A decoded client event, one strongly-typed payload per accepted type.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    TaskMove(TaskMovePayload),
    TaskUpdate(TaskUpdatePayload),
    CursorMove(CursorMovePayload),
    UserPresence(UserPresencePayload),
}

impl ClientEvent {
    /// Decode `data` according to the frame's `type` tag and validate it.
    pub fn decode(kind: &str, data: Value) -> Result<Self, GatewayError> {
        let event_type =
            EventType::parse(kind).ok_or_else(|| GatewayError::UnknownType(kind.to_string()))?;

        let event = match event_type {
            EventType::TaskMove => Self::TaskMove(payload(data)?),
            EventType::TaskUpdate => Self::TaskUpdate(payload(data)?),
            EventType::CursorMove => Self::CursorMove(payload(data)?),
            EventType::UserPresence => Self::UserPresence(payload(data)?),
            other => return Err(GatewayError::UnsupportedType(other.as_str())),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskMove(_) => EventType::TaskMove,
            Self::TaskUpdate(_) => EventType::TaskUpdate,
            Self::CursorMove(_) => EventType::CursorMove,
            Self::UserPresence(_) => EventType::UserPresence,
        }
    }

    fn validate(&self) -> Result<(), GatewayError> {
        match self {
            Self::TaskMove(p) => {
                validate_identifier("taskId", &p.task_id)?;
                validate_identifier("columnId", &p.column_id)?;
                if u32::try_from(p.position).is_err() {
                    return Err(GatewayError::InvalidPayload(
                        "position must be a non-negative integer".to_string(),
                    ));
                }
            }
            Self::TaskUpdate(p) => validate_identifier("taskId", &p.task_id)?,
            Self::CursorMove(p) => {
                if !p.x.is_finite() || !p.y.is_finite() {
                    return Err(GatewayError::InvalidPayload(
                        "cursor coordinates must be finite numbers".to_string(),
                    ));
                }
                if let Some(focus) = &p.focus_element {
                    if focus.len() > MAX_FOCUS_ELEMENT_LEN {
                        return Err(GatewayError::InvalidPayload(
                            "focusElement is too long".to_string(),
                        ));
                    }
                }
            }
            Self::UserPresence(p) => {
                if let Some(task_id) = &p.active_task_id {
                    validate_identifier("activeTaskId", task_id)?;
                }
            }
        }
        Ok(())
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::InvalidPayload(e.to_string()))
}

/// Identifiers are non-empty, bounded, and limited to `[A-Za-z0-9_-]`.
pub fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn validate_identifier(field: &str, value: &str) -> Result<(), GatewayError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(GatewayError::InvalidPayload(format!(
            "{field} is not a valid identifier"
        )))
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// An event sent to clients, serialized as `"type"` + `"data"`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    TaskCreate(TaskEventData),
    TaskUpdate(TaskUpdateData),
    TaskDelete(TaskDeleteData),
    HtmxUpdate(HtmxUpdateData),
    CursorMove(CursorData),
    UserPresence(UserPresenceData),
    PresenceUpdate(PresenceUpdateData),
    BoardSnapshot(BoardSnapshotData),
    MemberAdded(MemberAddedData),
    MemberRemoved(MemberRemovedData),
    Error(ErrorData),
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreate(_) => EventType::TaskCreate,
            Self::TaskUpdate(_) => EventType::TaskUpdate,
            Self::TaskDelete(_) => EventType::TaskDelete,
            Self::HtmxUpdate(_) => EventType::HtmxUpdate,
            Self::CursorMove(_) => EventType::CursorMove,
            Self::UserPresence(_) => EventType::UserPresence,
            Self::PresenceUpdate(_) => EventType::PresenceUpdate,
            Self::BoardSnapshot(_) => EventType::BoardSnapshot,
            Self::MemberAdded(_) => EventType::MemberAdded,
            Self::MemberRemoved(_) => EventType::MemberRemoved,
            Self::Error(_) => EventType::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventData {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateData {
    pub task_id: String,
    /// Only the fields that changed, keyed by storage field name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<TaskPatch>,
    /// The full record, when the update originated outside the gateway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDeleteData {
    pub task_id: String,
}

/// A pre-rendered fragment replacing an element on the board.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmxUpdateData {
    pub task_id: String,
    pub target: String,
    pub swap: &'static str,
    pub html: String,
    pub column_id: String,
    pub position: u32,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_element: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Joined,
    Left,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceData {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub action: PresenceAction,
    pub status: PresenceStatus,
}

impl UserPresenceData {
    pub fn joined(identity: &Identity) -> Self {
        Self::new(identity, PresenceAction::Joined, PresenceStatus::Online)
    }

    pub fn left(identity: &Identity) -> Self {
        Self::new(identity, PresenceAction::Left, PresenceStatus::Offline)
    }

    fn new(identity: &Identity, action: PresenceAction, status: PresenceStatus) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            display_name: identity.display_name.clone(),
            action,
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateData {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub is_typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
}

/// One user in the "who is here" list sent on admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_y: Option<f64>,
    pub is_typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshotData {
    pub connection_id: String,
    pub users: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAddedData {
    pub member: BoardMember,
    pub role: MemberRole,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRemovedData {
    pub member_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: &'static str,
    pub message: String,
}

impl From<&GatewayError> for ErrorData {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// The wire-level unit sent to clients:
/// `{ type, userId, boardId, timestamp, data }`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub user_id: String,
    pub board_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope stamped with the current server time.
    pub fn new(event: ServerEvent, user_id: &str, board_id: &str) -> Self {
        Self {
            event,
            user_id: user_id.to_string(),
            board_id: board_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(err: &GatewayError, board_id: &str) -> Self {
        Self::new(ServerEvent::Error(err.into()), SYSTEM_USER_ID, board_id)
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
