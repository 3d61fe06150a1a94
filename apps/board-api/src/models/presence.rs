use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable per-user, per-board activity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub board_id: String,
    pub username: String,
    pub display_name: String,
    pub cursor_x: Option<f64>,
    pub cursor_y: Option<f64>,
    pub focus_element: Option<String>,
    pub is_typing: bool,
    pub active_task_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// An upsert for a presence record. Fields left `None` keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub board_id: String,
    pub username: String,
    pub display_name: String,
    pub cursor_x: Option<f64>,
    pub cursor_y: Option<f64>,
    pub focus_element: Option<String>,
    pub is_typing: Option<bool>,
    pub active_task_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl PresenceUpdate {
    /// A bare "I am here" touch with no cursor or typing data.
    pub fn touch(
        user_id: &str,
        board_id: &str,
        username: &str,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            board_id: board_id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            cursor_x: None,
            cursor_y: None,
            focus_element: None,
            is_typing: None,
            active_task_id: None,
            at,
        }
    }

    /// Merge this update into an existing record (or start a fresh one).
    pub fn merge_into(self, existing: Option<PresenceRecord>) -> PresenceRecord {
        let mut record = existing.unwrap_or_else(|| PresenceRecord {
            user_id: self.user_id.clone(),
            board_id: self.board_id.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            cursor_x: None,
            cursor_y: None,
            focus_element: None,
            is_typing: false,
            active_task_id: None,
            last_activity: self.at,
        });
        record.username = self.username;
        record.display_name = self.display_name;
        if self.cursor_x.is_some() || self.cursor_y.is_some() {
            record.cursor_x = self.cursor_x;
            record.cursor_y = self.cursor_y;
            record.focus_element = self.focus_element;
        }
        if let Some(is_typing) = self.is_typing {
            record.is_typing = is_typing;
            record.active_task_id = self.active_task_id;
        }
        record.last_activity = self.at;
        record
    }
}

/// Online status shown in the board's "who is here" list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}
