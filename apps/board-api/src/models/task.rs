use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task card as stored by the board storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub board_id: String,
    pub column_id: String,
    pub position: u32,
    /// Bumped on every move so clients can discard out-of-order fragments.
    pub version: i64,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<String>,
    pub assignee_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A partial task update. `None` leaves a field untouched; for nullable fields
/// `Some(None)` clears the value.
///
/// Serializes to exactly the fields being changed, keyed by storage field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a task in place, stamping `updated_at`.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(column_id) = &self.column_id {
            task.column_id = column_id.clone();
        }
        if let Some(position) = self.position {
            task.position = position;
        }
        if let Some(version) = self.version {
            task.version = version;
        }
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(priority) = &self.priority {
            task.priority = priority.clone();
        }
        if let Some(due_date) = &self.due_date {
            task.due_date = due_date.clone();
        }
        if let Some(assignee_id) = &self.assignee_id {
            task.assignee_id = assignee_id.clone();
        }
        task.updated_at = now;
    }
}

/// What happened to a task, for notifications raised outside the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskChange {
    Created,
    Updated,
    Deleted,
}
