//! Board storage collaborator: task records and board membership.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};

use crate::error::StoreError;
use crate::models::task::{Task, TaskPatch};

/// Storage operations the collaboration hub needs from the board backend.
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// Apply `patch` to the task and return the stored result.
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError>;

    async fn has_board_access(&self, user_id: &str, board_id: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

pub struct MemoryBoardStore {
    tasks: DashMap<String, Task>,
    access: DashSet<(String, String)>,
    fail_writes: AtomicBool,
}

impl MemoryBoardStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            access: DashSet::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn insert_task(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn grant_access(&self, user_id: &str, board_id: &str) {
        self.access.insert((user_id.to_string(), board_id.to_string()));
    }

    pub fn revoke_access(&self, user_id: &str, board_id: &str) {
        self.access.remove(&(user_id.to_string(), board_id.to_string()));
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }
}

impl Default for MemoryBoardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BoardStore for MemoryBoardStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.task(task_id))
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        patch.apply(task.value_mut(), Utc::now());
        Ok(task.value().clone())
    }

    async fn has_board_access(&self, user_id: &str, board_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .access
            .contains(&(user_id.to_string(), board_id.to_string())))
    }
}
