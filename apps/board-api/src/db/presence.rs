//! Durable presence store collaborator.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::models::presence::{PresenceRecord, PresenceUpdate};

/// Durable per-user, per-board presence records.
///
/// The hub only ever calls this off the broadcast path; implementations may be
/// slow without affecting fan-out.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn update_user_presence(&self, update: PresenceUpdate) -> Result<(), StoreError>;
    async fn remove_user_presence(&self, user_id: &str, board_id: &str) -> Result<(), StoreError>;
    async fn get_board_presence(&self, board_id: &str) -> Result<Vec<PresenceRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

pub struct MemoryPresenceStore {
    /// (user_id, board_id) -> record
    records: DashMap<(String, String), PresenceRecord>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn get(&self, user_id: &str, board_id: &str) -> Option<PresenceRecord> {
        self.records
            .get(&(user_id.to_string(), board_id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Insert a record as-is, bypassing merge. Used to seed history.
    pub fn insert(&self, record: PresenceRecord) {
        self.records
            .insert((record.user_id.clone(), record.board_id.clone()), record);
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn update_user_presence(&self, update: PresenceUpdate) -> Result<(), StoreError> {
        let key = (update.user_id.clone(), update.board_id.clone());
        // Merge under the entry lock so concurrent partial updates keep each other's fields.
        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                let merged = update.merge_into(Some(entry.get().clone()));
                entry.insert(merged);
            }
            Entry::Vacant(entry) => {
                entry.insert(update.merge_into(None));
            }
        }
        Ok(())
    }

    async fn remove_user_presence(&self, user_id: &str, board_id: &str) -> Result<(), StoreError> {
        self.records
            .remove(&(user_id.to_string(), board_id.to_string()));
        Ok(())
    }

    async fn get_board_presence(&self, board_id: &str) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().board_id == board_id)
            .map(|entry| entry.value().clone())
            .collect())
    }
}
