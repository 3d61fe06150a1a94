//! Board-scoped fan-out registry.
//!
//! Mutated only by the hub coordinator. External readers (online counts,
//! admission snapshots) take the read lock just long enough to copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::events::Envelope;
use super::session::{Connection, QueueError};

/// A connected user on a board, merged across that user's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    /// Freshest last-seen across the user's connections.
    pub last_seen: DateTime<Utc>,
    pub connections: usize,
}

/// Result of a single fan-out.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Recipients whose queue was full or closed; the caller must unregister them.
    pub evicted: Vec<Arc<Connection>>,
}

type BoardConnections = HashMap<String, Arc<Connection>>;

pub struct FanoutRegistry {
    /// board_id -> (connection_id -> connection)
    boards: RwLock<HashMap<String, BoardConnections>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a connection under its own board. Adding the same connection
    /// twice is a no-op; returns `true` only for a new insert.
    pub fn add(&self, conn: Arc<Connection>) -> bool {
        let mut boards = self.boards.write();
        let board = boards.entry(conn.board_id.clone()).or_default();
        if board.contains_key(&conn.id) {
            return false;
        }
        board.insert(conn.id.clone(), conn);
        true
    }

    /// Remove a connection. The board entry is dropped once it is empty.
    /// Returns `true` if the connection was registered.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut boards = self.boards.write();
        let Some(board) = boards.get_mut(&conn.board_id) else {
            return false;
        };
        let removed = board.remove(&conn.id).is_some();
        if board.is_empty() {
            boards.remove(&conn.board_id);
        }
        removed
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.boards
            .read()
            .get(&conn.board_id)
            .is_some_and(|board| board.contains_key(&conn.id))
    }

    /// Serialize `envelope` once and queue it for every connection on the
    /// board except those belonging to `exclude_user`. Never waits on a
    /// recipient; full or closed queues are reported for eviction.
    pub fn broadcast(
        &self,
        board_id: &str,
        envelope: &Envelope,
        exclude_user: Option<&str>,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let boards = self.boards.read();
        let Some(board) = boards.get(board_id) else {
            return outcome;
        };

        let frame: Utf8Bytes = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(err) => {
                tracing::error!(?err, board_id, "failed to serialize broadcast envelope");
                return outcome;
            }
        };

        for conn in board.values() {
            if exclude_user == Some(conn.user_id()) {
                continue;
            }
            match conn.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(QueueError::Full) | Err(QueueError::Closed) => {
                    outcome.evicted.push(conn.clone());
                }
            }
        }
        outcome
    }

    /// All connections currently registered on a board.
    pub fn connections(&self, board_id: &str) -> Vec<Arc<Connection>> {
        self.boards
            .read()
            .get(board_id)
            .map(|board| board.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Point-in-time list of connected users, one entry per user.
    pub fn snapshot(&self, board_id: &str) -> Vec<ConnectedUser> {
        merge_by_user(&self.connections(board_id))
    }

    /// Number of distinct users connected to a board.
    pub fn connected_users_count(&self, board_id: &str) -> usize {
        self.snapshot(board_id).len()
    }

    /// Number of connections a user holds on a board.
    pub fn user_connection_count(&self, board_id: &str, user_id: &str) -> usize {
        self.boards
            .read()
            .get(board_id)
            .map(|board| board.values().filter(|c| c.user_id() == user_id).count())
            .unwrap_or(0)
    }

    /// Connections with no inbound traffic for longer than `threshold`.
    pub fn stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Arc<Connection>> {
        self.boards
            .read()
            .values()
            .flat_map(|board| board.values())
            .filter(|conn| conn.idle_for(now) > threshold)
            .cloned()
            .collect()
    }

    pub fn board_count(&self) -> usize {
        self.boards.read().len()
    }

    pub fn connection_count(&self) -> usize {
        self.boards.read().values().map(HashMap::len).sum()
    }
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse connections into one entry per user, keeping first-seen order.
pub fn merge_by_user(connections: &[Arc<Connection>]) -> Vec<ConnectedUser> {
    let mut users: Vec<ConnectedUser> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for conn in connections {
        let last_seen = conn.last_seen();
        match index.get(conn.user_id()) {
            Some(&i) => {
                let user = &mut users[i];
                user.connections += 1;
                if last_seen > user.last_seen {
                    user.last_seen = last_seen;
                }
            }
            None => {
                index.insert(conn.user_id(), users.len());
                users.push(ConnectedUser {
                    user_id: conn.identity.user_id.clone(),
                    username: conn.identity.username.clone(),
                    display_name: conn.identity.display_name.clone(),
                    last_seen,
                    connections: 1,
                });
            }
        }
    }
    users
}
