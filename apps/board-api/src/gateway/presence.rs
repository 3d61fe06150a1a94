//! Presence reconciliation: who is on a board right now, and who was recently.
//!
//! Live connections are the authority for "online". Durable records only add
//! cursor and typing detail, plus recently-active users who are no longer
//! connected. Durable writes are fire-and-forget and never block the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::presence::PresenceStore;
use crate::models::presence::{PresenceRecord, PresenceStatus, PresenceUpdate};

use super::events::{BoardSnapshotData, PresenceEntry};
use super::hub::Hub;
use super::registry::{merge_by_user, ConnectedUser};
use super::session::Connection;

/// Merge live users with durable records into one list, one entry per user.
///
/// Live users come first in the order given. Records for users without a live
/// connection are included only if active within `window`, newest first, and
/// always as offline.
pub fn reconcile(
    live: &[ConnectedUser],
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    liveness: Duration,
    window: Duration,
) -> Vec<PresenceEntry> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut entries = Vec::with_capacity(live.len());

    for user in live {
        if !seen.insert(user.user_id.as_str()) {
            continue;
        }
        let record = records.iter().find(|r| r.user_id == user.user_id);
        let status = if within(now, user.last_seen, liveness) {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        entries.push(PresenceEntry {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            status,
            last_seen: user.last_seen,
            cursor_x: record.and_then(|r| r.cursor_x),
            cursor_y: record.and_then(|r| r.cursor_y),
            is_typing: record.is_some_and(|r| r.is_typing),
            active_task_id: record.and_then(|r| r.active_task_id.clone()),
        });
    }

    let mut recent: Vec<&PresenceRecord> = records
        .iter()
        .filter(|r| within(now, r.last_activity, window))
        .collect();
    recent.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

    for record in recent {
        if !seen.insert(record.user_id.as_str()) {
            continue;
        }
        entries.push(PresenceEntry {
            user_id: record.user_id.clone(),
            username: record.username.clone(),
            display_name: record.display_name.clone(),
            status: PresenceStatus::Offline,
            last_seen: record.last_activity,
            cursor_x: record.cursor_x,
            cursor_y: record.cursor_y,
            is_typing: record.is_typing,
            active_task_id: record.active_task_id.clone(),
        });
    }

    entries
}

/// Future timestamps count as "just now".
fn within(now: DateTime<Utc>, at: DateTime<Utc>, window: Duration) -> bool {
    (now - at).to_std().map_or(true, |age| age <= window)
}

/// Build the admission snapshot for a newly joined connection.
///
/// Registration is asynchronous, so the joining connection is merged in
/// explicitly and the new user always appears in their own list. A failing
/// durable store degrades to live users only.
pub async fn board_snapshot(
    hub: &Hub,
    store: &dyn PresenceStore,
    connection: &Arc<Connection>,
) -> BoardSnapshotData {
    let board_id = &connection.board_id;

    let mut connections = hub.registry().connections(board_id);
    if !connections.iter().any(|c| c.id == connection.id) {
        connections.push(connection.clone());
    }
    let live = merge_by_user(&connections);

    let records = match store.get_board_presence(board_id).await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(%err, %board_id, "presence lookup failed, snapshot has live users only");
            Vec::new()
        }
    };

    let config = hub.config();
    BoardSnapshotData {
        connection_id: connection.id.clone(),
        users: reconcile(
            &live,
            &records,
            Utc::now(),
            config.liveness_window,
            config.presence_window,
        ),
    }
}

/// Persist a presence update in the background.
pub fn spawn_presence_update(store: Arc<dyn PresenceStore>, update: PresenceUpdate) {
    tokio::spawn(async move {
        let user_id = update.user_id.clone();
        let board_id = update.board_id.clone();
        if let Err(err) = store.update_user_presence(update).await {
            tracing::warn!(%err, %user_id, %board_id, "failed to persist presence");
        }
    });
}

/// Delete a user's durable presence for a board in the background.
pub fn spawn_presence_removal(store: Arc<dyn PresenceStore>, user_id: &str, board_id: &str) {
    let user_id = user_id.to_string();
    let board_id = board_id.to_string();
    tokio::spawn(async move {
        if let Err(err) = store.remove_user_presence(&user_id, &board_id).await {
            tracing::warn!(%err, %user_id, %board_id, "failed to remove presence");
        }
    });
}
