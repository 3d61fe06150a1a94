//! Per-connection state shared between the I/O tasks and the hub.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::Identity;

use super::events::Envelope;

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The outbound queue is at capacity (slow consumer).
    Full,
    /// The connection has been closed by the hub or its writer is gone.
    Closed,
}

/// One live client link, scoped to exactly one board for its lifetime.
pub struct Connection {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub id: String,
    pub board_id: String,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    /// Sending half of the bounded outbound queue; `None` once closed.
    outbound: Mutex<Option<mpsc::Sender<Utf8Bytes>>>,
    /// Unix millis of the last inbound traffic.
    last_seen_ms: AtomicI64,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue.
    pub fn new(
        board_id: &str,
        identity: Identity,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Utc::now();
        let conn = Arc::new(Self {
            id: corkboard_common::id::prefixed_ulid(corkboard_common::id::prefix::CONNECTION),
            board_id: board_id.to_string(),
            identity,
            connected_at: now,
            outbound: Mutex::new(Some(tx)),
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        });
        (conn, rx)
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Record inbound traffic now.
    pub fn touch(&self) {
        self.mark_seen_at(Utc::now());
    }

    pub fn mark_seen_at(&self, at: DateTime<Utc>) {
        self.last_seen_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_seen_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.connected_at)
    }

    /// Time since the last inbound traffic, saturating at zero.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Queue an already-serialized frame without waiting.
    pub fn try_send(&self, frame: Utf8Bytes) -> Result<(), QueueError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(QueueError::Closed)?;
        tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Serialize and queue a frame addressed to this connection only.
    pub fn send_event(&self, envelope: &Envelope) -> Result<(), QueueError> {
        match envelope.to_json() {
            Ok(json) => self.try_send(json.into()),
            Err(err) => {
                tracing::error!(?err, connection_id = %self.id, "failed to serialize envelope");
                Ok(())
            }
        }
    }

    /// Close the outbound queue. The writer drains what is already queued and
    /// then shuts the transport. Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("board_id", &self.board_id)
            .field("user_id", &self.identity.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
