//! Hub coordinator: the single serialized loop that owns the fan-out registry.
//!
//! Register, unregister, broadcast, and the periodic stale sweep are applied
//! one at a time in submission order, so registry mutations for a board never
//! interleave. Submissions never wait: a full command queue drops the event.
//!
//! Task mutations hold their board's mutation lock from the read until the
//! broadcast is submitted, so two edits on one board cannot race and their
//! broadcasts reach the coordinator in write order.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time;

use crate::config::HubConfig;
use crate::db::presence::PresenceStore;
use crate::models::member::{BoardMember, MemberRole};
use crate::models::task::{Task, TaskChange};

use super::events::{
    Envelope, MemberAddedData, MemberRemovedData, ServerEvent, TaskDeleteData, TaskEventData,
    TaskUpdateData, UserPresenceData, SYSTEM_USER_ID,
};
use super::presence::spawn_presence_removal;
use super::registry::FanoutRegistry;
use super::session::Connection;

/// Why a connection left the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a close frame.
    ClientClosed,
    /// Read or write failure, or the stream ended without a close frame.
    TransportError,
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// A single write exceeded its deadline.
    WriteTimeout,
    /// Too many consecutive undecodable frames.
    DecodeFaults,
    /// The outbound queue was full during a broadcast.
    Backpressure,
    /// Removed by the periodic stale sweep.
    Stale,
    /// The hub closed the outbound queue.
    ServerClosed,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::WriteTimeout => "write_timeout",
            Self::DecodeFaults => "decode_faults",
            Self::Backpressure => "backpressure",
            Self::Stale => "stale",
            Self::ServerClosed => "server_closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub command queue is full")]
    QueueFull,
    #[error("hub coordinator has stopped")]
    Closed,
}

/// Work submitted to the coordinator loop.
enum HubCommand {
    Register(Arc<Connection>),
    Unregister {
        connection: Arc<Connection>,
        reason: DisconnectReason,
    },
    Broadcast {
        board_id: String,
        envelope: Envelope,
        exclude_user: Option<String>,
    },
}

impl HubCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Unregister { .. } => "unregister",
            Self::Broadcast { .. } => "broadcast",
        }
    }
}

/// Handle to a running hub. Cheap to clone; store in `AppState`.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    registry: Arc<FanoutRegistry>,
    mutation_locks: Arc<MutationLocks>,
    config: Arc<HubConfig>,
}

/// board id -> lock serializing task mutations on that board.
type MutationLocks = DashMap<String, Arc<Mutex<()>>>;

impl Hub {
    /// Start a coordinator task on the current tokio runtime.
    pub fn spawn(config: HubConfig, presence: Arc<dyn PresenceStore>) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let registry = Arc::new(FanoutRegistry::new());
        let mutation_locks = Arc::new(MutationLocks::new());
        let config = Arc::new(config);

        let coordinator = Coordinator {
            registry: registry.clone(),
            mutation_locks: mutation_locks.clone(),
            presence,
            config: config.clone(),
        };
        tokio::spawn(coordinator.run(rx));

        Self {
            commands,
            registry,
            mutation_locks,
            config,
        }
    }

    /// Wait for exclusive access to a board's task mutations. Hold the guard
    /// from reading the task until its broadcast has been submitted.
    pub async fn lock_board(&self, board_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .mutation_locks
            .entry(board_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Read-only view of the registry for snapshots and counts.
    pub fn registry(&self) -> &FanoutRegistry {
        &self.registry
    }

    /// Submit a connection for registration. Fails without waiting if the
    /// coordinator is saturated; the caller should drop the transport.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        self.submit(HubCommand::Register(connection))
    }

    pub fn unregister(&self, connection: Arc<Connection>, reason: DisconnectReason) {
        let connection_id = connection.id.clone();
        if let Err(err) = self.submit(HubCommand::Unregister { connection, reason }) {
            tracing::warn!(%err, %connection_id, "dropped unregister");
        }
    }

    /// Fan `envelope` out to every connection on the board except `exclude_user`'s.
    pub fn broadcast(&self, board_id: &str, envelope: Envelope, exclude_user: Option<&str>) {
        let event = envelope.event_type().as_str();
        let command = HubCommand::Broadcast {
            board_id: board_id.to_string(),
            envelope,
            exclude_user: exclude_user.map(str::to_string),
        };
        if let Err(err) = self.submit(command) {
            tracing::warn!(%err, board_id, event, "dropped broadcast");
        }
    }

    /// Distinct users currently connected to a board.
    pub fn connected_users_count(&self, board_id: &str) -> usize {
        self.registry.connected_users_count(board_id)
    }

    /// Notify a board about a task change made outside the gateway.
    pub fn broadcast_task_update(&self, board_id: &str, task: &Task, change: TaskChange) {
        let event = match change {
            TaskChange::Created => ServerEvent::TaskCreate(TaskEventData { task: task.clone() }),
            TaskChange::Updated => ServerEvent::TaskUpdate(TaskUpdateData {
                task_id: task.id.clone(),
                fields: None,
                task: Some(task.clone()),
                version: task.version,
            }),
            TaskChange::Deleted => ServerEvent::TaskDelete(TaskDeleteData {
                task_id: task.id.clone(),
            }),
        };
        self.broadcast(board_id, Envelope::new(event, SYSTEM_USER_ID, board_id), None);
    }

    pub fn broadcast_member_added(&self, board_id: &str, member: &BoardMember, role: MemberRole) {
        let event = ServerEvent::MemberAdded(MemberAddedData {
            member: member.clone(),
            role,
        });
        self.broadcast(board_id, Envelope::new(event, SYSTEM_USER_ID, board_id), None);
    }

    pub fn broadcast_member_removed(&self, board_id: &str, member_id: &str) {
        let event = ServerEvent::MemberRemoved(MemberRemovedData {
            member_id: member_id.to_string(),
        });
        self.broadcast(board_id, Envelope::new(event, SYSTEM_USER_ID, board_id), None);
    }

    fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(cmd) => {
                tracing::warn!(command = cmd.name(), "hub command queue full");
                HubError::QueueFull
            }
            TrySendError::Closed(_) => HubError::Closed,
        })
    }
}

/// A "user left" notice owed to a board after a connection is detached.
struct LeftNotice {
    board_id: String,
    envelope: Envelope,
}

struct Coordinator {
    registry: Arc<FanoutRegistry>,
    mutation_locks: Arc<MutationLocks>,
    presence: Arc<dyn PresenceStore>,
    config: Arc<HubConfig>,
}

impl Coordinator {
    async fn run(self, mut commands: mpsc::Receiver<HubCommand>) {
        let mut cleanup = time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        cleanup.tick().await; // First tick fires immediately; skip it.

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    // Every Hub handle is gone.
                    None => break,
                },
                _ = cleanup.tick() => self.cleanup(),
            }
        }

        tracing::debug!("hub coordinator stopped");
    }

    fn handle(&self, command: HubCommand) {
        match command {
            HubCommand::Register(connection) => self.register(connection),
            HubCommand::Unregister { connection, reason } => {
                if let Some(notice) = self.detach(&connection, reason) {
                    self.fan_out(&notice.board_id, notice.envelope, None);
                }
            }
            HubCommand::Broadcast {
                board_id,
                envelope,
                exclude_user,
            } => self.fan_out(&board_id, envelope, exclude_user),
        }
    }

    fn register(&self, connection: Arc<Connection>) {
        if connection.is_closed() {
            tracing::debug!(connection_id = %connection.id, "skipping register of closed connection");
            return;
        }
        let board_id = connection.board_id.clone();
        let user_id = connection.user_id().to_string();
        let connection_id = connection.id.clone();
        let joined = UserPresenceData::joined(&connection.identity);
        if !self.registry.add(connection) {
            return;
        }

        tracing::debug!(
            %board_id,
            %user_id,
            %connection_id,
            board_users = self.registry.connected_users_count(&board_id),
            total_connections = self.registry.connection_count(),
            "connection registered"
        );

        // Later tabs of the same user join silently.
        if self.registry.user_connection_count(&board_id, &user_id) == 1 {
            let envelope = Envelope::new(ServerEvent::UserPresence(joined), &user_id, &board_id);
            self.fan_out(&board_id, envelope, Some(user_id));
        }
    }

    /// Broadcast, then evict any recipient that could not accept the frame.
    /// Evictions can owe further "left" notices, which are processed in turn.
    fn fan_out(&self, board_id: &str, envelope: Envelope, exclude_user: Option<String>) {
        let mut pending = VecDeque::new();
        pending.push_back((board_id.to_string(), envelope, exclude_user));

        while let Some((board_id, envelope, exclude_user)) = pending.pop_front() {
            let outcome = self
                .registry
                .broadcast(&board_id, &envelope, exclude_user.as_deref());

            for connection in outcome.evicted {
                tracing::warn!(
                    %board_id,
                    user_id = %connection.user_id(),
                    connection_id = %connection.id,
                    "evicting slow consumer"
                );
                if let Some(notice) = self.detach(&connection, DisconnectReason::Backpressure) {
                    pending.push_back((notice.board_id, notice.envelope, None));
                }
            }
        }
    }

    /// Remove a connection and close its queue. Returns a "left" notice when
    /// this was the user's last connection on the board.
    fn detach(&self, connection: &Arc<Connection>, reason: DisconnectReason) -> Option<LeftNotice> {
        connection.close();
        if !self.registry.remove(connection) {
            return None;
        }

        let board_id = &connection.board_id;
        let user_id = connection.user_id();
        tracing::debug!(
            %board_id,
            %user_id,
            connection_id = %connection.id,
            reason = reason.as_str(),
            "connection unregistered"
        );

        if self.registry.user_connection_count(board_id, user_id) > 0 {
            return None;
        }

        // Durable presence only goes away on an explicit disconnect.
        if reason == DisconnectReason::ClientClosed {
            spawn_presence_removal(self.presence.clone(), user_id, board_id);
        }

        Some(LeftNotice {
            board_id: board_id.clone(),
            envelope: Envelope::new(
                ServerEvent::UserPresence(UserPresenceData::left(&connection.identity)),
                user_id,
                board_id,
            ),
        })
    }

    fn cleanup(&self) {
        let stale = self.registry.stale(Utc::now(), self.config.stale_after);
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "removing stale connections");
            for connection in stale {
                if let Some(notice) = self.detach(&connection, DisconnectReason::Stale) {
                    self.fan_out(&notice.board_id, notice.envelope, None);
                }
            }
        }

        // Drop locks for boards nobody is watching or mutating.
        self.mutation_locks.retain(|board_id, lock| {
            Arc::strong_count(lock) > 1 || self.registry.connected_users_count(board_id) > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::db::presence::MemoryPresenceStore;
    use crate::models::presence::PresenceUpdate;
    use axum::extract::ws::Utf8Bytes;
    use std::time::Duration;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            username: user.into(),
            display_name: user.to_uppercase(),
        }
    }

    fn test_hub(config: HubConfig) -> (Hub, Arc<MemoryPresenceStore>) {
        let presence = Arc::new(MemoryPresenceStore::new());
        (Hub::spawn(config, presence.clone()), presence)
    }

    /// Wait until the coordinator has drained everything submitted so far.
    async fn settle(hub: &Hub) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if hub.commands.capacity() == hub.commands.max_capacity() {
                break;
            }
        }
        // Let the last dequeued command finish applying.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn recv_json(rx: &mut mpsc::Receiver<Utf8Bytes>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        serde_json::from_str(frame.as_str()).unwrap()
    }

    #[tokio::test]
    async fn register_broadcast_unregister() {
        let (hub, _) = test_hub(HubConfig::default());
        let (c1, mut rx1) = Connection::new("b1", identity("u1"), 8);
        let (c2, mut rx2) = Connection::new("b1", identity("u2"), 8);

        hub.register(c1.clone()).unwrap();
        hub.register(c2.clone()).unwrap();
        hub.broadcast_member_removed("b1", "u9");
        settle(&hub).await;

        assert_eq!(hub.connected_users_count("b1"), 2);
        let joined = recv_json(&mut rx1).await;
        assert_eq!(joined["data"]["action"], "joined");
        assert_eq!(joined["userId"], "u2");
        assert_eq!(recv_json(&mut rx1).await["type"], "member_removed");
        assert_eq!(recv_json(&mut rx2).await["data"]["memberId"], "u9");

        hub.unregister(c1.clone(), DisconnectReason::TransportError);
        settle(&hub).await;

        assert!(c1.is_closed());
        assert_eq!(hub.connected_users_count("b1"), 1);
        let left = recv_json(&mut rx2).await;
        assert_eq!(left["type"], "user_presence");
        assert_eq!(left["data"]["action"], "left");
        assert_eq!(left["userId"], "u1");

        hub.unregister(c2.clone(), DisconnectReason::TransportError);
        settle(&hub).await;
        assert_eq!(hub.registry().board_count(), 0);
    }

    #[tokio::test]
    async fn second_connection_of_same_user_suppresses_left_notice() {
        let (hub, _) = test_hub(HubConfig::default());
        let (tab1, _rx1) = Connection::new("b1", identity("u1"), 8);
        let (tab2, _rx2) = Connection::new("b1", identity("u1"), 8);
        let (watcher, mut watcher_rx) = Connection::new("b1", identity("u2"), 8);
        for c in [&tab1, &tab2, &watcher] {
            hub.register(c.clone()).unwrap();
        }
        settle(&hub).await;
        assert_eq!(hub.connected_users_count("b1"), 2);

        hub.unregister(tab1, DisconnectReason::TransportError);
        settle(&hub).await;
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_others_still_receive() {
        let (hub, _) = test_hub(HubConfig::default());
        let (slow, _slow_rx) = Connection::new("b1", identity("slow"), 1);
        let (fast, mut fast_rx) = Connection::new("b1", identity("fast"), 8);
        hub.register(fast.clone()).unwrap();
        hub.register(slow.clone()).unwrap();
        settle(&hub).await;
        assert_eq!(recv_json(&mut fast_rx).await["userId"], "slow");
        slow.try_send("filler".into()).unwrap();

        hub.broadcast_member_removed("b1", "u9");
        settle(&hub).await;

        assert!(slow.is_closed());
        assert!(!hub.registry().contains(&slow));
        assert_eq!(recv_json(&mut fast_rx).await["type"], "member_removed");
        let left = recv_json(&mut fast_rx).await;
        assert_eq!(left["data"]["action"], "left");
        assert_eq!(left["userId"], "slow");
    }

    #[tokio::test]
    async fn simultaneous_tabs_announce_joined_once() {
        let (hub, _) = test_hub(HubConfig::default());
        let (watcher, mut watcher_rx) = Connection::new("b1", identity("u2"), 8);
        hub.register(watcher).unwrap();
        settle(&hub).await;

        let (tab1, _rx1) = Connection::new("b1", identity("u1"), 8);
        let (tab2, _rx2) = Connection::new("b1", identity("u1"), 8);
        hub.register(tab1.clone()).unwrap();
        hub.register(tab2.clone()).unwrap();
        settle(&hub).await;

        let joined = recv_json(&mut watcher_rx).await;
        assert_eq!(joined["data"]["action"], "joined");
        assert_eq!(joined["userId"], "u1");
        assert!(watcher_rx.try_recv().is_err());

        hub.unregister(tab1, DisconnectReason::TransportError);
        hub.unregister(tab2, DisconnectReason::TransportError);
        settle(&hub).await;
        assert_eq!(recv_json(&mut watcher_rx).await["data"]["action"], "left");
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn board_lock_is_exclusive_per_board() {
        let (hub, _) = test_hub(HubConfig::default());
        let guard = hub.lock_board("b1").await;

        let waiting = tokio::time::timeout(Duration::from_millis(50), hub.lock_board("b1")).await;
        assert!(waiting.is_err());
        let _other = tokio::time::timeout(Duration::from_millis(50), hub.lock_board("b2"))
            .await
            .expect("other boards are not blocked");

        drop(guard);
        let _again = tokio::time::timeout(Duration::from_millis(50), hub.lock_board("b1"))
            .await
            .expect("lock released");
    }

    #[tokio::test]
    async fn cleanup_removes_stale_connections() {
        let config = HubConfig {
            cleanup_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(30),
            ..HubConfig::default()
        };
        let (hub, _) = test_hub(config);
        let (quiet, _quiet_rx) = Connection::new("b1", identity("u1"), 8);
        let (active, mut active_rx) = Connection::new("b1", identity("u2"), 8);
        hub.register(quiet.clone()).unwrap();
        hub.register(active.clone()).unwrap();
        settle(&hub).await;

        quiet.mark_seen_at(Utc::now() - chrono::Duration::seconds(60));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(quiet.is_closed());
        assert!(!hub.registry().contains(&quiet));
        assert!(hub.registry().contains(&active));
        let left = recv_json(&mut active_rx).await;
        assert_eq!(left["data"]["action"], "left");
    }

    #[tokio::test]
    async fn explicit_close_removes_durable_presence_but_timeout_does_not() {
        let (hub, presence) = test_hub(HubConfig::default());
        for user in ["u1", "u2"] {
            presence
                .update_user_presence(PresenceUpdate::touch(user, "b1", user, user, Utc::now()))
                .await
                .unwrap();
        }

        let (closer, _r1) = Connection::new("b1", identity("u1"), 8);
        let (timed_out, _r2) = Connection::new("b1", identity("u2"), 8);
        hub.register(closer.clone()).unwrap();
        hub.register(timed_out.clone()).unwrap();
        hub.unregister(closer, DisconnectReason::ClientClosed);
        hub.unregister(timed_out, DisconnectReason::IdleTimeout);
        settle(&hub).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(presence.get("u1", "b1").is_none());
        assert!(presence.get("u2", "b1").is_some());
    }

    #[tokio::test]
    async fn closed_connection_is_never_registered() {
        let (hub, _) = test_hub(HubConfig::default());
        let (conn, _rx) = Connection::new("b1", identity("u1"), 8);
        conn.close();
        hub.register(conn.clone()).unwrap();
        settle(&hub).await;
        assert!(!hub.registry().contains(&conn));
        assert_eq!(hub.registry().board_count(), 0);
    }

    #[tokio::test]
    async fn full_command_queue_drops_instead_of_blocking() {
        let config = HubConfig {
            command_capacity: 1,
            ..HubConfig::default()
        };
        let (hub, _) = test_hub(config);
        let mut results = Vec::new();
        // Nothing yields to the coordinator in between, so the queue fills.
        for _ in 0..16 {
            let (conn, _rx) = Connection::new("b1", identity("u1"), 8);
            results.push(hub.register(conn));
        }
        assert!(results.iter().any(|r| matches!(r, Err(HubError::QueueFull))));
    }

    #[tokio::test]
    async fn concurrent_churn_leaves_exactly_the_open_connections() {
        let (hub, _) = test_hub(HubConfig::default());
        let mut handles = Vec::new();
        for i in 0..32 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                let (conn, rx) = Connection::new("b1", identity(&format!("u{i}")), 256);
                hub.register(conn.clone()).unwrap();
                hub.broadcast_member_removed("b1", "nobody");
                if i % 2 == 0 {
                    hub.unregister(conn.clone(), DisconnectReason::TransportError);
                }
                (conn, rx)
            }));
        }
        let mut conns = Vec::new();
        for handle in handles {
            conns.push(handle.await.unwrap());
        }
        settle(&hub).await;

        for (i, (conn, _rx)) in conns.iter().enumerate() {
            let registered = hub.registry().contains(conn);
            assert_eq!(registered, i % 2 == 1, "connection {i}");
            assert_eq!(conn.is_closed(), i % 2 == 0, "connection {i}");
        }
        assert_eq!(hub.connected_users_count("b1"), 16);
    }
}
