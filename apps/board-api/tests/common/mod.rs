#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use board_api::auth::{Identity, KvAuthenticator};
use board_api::config::{Config, HubConfig};
use board_api::db::boards::MemoryBoardStore;
use board_api::db::kv::MemoryStore;
use board_api::db::presence::MemoryPresenceStore;
use board_api::models::task::Task;
use board_api::render::HtmlTaskRenderer;
use board_api::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Application state wired to in-memory collaborators, with handles to poke them.
pub struct TestEnv {
    pub state: AppState,
    pub boards: Arc<MemoryBoardStore>,
    pub presence: Arc<MemoryPresenceStore>,
    pub auth: Arc<KvAuthenticator>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_hub_config(HubConfig::default())
    }

    pub fn with_hub_config(hub: HubConfig) -> Self {
        let config = Config {
            port: 0,
            cors_allow_any: true,
            hub,
        };
        let boards = Arc::new(MemoryBoardStore::new());
        let presence = Arc::new(MemoryPresenceStore::new());
        let auth = Arc::new(KvAuthenticator::new(Arc::new(MemoryStore::new())));
        let state = AppState::new(
            config,
            boards.clone(),
            presence.clone(),
            Arc::new(HtmlTaskRenderer),
            auth.clone(),
        );
        Self {
            state,
            boards,
            presence,
            auth,
        }
    }

    pub fn app(&self) -> Router {
        board_api::routes::router().with_state(self.state.clone())
    }

    /// Create a user with access to `boards` and return a session token for them.
    pub async fn user(&self, user_id: &str, boards: &[&str]) -> String {
        for board_id in boards {
            self.boards.grant_access(user_id, board_id);
        }
        let identity = Identity {
            user_id: user_id.to_string(),
            username: user_id.to_string(),
            display_name: user_id.to_uppercase(),
        };
        self.auth.issue_session(&identity).await.expect("issue session")
    }

    pub fn seed_task(&self, task_id: &str, board_id: &str, column_id: &str, position: u32) {
        self.boards.insert_task(Task {
            id: task_id.to_string(),
            board_id: board_id.to_string(),
            column_id: column_id.to_string(),
            position,
            version: 1,
            title: format!("Task {task_id}"),
            description: None,
            priority: None,
            due_date: None,
            assignee_id: None,
            updated_at: Utc::now(),
        });
    }

    /// Serve the app on an ephemeral port in the background.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().unwrap();
        let app = self.app();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

/// Short hub timings so cleanup-driven tests finish quickly.
pub fn fast_hub_config() -> HubConfig {
    HubConfig {
        cleanup_interval: Duration::from_millis(100),
        stale_after: Duration::from_millis(400),
        ..HubConfig::default()
    }
}

/// Connect to a board and consume the admission snapshot, which is returned.
pub async fn connect(addr: SocketAddr, board_id: &str, token: &str) -> (WsClient, Value) {
    let url = format!("ws://{addr}/ws/boards/{board_id}?token={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");
    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["type"], "board_snapshot", "first frame: {snapshot}");
    (ws, snapshot)
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON text frame, skipping control frames. Panics after two seconds.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("json frame")
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("unexpected ws item: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Skip frames until one of type `kind` arrives.
pub async fn recv_type(ws: &mut WsClient, kind: &str) -> Value {
    loop {
        let frame = recv_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Assert that no text frame arrives within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let result = time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = result {
        panic!("expected no frames, got {text}");
    }
}
