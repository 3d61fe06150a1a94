//! Inbound event dispatch: one handler per client event type.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::error::GatewayError;
use crate::models::presence::PresenceUpdate;
use crate::models::task::TaskPatch;
use crate::AppState;

use super::events::{
    is_identifier, ClientEvent, CursorData, CursorMovePayload, Envelope, HtmxUpdateData,
    InboundFrame, PresenceUpdateData, ServerEvent, TaskMovePayload, TaskUpdateData,
    TaskUpdatePayload, UserPresencePayload,
};
use super::presence::spawn_presence_update;
use super::session::Connection;

/// Fields a client may change through `task_update`.
pub const UPDATABLE_FIELDS: [&str; 5] =
    ["title", "description", "priority", "due_date", "assignee_id"];

const PRIORITIES: [&str; 4] = ["low", "medium", "high", "urgent"];
const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Swap strategy for task fragments.
const FRAGMENT_SWAP: &str = "outerHTML";

/// Decode one text frame from `conn` and apply it.
///
/// Errors are meant for the sender only; nothing is broadcast on failure.
pub async fn handle_frame(
    state: &AppState,
    conn: &Arc<Connection>,
    text: &str,
) -> Result<(), GatewayError> {
    let frame: InboundFrame = serde_json::from_str(text)
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed frame: {e}")))?;

    if let Some(board_id) = &frame.board_id {
        if *board_id != conn.board_id {
            return Err(GatewayError::BoardMismatch);
        }
    }

    let event = ClientEvent::decode(&frame.kind, frame.data)?;
    tracing::trace!(
        connection_id = %conn.id,
        event = event.event_type().as_str(),
        "dispatching client event"
    );

    match event {
        ClientEvent::TaskMove(payload) => handle_task_move(state, conn, payload).await,
        ClientEvent::TaskUpdate(payload) => handle_task_update(state, conn, payload).await,
        ClientEvent::CursorMove(payload) => {
            handle_cursor_move(state, conn, payload);
            Ok(())
        }
        ClientEvent::UserPresence(payload) => {
            handle_user_presence(state, conn, payload);
            Ok(())
        }
    }
}

async fn handle_task_move(
    state: &AppState,
    conn: &Arc<Connection>,
    payload: TaskMovePayload,
) -> Result<(), GatewayError> {
    let _guard = state.hub.lock_board(&conn.board_id).await;
    let task = state
        .boards
        .get_task(&payload.task_id)
        .await?
        .filter(|task| task.board_id == conn.board_id)
        .ok_or(GatewayError::NotFound)?;

    let position = u32::try_from(payload.position)
        .map_err(|_| GatewayError::InvalidPayload("position out of range".to_string()))?;
    let patch = TaskPatch {
        column_id: Some(payload.column_id),
        position: Some(position),
        version: Some(task.version + 1),
        ..TaskPatch::default()
    };
    let task = state.boards.update_task(&task.id, &patch).await?;

    let html = state.renderer.render_task_fragment(&task).map_err(|err| {
        tracing::error!(%err, task_id = %task.id, "failed to render task fragment");
        GatewayError::Render
    })?;

    tracing::debug!(
        board_id = %conn.board_id,
        user_id = %conn.user_id(),
        task_id = %task.id,
        column_id = %task.column_id,
        position = task.position,
        version = task.version,
        "task moved"
    );

    let event = ServerEvent::HtmxUpdate(HtmxUpdateData {
        target: format!("task-{}", task.id),
        swap: FRAGMENT_SWAP,
        html,
        column_id: task.column_id,
        position: task.position,
        version: task.version,
        task_id: task.id,
    });
    state.hub.broadcast(
        &conn.board_id,
        Envelope::new(event, conn.user_id(), &conn.board_id),
        Some(conn.user_id()),
    );
    Ok(())
}

async fn handle_task_update(
    state: &AppState,
    conn: &Arc<Connection>,
    payload: TaskUpdatePayload,
) -> Result<(), GatewayError> {
    let patch = sanitize_fields(&payload.fields);
    if patch.is_empty() {
        tracing::debug!(task_id = %payload.task_id, "task update had no applicable fields");
        return Ok(());
    }

    let _guard = state.hub.lock_board(&conn.board_id).await;
    let task = state
        .boards
        .get_task(&payload.task_id)
        .await?
        .filter(|task| task.board_id == conn.board_id)
        .ok_or(GatewayError::NotFound)?;
    let task = state.boards.update_task(&task.id, &patch).await?;

    let event = ServerEvent::TaskUpdate(TaskUpdateData {
        task_id: task.id,
        fields: Some(patch),
        task: None,
        version: task.version,
    });
    state.hub.broadcast(
        &conn.board_id,
        Envelope::new(event, conn.user_id(), &conn.board_id),
        Some(conn.user_id()),
    );
    Ok(())
}

fn handle_cursor_move(state: &AppState, conn: &Arc<Connection>, payload: CursorMovePayload) {
    let identity = &conn.identity;
    let event = ServerEvent::CursorMove(CursorData {
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        display_name: identity.display_name.clone(),
        x: payload.x,
        y: payload.y,
        focus_element: payload.focus_element.clone(),
    });
    state.hub.broadcast(
        &conn.board_id,
        Envelope::new(event, conn.user_id(), &conn.board_id),
        Some(conn.user_id()),
    );

    let mut update = presence_touch(conn);
    update.cursor_x = Some(payload.x);
    update.cursor_y = Some(payload.y);
    update.focus_element = payload.focus_element;
    spawn_presence_update(state.presence.clone(), update);
}

fn handle_user_presence(state: &AppState, conn: &Arc<Connection>, payload: UserPresencePayload) {
    let identity = &conn.identity;
    let event = ServerEvent::PresenceUpdate(PresenceUpdateData {
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        display_name: identity.display_name.clone(),
        is_typing: payload.is_typing,
        active_task_id: payload.active_task_id.clone(),
    });
    state.hub.broadcast(
        &conn.board_id,
        Envelope::new(event, conn.user_id(), &conn.board_id),
        Some(conn.user_id()),
    );

    let mut update = presence_touch(conn);
    update.is_typing = Some(payload.is_typing);
    update.active_task_id = payload.active_task_id;
    spawn_presence_update(state.presence.clone(), update);
}

/// A presence write stamped with this connection's identity and the current time.
pub fn presence_touch(conn: &Connection) -> PresenceUpdate {
    let identity = &conn.identity;
    PresenceUpdate::touch(
        &identity.user_id,
        &conn.board_id,
        &identity.username,
        &identity.display_name,
        Utc::now(),
    )
}

/// Filter a raw `task_update` field map down to a typed patch.
///
/// Only whitelisted keys survive, and each must carry the expected type and
/// pass its own check. Anything else is dropped without failing the update.
pub fn sanitize_fields(fields: &Map<String, Value>) -> TaskPatch {
    let mut patch = TaskPatch::default();

    for (key, value) in fields {
        let accepted = UPDATABLE_FIELDS.contains(&key.as_str())
            && match key.as_str() {
                "title" => match value.as_str().map(str::trim) {
                    Some(title) if !title.is_empty() && title.chars().count() <= MAX_TITLE_LEN => {
                        patch.title = Some(title.to_string());
                        true
                    }
                    _ => false,
                },
                "description" => assign(
                    &mut patch.description,
                    nullable_string(value, |s| s.chars().count() <= MAX_DESCRIPTION_LEN),
                ),
                "priority" => assign(
                    &mut patch.priority,
                    nullable_string(value, |s| PRIORITIES.contains(&s)),
                ),
                "due_date" => assign(
                    &mut patch.due_date,
                    nullable_string(value, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
                ),
                "assignee_id" => assign(&mut patch.assignee_id, nullable_string(value, is_identifier)),
                _ => false,
            };

        if !accepted {
            tracing::debug!(field = %key, "dropping task update field");
        }
    }

    patch
}

fn assign(slot: &mut Option<Option<String>>, value: Option<Option<String>>) -> bool {
    match value {
        Some(value) => {
            *slot = Some(value);
            true
        }
        None => false,
    }
}

/// `null` clears the field; a string must pass `valid`. Any other shape is rejected.
fn nullable_string(value: &Value, valid: impl Fn(&str) -> bool) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) if valid(s) => Some(Some(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, KvAuthenticator};
    use crate::config::{Config, HubConfig};
    use crate::db::boards::{BoardStore, MemoryBoardStore};
    use crate::db::kv::MemoryStore;
    use crate::db::presence::MemoryPresenceStore;
    use crate::error::StoreError;
    use crate::models::task::Task;
    use crate::render::HtmlTaskRenderer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Board store whose reads take a while, widening any read-modify-write window.
    struct SlowReads(Arc<MemoryBoardStore>);

    #[async_trait]
    impl BoardStore for SlowReads {
        async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.get_task(task_id).await
        }

        async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
            self.0.update_task(task_id, patch).await
        }

        async fn has_board_access(&self, user_id: &str, board_id: &str) -> Result<bool, StoreError> {
            self.0.has_board_access(user_id, board_id).await
        }
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            username: user.into(),
            display_name: user.into(),
        }
    }

    fn slow_state() -> (AppState, Arc<MemoryBoardStore>) {
        let boards = Arc::new(MemoryBoardStore::new());
        boards.insert_task(Task {
            id: "tsk_1".into(),
            board_id: "brd_1".into(),
            column_id: "col_1".into(),
            position: 0,
            version: 1,
            title: "First".into(),
            description: None,
            priority: None,
            due_date: None,
            assignee_id: None,
            updated_at: Utc::now(),
        });
        let config = Config {
            port: 0,
            cors_allow_any: true,
            hub: HubConfig::default(),
        };
        let state = AppState::new(
            config,
            Arc::new(SlowReads(boards.clone())),
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(HtmlTaskRenderer),
            Arc::new(KvAuthenticator::new(Arc::new(MemoryStore::new()))),
        );
        (state, boards)
    }

    fn move_frame(column_id: &str, position: i64) -> String {
        json!({
            "type": "task_move",
            "boardId": "brd_1",
            "data": { "taskId": "tsk_1", "columnId": column_id, "position": position }
        })
        .to_string()
    }

    #[tokio::test]
    async fn concurrent_moves_on_one_board_are_serialized() {
        let (state, boards) = slow_state();
        let (watcher, mut watcher_rx) = Connection::new("brd_1", identity("usr_3"), 16);
        state.hub.register(watcher).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (c1, _rx1) = Connection::new("brd_1", identity("usr_1"), 16);
        let (c2, _rx2) = Connection::new("brd_1", identity("usr_2"), 16);
        let first = move_frame("col_2", 1);
        let second = move_frame("col_3", 2);
        let (r1, r2) = tokio::join!(
            handle_frame(&state, &c1, &first),
            handle_frame(&state, &c2, &second),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(boards.task("tsk_1").unwrap().version, 3);

        let mut versions = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(1), watcher_rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("queue closed");
            let frame: Value = serde_json::from_str(frame.as_str()).unwrap();
            assert_eq!(frame["type"], "htmx_update");
            versions.push(frame["data"]["version"].as_u64().unwrap());
        }
        assert_eq!(versions, vec![2, 3]);
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn sanitize_drops_unknown_keys() {
        let patch = sanitize_fields(&fields(json!({
            "title": "  Ship it ",
            "secret_internal_flag": true,
            "board_id": "brd_other",
            "version": 99,
        })));
        assert_eq!(
            patch,
            TaskPatch {
                title: Some("Ship it".into()),
                ..TaskPatch::default()
            }
        );
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "title": "Ship it" })
        );
    }

    #[test]
    fn sanitize_checks_types_and_values() {
        let patch = sanitize_fields(&fields(json!({
            "title": 42,
            "description": null,
            "priority": "critical",
            "due_date": "2026-02-30",
            "assignee_id": "usr_2",
        })));
        assert_eq!(patch.title, None);
        assert_eq!(patch.description, Some(None));
        assert_eq!(patch.priority, None);
        assert_eq!(patch.due_date, None);
        assert_eq!(patch.assignee_id, Some(Some("usr_2".into())));
    }

    #[test]
    fn sanitize_accepts_valid_dates_and_priorities() {
        let patch = sanitize_fields(&fields(json!({
            "priority": "urgent",
            "due_date": "2026-03-01",
        })));
        assert_eq!(patch.priority, Some(Some("urgent".into())));
        assert_eq!(patch.due_date, Some(Some("2026-03-01".into())));
    }

    #[test]
    fn sanitize_rejects_blank_title_and_bad_assignee() {
        let patch = sanitize_fields(&fields(json!({
            "title": "   ",
            "assignee_id": "usr 2; drop",
        })));
        assert!(patch.is_empty());
    }
}
