//! Task card rendering for fragment swaps on connected boards.

use askama::Template;

use crate::models::task::Task;

#[derive(Debug, thiserror::Error)]
#[error("template rendering failed: {0}")]
pub struct RenderError(pub String);

/// Turns a task record into the markup fragment clients swap into the board.
pub trait TaskRenderer: Send + Sync {
    fn render_task_fragment(&self, task: &Task) -> Result<String, RenderError>;
}

#[derive(Template)]
#[template(path = "partials/task_card.html")]
struct TaskCardTemplate<'a> {
    id: &'a str,
    column_id: &'a str,
    position: u32,
    version: i64,
    title: &'a str,
    description: Option<&'a str>,
    priority: Option<&'a str>,
    due_date: Option<&'a str>,
    assignee_id: Option<&'a str>,
}

impl<'a> TaskCardTemplate<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            column_id: &task.column_id,
            position: task.position,
            version: task.version,
            title: &task.title,
            description: task.description.as_deref(),
            priority: task.priority.as_deref(),
            due_date: task.due_date.as_deref(),
            assignee_id: task.assignee_id.as_deref(),
        }
    }
}

/// Askama-backed renderer; output is HTML-escaped.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlTaskRenderer;

impl TaskRenderer for HtmlTaskRenderer {
    fn render_task_fragment(&self, task: &Task) -> Result<String, RenderError> {
        TaskCardTemplate::from_task(task)
            .render()
            .map_err(|e| RenderError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn renders_escaped_card() {
        let task = Task {
            id: "tsk_1".into(),
            board_id: "brd_1".into(),
            column_id: "col_2".into(),
            position: 0,
            version: 4,
            title: "<script>alert(1)</script>".into(),
            description: None,
            priority: Some("high".into()),
            due_date: None,
            assignee_id: None,
            updated_at: Utc::now(),
        };
        let html = HtmlTaskRenderer.render_task_fragment(&task).unwrap();
        assert!(html.contains(r#"id="task-tsk_1""#));
        assert!(html.contains(r#"data-column-id="col_2""#));
        assert!(html.contains("priority-high"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
