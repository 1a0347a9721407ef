use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use libnudge::{Todo, TodoPatch};
use nudge_protocol::{NotificationId, NotificationView, PrincipalId, SubjectId};

use crate::AppState;
use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};

const DEFAULT_NOTIFICATION_LIMIT: usize = 50;
const MAX_NOTIFICATION_LIMIT: usize = 200;
const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_page")]
    pub limit: usize,
}

fn default_page() -> usize {
    DEFAULT_PAGE
}

impl Page {
    /// `(skip, limit)` once both are known to fit the store's integer range.
    pub fn bounds(&self) -> ApiResult<(usize, usize)> {
        if !(1..=MAX_PAGE).contains(&self.limit) {
            return Err(ApiError::validation(format!(
                "limit must be between 1 and {MAX_PAGE}"
            )));
        }
        if i64::try_from(self.skip).is_err() {
            return Err(ApiError::validation("skip is out of range"));
        }
        Ok((self.skip, self.limit))
    }
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTodo {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Serialize)]
pub struct PublicTodo {
    #[serde(flatten)]
    pub todo: Todo,
    pub owner_username: Option<String>,
}

/// GET /api/public/todos
pub async fn list_public_todos(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<PublicTodo>>> {
    let (skip, limit) = page.bounds()?;
    let rows = state.store.list_public_todos(skip, limit).await?;
    Ok(Json(
        rows.into_iter()
            .map(|(todo, owner_username)| PublicTodo {
                todo,
                owner_username,
            })
            .collect(),
    ))
}

/// GET /api/todos - The caller's own todos.
pub async fn list_todos(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Todo>>> {
    let (skip, limit) = page.bounds()?;
    let todos = state
        .store
        .list_todos_for(ctx.principal.id, skip, limit)
        .await?;
    Ok(Json(todos))
}

/// POST /api/todos
pub async fn create_todo(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(body): Json<CreateTodo>,
) -> ApiResult<(StatusCode, Json<Todo>)> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("title must not be empty"));
    }
    let todo = state
        .store
        .create_todo(
            Some(ctx.principal.id),
            title,
            body.description.as_deref(),
            body.is_public,
        )
        .await?;
    debug!(todo_id = todo.id, owner_id = ctx.principal.id, "todo created");
    Ok((StatusCode::CREATED, Json(todo)))
}

/// PUT /api/todos/{id}
///
/// Any non-empty edit of someone else's public todo notifies its owner, even
/// when the submitted values match what is stored.
pub async fn update_todo(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<SubjectId>,
    Json(patch): Json<TodoPatch>,
) -> ApiResult<Json<Todo>> {
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::validation("title must not be empty"));
    }

    let previous = visible_todo(&state, id, ctx.principal.id).await?;
    if patch.is_empty() {
        return Ok(Json(previous));
    }

    let mut todo = previous.clone();
    if patch.apply(&mut todo) {
        todo.updated_at = Some(Utc::now());
        if !state.store.save_todo(&todo).await? {
            return Err(ApiError::not_found("todo"));
        }
    }
    state
        .notifications
        .notify_on_change(&previous, &todo, ctx.principal.id)
        .await?;
    Ok(Json(todo))
}

/// DELETE /api/todos/{id}
pub async fn delete_todo(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<StatusCode> {
    let todo = visible_todo(&state, id, ctx.principal.id).await?;

    // The notification reads the title, so it goes first.
    state
        .notifications
        .notify_on_delete(&todo, ctx.principal.id)
        .await?;
    if !state.store.delete_todo(todo.id).await? {
        return Err(ApiError::not_found("todo"));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Public todos are shared; private ones exist only for their owner.
async fn visible_todo(state: &AppState, id: SubjectId, caller: PrincipalId) -> ApiResult<Todo> {
    match state.store.get_todo(id).await? {
        Some(todo) if todo.is_public || todo.owner_id == Some(caller) => Ok(todo),
        _ => Err(ApiError::not_found("todo")),
    }
}

/// GET /api/notifications?limit=N
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<Vec<NotificationView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT);
    if !(1..=MAX_NOTIFICATION_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!(
            "limit must be between 1 and {MAX_NOTIFICATION_LIMIT}"
        )));
    }
    let views = state
        .notifications
        .list_for_user(ctx.principal.id, limit)
        .await?;
    Ok(Json(views))
}

/// GET /api/notifications/unread-count
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> ApiResult<Json<Value>> {
    let count = state.notifications.unread_count(ctx.principal.id).await?;
    Ok(Json(json!({ "unread_count": count })))
}

/// PUT /api/notifications/{id}/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<NotificationId>,
) -> ApiResult<Json<Value>> {
    if !state.notifications.mark_read(id, ctx.principal.id).await? {
        return Err(ApiError::not_found("notification"));
    }
    Ok(Json(json!({ "success": true, "notification_id": id })))
}

/// PUT /api/notifications/mark-all-read
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> ApiResult<Json<Value>> {
    let marked = state.notifications.mark_all_read(ctx.principal.id).await?;
    Ok(Json(json!({ "success": true, "marked_count": marked })))
}
