use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::storage::task::{Task, TaskFilter, TaskStatus};
use crate::web::Pagination;
use crate::AppContext;

pub fn task_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            message: None,
        }),
    )
        .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            message: Some(message.into()),
        }),
    )
        .into_response()
}

/// Authentication itself lives in front of this service; here only the
/// authenticated user id arrives, as a header.
fn auth_user(headers: &HeaderMap) -> Result<i64, Response> {
    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|uid| *uid > 0)
        .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "unauthorized, please log in"))
}

#[derive(Debug, Serialize)]
struct TaskDto {
    task_id: String,
    user_id: i64,
    model: String,
    prompt: String,
    resolution: String,
    aspect_ratio: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    reference_image: String,
    count: i32,
    status: TaskStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    image_urls: Vec<String>,
    attempts: i32,
    created_at: i64,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<i64>,
}

impl From<&Task> for TaskDto {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            user_id: task.user_id,
            model: task.model_id.clone(),
            prompt: task.prompt.clone(),
            resolution: task.resolution.clone(),
            aspect_ratio: task.aspect_ratio.clone(),
            reference_image: task.reference_image.clone(),
            count: task.count,
            status: task.status,
            error_message: task.error_message.clone(),
            image_urls: task.image_urls.clone(),
            attempts: task.attempts,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    resolution: String,
    #[serde(default)]
    aspect_ratio: String,
    #[serde(default)]
    reference_image: String,
    #[serde(default)]
    count: i32,
}

async fn create_task(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Response {
    let user_id = match auth_user(&headers) {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };

    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return fail(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {}", rejection.body_text()),
            )
        }
    };
    if req.model.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "model is required");
    }
    if req.prompt.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "prompt is required");
    }

    // Admission before any row exists.
    let decision = ctx.rpm.acquire(user_id, &req.model, None).await;
    if !decision.admitted {
        let retry_after = decision.retry_after.as_secs_f64();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "message": format!("too many requests, retry in {:.1}s", retry_after),
                "retry_after": retry_after,
            })),
        )
            .into_response();
    }

    let mut task = Task::new(user_id, &req.model, &req.prompt);
    if !req.resolution.is_empty() {
        task.resolution = req.resolution;
    }
    if !req.aspect_ratio.is_empty() {
        task.aspect_ratio = req.aspect_ratio;
    }
    task.reference_image = req.reference_image;
    task.count = req.count.clamp(1, 4);

    if let Err(e) = ctx.store.insert(&task).await {
        error!("failed to create task: {}", e);
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to create task");
    }
    ok(TaskDto::from(&task))
}

async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let user_id = match auth_user(&headers) {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };

    match ctx.store.get(&task_id).await {
        Ok(Some(task)) if task.user_id == user_id => ok(TaskDto::from(&task)),
        Ok(Some(_)) => fail(StatusCode::FORBIDDEN, "no access to this task"),
        Ok(None) => fail(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => {
            error!("failed to get task {}: {}", task_id, e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to get task")
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    page: Option<u64>,
    page_size: Option<u64>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    model: String,
    start_time: Option<i64>,
    end_time: Option<i64>,
    #[serde(default)]
    search: String,
}

async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Response {
    let user_id = match auth_user(&headers) {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };

    let pagination = Pagination {
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(10),
    }
    .clamp();

    let status = if query.status.is_empty() {
        None
    } else {
        match TaskStatus::parse(&query.status) {
            Ok(status) => Some(status),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };
    let filter = TaskFilter {
        status,
        model: (!query.model.is_empty()).then(|| query.model.clone()),
        start_time: query.start_time.filter(|t| *t > 0),
        end_time: query.end_time.filter(|t| *t > 0),
        search: (!query.search.is_empty()).then(|| query.search.clone()),
    };

    match ctx
        .store
        .list_by_user(user_id, pagination.page, pagination.page_size, &filter)
        .await
    {
        Ok((tasks, total)) => ok(json!({
            "data": tasks.iter().map(TaskDto::from).collect::<Vec<_>>(),
            "total": total,
            "page": pagination.page,
            "page_size": pagination.page_size,
        })),
        Err(e) => {
            error!("failed to list tasks: {}", e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to list tasks")
        }
    }
}

async fn delete_task(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let user_id = match auth_user(&headers) {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };

    // Ownership rides in the delete predicate, so a foreign id and a
    // missing id are indistinguishable.
    match ctx.store.delete(&task_id, user_id).await {
        Ok(true) => ok(json!({ "message": "task deleted" })),
        Ok(false) => fail(StatusCode::NOT_FOUND, "task not found or not owned"),
        Err(e) => {
            error!("failed to delete task {}: {}", task_id, e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete task")
        }
    }
}
