use async_trait::async_trait;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

pub mod postgres;
pub mod sqlite;
#[cfg(test)]
mod tests;

pub use postgres::PgTaskStore;
pub use sqlite::SqliteTaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(anyhow::anyhow!("invalid task status: {}", other)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one durable entity: a user-owned image generation request tracked
/// through its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: i64,
    pub model_id: String,
    pub prompt: String,
    pub resolution: String,
    pub aspect_ratio: String,
    /// URL, data-URL, or raw base64; empty when absent.
    pub reference_image: String,
    pub count: i32,
    pub status: TaskStatus,
    /// Terminal failure message, set only when `failed`.
    pub error_message: String,
    pub image_urls: Vec<String>,
    pub attempts: i32,
    /// Most recent failure, kept across retries.
    pub last_error: String,
    /// Earliest unix second a pending row becomes claimable; None = now.
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(user_id: i64, model_id: &str, prompt: &str) -> Self {
        let now = now_unix();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            resolution: "1K".to_string(),
            aspect_ratio: "1:1".to_string(),
            reference_image: String::new(),
            count: 1,
            status: TaskStatus::Pending,
            error_message: String::new(),
            image_urls: Vec::new(),
            attempts: 0,
            last_error: String::new(),
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Filters accepted by the list endpoint.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub model: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Substring match on the prompt.
    pub search: Option<String>,
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Durable task store. Both implementations preserve the same claim
/// contract: at most one worker observes any row as `running` as a result
/// of its own claim, and transitions out of `running` are conditional so a
/// late terminal write after a zombie reset cannot corrupt the row.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn insert(&self, task: &Task) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Page through a user's tasks, newest first. Returns the page and the
    /// total row count under the same filters.
    async fn list_by_user(
        &self,
        user_id: i64,
        page: u64,
        page_size: u64,
        filter: &TaskFilter,
    ) -> Result<(Vec<Task>, i64)>;

    /// Remove a row owned by `user_id`. Returns false when no such row.
    async fn delete(&self, id: &str, user_id: i64) -> Result<bool>;

    /// Atomically move the oldest eligible pending row to `running` and
    /// return it. None means no eligible row (not an error).
    async fn claim_next_pending(&self) -> Result<Option<Task>>;

    async fn mark_running(&self, id: &str) -> Result<()>;
    async fn mark_success(&self, id: &str, image_urls: &[String]) -> Result<()>;
    async fn mark_failed(&self, id: &str, error_message: &str) -> Result<()>;

    /// Move a running row back to `pending` with a future eligibility time,
    /// incrementing `attempts` in the same statement.
    async fn schedule_retry(&self, id: &str, next_attempt_at: i64, error_message: &str)
        -> Result<()>;

    /// Flip running rows whose `updated_at` is older than `stale_after` back
    /// to `pending` with immediate eligibility. Returns how many flipped.
    async fn reset_zombie_running(&self, stale_after: Duration) -> Result<u64>;
}

pub(crate) fn encode_image_urls(urls: &[String]) -> Result<Option<String>> {
    if urls.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(urls)?))
}

pub(crate) fn decode_image_urls(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(Vec::new()),
    }
}
