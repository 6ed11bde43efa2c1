use async_trait::async_trait;
use anyhow::Result;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

use super::{
    decode_image_urls, encode_image_urls, now_unix, Task, TaskFilter, TaskStatus, TaskStore,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS image_tasks (
    id TEXT PRIMARY KEY,
    user_id BIGINT NOT NULL,
    model_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    resolution TEXT NOT NULL DEFAULT '1K',
    aspect_ratio TEXT NOT NULL DEFAULT '1:1',
    reference_image TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    error_message TEXT NOT NULL DEFAULT '',
    image_urls TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT NOT NULL DEFAULT '',
    next_attempt_at BIGINT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    completed_at BIGINT
)
"#;

const TASK_COLUMNS: &str = "id, user_id, model_id, prompt, resolution, aspect_ratio, \
     reference_image, count, status, error_message, image_urls, attempts, last_error, \
     next_attempt_at, created_at, updated_at, completed_at";

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_filters<'q>(mut q: PgQuery<'q>, user_id: i64, filter: &TaskFilter) -> PgQuery<'q> {
    q = q.bind(user_id);
    if let Some(status) = filter.status {
        q = q.bind(status.as_str());
    }
    if let Some(model) = &filter.model {
        q = q.bind(model.clone());
    }
    if let Some(start) = filter.start_time {
        q = q.bind(start);
    }
    if let Some(end) = filter.end_time {
        q = q.bind(end);
    }
    if let Some(search) = &filter.search {
        q = q.bind(format!("%{}%", search));
    }
    q
}

/// PostgreSQL-backed task store. The claim rides `FOR UPDATE SKIP LOCKED`
/// so concurrent claimers never block on, or double-take, each other's rows.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Initializing PostgreSQL task store");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_image_tasks_user_created \
             ON image_tasks (user_id, created_at DESC)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_image_tasks_status_next_attempt \
             ON image_tasks (status, next_attempt_at)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    fn row_to_task(row: PgRow) -> Result<Task> {
        Ok(Task {
            id: row.get("id"),
            user_id: row.get("user_id"),
            model_id: row.get("model_id"),
            prompt: row.get("prompt"),
            resolution: row.get("resolution"),
            aspect_ratio: row.get("aspect_ratio"),
            reference_image: row.get("reference_image"),
            count: row.get("count"),
            status: TaskStatus::parse(row.get("status"))?,
            error_message: row.get("error_message"),
            image_urls: decode_image_urls(row.get("image_urls"))?,
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            next_attempt_at: row.get("next_attempt_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }

    #[cfg(test)]
    pub(crate) async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM image_tasks").execute(&self.pool).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn force_updated_at(&self, id: &str, updated_at: i64) -> Result<()> {
        sqlx::query("UPDATE image_tasks SET updated_at = $1 WHERE id = $2")
            .bind(updated_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_tasks
            (id, user_id, model_id, prompt, resolution, aspect_ratio, reference_image,
             count, status, error_message, image_urls, attempts, last_error,
             next_attempt_at, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&task.id)
        .bind(task.user_id)
        .bind(&task.model_id)
        .bind(&task.prompt)
        .bind(&task.resolution)
        .bind(&task.aspect_ratio)
        .bind(&task.reference_image)
        .bind(task.count)
        .bind(task.status.as_str())
        .bind(&task.error_message)
        .bind(encode_image_urls(&task.image_urls)?)
        .bind(task.attempts)
        .bind(&task.last_error)
        .bind(task.next_attempt_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM image_tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(Self::row_to_task).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        page: u64,
        page_size: u64,
        filter: &TaskFilter,
    ) -> Result<(Vec<Task>, i64)> {
        let mut conditions = String::from("user_id = $1");
        let mut arg = 1;
        if filter.status.is_some() {
            arg += 1;
            conditions.push_str(&format!(" AND status = ${}", arg));
        }
        if filter.model.is_some() {
            arg += 1;
            conditions.push_str(&format!(" AND model_id = ${}", arg));
        }
        if filter.start_time.is_some() {
            arg += 1;
            conditions.push_str(&format!(" AND created_at >= ${}", arg));
        }
        if filter.end_time.is_some() {
            arg += 1;
            conditions.push_str(&format!(" AND created_at <= ${}", arg));
        }
        if filter.search.is_some() {
            arg += 1;
            conditions.push_str(&format!(" AND prompt LIKE ${}", arg));
        }

        let count_sql = format!("SELECT COUNT(*) AS total FROM image_tasks WHERE {}", conditions);
        let total: i64 = bind_filters(sqlx::query(&count_sql), user_id, filter)
            .fetch_one(&self.pool)
            .await?
            .get("total");

        let offset = page.saturating_sub(1) * page_size;
        let list_sql = format!(
            "SELECT {} FROM image_tasks WHERE {} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            TASK_COLUMNS,
            conditions,
            arg + 1,
            arg + 2
        );
        let rows = bind_filters(sqlx::query(&list_sql), user_id, filter)
            .bind(page_size as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let tasks = rows
            .into_iter()
            .map(Self::row_to_task)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    async fn delete(&self, id: &str, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM image_tasks WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_pending(&self) -> Result<Option<Task>> {
        let now = now_unix();
        // The locked subselect and the running transition commit together,
        // and SKIP LOCKED steps over rows held by other in-flight claims.
        let sql = format!(
            r#"
            UPDATE image_tasks SET status = 'running', updated_at = $1
            WHERE id = (
                SELECT id FROM image_tasks
                WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_task).transpose()
    }

    async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE image_tasks SET status = 'running', updated_at = $1 \
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_success(&self, id: &str, image_urls: &[String]) -> Result<()> {
        let now = now_unix();
        sqlx::query(
            "UPDATE image_tasks SET status = 'succeeded', image_urls = $1, \
             updated_at = $2, completed_at = $3 WHERE id = $4 AND status = 'running'",
        )
        .bind(encode_image_urls(image_urls)?)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error_message: &str) -> Result<()> {
        let now = now_unix();
        sqlx::query(
            "UPDATE image_tasks SET status = 'failed', error_message = $1, last_error = $2, \
             next_attempt_at = NULL, updated_at = $3, completed_at = $4 \
             WHERE id = $5 AND status = 'running'",
        )
        .bind(error_message)
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &str,
        next_attempt_at: i64,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE image_tasks SET status = 'pending', attempts = attempts + 1, \
             last_error = $1, next_attempt_at = $2, updated_at = $3 \
             WHERE id = $4 AND status = 'running'",
        )
        .bind(error_message)
        .bind(next_attempt_at)
        .bind(now_unix())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_zombie_running(&self, stale_after: Duration) -> Result<u64> {
        let now = now_unix();
        let stale_before = now - stale_after.as_secs() as i64;
        let result = sqlx::query(
            "UPDATE image_tasks SET status = 'pending', next_attempt_at = $1, updated_at = $2 \
             WHERE status = 'running' AND updated_at < $3",
        )
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
