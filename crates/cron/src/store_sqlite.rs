//! SQLite-backed task store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqliteRow, sqlite::SqlitePoolOptions},
};

use crate::{
    Error, Result,
    store::TaskStore,
    types::{ScheduledTask, TaskRunLog, TaskStatus},
};

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, \
                            context_mode, status, next_run, last_run, last_result, created_at";

/// SQLite-backed persistence for tasks and run logs.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a dedicated pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Use an existing pool. [`crate::run_migrations`] must already have run.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn opt_u64(row: &SqliteRow, column: &str) -> Result<Option<u64>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u64))
}

fn task_from_row(row: &SqliteRow) -> Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.try_get("id")?,
        group_folder: row.try_get("group_folder")?,
        chat_jid: row.try_get("chat_jid")?,
        prompt: row.try_get("prompt")?,
        schedule_type: row.try_get::<String, _>("schedule_type")?.parse()?,
        schedule_value: row.try_get("schedule_value")?,
        context_mode: row.try_get::<String, _>("context_mode")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        next_run: opt_u64(row, "next_run")?,
        last_run: opt_u64(row, "last_run")?,
        last_result: row.try_get("last_result")?,
        created_at: row.try_get::<i64, _>("created_at")? as u64,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<TaskRunLog> {
    Ok(TaskRunLog {
        task_id: row.try_get("task_id")?,
        run_at: row.try_get::<i64, _>("run_at")? as u64,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        status: row.try_get::<String, _>("status")?.parse()?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_tasks (id, group_folder, chat_jid, prompt, schedule_type,
                 schedule_value, context_mode, status, next_run, last_run, last_result, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.status.as_str())
        .bind(task.next_run.map(|v| v as i64))
        .bind(task.last_run.map(|v| v as i64))
        .bind(&task.last_result)
        .bind(task.created_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_by_id(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, group_folder: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let rows = match group_folder {
            Some(group) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE group_folder = ?
                     ORDER BY created_at, id"
                ))
                .bind(group)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at, id"
                ))
                .fetch_all(&self.pool)
                .await?
            },
        };
        rows.iter().map(task_from_row).collect()
    }

    async fn get_due_tasks(&self, now_ms: u64) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run"
        ))
        .bind(now_ms as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_task_after_run(
        &self,
        id: &str,
        run_at: u64,
        next_run: Option<u64>,
        last_result: &str,
    ) -> Result<()> {
        let next_run = next_run.map(|v| v as i64);
        let result = sqlx::query(
            "UPDATE scheduled_tasks
             SET next_run = ?, last_run = ?, last_result = ?,
                 status = CASE WHEN ? IS NULL THEN 'done' ELSE status END
             WHERE id = ?",
        )
        .bind(next_run)
        .bind(run_at as i64)
        .bind(last_result)
        .bind(next_run)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::task_not_found(id));
        }
        Ok(())
    }

    async fn log_task_run(&self, entry: &TaskRunLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.task_id)
        .bind(entry.run_at as i64)
        .bind(entry.duration_ms as i64)
        .bind(entry.status.as_str())
        .bind(&entry.result)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::task_not_found(id));
        }
        Ok(())
    }

    async fn get_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        let rows = sqlx::query(
            "SELECT task_id, run_at, duration_ms, status, result, error
             FROM task_run_logs
             WHERE task_id = ?
             ORDER BY run_at DESC, id DESC
             LIMIT ?",
        )
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = rows.iter().map(run_from_row).collect::<Result<Vec<_>>>()?;
        runs.reverse();
        Ok(runs)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_run_logs WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::task_not_found(id));
        }
        tx.commit().await?;
        Ok(())
    }
}
