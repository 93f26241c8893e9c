use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{
    ConnectOptions, Row, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use taskron_models::{
    core::{LogEntry, NewLogEntry, NewTask, Task, TaskStatistics},
    errors::TaskronError,
    web::{Page, PageRequest},
};

use crate::{
    interfaces::DatabaseImpl,
    mappers::{self, from_millis, to_millis},
};

const SQLITE_TABLE_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    schedule TEXT NOT NULL,
    command TEXT NOT NULL,
    action_kind TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'GET',
    headers TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    next_run INTEGER NULL,
    schedule_error TEXT NULL,
    notify_on_success INTEGER NOT NULL DEFAULT 0,
    notify_on_failure INTEGER NOT NULL DEFAULT 1,
    notification_types TEXT NOT NULL DEFAULT '[]',
    notification_config TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (enabled, next_run);

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    task_name TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    success INTEGER NOT NULL,
    output TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task_start ON task_logs (task_id, start_time DESC);
"#;

const TASK_COLUMNS: &str = "id, name, schedule, command, action_kind, method, headers, description, \
     enabled, next_run, schedule_error, notify_on_success, notify_on_failure, notification_types, \
     notification_config, created_at, updated_at";

const LOG_COLUMNS: &str = "id, task_id, task_name, start_time, end_time, success, output, error";

fn store_error(err: sqlx::Error) -> TaskronError {
    TaskronError::StoreIo(Box::new(err))
}

pub struct SqliteDb {
    pub pool: SqlitePool,
}

impl SqliteDb {
    pub async fn new(filename: &str) -> Result<Self, TaskronError> {
        let mut options = SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        options
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(store_error)?;
        info!("Opened SQLite task store at {}", filename);
        Ok(Self { pool })
    }

    async fn execute_script(&self, script: &str) -> Result<(), TaskronError> {
        for statement in script.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() {
                continue;
            }
            let result = sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
            debug!("Init script: {} row(s) affected", result.rows_affected());
        }
        Ok(())
    }

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>, TaskronError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.map(|row| mappers::row_to_task(&row))
            .transpose()
            .map_err(store_error)
    }

    async fn load_log(&self, log_id: i64) -> Result<Option<LogEntry>, TaskronError> {
        let row = sqlx::query(&format!("SELECT {LOG_COLUMNS} FROM task_logs WHERE id = ?"))
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.map(|row| mappers::row_to_log_entry(&row))
            .transpose()
            .map_err(store_error)
    }

    async fn query_tasks(&self, sql: &str, now: Option<i64>) -> Result<Vec<Task>, TaskronError> {
        let mut query = sqlx::query(sql);
        if let Some(now) = now {
            query = query.bind(now);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(store_error)?;
        rows.iter()
            .map(mappers::row_to_task)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)
    }

    async fn count(&self, sql: &str, task_id: Option<i64>) -> Result<i64, TaskronError> {
        let mut query = sqlx::query_scalar::<Sqlite, i64>(sql);
        if let Some(task_id) = task_id {
            query = query.bind(task_id);
        }
        query.fetch_one(&self.pool).await.map_err(store_error)
    }
}

impl DatabaseImpl for SqliteDb {
    async fn initialize(&self) -> Result<(), TaskronError> {
        info!("Running embedded SQLite table initialization script");
        self.execute_script(SQLITE_TABLE_INIT_SQL).await
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, TaskronError> {
        let now = to_millis(Utc::now());
        let (notification_types, notification_config) = mappers::notification_columns(&task.notifications)?;
        let result = sqlx::query(
            "INSERT INTO tasks (
                name,
                schedule,
                command,
                action_kind,
                method,
                headers,
                description,
                enabled,
                next_run,
                schedule_error,
                notify_on_success,
                notify_on_failure,
                notification_types,
                notification_config,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.name)
        .bind(&task.schedule)
        .bind(&task.command)
        .bind(task.kind.as_str())
        .bind(&task.method)
        .bind(&task.headers)
        .bind(&task.description)
        .bind(task.enabled)
        .bind(task.next_run.map(to_millis))
        .bind(task.notifications.notify_on_success)
        .bind(task.notifications.notify_on_failure)
        .bind(notification_types)
        .bind(notification_config)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        let id = result.last_insert_rowid();
        self.load_task(id)
            .await?
            .ok_or(TaskronError::TaskNotFound(id))
    }

    async fn update_task(&self, task: &Task) -> Result<Task, TaskronError> {
        let (notification_types, notification_config) = mappers::notification_columns(&task.notifications)?;
        let result = sqlx::query(
            "UPDATE tasks SET
                name = ?,
                schedule = ?,
                command = ?,
                action_kind = ?,
                method = ?,
                headers = ?,
                description = ?,
                enabled = ?,
                next_run = ?,
                schedule_error = ?,
                notify_on_success = ?,
                notify_on_failure = ?,
                notification_types = ?,
                notification_config = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&task.name)
        .bind(&task.schedule)
        .bind(&task.command)
        .bind(task.kind.as_str())
        .bind(&task.method)
        .bind(&task.headers)
        .bind(&task.description)
        .bind(task.enabled)
        .bind(task.next_run.map(to_millis))
        .bind(&task.schedule_error)
        .bind(task.notifications.notify_on_success)
        .bind(task.notifications.notify_on_failure)
        .bind(notification_types)
        .bind(notification_config)
        .bind(to_millis(Utc::now()))
        .bind(task.id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskronError::TaskNotFound(task.id));
        }
        self.load_task(task.id)
            .await?
            .ok_or(TaskronError::TaskNotFound(task.id))
    }

    async fn delete_task(&self, task_id: i64) -> Result<u64, TaskronError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let logs = sqlx::query("DELETE FROM task_logs WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut tx)
            .await
            .map_err(store_error)?;
        let tasks = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut tx)
            .await
            .map_err(store_error)?;

        if tasks.rows_affected() == 0 {
            tx.rollback().await.map_err(store_error)?;
            return Err(TaskronError::TaskNotFound(task_id));
        }

        tx.commit().await.map_err(store_error)?;
        Ok(logs.rows_affected())
    }

    async fn fetch_task(&self, task_id: i64) -> Result<Option<Task>, TaskronError> {
        self.load_task(task_id).await
    }

    async fn fetch_all_tasks(&self) -> Result<Vec<Task>, TaskronError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"),
            None,
        )
        .await
    }

    async fn fetch_tasks_page(&self, page: PageRequest) -> Result<Page<Task>, TaskronError> {
        let total = self.count("SELECT COUNT(*) FROM tasks", None).await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let data = rows
            .iter()
            .map(mappers::row_to_task)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        Ok(Page::new(page, total, data))
    }

    async fn fetch_enabled_tasks(&self) -> Result<Vec<Task>, TaskronError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE enabled = 1 ORDER BY id ASC"),
            None,
        )
        .await
    }

    async fn fetch_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskronError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?
                 ORDER BY next_run ASC, id ASC"
            ),
            Some(to_millis(now)),
        )
        .await
    }

    async fn reschedule_task(
        &self,
        task_id: i64,
        expected_schedule: &str,
        next_run: Option<DateTime<Utc>>,
        schedule_error: Option<&str>,
    ) -> Result<bool, TaskronError> {
        // Disabled tasks never carry a next_run, whatever the caller computed.
        let result = sqlx::query(
            "UPDATE tasks
             SET next_run = CASE WHEN enabled = 1 THEN ? ELSE NULL END,
                 schedule_error = ?
             WHERE id = ? AND schedule = ?",
        )
        .bind(next_run.map(to_millis))
        .bind(schedule_error)
        .bind(task_id)
        .bind(expected_schedule)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_log(&self, entry: &NewLogEntry) -> Result<LogEntry, TaskronError> {
        let result = sqlx::query(
            "INSERT INTO task_logs (task_id, task_name, start_time, end_time, success, output, error)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.task_id)
        .bind(&entry.task_name)
        .bind(to_millis(entry.start_time))
        .bind(to_millis(entry.end_time))
        .bind(entry.success)
        .bind(&entry.output)
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        let id = result.last_insert_rowid();
        self.load_log(id).await?.ok_or(TaskronError::LogNotFound(id))
    }

    async fn fetch_log(&self, log_id: i64) -> Result<Option<LogEntry>, TaskronError> {
        self.load_log(log_id).await
    }

    async fn fetch_task_logs(&self, task_id: i64) -> Result<Vec<LogEntry>, TaskronError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ? ORDER BY start_time DESC, id DESC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter()
            .map(mappers::row_to_log_entry)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)
    }

    async fn fetch_task_logs_page(
        &self,
        task_id: i64,
        page: PageRequest,
    ) -> Result<Page<LogEntry>, TaskronError> {
        let total = self
            .count("SELECT COUNT(*) FROM task_logs WHERE task_id = ?", Some(task_id))
            .await?;
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ?
             ORDER BY start_time DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(task_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let data = rows
            .iter()
            .map(mappers::row_to_log_entry)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        Ok(Page::new(page, total, data))
    }

    async fn fetch_logs_page(&self, page: PageRequest) -> Result<Page<LogEntry>, TaskronError> {
        let total = self.count("SELECT COUNT(*) FROM task_logs", None).await?;
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs ORDER BY start_time DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let data = rows
            .iter()
            .map(mappers::row_to_log_entry)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        Ok(Page::new(page, total, data))
    }

    async fn trim_task_logs(&self, task_id: i64, keep: u32) -> Result<u64, TaskronError> {
        let result = sqlx::query(
            "DELETE FROM task_logs
             WHERE task_id = ?
               AND id NOT IN (
                   SELECT id FROM task_logs
                   WHERE task_id = ?
                   ORDER BY start_time DESC, id DESC
                   LIMIT ?
               )",
        )
        .bind(task_id)
        .bind(task_id)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn task_statistics(&self, task: &Task) -> Result<TaskStatistics, TaskronError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successes,
                    COALESCE(AVG(end_time - start_time), 0.0) AS average_ms
             FROM task_logs WHERE task_id = ?",
        )
        .bind(task.id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        let total = row.try_get::<i64, _>("total").map_err(store_error)?;
        let successes = row.try_get::<i64, _>("successes").map_err(store_error)?;
        let average_ms = row.try_get::<f64, _>("average_ms").map_err(store_error)?;

        let last = sqlx::query(
            "SELECT start_time, success FROM task_logs WHERE task_id = ?
             ORDER BY start_time DESC, id DESC LIMIT 1",
        )
        .bind(task.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        let (last_execution_time, last_execution_status) = match last {
            Some(row) => (
                Some(from_millis(
                    row.try_get::<i64, _>("start_time").map_err(store_error)?,
                )),
                Some(row.try_get::<bool, _>("success").map_err(store_error)?),
            ),
            None => (None, None),
        };

        let success_rate = if total > 0 {
            successes as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(TaskStatistics {
            task_id: task.id,
            task_name: task.name.clone(),
            total_executions: total,
            success_executions: successes,
            failure_executions: total - successes,
            success_rate,
            average_execution_time: average_ms / 1000.0,
            last_execution_time,
            last_execution_status,
        })
    }
}
