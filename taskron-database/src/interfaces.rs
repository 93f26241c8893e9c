use std::future::Future;

use chrono::{DateTime, Utc};
use taskron_models::{
    core::{LogEntry, NewLogEntry, NewTask, Task, TaskStatistics},
    errors::TaskronError,
    web::{Page, PageRequest},
};

// NOTE: implementors are shared across spawned workers behind an `Arc`, so
// they must own their state (no borrowed connections).
pub trait DatabaseImpl: Send + Sync + 'static {
    fn initialize(&self) -> impl Future<Output = Result<(), TaskronError>> + Send;

    fn insert_task(&self, task: &NewTask) -> impl Future<Output = Result<Task, TaskronError>> + Send;
    /// Replaces every editable column of an existing task. `TaskNotFound` if the id is unknown.
    fn update_task(&self, task: &Task) -> impl Future<Output = Result<Task, TaskronError>> + Send;
    /// Deletes the task and all of its log entries, returning how many logs went with it.
    fn delete_task(&self, task_id: i64) -> impl Future<Output = Result<u64, TaskronError>> + Send;
    fn fetch_task(&self, task_id: i64) -> impl Future<Output = Result<Option<Task>, TaskronError>> + Send;
    fn fetch_all_tasks(&self) -> impl Future<Output = Result<Vec<Task>, TaskronError>> + Send;
    fn fetch_tasks_page(
        &self,
        page: PageRequest,
    ) -> impl Future<Output = Result<Page<Task>, TaskronError>> + Send;
    fn fetch_enabled_tasks(&self) -> impl Future<Output = Result<Vec<Task>, TaskronError>> + Send;
    /// Enabled tasks whose `next_run` is at or before `now`.
    fn fetch_due_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Task>, TaskronError>> + Send;

    /// Stores the next fire time, guarded by the schedule it was computed from.
    /// Returns false when the schedule or enabled flag changed in the meantime.
    fn reschedule_task(
        &self,
        task_id: i64,
        expected_schedule: &str,
        next_run: Option<DateTime<Utc>>,
        schedule_error: Option<&str>,
    ) -> impl Future<Output = Result<bool, TaskronError>> + Send;

    fn append_log(&self, entry: &NewLogEntry) -> impl Future<Output = Result<LogEntry, TaskronError>> + Send;
    fn fetch_log(&self, log_id: i64) -> impl Future<Output = Result<Option<LogEntry>, TaskronError>> + Send;
    fn fetch_task_logs(&self, task_id: i64) -> impl Future<Output = Result<Vec<LogEntry>, TaskronError>> + Send;
    fn fetch_task_logs_page(
        &self,
        task_id: i64,
        page: PageRequest,
    ) -> impl Future<Output = Result<Page<LogEntry>, TaskronError>> + Send;
    fn fetch_logs_page(
        &self,
        page: PageRequest,
    ) -> impl Future<Output = Result<Page<LogEntry>, TaskronError>> + Send;
    /// Keeps the newest `keep` entries of a task and deletes the rest.
    fn trim_task_logs(&self, task_id: i64, keep: u32) -> impl Future<Output = Result<u64, TaskronError>> + Send;
    fn task_statistics(&self, task: &Task) -> impl Future<Output = Result<TaskStatistics, TaskronError>> + Send;
}
