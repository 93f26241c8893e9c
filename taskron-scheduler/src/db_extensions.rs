use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use taskron_database::interfaces::DatabaseImpl;
use taskron_models::errors::TaskronError;

use crate::schedule;

/// Recomputes `next_run` from the task's current schedule after a run that
/// ended at `finished_at`. A schedule that no longer yields a fire time
/// leaves the task with no next run and a recorded schedule error.
pub(crate) async fn reschedule_after_run(
    pool: &Arc<impl DatabaseImpl>,
    task_id: i64,
    finished_at: DateTime<Utc>,
) -> Result<(), TaskronError> {
    let Some(task) = pool.fetch_task(task_id).await? else {
        debug!("Task {} was deleted while running, nothing to reschedule", task_id);
        return Ok(());
    };

    let stored = match schedule::next_fire(&task.schedule, finished_at) {
        Ok(next) => pool.reschedule_task(task.id, &task.schedule, Some(next), None).await?,
        Err(err) => {
            warn!("Task {} can no longer be scheduled: {}", task.id, err);
            pool.reschedule_task(task.id, &task.schedule, None, Some(&err.to_string()))
                .await?
        }
    };

    if !stored {
        debug!(
            "Schedule of task {} changed during its run, keeping the newer next run",
            task.id
        );
    }
    Ok(())
}

/// Gives every enabled task without a next run one, counting from `now`.
pub(crate) async fn set_initial_executions(
    pool: &Arc<impl DatabaseImpl>,
    now: DateTime<Utc>,
) -> Result<usize, TaskronError> {
    let mut assigned = 0;
    for task in pool.fetch_enabled_tasks().await? {
        if task.next_run.is_some() || task.schedule_error.is_some() {
            continue;
        }
        match schedule::next_fire(&task.schedule, now) {
            Ok(next) => {
                if pool.reschedule_task(task.id, &task.schedule, Some(next), None).await? {
                    assigned += 1;
                }
            }
            Err(err) => {
                warn!("Task {} has an unusable schedule: {}", task.id, err);
                pool.reschedule_task(task.id, &task.schedule, None, Some(&err.to_string()))
                    .await?;
            }
        }
    }
    Ok(assigned)
}
