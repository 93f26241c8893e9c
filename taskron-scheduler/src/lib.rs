mod db_extensions;
pub mod executor;
pub mod notifier;
pub mod running;
pub mod schedule;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use taskron_database::interfaces::DatabaseImpl;
use taskron_models::{
    core::{Task, TaskState},
    errors::{SendableError, TaskronError},
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{
    executor::{Executor, DEFAULT_OUTPUT_LIMIT},
    notifier::Notifier,
    running::{RunGuard, RunningTasks},
};

type TaskHandleMap = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub frequency: Duration,
    pub execution_timeout: Duration,
    pub output_limit: usize,
    /// Log entries kept per task after each run. Zero keeps everything.
    pub log_retention: u32,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(30),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            log_retention: 0,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Shared scheduler state. Cloning is cheap and every clone drives the same
/// in-flight registry, so the web layer and the tick loop can both hold one.
pub struct SchedulerContext<D: DatabaseImpl> {
    pool: Arc<D>,
    executor: Executor,
    notifier: Notifier,
    running: RunningTasks,
    config: SchedulerConfig,
    handles: TaskHandleMap,
    next_handle: Arc<AtomicU64>,
}

impl<D: DatabaseImpl> Clone for SchedulerContext<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            notifier: self.notifier.clone(),
            running: self.running.clone(),
            config: self.config.clone(),
            handles: self.handles.clone(),
            next_handle: self.next_handle.clone(),
        }
    }
}

impl<D: DatabaseImpl> SchedulerContext<D> {
    pub fn new(pool: Arc<D>, config: SchedulerConfig) -> Result<Self, SendableError> {
        let executor = Executor::new(config.execution_timeout, config.output_limit)?;
        let notifier = Notifier::new(executor.client().clone());
        Ok(Self {
            pool,
            executor,
            notifier,
            running: RunningTasks::new(),
            config,
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn pool(&self) -> &Arc<D> {
        &self.pool
    }

    pub fn running(&self) -> &RunningTasks {
        &self.running
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn task_state(&self, task: &Task, now: DateTime<Utc>) -> TaskState {
        if self.running.is_running(task.id) {
            TaskState::Running
        } else if !task.enabled {
            TaskState::Disabled
        } else if task.next_run.is_some_and(|next| next <= now) {
            TaskState::Due
        } else {
            TaskState::Waiting
        }
    }

    /// Runs the tick loop until `shutdown` is cancelled, then gives in-flight
    /// runs the configured grace period before aborting them.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SendableError> {
        match self.initialize_schedules(Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!("Assigned an initial next run to {} task(s)", count),
            Err(err) => error!("Failed to assign initial next runs: {}", err),
        }

        info!(
            "Scheduler started, ticking every {} seconds",
            self.config.frequency.as_secs_f64()
        );
        loop {
            let start = Instant::now();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.handle_shutdown().await;
                    break;
                }
                _ = time::sleep(self.config.frequency) => {
                    match self.tick(Utc::now()).await {
                        Ok(dispatched) if dispatched > 0 => {
                            debug!("Dispatched {} task(s)", dispatched);
                        }
                        Ok(_) => {}
                        Err(err) => error!("Scheduler iteration failed, retrying next tick: {}", err),
                    }
                }
            }
            debug!(
                "Scheduler took {} seconds to run",
                start.elapsed().as_secs_f64()
            );
        }

        Ok(())
    }

    /// Enabled tasks missing a next run are given one.
    pub async fn initialize_schedules(&self, now: DateTime<Utc>) -> Result<usize, TaskronError> {
        db_extensions::set_initial_executions(&self.pool, now).await
    }

    /// One scheduling pass: dispatches every due task that is not already
    /// running and reaps finished workers. Returns how many runs started.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, TaskronError> {
        self.clean_up_finished_tasks().await;

        let tasks = self.pool.fetch_due_tasks(now).await?;
        let mut dispatched = 0;
        for task in tasks {
            let Some(guard) = self.running.try_acquire(task.id) else {
                debug!("Task {} is still running, skipping", task.id);
                continue;
            };

            // The due list may predate a run that finished and rescheduled
            // the task before the guard was taken.
            let Some(current) = self.pool.fetch_task(task.id).await? else {
                debug!("Task {} was deleted before it could run", task.id);
                continue;
            };
            if !current.enabled || !current.next_run.is_some_and(|next| next <= now) {
                debug!("Task {} is no longer due, skipping", task.id);
                continue;
            }

            debug!("Running task {} ({})", current.id, current.name);
            self.spawn_worker(current, guard);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Starts a run right away, outside the schedule.
    pub async fn execute_now(&self, task_id: i64) -> Result<(), TaskronError> {
        let task = self
            .pool
            .fetch_task(task_id)
            .await?
            .ok_or(TaskronError::TaskNotFound(task_id))?;
        let guard = self
            .running
            .try_acquire(task.id)
            .ok_or(TaskronError::ConcurrentRunRejected(task.id))?;

        info!("Manual run of task {} ({})", task.id, task.name);
        self.spawn_worker(task, guard);
        Ok(())
    }

    fn spawn_worker(&self, task: Task, guard: RunGuard) {
        let ctx = self.clone();
        let handle = tokio::spawn(async move {
            ctx.process_task(task, guard).await;
        });

        let handle_index = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(handle_index, handle);
    }

    async fn process_task(&self, task: Task, guard: RunGuard) {
        let entry = self.executor.run(&task).await;
        let finished_at = entry.end_time;

        match self.pool.append_log(&entry).await {
            Ok(log) => {
                debug!("Recorded log entry {} for task {}", log.id, task.id);
                if task.notifications.should_notify(log.success) {
                    let notifier = self.notifier.clone();
                    let task = task.clone();
                    tokio::spawn(async move {
                        notifier.notify(&task, &log).await;
                    });
                }
            }
            Err(err) => error!("Failed to record run of task {}: {}", task.id, err),
        }

        if self.config.log_retention > 0 {
            match self
                .pool
                .trim_task_logs(task.id, self.config.log_retention)
                .await
            {
                Ok(0) => {}
                Ok(removed) => debug!("Trimmed {} old log entries of task {}", removed, task.id),
                Err(err) => warn!("Failed to trim logs of task {}: {}", task.id, err),
            }
        }

        if let Err(err) = db_extensions::reschedule_after_run(&self.pool, task.id, finished_at).await {
            error!("Failed to reschedule task {}: {}", task.id, err);
        }

        drop(guard);
    }

    async fn clean_up_finished_tasks(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock();
            let done: Vec<u64> = handles
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(index, _)| *index)
                .collect();
            done.iter().filter_map(|index| handles.remove(index)).collect()
        };

        for handle in finished {
            if let Err(err) = handle.await {
                error!("Task worker failed: {:?}", err);
            }
        }
    }

    async fn handle_shutdown(&self) {
        info!("Scheduler received shutdown signal.");

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        info!(
            "Waiting up to {} seconds for {} running task(s)",
            self.config.shutdown_grace.as_secs_f64(),
            handles.len()
        );
        let deadline = time::Instant::now() + self.config.shutdown_grace;
        for mut handle in handles {
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Task worker failed: {:?}", err),
                Err(_) => {
                    warn!("Aborting task worker still running after the grace period");
                    handle.abort();
                }
            }
        }
    }
}
