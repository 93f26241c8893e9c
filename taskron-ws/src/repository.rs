use axum::http::Method;
use chrono::{DateTime, Utc};
use log::info;
use taskron_database::interfaces::DatabaseImpl;
use taskron_models::{
    core::{ActionKind, DEFAULT_HTTP_METHOD, LogEntry, NewTask, Task, TaskStatistics},
    errors::TaskronError,
    web::{Page, PageRequest, TaskInput, TaskResponse, TaskView},
};
use taskron_scheduler::{SchedulerContext, schedule};

struct ValidInput {
    name: String,
    schedule: String,
    command: String,
    kind: ActionKind,
    method: String,
}

fn validate(input: &TaskInput) -> Result<ValidInput, TaskronError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(TaskronError::InvalidTask("name must not be empty".to_string()));
    }
    let command = input.command.trim();
    if command.is_empty() {
        return Err(TaskronError::InvalidTask("command must not be empty".to_string()));
    }
    if let Some(kind) = input.notifications.unconfigured() {
        return Err(TaskronError::InvalidTask(format!(
            "notification type '{}' has no configuration",
            kind.as_str()
        )));
    }

    let method = input.method.trim().to_ascii_uppercase();
    let method = if method.is_empty() {
        DEFAULT_HTTP_METHOD.to_string()
    } else {
        Method::from_bytes(method.as_bytes())
            .map_err(|_| TaskronError::InvalidTask(format!("invalid HTTP method '{}'", input.method)))?;
        method
    };

    let schedule = input.schedule.split_whitespace().collect::<Vec<_>>().join(" ");
    schedule::CronSchedule::parse(&schedule)?;

    Ok(ValidInput {
        name: name.to_string(),
        schedule,
        command: command.to_string(),
        kind: ActionKind::detect(command),
        method,
    })
}

fn view<D: DatabaseImpl>(ctx: &SchedulerContext<D>, task: Task, now: DateTime<Utc>) -> TaskView {
    let state = ctx.task_state(&task, now);
    TaskView { task, state }
}

async fn require_task<D: DatabaseImpl>(db: &D, task_id: i64) -> Result<Task, TaskronError> {
    db.fetch_task(task_id)
        .await?
        .ok_or(TaskronError::TaskNotFound(task_id))
}

pub async fn add_task<D: DatabaseImpl>(
    ctx: &SchedulerContext<D>,
    input: &TaskInput,
) -> Result<TaskView, TaskronError> {
    let valid = validate(input)?;
    let now = Utc::now();
    let next_run = schedule::initial_next_run(&valid.schedule, input.enabled, now)?;

    let task = ctx
        .pool()
        .insert_task(&NewTask {
            name: valid.name,
            schedule: valid.schedule,
            command: valid.command,
            kind: valid.kind,
            method: valid.method,
            headers: input.headers.clone(),
            description: input.description.clone(),
            enabled: input.enabled,
            next_run,
            notifications: input.notifications.clone(),
        })
        .await?;
    info!("Created task {} ({})", task.id, task.name);
    Ok(view(ctx, task, now))
}

/// Replaces a task's definition. The next run is recomputed when the
/// schedule or enabled flag changes, or when an enabled task has none.
pub async fn update_task<D: DatabaseImpl>(
    ctx: &SchedulerContext<D>,
    task_id: i64,
    input: &TaskInput,
) -> Result<TaskView, TaskronError> {
    let valid = validate(input)?;
    let existing = require_task(ctx.pool().as_ref(), task_id).await?;
    let now = Utc::now();

    let reschedule = existing.schedule != valid.schedule
        || existing.enabled != input.enabled
        || (input.enabled && existing.next_run.is_none());
    let next_run = if reschedule {
        schedule::initial_next_run(&valid.schedule, input.enabled, now)?
    } else {
        existing.next_run
    };

    let task = ctx
        .pool()
        .update_task(&Task {
            name: valid.name,
            schedule: valid.schedule,
            command: valid.command,
            kind: valid.kind,
            method: valid.method,
            headers: input.headers.clone(),
            description: input.description.clone(),
            enabled: input.enabled,
            next_run,
            schedule_error: None,
            notifications: input.notifications.clone(),
            ..existing
        })
        .await?;
    info!("Updated task {} ({})", task.id, task.name);
    Ok(view(ctx, task, now))
}

pub async fn delete_task<D: DatabaseImpl>(db: &D, task_id: i64) -> Result<TaskResponse, TaskronError> {
    let removed_logs = db.delete_task(task_id).await?;
    info!("Deleted task {} and {} log entries", task_id, removed_logs);
    Ok(TaskResponse {
        success: true,
        message: format!("Task with ID {} deleted successfully", task_id),
    })
}

pub async fn execute_task<D: DatabaseImpl>(
    ctx: &SchedulerContext<D>,
    task_id: i64,
) -> Result<TaskResponse, TaskronError> {
    ctx.execute_now(task_id).await?;
    Ok(TaskResponse {
        success: true,
        message: format!("Task with ID {} started", task_id),
    })
}

pub async fn fetch_task<D: DatabaseImpl>(
    ctx: &SchedulerContext<D>,
    task_id: i64,
) -> Result<TaskView, TaskronError> {
    let task = require_task(ctx.pool().as_ref(), task_id).await?;
    Ok(view(ctx, task, Utc::now()))
}

pub async fn fetch_tasks<D: DatabaseImpl>(ctx: &SchedulerContext<D>) -> Result<Vec<TaskView>, TaskronError> {
    let now = Utc::now();
    let tasks = ctx.pool().fetch_all_tasks().await?;
    Ok(tasks.into_iter().map(|task| view(ctx, task, now)).collect())
}

pub async fn fetch_tasks_page<D: DatabaseImpl>(
    ctx: &SchedulerContext<D>,
    page: PageRequest,
) -> Result<Page<TaskView>, TaskronError> {
    let now = Utc::now();
    let tasks = ctx.pool().fetch_tasks_page(page).await?;
    Ok(tasks.map(|task| view(ctx, task, now)))
}

pub async fn fetch_task_logs<D: DatabaseImpl>(db: &D, task_id: i64) -> Result<Vec<LogEntry>, TaskronError> {
    require_task(db, task_id).await?;
    db.fetch_task_logs(task_id).await
}

pub async fn fetch_task_logs_page<D: DatabaseImpl>(
    db: &D,
    task_id: i64,
    page: PageRequest,
) -> Result<Page<LogEntry>, TaskronError> {
    require_task(db, task_id).await?;
    db.fetch_task_logs_page(task_id, page).await
}

pub async fn fetch_task_statistics<D: DatabaseImpl>(
    db: &D,
    task_id: i64,
) -> Result<TaskStatistics, TaskronError> {
    let task = require_task(db, task_id).await?;
    db.task_statistics(&task).await
}

pub async fn fetch_log<D: DatabaseImpl>(db: &D, log_id: i64) -> Result<LogEntry, TaskronError> {
    db.fetch_log(log_id).await?.ok_or(TaskronError::LogNotFound(log_id))
}

pub async fn fetch_logs_page<D: DatabaseImpl>(db: &D, page: PageRequest) -> Result<Page<LogEntry>, TaskronError> {
    db.fetch_logs_page(page).await
}

#[cfg(test)]
mod tests {
    use taskron_models::core::{NotificationKind, NotificationSettings, WeChatConfig};

    use super::*;

    fn input(schedule: &str, command: &str, method: &str) -> TaskInput {
        TaskInput {
            name: "  nightly  ".to_string(),
            schedule: schedule.to_string(),
            command: command.to_string(),
            method: method.to_string(),
            headers: String::new(),
            description: String::new(),
            enabled: true,
            notifications: NotificationSettings::default(),
        }
    }

    #[test]
    fn validation_normalizes_fields() {
        let valid = validate(&input(" 0  3 * * * ", "https://example/ping", "post")).unwrap();
        assert_eq!(valid.name, "nightly");
        assert_eq!(valid.schedule, "0 3 * * *");
        assert_eq!(valid.kind, ActionKind::Http);
        assert_eq!(valid.method, "POST");

        let valid = validate(&input("* * * * *", "echo hi", "")).unwrap();
        assert_eq!(valid.kind, ActionKind::Command);
        assert_eq!(valid.method, DEFAULT_HTTP_METHOD);
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(matches!(
            validate(&input("* * * * *", "   ", "")),
            Err(TaskronError::InvalidTask(_))
        ));
        assert!(matches!(
            validate(&input("* * * * *", "echo", "GE T")),
            Err(TaskronError::InvalidTask(_))
        ));
        assert!(matches!(
            validate(&input("61 * * * *", "echo", "")),
            Err(TaskronError::InvalidSchedule { .. })
        ));

        let mut unnamed = input("* * * * *", "echo", "");
        unnamed.name = " ".to_string();
        assert!(matches!(validate(&unnamed), Err(TaskronError::InvalidTask(_))));
    }

    #[test]
    fn notification_types_need_a_configuration() {
        let mut wants_wechat = input("* * * * *", "echo", "");
        wants_wechat.notifications.notification_types = vec![NotificationKind::WeChat];
        let err = validate(&wants_wechat).err().unwrap();
        assert_eq!(
            err.to_string(),
            "invalid task: notification type 'wechat' has no configuration"
        );

        wants_wechat.notifications.notification_config.wechat = Some(WeChatConfig {
            webhook_url: "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=k".to_string(),
            at_user_ids: Vec::new(),
            at_all: false,
        });
        assert!(validate(&wants_wechat).is_ok());
    }
}
