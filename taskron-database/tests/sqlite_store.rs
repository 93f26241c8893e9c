use chrono::{Duration, Utc};
use taskron_database::{interfaces::DatabaseImpl, sqlite::SqliteDb};
use taskron_models::{
    core::{
        ActionKind, DingTalkConfig, NewLogEntry, NewTask, NotificationKind, NotificationSettings,
    },
    errors::TaskronError,
    web::PageRequest,
};
use tempfile::TempDir;

async fn open_store() -> (TempDir, SqliteDb) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskron.db");
    let db = SqliteDb::new(path.to_str().unwrap()).await.unwrap();
    db.initialize().await.unwrap();
    (dir, db)
}

fn new_task(name: &str) -> NewTask {
    NewTask {
        name: name.to_string(),
        schedule: "*/5 * * * *".to_string(),
        command: "echo hello".to_string(),
        kind: ActionKind::Command,
        method: "GET".to_string(),
        headers: String::new(),
        description: format!("{name} description"),
        enabled: true,
        next_run: Some(Utc::now() + Duration::minutes(5)),
        notifications: NotificationSettings::default(),
    }
}

fn log_for(task_id: i64, offset_secs: i64, success: bool) -> NewLogEntry {
    let start = Utc::now() + Duration::seconds(offset_secs);
    NewLogEntry {
        task_id,
        task_name: "task".to_string(),
        start_time: start,
        end_time: start + Duration::milliseconds(1500),
        success,
        output: format!("run at {offset_secs}"),
        error: if success { String::new() } else { "exit status: 1".to_string() },
    }
}

#[tokio::test]
async fn notification_settings_are_persisted() {
    let (_dir, db) = open_store().await;

    let mut task = new_task("notified");
    task.notifications.notify_on_success = true;
    task.notifications.notification_types = vec![NotificationKind::DingTalk];
    task.notifications.notification_config.dingtalk = Some(DingTalkConfig {
        webhook_url: "http://hook.invalid/robot?access_token=t".to_string(),
        secret: "SEC".to_string(),
        at_mobiles: vec!["13800000000".to_string()],
        at_all: false,
    });

    let created = db.insert_task(&task).await.unwrap();
    assert_eq!(created.notifications, task.notifications);

    let mut changed = created.clone();
    changed.notifications = NotificationSettings::default();
    let updated = db.update_task(&changed).await.unwrap();
    assert_eq!(updated.notifications, NotificationSettings::default());
    assert!(updated.notifications.notify_on_failure);
}

#[tokio::test]
async fn insert_fetch_update_task() {
    let (_dir, db) = open_store().await;

    let created = db.insert_task(&new_task("backup")).await.unwrap();
    assert!(created.id > 0);
    assert_eq!(created.kind, ActionKind::Command);
    assert!(created.next_run.is_some());

    let mut fetched = db.fetch_task(created.id).await.unwrap().unwrap();
    assert_eq!(fetched, created);

    fetched.name = "nightly backup".to_string();
    fetched.enabled = false;
    fetched.next_run = None;
    let updated = db.update_task(&fetched).await.unwrap();
    assert_eq!(updated.name, "nightly backup");
    assert!(!updated.enabled);
    assert!(updated.next_run.is_none());
    assert!(updated.updated_at >= created.updated_at);

    assert!(db.fetch_task(9_999).await.unwrap().is_none());
    fetched.id = 9_999;
    assert!(matches!(
        db.update_task(&fetched).await,
        Err(TaskronError::TaskNotFound(9_999))
    ));
}

#[tokio::test]
async fn tasks_page_in_creation_order() {
    let (_dir, db) = open_store().await;
    for i in 0..12 {
        db.insert_task(&new_task(&format!("task-{i}"))).await.unwrap();
    }

    let first = db.fetch_tasks_page(PageRequest::new(Some(1), Some(5))).await.unwrap();
    assert_eq!(first.total, 12);
    assert_eq!(first.total_pages, 3);
    let names: Vec<_> = first.data.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["task-0", "task-1", "task-2", "task-3", "task-4"]);

    let last = db.fetch_tasks_page(PageRequest::new(Some(3), Some(5))).await.unwrap();
    assert_eq!(last.data.len(), 2);
    assert_eq!(last.data[1].name, "task-11");

    let all = db.fetch_all_tasks().await.unwrap();
    assert_eq!(all.len(), 12);
}

#[tokio::test]
async fn due_tasks_only_enabled_and_elapsed() {
    let (_dir, db) = open_store().await;
    let now = Utc::now();

    let mut due = new_task("due");
    due.next_run = Some(now - Duration::seconds(1));
    let due = db.insert_task(&due).await.unwrap();

    let mut later = new_task("later");
    later.next_run = Some(now + Duration::hours(1));
    db.insert_task(&later).await.unwrap();

    let mut disabled = new_task("disabled");
    disabled.enabled = false;
    disabled.next_run = Some(now - Duration::seconds(1));
    db.insert_task(&disabled).await.unwrap();

    let found = db.fetch_due_tasks(now).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, due.id);

    assert_eq!(db.fetch_enabled_tasks().await.unwrap().len(), 2);
}

#[tokio::test]
async fn reschedule_is_guarded_by_schedule_and_enabled() {
    let (_dir, db) = open_store().await;
    let task = db.insert_task(&new_task("guarded")).await.unwrap();
    let next = Utc::now() + Duration::minutes(10);

    assert!(!db.reschedule_task(task.id, "0 0 * * *", Some(next), None).await.unwrap());
    assert!(db.reschedule_task(task.id, &task.schedule, Some(next), None).await.unwrap());
    let stored = db.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(
        stored.next_run.map(|t| t.timestamp_millis()),
        Some(next.timestamp_millis())
    );

    let mut disabled = stored.clone();
    disabled.enabled = false;
    disabled.next_run = None;
    db.update_task(&disabled).await.unwrap();
    db.reschedule_task(task.id, &task.schedule, Some(next), None).await.unwrap();
    assert!(db.fetch_task(task.id).await.unwrap().unwrap().next_run.is_none());

    db.reschedule_task(task.id, &task.schedule, None, Some("no match"))
        .await
        .unwrap();
    let flagged = db.fetch_task(task.id).await.unwrap().unwrap();
    assert_eq!(flagged.schedule_error.as_deref(), Some("no match"));
}

#[tokio::test]
async fn logs_are_newest_first_and_stable() {
    let (_dir, db) = open_store().await;
    let task = db.insert_task(&new_task("logged")).await.unwrap();

    for offset in [0, 10, 5] {
        db.append_log(&log_for(task.id, offset, true)).await.unwrap();
    }

    let logs = db.fetch_task_logs(task.id).await.unwrap();
    let outputs: Vec<_> = logs.iter().map(|l| l.output.as_str()).collect();
    assert_eq!(outputs, ["run at 10", "run at 5", "run at 0"]);

    let first = db.fetch_log(logs[0].id).await.unwrap().unwrap();
    let second = db.fetch_log(logs[0].id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first, logs[0]);

    let page = db
        .fetch_task_logs_page(task.id, PageRequest::new(Some(2), Some(2)))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].output, "run at 0");

    let global = db.fetch_logs_page(PageRequest::new(None, None)).await.unwrap();
    assert_eq!(global.total, 3);
}

#[tokio::test]
async fn delete_cascades_to_logs() {
    let (_dir, db) = open_store().await;
    let task = db.insert_task(&new_task("doomed")).await.unwrap();
    let survivor = db.insert_task(&new_task("survivor")).await.unwrap();

    for i in 0..5 {
        db.append_log(&log_for(task.id, i, true)).await.unwrap();
    }
    db.append_log(&log_for(survivor.id, 0, true)).await.unwrap();

    assert_eq!(db.delete_task(task.id).await.unwrap(), 5);
    assert!(db.fetch_task(task.id).await.unwrap().is_none());
    assert!(db.fetch_task_logs(task.id).await.unwrap().is_empty());
    assert_eq!(db.fetch_task_logs(survivor.id).await.unwrap().len(), 1);

    assert!(matches!(
        db.delete_task(task.id).await,
        Err(TaskronError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn append_log_for_missing_task_fails() {
    let (_dir, db) = open_store().await;
    let result = db.append_log(&log_for(4242, 0, true)).await;
    assert!(matches!(result, Err(TaskronError::StoreIo(_))));
}

#[tokio::test]
async fn trim_keeps_newest_entries() {
    let (_dir, db) = open_store().await;
    let task = db.insert_task(&new_task("chatty")).await.unwrap();
    for i in 0..6 {
        db.append_log(&log_for(task.id, i, true)).await.unwrap();
    }

    assert_eq!(db.trim_task_logs(task.id, 2).await.unwrap(), 4);
    let logs = db.fetch_task_logs(task.id).await.unwrap();
    let outputs: Vec<_> = logs.iter().map(|l| l.output.as_str()).collect();
    assert_eq!(outputs, ["run at 5", "run at 4"]);
}

#[tokio::test]
async fn statistics_summarise_runs() {
    let (_dir, db) = open_store().await;
    let task = db.insert_task(&new_task("measured")).await.unwrap();

    let empty = db.task_statistics(&task).await.unwrap();
    assert_eq!(empty.total_executions, 0);
    assert_eq!(empty.success_rate, 0.0);
    assert!(empty.last_execution_time.is_none());

    db.append_log(&log_for(task.id, 0, true)).await.unwrap();
    db.append_log(&log_for(task.id, 1, true)).await.unwrap();
    db.append_log(&log_for(task.id, 2, true)).await.unwrap();
    db.append_log(&log_for(task.id, 3, false)).await.unwrap();

    let stats = db.task_statistics(&task).await.unwrap();
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.success_executions, 3);
    assert_eq!(stats.failure_executions, 1);
    assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
    assert!((stats.average_execution_time - 1.5).abs() < 1e-9);
    assert_eq!(stats.last_execution_status, Some(false));
}
