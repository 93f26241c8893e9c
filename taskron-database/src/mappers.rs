use chrono::{DateTime, Utc};
use sqlx::{Row, sqlite::SqliteRow};
use taskron_models::{
    core::{ActionKind, LogEntry, NotificationSettings, Task},
    errors::TaskronError,
};

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn row_to_task(row: &SqliteRow) -> Result<Task, sqlx::Error> {
    let kind_text = row.try_get::<String, _>("action_kind")?;
    let command = row.try_get::<String, _>("command")?;
    let kind = ActionKind::parse(&kind_text).unwrap_or_else(|| ActionKind::detect(&command));

    Ok(Task {
        id: row.try_get::<i64, _>("id")?,
        name: row.try_get::<String, _>("name")?,
        schedule: row.try_get::<String, _>("schedule")?,
        command,
        kind,
        method: row.try_get::<String, _>("method")?,
        headers: row.try_get::<String, _>("headers")?,
        description: row.try_get::<String, _>("description")?,
        enabled: row.try_get::<bool, _>("enabled")?,
        next_run: row.try_get::<Option<i64>, _>("next_run")?.map(from_millis),
        schedule_error: row.try_get::<Option<String>, _>("schedule_error")?,
        notifications: NotificationSettings {
            notify_on_success: row.try_get::<bool, _>("notify_on_success")?,
            notify_on_failure: row.try_get::<bool, _>("notify_on_failure")?,
            notification_types: decode_json(row, "notification_types")?,
            notification_config: decode_json(row, "notification_config")?,
        },
        created_at: from_millis(row.try_get::<i64, _>("created_at")?),
        updated_at: from_millis(row.try_get::<i64, _>("updated_at")?),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let text = row.try_get::<String, _>(column)?;
    serde_json::from_str(&text).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

/// JSON text stored in the `notification_types` and `notification_config` columns.
pub(crate) fn notification_columns(settings: &NotificationSettings) -> Result<(String, String), TaskronError> {
    let encode = |err: serde_json::Error| TaskronError::StoreIo(Box::new(err));
    Ok((
        serde_json::to_string(&settings.notification_types).map_err(encode)?,
        serde_json::to_string(&settings.notification_config).map_err(encode)?,
    ))
}

pub(crate) fn row_to_log_entry(row: &SqliteRow) -> Result<LogEntry, sqlx::Error> {
    Ok(LogEntry {
        id: row.try_get::<i64, _>("id")?,
        task_id: row.try_get::<i64, _>("task_id")?,
        task_name: row.try_get::<String, _>("task_name")?,
        start_time: from_millis(row.try_get::<i64, _>("start_time")?),
        end_time: from_millis(row.try_get::<i64, _>("end_time")?),
        success: row.try_get::<bool, _>("success")?,
        output: row.try_get::<String, _>("output")?,
        error: row.try_get::<String, _>("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip_keeps_precision() {
        let time = from_millis(1_700_000_123_456);
        assert_eq!(to_millis(time), 1_700_000_123_456);
    }

    #[test]
    fn empty_notifications_encode_as_empty_json() {
        let (types, config) = notification_columns(&NotificationSettings::default()).unwrap();
        assert_eq!(types, "[]");
        assert_eq!(config, "{}");
    }
}
