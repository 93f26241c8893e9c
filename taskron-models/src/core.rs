use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_METHOD: &str = "GET";

/// How a task's `command` is carried out. Resolved once when the task is
/// saved and persisted next to the command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Http,
}

impl ActionKind {
    pub fn detect(command: &str) -> Self {
        let trimmed = command.trim_start();
        let lowered = trimmed
            .get(..8)
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            ActionKind::Http
        } else {
            ActionKind::Command
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Command => "command",
            ActionKind::Http => "http",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "command" => Some(ActionKind::Command),
            "http" => Some(ActionKind::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    #[serde(rename = "ID")]
    pub id: i64,
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub kind: ActionKind,
    pub method: String,
    pub headers: String,
    pub description: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub schedule_error: Option<String>,
    #[serde(flatten)]
    pub notifications: NotificationSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn action(&self) -> TaskAction {
        match self.kind {
            ActionKind::Command => TaskAction::Command {
                command: self.command.clone(),
            },
            ActionKind::Http => TaskAction::HttpCall {
                url: self.command.trim().to_string(),
                method: if self.method.trim().is_empty() {
                    DEFAULT_HTTP_METHOD.to_string()
                } else {
                    self.method.trim().to_ascii_uppercase()
                },
                headers: parse_headers(&self.headers),
            },
        }
    }
}

/// A task definition that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub kind: ActionKind,
    pub method: String,
    pub headers: String,
    pub description: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    Command {
        command: String,
    },
    HttpCall {
        url: String,
        method: String,
        headers: Vec<(String, String)>,
    },
}

/// Parses raw header text into name/value pairs.
///
/// Accepts a JSON object (`{"Accept": "text/plain"}`) or `key: value` pairs
/// separated by newlines or semicolons. Malformed pairs are skipped.
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('{') {
        if let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(trimmed) {
            return map
                .into_iter()
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .filter(|(key, _)| !key.is_empty())
                .collect();
        }
    }

    trimmed
        .split(['\n', ';'])
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Email,
    DingTalk,
    WeChat,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Email => "email",
            NotificationKind::DingTalk => "dingtalk",
            NotificationKind::WeChat => "wechat",
        }
    }
}

/// Per-task run notifications. Flattened into the task's JSON, so the keys
/// are `NotifyOnSuccess`, `NotifyOnFailure`, `NotificationTypes` and
/// `NotificationConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationSettings {
    #[serde(default, alias = "notify_on_success")]
    pub notify_on_success: bool,
    #[serde(default = "default_true", alias = "notify_on_failure")]
    pub notify_on_failure: bool,
    #[serde(default, alias = "notification_types")]
    pub notification_types: Vec<NotificationKind>,
    #[serde(default, alias = "notification_config")]
    pub notification_config: NotificationConfig,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            notify_on_success: false,
            notify_on_failure: true,
            notification_types: Vec::new(),
            notification_config: NotificationConfig::default(),
        }
    }
}

impl NotificationSettings {
    pub fn should_notify(&self, success: bool) -> bool {
        let wanted = if success {
            self.notify_on_success
        } else {
            self.notify_on_failure
        };
        wanted && !self.notification_types.is_empty()
    }

    /// The first requested channel that has no configuration, if any.
    pub fn unconfigured(&self) -> Option<NotificationKind> {
        self.notification_types
            .iter()
            .copied()
            .find(|kind| !self.notification_config.has(*kind))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dingtalk: Option<DingTalkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wechat: Option<WeChatConfig>,
}

impl NotificationConfig {
    pub fn has(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Email => self.email.is_some(),
            NotificationKind::DingTalk => self.dingtalk.is_some(),
            NotificationKind::WeChat => self.wechat.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default)]
    pub enable_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DingTalkConfig {
    pub webhook_url: String,
    /// Signing secret; requests are signed when set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub at_mobiles: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeChatConfig {
    pub webhook_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub at_user_ids: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Disabled,
    Waiting,
    Due,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogEntry {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "TaskID")]
    pub task_id: i64,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub output: String,
    pub error: String,
}

/// The outcome of one run, before the store assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub task_id: i64,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl NewLogEntry {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemStats {
    #[serde(rename = "CPUUsage")]
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Megabytes.
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    /// One minute load average.
    pub system_load: f64,
    pub load_average: [f64; 3],
    pub process_count: u64,
    /// Percentage of the root filesystem in use.
    pub disk_usage: f64,
    /// Gigabytes.
    pub disk_total: f64,
    pub disk_used: f64,
    pub disk_free: f64,
    /// Bytes received and sent over all non-loopback interfaces since boot.
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    /// Seconds since boot.
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
}

impl SystemStats {
    pub fn zeroed(timestamp: DateTime<Utc>) -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            memory_total: 0,
            memory_used: 0,
            memory_free: 0,
            system_load: 0.0,
            load_average: [0.0; 3],
            process_count: 0,
            disk_usage: 0.0,
            disk_total: 0.0,
            disk_used: 0.0,
            disk_free: 0.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            uptime: 0,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub task_id: i64,
    pub task_name: String,
    pub total_executions: i64,
    pub success_executions: i64,
    pub failure_executions: i64,
    /// Percentage, 0-100.
    pub success_rate: f64,
    /// Seconds.
    pub average_execution_time: f64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub last_execution_status: Option<bool>,
}
