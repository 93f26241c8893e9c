//! Run notifications over DingTalk and WeChat Work webhooks and SMTP mail.
//! Delivery is best effort: failures are logged and never touch the run.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use log::{debug, info, warn};
use reqwest::{Client, Url};
use serde_json::{json, Value};
use sha2::Sha256;
use taskron_models::{
    core::{DingTalkConfig, EmailConfig, LogEntry, NotificationKind, Task, WeChatConfig},
    errors::SendableError,
};

type HmacSha256 = Hmac<Sha256>;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// What a notification says about one finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub task_name: String,
    pub success: bool,
    pub start_time: String,
    pub end_time: String,
    pub duration: String,
    pub output: String,
    pub error: String,
}

impl RunSummary {
    pub fn new(task: &Task, entry: &LogEntry) -> Self {
        let millis = (entry.end_time - entry.start_time).num_milliseconds().max(0);
        Self {
            task_name: task.name.clone(),
            success: entry.success,
            start_time: entry.start_time.format(TIME_FORMAT).to_string(),
            end_time: entry.end_time.format(TIME_FORMAT).to_string(),
            duration: format!("{:.3}s", millis as f64 / 1000.0),
            output: entry.output.clone(),
            error: entry.error.clone(),
        }
    }

    fn status(&self) -> &'static str {
        if self.success {
            "succeeded"
        } else {
            "failed"
        }
    }

    fn title(&self) -> String {
        format!("Task {} {}", self.task_name, self.status())
    }

    fn markdown(&self) -> String {
        let mut text = format!(
            "## {}\n\n**Task:** {}\n\n**Status:** {}\n\n**Started:** {}\n\n**Finished:** {}\n\n**Duration:** {}",
            self.title(),
            self.task_name,
            self.status(),
            self.start_time,
            self.end_time,
            self.duration
        );
        if !self.output.is_empty() {
            text.push_str(&format!("\n\n**Output:**\n```\n{}\n```", self.output));
        }
        if !self.error.is_empty() {
            text.push_str(&format!("\n\n**Error:**\n```\n{}\n```", self.error));
        }
        text
    }

    fn plain_text(&self) -> String {
        let mut text = format!(
            "Task: {}\nStatus: {}\nStarted: {}\nFinished: {}\nDuration: {}\n",
            self.task_name,
            self.status(),
            self.start_time,
            self.end_time,
            self.duration
        );
        if !self.output.is_empty() {
            text.push_str(&format!("\nOutput:\n{}\n", self.output));
        }
        if !self.error.is_empty() {
            text.push_str(&format!("\nError:\n{}\n", self.error));
        }
        text
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
}

impl Notifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Sends the run's outcome to every channel the task asked for, if the
    /// task wants to hear about this outcome at all.
    pub async fn notify(&self, task: &Task, entry: &LogEntry) {
        let settings = &task.notifications;
        if !settings.should_notify(entry.success) {
            return;
        }

        let summary = RunSummary::new(task, entry);
        let config = &settings.notification_config;
        for kind in &settings.notification_types {
            let result = match kind {
                NotificationKind::DingTalk => match &config.dingtalk {
                    Some(dingtalk) => self.send_dingtalk(dingtalk, &summary, Utc::now()).await,
                    None => Err("no dingtalk configuration".into()),
                },
                NotificationKind::WeChat => match &config.wechat {
                    Some(wechat) => self.send_wechat(wechat, &summary).await,
                    None => Err("no wechat configuration".into()),
                },
                NotificationKind::Email => match &config.email {
                    Some(email) => send_email(email, &summary).await,
                    None => Err("no email configuration".into()),
                },
            };

            match result {
                Ok(()) => info!(
                    "Sent {} notification for task {} ({})",
                    kind.as_str(),
                    task.id,
                    task.name
                ),
                Err(err) => warn!(
                    "Failed to send {} notification for task {}: {}",
                    kind.as_str(),
                    task.id,
                    err
                ),
            }
        }
    }

    async fn send_dingtalk(
        &self,
        config: &DingTalkConfig,
        summary: &RunSummary,
        now: DateTime<Utc>,
    ) -> Result<(), SendableError> {
        let url = dingtalk_url(config, now)?;
        self.post_webhook(url, &dingtalk_payload(config, summary)).await
    }

    async fn send_wechat(&self, config: &WeChatConfig, summary: &RunSummary) -> Result<(), SendableError> {
        let url = Url::parse(&config.webhook_url)?;
        self.post_webhook(url, &wechat_payload(config, summary)).await
    }

    async fn post_webhook(&self, url: Url, payload: &Value) -> Result<(), SendableError> {
        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("webhook returned status {}", status.as_u16()).into());
        }

        // Both robots answer 200 and report rejections in the body.
        let body: Value = response.json().await.unwrap_or(Value::Null);
        match body.get("errcode").and_then(Value::as_i64) {
            Some(code) if code != 0 => {
                let message = body.get("errmsg").and_then(Value::as_str).unwrap_or_default();
                Err(format!("webhook rejected the message: {code} {message}").into())
            }
            _ => {
                debug!("Webhook accepted notification");
                Ok(())
            }
        }
    }
}

/// Webhook URL with `timestamp` and `sign` appended when a secret is set.
fn dingtalk_url(config: &DingTalkConfig, now: DateTime<Utc>) -> Result<Url, SendableError> {
    let mut url = Url::parse(&config.webhook_url)?;
    if !config.secret.is_empty() {
        let timestamp = now.timestamp_millis();
        let sign = dingtalk_sign(&config.secret, timestamp)?;
        url.query_pairs_mut()
            .append_pair("timestamp", &timestamp.to_string())
            .append_pair("sign", &sign);
    }
    Ok(url)
}

fn dingtalk_sign(secret: &str, timestamp: i64) -> Result<String, SendableError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| err.to_string())?;
    mac.update(format!("{timestamp}\n{secret}").as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn dingtalk_payload(config: &DingTalkConfig, summary: &RunSummary) -> Value {
    let mut payload = json!({
        "msgtype": "markdown",
        "markdown": {
            "title": summary.title(),
            "text": summary.markdown(),
        },
    });
    if config.at_all || !config.at_mobiles.is_empty() {
        payload["at"] = json!({
            "atMobiles": config.at_mobiles,
            "isAtAll": config.at_all,
        });
    }
    payload
}

fn wechat_payload(config: &WeChatConfig, summary: &RunSummary) -> Value {
    let color = if summary.success { "info" } else { "warning" };
    let mut content = format!(
        "<font color=\"{}\">{}</font>\n\n{}",
        color,
        summary.title(),
        summary.markdown()
    );

    let mentions = if config.at_all {
        vec!["@all".to_string()]
    } else {
        config.at_user_ids.iter().map(|id| format!("<@{id}>")).collect()
    };
    if !mentions.is_empty() {
        content.push_str("\n\n");
        content.push_str(&mentions.join(" "));
    }

    json!({
        "msgtype": "markdown",
        "markdown": { "content": content },
    })
}

async fn send_email(config: &EmailConfig, summary: &RunSummary) -> Result<(), SendableError> {
    let subject = if config.subject.is_empty() {
        summary.title()
    } else {
        config.subject.clone()
    };

    let mut builder = Message::builder()
        .from(config.from.parse::<Mailbox>()?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for recipient in &config.to {
        builder = builder.to(recipient.parse::<Mailbox>()?);
    }
    let email = builder.body(summary.plain_text())?;

    let mut transport = if config.enable_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
    }
    .port(config.smtp_port);
    if !config.username.is_empty() {
        transport = transport.credentials(Credentials::new(
            config.username.clone(),
            config.password.clone(),
        ));
    }

    transport.build().send(email).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use taskron_models::core::ActionKind;

    use super::*;

    fn summary(success: bool) -> RunSummary {
        RunSummary {
            task_name: "backup".into(),
            success,
            start_time: "2024-01-01 00:00:00 UTC".into(),
            end_time: "2024-01-01 00:00:02 UTC".into(),
            duration: "2.000s".into(),
            output: "done".into(),
            error: if success { String::new() } else { "exit status: 1".into() },
        }
    }

    fn dingtalk(secret: &str) -> DingTalkConfig {
        DingTalkConfig {
            webhook_url: "https://oapi.dingtalk.com/robot/send?access_token=abc".into(),
            secret: secret.into(),
            at_mobiles: Vec::new(),
            at_all: false,
        }
    }

    #[test]
    fn summary_formats_times_and_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap();
        let entry = LogEntry {
            id: 1,
            task_id: 1,
            task_name: "backup".into(),
            start_time: start,
            end_time: start + Duration::milliseconds(1500),
            success: true,
            output: "ok".into(),
            error: String::new(),
        };
        let task = Task {
            id: 1,
            name: "backup".into(),
            schedule: "* * * * *".into(),
            command: "true".into(),
            kind: ActionKind::Command,
            method: String::new(),
            headers: String::new(),
            description: String::new(),
            enabled: true,
            next_run: None,
            schedule_error: None,
            notifications: Default::default(),
            created_at: start,
            updated_at: start,
        };

        let summary = RunSummary::new(&task, &entry);
        assert_eq!(summary.start_time, "2024-01-01 08:30:00 UTC");
        assert_eq!(summary.duration, "1.500s");
        assert_eq!(summary.title(), "Task backup succeeded");
    }

    #[test]
    fn unsigned_dingtalk_url_is_unchanged() {
        let url = dingtalk_url(&dingtalk(""), Utc::now()).unwrap();
        assert_eq!(url.as_str(), "https://oapi.dingtalk.com/robot/send?access_token=abc");
    }

    #[test]
    fn signed_dingtalk_url_carries_timestamp_and_signature() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let url = dingtalk_url(&dingtalk("SECret"), now).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("access_token".into(), "abc".into()));
        assert_eq!(pairs[1], ("timestamp".into(), "1700000000000".into()));
        assert_eq!(pairs[2].0, "sign");
        assert_eq!(pairs[2].1, dingtalk_sign("SECret", 1_700_000_000_000).unwrap());
        // HMAC-SHA256 digests are 32 bytes, 44 characters in padded base64.
        assert_eq!(pairs[2].1.len(), 44);
        assert_ne!(
            dingtalk_sign("SECret", 1).unwrap(),
            dingtalk_sign("SECret", 2).unwrap()
        );
    }

    #[test]
    fn dingtalk_payload_mentions_only_when_asked() {
        let plain = dingtalk_payload(&dingtalk(""), &summary(false));
        assert_eq!(plain["msgtype"], "markdown");
        assert!(plain.get("at").is_none());
        assert!(plain["markdown"]["text"].as_str().unwrap().contains("exit status: 1"));

        let mut config = dingtalk("");
        config.at_mobiles = vec!["13800000000".into()];
        let mentioned = dingtalk_payload(&config, &summary(false));
        assert_eq!(mentioned["at"]["atMobiles"][0], "13800000000");
        assert_eq!(mentioned["at"]["isAtAll"], false);
    }

    #[test]
    fn wechat_payload_appends_mentions() {
        let config = WeChatConfig {
            webhook_url: "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=k".into(),
            at_user_ids: vec!["alice".into(), "bob".into()],
            at_all: false,
        };
        let payload = wechat_payload(&config, &summary(true));
        let content = payload["markdown"]["content"].as_str().unwrap();
        assert!(content.starts_with("<font color=\"info\">Task backup succeeded</font>"));
        assert!(content.ends_with("<@alice> <@bob>"));

        let everyone = WeChatConfig { at_all: true, ..config };
        let payload = wechat_payload(&everyone, &summary(false));
        let content = payload["markdown"]["content"].as_str().unwrap();
        assert!(content.contains("color=\"warning\""));
        assert!(content.ends_with("@all"));
    }
}
