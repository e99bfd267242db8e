use crate::config::TelegramConfig;
use async_trait::async_trait;
use catalog_types::job::{Job, LogLevel};
use log_error::LogError;
use serde::Serialize;
use typesafe_repository::IdentityOf;

const MAX_MESSAGE_CHARS: usize = 3800;

/// Fire-and-forget alert sink. Failures never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        level: LogLevel,
        message: &str,
        job_id: Option<IdentityOf<Job>>,
        data: &serde_json::Value,
    );
}

pub fn format_message(
    app_name: Option<&str>,
    level: LogLevel,
    message: &str,
    job_id: Option<IdentityOf<Job>>,
    data: &serde_json::Value,
) -> String {
    let mut lines = vec![match app_name {
        Some(app) => format!("{app}: {message}"),
        None => message.to_string(),
    }];
    if let Some(id) = job_id {
        lines.push(format!("Job: #{id}"));
    }
    lines.push(format!("Level: {level}"));
    let empty = match data {
        serde_json::Value::Null => true,
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    };
    if !empty {
        lines.push(format!("Data: {data}"));
    }
    let text = lines.join("\n");
    if text.chars().count() > MAX_MESSAGE_CHARS {
        let mut truncated = text.chars().take(MAX_MESSAGE_CHARS).collect::<String>();
        truncated.push('…');
        truncated
    } else {
        text
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    app_name: Option<String>,
}

impl TelegramNotifier {
    /// `None` unless both bot token and chat id are configured
    pub fn from_config(client: reqwest::Client, config: &TelegramConfig) -> Option<Self> {
        Some(Self {
            client,
            bot_token: config.bot_token.clone()?,
            chat_id: config.chat_id.clone()?,
            app_name: config.app_name.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        level: LogLevel,
        message: &str,
        job_id: Option<IdentityOf<Job>>,
        data: &serde_json::Value,
    ) {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_message(self.app_name.as_deref(), level, message, job_id, data),
            disable_web_page_preview: true,
        };
        let res = self
            .client
            .post(format!(
                "https://api.telegram.org/bot{}/sendMessage",
                self.bot_token
            ))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        res.log_warn("Unable to send Telegram notification");
    }
}
