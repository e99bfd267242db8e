use crate::telegram::Notifier;
use catalog_types::job::repository::LogRepository;
use catalog_types::job::{Job, LogLevel, NewLogEntry};
use log_error::LogError;
use std::sync::Arc;
use typesafe_repository::IdentityOf;

/// Append-only operator log keyed by job, mirrored to the `log` facade.
/// Error entries are also sent to the notifier.
#[derive(Clone)]
pub struct Journal {
    repo: Arc<dyn LogRepository>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Journal {
    pub fn new(repo: Arc<dyn LogRepository>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { repo, notifier }
    }

    /// Never fails; a storage error is only logged
    pub async fn log(
        &self,
        job_id: Option<IdentityOf<Job>>,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) {
        match job_id {
            Some(id) => log::log!(level.into(), "[job #{id}] {message} {data}"),
            None => log::log!(level.into(), "{message} {data}"),
        }
        if level == LogLevel::Error {
            if let Some(notifier) = self.notifier.clone() {
                let message = message.to_string();
                let data = data.clone();
                tokio::spawn(async move {
                    notifier.notify(level, &message, job_id, &data).await;
                });
            }
        }
        self.repo
            .create(NewLogEntry {
                job_id,
                level,
                message: message.to_string(),
                data,
            })
            .await
            .log_error("Unable to write journal entry");
    }

    pub async fn info<J: Into<Option<IdentityOf<Job>>>>(
        &self,
        job_id: J,
        message: &str,
        data: serde_json::Value,
    ) {
        self.log(job_id.into(), LogLevel::Info, message, data).await
    }

    pub async fn warn<J: Into<Option<IdentityOf<Job>>>>(
        &self,
        job_id: J,
        message: &str,
        data: serde_json::Value,
    ) {
        self.log(job_id.into(), LogLevel::Warn, message, data).await
    }

    pub async fn error<J: Into<Option<IdentityOf<Job>>>>(
        &self,
        job_id: J,
        message: &str,
        data: serde_json::Value,
    ) {
        self.log(job_id.into(), LogLevel::Error, message, data).await
    }
}
