use crate::journal::Journal;
use async_trait::async_trait;
use catalog_types::job::Job;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_postgres::Client;
use typesafe_repository::IdentityOf;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub retention_days: u32,
    pub logs_deleted: u64,
    pub raw_deleted: u64,
    pub jobs_deleted: u64,
}

/// Rows created before this instant are expired
pub fn retention_cutoff(now: OffsetDateTime, retention_days: u32) -> OffsetDateTime {
    now - time::Duration::days(retention_days.into())
}

#[async_trait]
pub trait Retention: Send + Sync {
    async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error>;
    async fn delete_raw_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error>;
    async fn delete_jobs_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error>;
}

pub struct Cleaner {
    store: Arc<dyn Retention>,
    journal: Journal,
    retention_days: u32,
}

impl Cleaner {
    pub fn new(store: Arc<dyn Retention>, journal: Journal, retention_days: u32) -> Self {
        Self {
            store,
            journal,
            retention_days,
        }
    }

    pub async fn cleanup(&self, job_id: IdentityOf<Job>) -> Result<CleanupSummary, anyhow::Error> {
        let cutoff = retention_cutoff(OffsetDateTime::now_utc(), self.retention_days);
        let summary = CleanupSummary {
            retention_days: self.retention_days,
            logs_deleted: self.store.delete_logs_before(cutoff).await?,
            raw_deleted: self.store.delete_raw_before(cutoff).await?,
            jobs_deleted: self.store.delete_jobs_before(cutoff).await?,
        };
        self.journal
            .info(job_id, "Cleanup summary", json!(summary))
            .await;
        Ok(summary)
    }
}

pub struct PostgresRetention {
    client: Arc<Client>,
}

impl PostgresRetention {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Retention for PostgresRetention {
    async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error> {
        Ok(self
            .client
            .execute("DELETE FROM logs WHERE created_at < $1", &[&cutoff])
            .await?)
    }

    async fn delete_raw_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error> {
        Ok(self
            .client
            .execute("DELETE FROM products_raw WHERE created_at < $1", &[&cutoff])
            .await?)
    }

    async fn delete_jobs_before(&self, cutoff: OffsetDateTime) -> Result<u64, anyhow::Error> {
        Ok(self
            .client
            .execute(
                "DELETE FROM jobs WHERE created_at < $1 AND status <> 'running'",
                &[&cutoff],
            )
            .await?)
    }
}
