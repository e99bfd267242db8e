use crate::job::{Job, JobType, LogEntry, LogFilter, NewJob, NewLogEntry};
use async_trait::async_trait;
use typesafe_repository::async_ops::{Create, Get, Select};
use typesafe_repository::{IdentityOf, Repository};

#[async_trait]
pub trait JobRepository:
    Repository<Job, Error = anyhow::Error> + Create<Job, NewJob> + Get<Job> + Send + Sync
{
    /// Moves the job to `running` and stamps `started_at`
    async fn start(&self, id: &IdentityOf<Job>) -> Result<(), anyhow::Error>;
    /// Marks a running job `success`, merging `meta` into the stored one.
    /// Returns false when the job was no longer running.
    async fn finish(
        &self,
        id: &IdentityOf<Job>,
        meta: serde_json::Value,
    ) -> Result<bool, anyhow::Error>;
    /// Marks a queued or running job `failed` with `meta.error`.
    /// Returns false when it was already canceled or timed out.
    async fn fail(&self, id: &IdentityOf<Job>, error: &str) -> Result<bool, anyhow::Error>;
    /// Marks a queued or running job `canceled` and drops its locks
    async fn cancel(&self, id: &IdentityOf<Job>, reason: &str) -> Result<bool, anyhow::Error>;
    async fn find_running(&self, types: &[JobType]) -> Result<Option<Job>, anyhow::Error>;
    /// Insert-if-absent on the named lock row
    async fn acquire_lock(&self, name: &str, job_id: &IdentityOf<Job>)
        -> Result<bool, anyhow::Error>;
    async fn release_lock(&self, name: &str, job_id: &IdentityOf<Job>)
        -> Result<(), anyhow::Error>;
    /// Fails running jobs started more than `minutes` ago, returns them
    async fn timeout_stale(&self, minutes: u64) -> Result<Vec<Job>, anyhow::Error>;
    async fn latest_successful(&self, job_type: JobType) -> Result<Option<Job>, anyhow::Error>;
    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, anyhow::Error>;
}

pub trait LogRepository:
    Repository<LogEntry, Error = anyhow::Error>
    + Create<LogEntry, NewLogEntry>
    + Select<LogEntry, LogFilter>
    + Send
    + Sync
{
}
