use crate::SqlWrapper;
use async_trait::async_trait;
use bytes::BytesMut;
use catalog_types::job::repository::{JobRepository, LogRepository};
use catalog_types::job::{
    Job, JobStatus, JobType, LogEntry, LogFilter, LogLevel, NewJob, NewLogEntry,
};
use futures::stream::StreamExt;
use std::error::Error;
use std::pin::pin;
use std::sync::Arc;
use tokio_postgres::row::Row;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::Client;
use typesafe_repository::async_ops::{Create, Get, Select};
use typesafe_repository::{IdentityOf, Repository};

macro_rules! text_to_sql {
    ($($t:ty),*) => {
        $(
            impl ToSql for SqlWrapper<$t> {
                fn to_sql(
                    &self,
                    ty: &Type,
                    out: &mut BytesMut,
                ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
                    self.0.as_str().to_sql(ty, out)
                }

                fn accepts(ty: &Type) -> bool {
                    String::accepts(ty)
                }

                fn to_sql_checked(
                    &self,
                    ty: &Type,
                    out: &mut BytesMut,
                ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
                    self.0.as_str().to_sql_checked(ty, out)
                }
            }
        )*
    };
}

text_to_sql!(JobType, JobStatus, LogLevel);

const JOB_COLUMNS: &str = "id, type, status, meta, created_at, started_at, finished_at";

pub struct PostgresJobRepository {
    client: Arc<Client>,
}

impl PostgresJobRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Repository<Job> for PostgresJobRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<Job> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(Job {
            id: r.try_get("id")?,
            job_type: r.try_get::<_, &str>("type")?.parse()?,
            status: r.try_get::<_, &str>("status")?.parse()?,
            meta: r
                .try_get::<_, Option<serde_json::Value>>("meta")?
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: r.try_get("created_at")?,
            started_at: r.try_get("started_at")?,
            finished_at: r.try_get("finished_at")?,
        }))
    }
}

#[async_trait]
impl Create<Job, NewJob> for PostgresJobRepository {
    async fn create(&self, job: NewJob) -> Result<IdentityOf<Job>, Self::Error> {
        let row = self
            .client
            .query_one(
                "INSERT INTO jobs (type, status, meta) VALUES ($1, $2, $3) RETURNING id",
                &[
                    &SqlWrapper(job.job_type),
                    &SqlWrapper(JobStatus::Queued),
                    &job.meta,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Get<Job> for PostgresJobRepository {
    async fn get_one(&self, id: &IdentityOf<Job>) -> Result<Option<Job>, Self::Error> {
        let mut res = pin!(
            self.client
                .query_raw(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"),
                    &[id]
                )
                .await?
        );
        res.next()
            .await
            .transpose()?
            .map(SqlWrapper::<Job>::from_sql)
            .transpose()
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn start(&self, id: &IdentityOf<Job>) -> Result<(), anyhow::Error> {
        self.client
            .execute(
                "UPDATE jobs SET status = 'running', started_at = NOW() WHERE id = $1",
                &[id],
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: &IdentityOf<Job>,
        meta: serde_json::Value,
    ) -> Result<bool, anyhow::Error> {
        let n = self
            .client
            .execute(
                "UPDATE jobs SET status = 'success', finished_at = NOW(), meta = COALESCE(meta, '{}'::jsonb) || $2
                WHERE id = $1 AND status = 'running'",
                &[id, &meta],
            )
            .await?;
        Ok(n > 0)
    }

    async fn fail(&self, id: &IdentityOf<Job>, error: &str) -> Result<bool, anyhow::Error> {
        let n = self
            .client
            .execute(
                "UPDATE jobs SET status = 'failed', finished_at = NOW(),
                meta = COALESCE(meta, '{}'::jsonb) || jsonb_build_object('error', $2::text)
                WHERE id = $1 AND status IN ('queued', 'running')",
                &[id, &error],
            )
            .await?;
        Ok(n > 0)
    }

    async fn cancel(&self, id: &IdentityOf<Job>, reason: &str) -> Result<bool, anyhow::Error> {
        let n = self
            .client
            .execute(
                "UPDATE jobs SET status = 'canceled', finished_at = NOW(),
                meta = COALESCE(meta, '{}'::jsonb) || jsonb_build_object('error', $2::text, 'canceled', true)
                WHERE id = $1 AND status IN ('queued', 'running')",
                &[id, &reason],
            )
            .await?;
        self.client
            .execute("DELETE FROM job_locks WHERE job_id = $1", &[id])
            .await?;
        Ok(n > 0)
    }

    async fn find_running(&self, types: &[JobType]) -> Result<Option<Job>, anyhow::Error> {
        let types = types.iter().map(|t| t.as_str()).collect::<Vec<_>>();
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' AND type = ANY($1)
                    ORDER BY id DESC LIMIT 1"
                ),
                &[&types],
            )
            .await?;
        res.into_iter().next().map(SqlWrapper::from_sql).transpose()
    }

    async fn acquire_lock(
        &self,
        name: &str,
        job_id: &IdentityOf<Job>,
    ) -> Result<bool, anyhow::Error> {
        let res = self
            .client
            .query(
                "INSERT INTO job_locks (name, job_id) VALUES ($1, $2)
                ON CONFLICT (name) DO NOTHING RETURNING name",
                &[&name, job_id],
            )
            .await?;
        Ok(!res.is_empty())
    }

    async fn release_lock(
        &self,
        name: &str,
        job_id: &IdentityOf<Job>,
    ) -> Result<(), anyhow::Error> {
        self.client
            .execute(
                "DELETE FROM job_locks WHERE name = $1 AND job_id = $2",
                &[&name, job_id],
            )
            .await?;
        Ok(())
    }

    async fn timeout_stale(&self, minutes: u64) -> Result<Vec<Job>, anyhow::Error> {
        let message = format!("Job timed out after {minutes} minutes");
        let res = self
            .client
            .query(
                &format!(
                    "UPDATE jobs SET status = 'failed', finished_at = NOW(),
                    meta = COALESCE(meta, '{{}}'::jsonb) || jsonb_build_object('error', $2::text, 'timed_out', true)
                    WHERE status = 'running' AND started_at < NOW() - make_interval(mins => $1)
                    RETURNING {JOB_COLUMNS}"
                ),
                &[&(minutes.min(i32::MAX as u64) as i32), &message],
            )
            .await?;
        let jobs = res
            .into_iter()
            .map(SqlWrapper::from_sql)
            .collect::<Result<Vec<Job>, _>>()?;
        if !jobs.is_empty() {
            let ids = jobs.iter().map(|j| j.id).collect::<Vec<_>>();
            self.client
                .execute("DELETE FROM job_locks WHERE job_id = ANY($1)", &[&ids])
                .await?;
        }
        Ok(jobs)
    }

    async fn latest_successful(&self, job_type: JobType) -> Result<Option<Job>, anyhow::Error> {
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE type = $1 AND status = 'success'
                    ORDER BY id DESC LIMIT 1"
                ),
                &[&SqlWrapper(job_type)],
            )
            .await?;
        res.into_iter().next().map(SqlWrapper::from_sql).transpose()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, anyhow::Error> {
        let res = self
            .client
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT $1"),
                &[&limit.max(0)],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }
}

pub struct PostgresLogRepository {
    client: Arc<Client>,
}

impl PostgresLogRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Repository<LogEntry> for PostgresLogRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<LogEntry> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(LogEntry {
            id: r.try_get("id")?,
            job_id: r.try_get("job_id")?,
            level: r.try_get::<_, &str>("level")?.parse()?,
            message: r.try_get("message")?,
            data: r
                .try_get::<_, Option<serde_json::Value>>("data")?
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: r.try_get("created_at")?,
        }))
    }
}

#[async_trait]
impl Create<LogEntry, NewLogEntry> for PostgresLogRepository {
    async fn create(&self, entry: NewLogEntry) -> Result<IdentityOf<LogEntry>, Self::Error> {
        let row = self
            .client
            .query_one(
                "INSERT INTO logs (job_id, level, message, data) VALUES ($1, $2, $3, $4) RETURNING id",
                &[
                    &entry.job_id,
                    &SqlWrapper(entry.level),
                    &entry.message,
                    &entry.data,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Select<LogEntry, LogFilter> for PostgresLogRepository {
    async fn select(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, Self::Error> {
        let res = self
            .client
            .query(
                "SELECT id, job_id, level, message, data, created_at FROM logs
                WHERE ($1::bigint IS NULL OR job_id = $1)
                AND ($2::text IS NULL OR level = $2)
                ORDER BY id DESC LIMIT $3",
                &[
                    &filter.job_id,
                    &filter.level.map(SqlWrapper),
                    &filter.limit.max(0),
                ],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }
}

impl LogRepository for PostgresLogRepository {}

#[cfg(test)]
pub mod testing {
    use async_trait::async_trait;
    use catalog_types::job::repository::JobRepository;
    use catalog_types::job::{Job, JobStatus, JobType, NewJob};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use time::OffsetDateTime;
    use typesafe_repository::async_ops::{Create, Get};
    use typesafe_repository::{Dao, IdentityOf, Repository};

    /// Job table and lock rows kept in memory, with the same status rules as Postgres
    #[derive(Default)]
    pub struct MemoryJobRepository {
        pub jobs: Mutex<Vec<Job>>,
        pub locks: Mutex<HashMap<String, IdentityOf<Job>>>,
    }

    impl MemoryJobRepository {
        pub fn job(&self, id: IdentityOf<Job>) -> Option<Job> {
            self.jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .find(|j| j.id == id)
                .cloned()
        }

        pub fn all(&self) -> Vec<Job> {
            self.jobs.lock().expect("jobs lock").clone()
        }

        pub fn lock_owner(&self, name: &str) -> Option<IdentityOf<Job>> {
            self.locks.lock().expect("locks lock").get(name).copied()
        }

        /// Inserts a job directly in the given state
        pub fn insert(&self, job_type: JobType, status: JobStatus) -> IdentityOf<Job> {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let id = jobs.len() as i64 + 1;
            let mut job = NewJob::new(job_type).enrich((id, OffsetDateTime::now_utc()));
            job.status = status;
            if status == JobStatus::Running {
                job.started_at = Some(OffsetDateTime::now_utc());
            }
            jobs.push(job);
            id
        }

        fn update<F: FnOnce(&mut Job) -> bool>(&self, id: &IdentityOf<Job>, f: F) -> bool {
            self.jobs
                .lock()
                .expect("jobs lock")
                .iter_mut()
                .find(|j| j.id == *id)
                .map(f)
                .unwrap_or(false)
        }
    }

    fn merge(job: &mut Job, meta: serde_json::Value) {
        if let (Some(target), serde_json::Value::Object(source)) = (job.meta.as_object_mut(), meta) {
            target.extend(source);
        }
    }

    impl Repository<Job> for MemoryJobRepository {
        type Error = anyhow::Error;
    }

    #[async_trait]
    impl Create<Job, NewJob> for MemoryJobRepository {
        async fn create(&self, job: NewJob) -> Result<IdentityOf<Job>, Self::Error> {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let id = jobs.len() as i64 + 1;
            jobs.push(job.enrich((id, OffsetDateTime::now_utc())));
            Ok(id)
        }
    }

    #[async_trait]
    impl Get<Job> for MemoryJobRepository {
        async fn get_one(&self, id: &IdentityOf<Job>) -> Result<Option<Job>, Self::Error> {
            Ok(self.job(*id))
        }
    }

    #[async_trait]
    impl JobRepository for MemoryJobRepository {
        async fn start(&self, id: &IdentityOf<Job>) -> Result<(), anyhow::Error> {
            self.update(id, |j| {
                j.status = JobStatus::Running;
                j.started_at = Some(OffsetDateTime::now_utc());
                true
            });
            Ok(())
        }

        async fn finish(
            &self,
            id: &IdentityOf<Job>,
            meta: serde_json::Value,
        ) -> Result<bool, anyhow::Error> {
            Ok(self.update(id, |j| {
                if j.status != JobStatus::Running {
                    return false;
                }
                j.status = JobStatus::Success;
                j.finished_at = Some(OffsetDateTime::now_utc());
                merge(j, meta);
                true
            }))
        }

        async fn fail(&self, id: &IdentityOf<Job>, error: &str) -> Result<bool, anyhow::Error> {
            Ok(self.update(id, |j| {
                if !j.status.is_cancelable() {
                    return false;
                }
                j.status = JobStatus::Failed;
                j.finished_at = Some(OffsetDateTime::now_utc());
                merge(j, serde_json::json!({"error": error}));
                true
            }))
        }

        async fn cancel(&self, id: &IdentityOf<Job>, reason: &str) -> Result<bool, anyhow::Error> {
            let canceled = self.update(id, |j| {
                if !j.status.is_cancelable() {
                    return false;
                }
                j.status = JobStatus::Canceled;
                j.finished_at = Some(OffsetDateTime::now_utc());
                merge(j, serde_json::json!({"error": reason, "canceled": true}));
                true
            });
            self.locks
                .lock()
                .expect("locks lock")
                .retain(|_, owner| owner != id);
            Ok(canceled)
        }

        async fn find_running(&self, types: &[JobType]) -> Result<Option<Job>, anyhow::Error> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .rev()
                .find(|j| j.status == JobStatus::Running && types.contains(&j.job_type))
                .cloned())
        }

        async fn acquire_lock(
            &self,
            name: &str,
            job_id: &IdentityOf<Job>,
        ) -> Result<bool, anyhow::Error> {
            let mut locks = self.locks.lock().expect("locks lock");
            if locks.contains_key(name) {
                return Ok(false);
            }
            locks.insert(name.to_string(), *job_id);
            Ok(true)
        }

        async fn release_lock(
            &self,
            name: &str,
            job_id: &IdentityOf<Job>,
        ) -> Result<(), anyhow::Error> {
            let mut locks = self.locks.lock().expect("locks lock");
            if locks.get(name) == Some(job_id) {
                locks.remove(name);
            }
            Ok(())
        }

        async fn timeout_stale(&self, minutes: u64) -> Result<Vec<Job>, anyhow::Error> {
            let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(minutes as i64);
            let mut timed_out = Vec::new();
            for j in self.jobs.lock().expect("jobs lock").iter_mut() {
                if j.status == JobStatus::Running && j.started_at.map_or(false, |s| s < cutoff) {
                    j.status = JobStatus::Failed;
                    j.finished_at = Some(OffsetDateTime::now_utc());
                    merge(
                        j,
                        serde_json::json!({
                            "error": format!("Job timed out after {minutes} minutes"),
                            "timed_out": true,
                        }),
                    );
                    timed_out.push(j.clone());
                }
            }
            self.locks
                .lock()
                .expect("locks lock")
                .retain(|_, owner| !timed_out.iter().any(|j| j.id == *owner));
            Ok(timed_out)
        }

        async fn latest_successful(&self, job_type: JobType) -> Result<Option<Job>, anyhow::Error> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .rev()
                .find(|j| j.job_type == job_type && j.status == JobStatus::Success)
                .cloned())
        }

        async fn list_recent(&self, limit: i64) -> Result<Vec<Job>, anyhow::Error> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .rev()
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryJobRepository;
    use actix::prelude::*;
    use actix_broker::BrokerSubscribe;
    use catalog_types::job::repository::JobRepository;
    use catalog_types::job::service::{JobService, JobTimedOut, List, SweepTimeouts};
    use catalog_types::job::{Job, JobStatus, JobType, GLOBAL_LOCK};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use time::OffsetDateTime;

    #[derive(Default)]
    struct TimeoutRecorder {
        seen: Arc<Mutex<Vec<(Job, u64)>>>,
    }

    impl Actor for TimeoutRecorder {
        type Context = Context<Self>;

        fn started(&mut self, ctx: &mut Self::Context) {
            self.subscribe_system_async::<JobTimedOut>(ctx);
        }
    }

    impl Handler<JobTimedOut> for TimeoutRecorder {
        type Result = ();

        fn handle(&mut self, msg: JobTimedOut, _: &mut Self::Context) {
            self.seen
                .lock()
                .expect("lock")
                .push((msg.job, msg.timeout_minutes));
        }
    }

    #[derive(Message)]
    #[rtype(result = "()")]
    struct Ping;

    impl Handler<Ping> for TimeoutRecorder {
        type Result = ();

        fn handle(&mut self, _: Ping, _: &mut Self::Context) {}
    }

    async fn recorder() -> Arc<Mutex<Vec<(Job, u64)>>> {
        let rec = TimeoutRecorder::default();
        let seen = rec.seen.clone();
        // started() has subscribed once a message is handled
        rec.start().send(Ping).await.expect("recorder");
        seen
    }

    async fn wait_for(seen: &Mutex<Vec<(Job, u64)>>, n: usize) -> Vec<(Job, u64)> {
        for _ in 0..100 {
            if seen.lock().expect("lock").len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen.lock().expect("lock").clone()
    }

    fn started_ago(jobs: &MemoryJobRepository, id: i64, minutes: i64) {
        let mut all = jobs.jobs.lock().expect("jobs lock");
        if let Some(j) = all.iter_mut().find(|j| j.id == id) {
            j.started_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(minutes));
        }
    }

    #[actix_web::test]
    async fn sweep_fails_stale_jobs_and_releases_lock() {
        let jobs = Arc::new(MemoryJobRepository::default());
        let stale = jobs.insert(JobType::ImportAll, JobStatus::Running);
        let fresh = jobs.insert(JobType::Cleanup, JobStatus::Running);
        started_ago(&jobs, stale, 45);
        assert!(jobs.acquire_lock(GLOBAL_LOCK, &stale).await.expect("lock"));
        let seen = recorder().await;
        let service = JobService::new(jobs.clone(), 30).start();

        let swept = service.send(SweepTimeouts).await.expect("sweep");
        assert_eq!(vec![stale], swept.iter().map(|j| j.id).collect::<Vec<_>>());

        let job = jobs.job(stale).expect("job");
        assert_eq!(JobStatus::Failed, job.status);
        assert!(job.is_timed_out());
        assert_eq!(Some("Job timed out after 30 minutes"), job.error());
        assert!(job.finished_at.is_some());
        assert_eq!(JobStatus::Running, jobs.job(fresh).expect("job").status);
        assert_eq!(None, jobs.lock_owner(GLOBAL_LOCK));

        let events = wait_for(&seen, 1).await;
        assert_eq!(1, events.len());
        assert_eq!(stale, events[0].0.id);
        assert_eq!(30, events[0].1);
    }

    #[actix_web::test]
    async fn list_sweeps_before_listing() {
        let jobs = Arc::new(MemoryJobRepository::default());
        let id = jobs.insert(JobType::Export, JobStatus::Running);
        started_ago(&jobs, id, 61);
        let service = JobService::new(jobs.clone(), 60).start();

        let listed = service.send(List(50)).await.expect("mailbox").expect("list");
        assert_eq!(1, listed.len());
        assert_eq!(JobStatus::Failed, listed[0].status);
        assert!(listed[0].is_timed_out());
    }

    #[actix_web::test]
    async fn zero_timeout_disables_sweep() {
        let jobs = Arc::new(MemoryJobRepository::default());
        let id = jobs.insert(JobType::Finalize, JobStatus::Running);
        started_ago(&jobs, id, 24 * 60);
        let service = JobService::new(jobs.clone(), 0).start();

        assert!(service.send(SweepTimeouts).await.expect("sweep").is_empty());
        assert_eq!(JobStatus::Running, jobs.job(id).expect("job").status);
    }
}
