use crate::cleanup::Cleaner;
use crate::export::Exporter;
use crate::finalize::Finalizer;
use crate::horoshop_sync::HoroshopSync;
use crate::import::{ImportError, Importer};
use crate::journal::Journal;
use actix::prelude::*;
use actix_broker::BrokerSubscribe;
use async_trait::async_trait;
use catalog_types::job::repository::JobRepository;
use catalog_types::job::service::{JobCanceled, JobTimedOut};
use catalog_types::job::{Job, JobError, JobType, NewJob, GLOBAL_LOCK};
use catalog_types::supplier::{Source, Supplier, DEFAULT_SUPPLIER_FILTER};
use log_error::LogError;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use typesafe_repository::IdentityOf;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: IdentityOf<Job>,
    pub result: Value,
}

/// The work each job type performs once it holds the lock
#[async_trait]
pub trait Stages: Send + Sync {
    async fn import_source(
        &self,
        job_id: IdentityOf<Job>,
        source_id: IdentityOf<Source>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error>;
    async fn import_sources(
        &self,
        job_id: IdentityOf<Job>,
        supplier_id: Option<IdentityOf<Supplier>>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error>;
    async fn finalize(&self, job_id: IdentityOf<Job>) -> Result<Value, anyhow::Error>;
    async fn export(&self, job_id: IdentityOf<Job>, supplier: &str) -> Result<Value, anyhow::Error>;
    async fn pull(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error>;
    async fn push(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error>;
    async fn cleanup(&self, job_id: IdentityOf<Job>) -> Result<Value, anyhow::Error>;
}

pub struct Services {
    pub importer: Importer,
    pub finalizer: Finalizer,
    pub exporter: Exporter,
    pub sync: HoroshopSync,
    pub cleaner: Cleaner,
}

fn import_error(err: ImportError) -> anyhow::Error {
    match err {
        ImportError::Canceled => JobError::Canceled.into(),
        ImportError::Storage(err) => err,
        err => err.into(),
    }
}

#[async_trait]
impl Stages for Services {
    async fn import_source(
        &self,
        job_id: IdentityOf<Job>,
        source_id: IdentityOf<Source>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error> {
        let (source, supplier) = self
            .importer
            .active_source(source_id)
            .await
            .map_err(import_error)?;
        let outcome = self
            .importer
            .import_source(job_id, &source, Some(&supplier.name), cancel)
            .await
            .map_err(import_error)?;
        Ok(json!(outcome))
    }

    async fn import_sources(
        &self,
        job_id: IdentityOf<Job>,
        supplier_id: Option<IdentityOf<Supplier>>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error> {
        let summary = self
            .importer
            .import_sources(job_id, supplier_id, cancel)
            .await
            .map_err(import_error)?;
        Ok(json!(summary))
    }

    async fn finalize(&self, job_id: IdentityOf<Job>) -> Result<Value, anyhow::Error> {
        Ok(json!(self.finalizer.finalize(job_id).await?))
    }

    async fn export(&self, job_id: IdentityOf<Job>, supplier: &str) -> Result<Value, anyhow::Error> {
        Ok(json!(self.exporter.export(job_id, Some(supplier)).await?))
    }

    async fn pull(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error> {
        Ok(json!(self.sync.pull(job_id, cancel).await?))
    }

    async fn push(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<Value, anyhow::Error> {
        Ok(json!(self.sync.push(job_id, cancel).await?))
    }

    async fn cleanup(&self, job_id: IdentityOf<Job>) -> Result<Value, anyhow::Error> {
        Ok(json!(self.cleaner.cleanup(job_id).await?))
    }
}

/// Cancellation tokens of the jobs running in this process
#[derive(Clone, Default)]
pub struct CancelRegistry(Arc<Mutex<HashMap<IdentityOf<Job>, CancellationToken>>>);

impl CancelRegistry {
    fn register(&self, job_id: IdentityOf<Job>, token: CancellationToken) -> Registration {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, token);
        Registration {
            registry: self.clone(),
            job_id,
        }
    }

    /// Returns false when the job is not running here
    pub fn cancel(&self, job_id: IdentityOf<Job>) -> bool {
        let token = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, job_id: IdentityOf<Job>) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&job_id)
    }
}

struct Registration {
    registry: CancelRegistry,
    job_id: IdentityOf<Job>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

fn title(job_type: JobType) -> &'static str {
    match job_type {
        JobType::ImportAll => "Import all sources",
        JobType::ImportSource => "Import source",
        JobType::ImportSupplier => "Import supplier",
        JobType::Finalize => "Finalize",
        JobType::Export => "Export",
        JobType::HoroshopSync => "Horoshop sync",
        JobType::HoroshopImport => "Horoshop import",
        JobType::UpdatePipeline => "Update pipeline",
        JobType::Cleanup => "Cleanup",
    }
}

/// Stages that journal their own failure entry
fn reports_own_failure(job_type: JobType) -> bool {
    matches!(
        job_type,
        JobType::Finalize | JobType::HoroshopSync | JobType::HoroshopImport
    )
}

fn blank_as_default(supplier: Option<&str>) -> String {
    supplier
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUPPLIER_FILTER)
        .to_string()
}

/// Runs every job: conflict pre-check, global lock, status transitions,
/// cancellation token and journal entries around the stage work
#[derive(Clone)]
pub struct Runner {
    jobs: Arc<dyn JobRepository>,
    journal: Journal,
    stages: Arc<dyn Stages>,
    tokens: CancelRegistry,
    sync_mirror: bool,
}

impl Runner {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        journal: Journal,
        stages: Arc<dyn Stages>,
        tokens: CancelRegistry,
        sync_mirror: bool,
    ) -> Self {
        Self {
            jobs,
            journal,
            stages,
            tokens,
            sync_mirror,
        }
    }

    pub async fn run<F, Fut>(&self, job: NewJob, work: F) -> Result<JobOutcome, JobError>
    where
        F: FnOnce(IdentityOf<Job>, CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send,
    {
        let job_type = job.job_type;
        let blocking = job_type.is_blocking();
        if blocking {
            if let Some(running) = self.jobs.find_running(&JobType::BLOCKING).await? {
                return Err(JobError::Conflict {
                    job_id: running.id,
                    job_type: running.job_type,
                });
            }
        }
        let job_id = self.jobs.create(job).await?;
        if blocking {
            let acquired = self
                .jobs
                .acquire_lock(GLOBAL_LOCK, &job_id)
                .await
                .log_error("Unable to acquire job lock")
                .unwrap_or(false);
            if !acquired {
                let err = JobError::LockBusy;
                self.jobs
                    .fail(&job_id, &err.to_string())
                    .await
                    .log_error("Unable to fail job");
                return Err(err);
            }
        }
        let res = self
            .execute(job_id, job_type, CancellationToken::new(), work)
            .await;
        if blocking {
            self.jobs
                .release_lock(GLOBAL_LOCK, &job_id)
                .await
                .log_error("Unable to release job lock");
        }
        res.map(|result| JobOutcome { job_id, result })
    }

    async fn execute<F, Fut>(
        &self,
        job_id: IdentityOf<Job>,
        job_type: JobType,
        token: CancellationToken,
        work: F,
    ) -> Result<Value, JobError>
    where
        F: FnOnce(IdentityOf<Job>, CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send,
    {
        let title = title(job_type);
        self.jobs.start(&job_id).await?;
        let _registration = self.tokens.register(job_id, token.clone());
        self.journal
            .info(job_id, &format!("{title} started"), json!({}))
            .await;
        match work(job_id, token).await {
            Ok(result) => {
                if !self.jobs.finish(&job_id, json!({"result": result})).await? {
                    return Err(self.stopped(job_id, title).await);
                }
                self.journal
                    .info(job_id, &format!("{title} finished"), result.clone())
                    .await;
                Ok(result)
            }
            Err(err) => {
                let err = JobError::from(err);
                let failed = self
                    .jobs
                    .fail(&job_id, &err.to_string())
                    .await
                    .log_error("Unable to fail job")
                    .unwrap_or(true);
                if !failed {
                    return Err(self.stopped(job_id, title).await);
                }
                if !matches!(err, JobError::Canceled) && !reports_own_failure(job_type) {
                    self.journal
                        .error(
                            job_id,
                            &format!("{title} failed"),
                            json!({"error": err.to_string()}),
                        )
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Work ended after the job was canceled or timed out elsewhere
    async fn stopped(&self, job_id: IdentityOf<Job>, title: &str) -> JobError {
        let timed_out = self
            .jobs
            .get_one(&job_id)
            .await
            .log_error("Unable to get job")
            .flatten()
            .is_some_and(|j| j.is_timed_out());
        if timed_out {
            self.journal
                .warn(job_id, &format!("{title} finished after timeout"), json!({}))
                .await;
            JobError::TimedOut
        } else {
            self.journal
                .warn(job_id, &format!("{title} finished after cancel"), json!({}))
                .await;
            JobError::Canceled
        }
    }

    /// Child job of an update pipeline; the umbrella job holds the lock
    async fn step<F, Fut>(
        &self,
        pipeline_job_id: IdentityOf<Job>,
        job: NewJob,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<(IdentityOf<Job>, Value), JobError>
    where
        F: FnOnce(IdentityOf<Job>, CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        let job_type = job.job_type;
        let mut meta = job.meta;
        if let Some(m) = meta.as_object_mut() {
            m.insert("pipeline_job_id".to_string(), json!(pipeline_job_id));
        }
        let job_id = self.jobs.create(NewJob::with_meta(job_type, meta)).await?;
        let result = self
            .execute(job_id, job_type, cancel.child_token(), work)
            .await?;
        Ok((job_id, result))
    }

    pub async fn import_source(
        &self,
        source_id: IdentityOf<Source>,
    ) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(
            NewJob::with_meta(JobType::ImportSource, json!({"sourceId": source_id})),
            |job_id, cancel| async move { stages.import_source(job_id, source_id, &cancel).await },
        )
        .await
    }

    pub async fn import_supplier(
        &self,
        supplier_id: IdentityOf<Supplier>,
    ) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(
            NewJob::with_meta(JobType::ImportSupplier, json!({"supplierId": supplier_id})),
            |job_id, cancel| async move {
                stages
                    .import_sources(job_id, Some(supplier_id), &cancel)
                    .await
            },
        )
        .await
    }

    pub async fn import_all(&self) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(NewJob::new(JobType::ImportAll), |job_id, cancel| async move {
            stages.import_sources(job_id, None, &cancel).await
        })
        .await
    }

    pub async fn finalize(&self) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(NewJob::new(JobType::Finalize), |job_id, _| async move {
            stages.finalize(job_id).await
        })
        .await
    }

    pub async fn export(&self, supplier: Option<&str>) -> Result<JobOutcome, JobError> {
        let supplier = blank_as_default(supplier);
        let stages = self.stages.clone();
        self.run(
            NewJob::with_meta(JobType::Export, json!({"supplier": supplier})),
            |job_id, _| async move { stages.export(job_id, &supplier).await },
        )
        .await
    }

    pub async fn horoshop_sync(&self) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(NewJob::new(JobType::HoroshopSync), |job_id, cancel| async move {
            stages.pull(job_id, &cancel).await
        })
        .await
    }

    pub async fn horoshop_import(&self) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(NewJob::new(JobType::HoroshopImport), |job_id, cancel| async move {
            stages.push(job_id, &cancel).await
        })
        .await
    }

    pub async fn cleanup(&self) -> Result<JobOutcome, JobError> {
        let stages = self.stages.clone();
        self.run(NewJob::new(JobType::Cleanup), |job_id, _| async move {
            stages.cleanup(job_id).await
        })
        .await
    }

    /// import_all, finalize, export and horoshop_import as child jobs of one
    /// umbrella job. The first failing step aborts the rest.
    pub async fn update_pipeline(&self, supplier: Option<&str>) -> Result<JobOutcome, JobError> {
        let supplier = blank_as_default(supplier);
        let meta = json!({"supplier": supplier});
        self.run(
            NewJob::with_meta(JobType::UpdatePipeline, meta),
            |job_id, cancel| async move {
                self.pipeline_steps(job_id, &supplier, &cancel)
                    .await
                    .map_err(anyhow::Error::from)
            },
        )
        .await
    }

    async fn pipeline_steps(
        &self,
        job_id: IdentityOf<Job>,
        supplier: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, JobError> {
        let stages = &self.stages;
        let mut result = serde_json::Map::new();
        if self.sync_mirror {
            let (sync_job_id, sync) = self
                .step(job_id, NewJob::new(JobType::HoroshopSync), cancel, |id, c| async move {
                    stages.pull(id, &c).await
                })
                .await?;
            self.journal
                .info(
                    job_id,
                    "Update pipeline horoshop sync finished",
                    json!({"jobId": sync_job_id, "result": sync}),
                )
                .await;
            result.insert("horoshopSyncJobId".to_string(), json!(sync_job_id));
            result.insert("horoshopSync".to_string(), sync);
        }

        let (import_job_id, import) = self
            .step(job_id, NewJob::new(JobType::ImportAll), cancel, |id, c| async move {
                stages.import_sources(id, None, &c).await
            })
            .await?;
        self.journal
            .info(
                job_id,
                "Update pipeline import finished",
                json!({"jobId": import_job_id, "summary": import}),
            )
            .await;

        let (finalize_job_id, finalize) = self
            .step(job_id, NewJob::new(JobType::Finalize), cancel, |id, _| async move {
                stages.finalize(id).await
            })
            .await?;
        self.journal
            .info(
                job_id,
                "Update pipeline finalize finished",
                json!({"jobId": finalize_job_id, "result": finalize}),
            )
            .await;

        let (export_job_id, export) = self
            .step(
                job_id,
                NewJob::with_meta(JobType::Export, json!({"supplier": supplier})),
                cancel,
                |id, _| async move { stages.export(id, supplier).await },
            )
            .await?;
        self.journal
            .info(
                job_id,
                "Update pipeline export finished",
                json!({"jobId": export_job_id, "result": export}),
            )
            .await;

        let (push_job_id, push) = self
            .step(job_id, NewJob::new(JobType::HoroshopImport), cancel, |id, c| async move {
                stages.push(id, &c).await
            })
            .await?;

        result.insert("importJobId".to_string(), json!(import_job_id));
        result.insert("finalizeJobId".to_string(), json!(finalize_job_id));
        result.insert("exportJobId".to_string(), json!(export_job_id));
        result.insert("horoshopImportJobId".to_string(), json!(push_job_id));
        result.insert("importSummary".to_string(), import);
        result.insert("finalize".to_string(), finalize);
        result.insert("export".to_string(), export);
        result.insert("horoshopImport".to_string(), push);
        Ok(Value::Object(result))
    }
}

/// Stops the in-process work of canceled and timed out jobs
pub struct CancelListener {
    tokens: CancelRegistry,
    journal: Journal,
}

impl CancelListener {
    pub fn new(tokens: CancelRegistry, journal: Journal) -> Self {
        Self { tokens, journal }
    }
}

impl Actor for CancelListener {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.subscribe_system_async::<JobCanceled>(ctx);
        self.subscribe_system_async::<JobTimedOut>(ctx);
    }
}

impl Handler<JobCanceled> for CancelListener {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(
        &mut self,
        JobCanceled { job, reason }: JobCanceled,
        _: &mut Self::Context,
    ) -> Self::Result {
        let stopped = self.tokens.cancel(job.id);
        let journal = self.journal.clone();
        Box::pin(
            async move {
                journal
                    .error(
                        job.id,
                        "Job canceled",
                        json!({"reason": reason, "type": job.job_type, "stopped": stopped}),
                    )
                    .await;
            }
            .into_actor(self),
        )
    }
}

impl Handler<JobTimedOut> for CancelListener {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(
        &mut self,
        JobTimedOut {
            job,
            timeout_minutes,
        }: JobTimedOut,
        _: &mut Self::Context,
    ) -> Self::Result {
        let stopped = self.tokens.cancel(job.id);
        let journal = self.journal.clone();
        Box::pin(
            async move {
                journal
                    .error(
                        job.id,
                        "Job timed out",
                        json!({
                            "timeout_minutes": timeout_minutes,
                            "type": job.job_type,
                            "stopped": stopped,
                        }),
                    )
                    .await;
            }
            .into_actor(self),
        )
    }
}
