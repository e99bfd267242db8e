use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;
use typesafe_repository::macros::Id;
use typesafe_repository::{Dao, GetIdentity, Identity, IdentityOf, RefIdentity, SelectBy, Selector};

pub mod repository;
pub mod service;

pub const DEFAULT_JOB_LIST_LIMIT: i64 = 50;
pub const DEFAULT_LOG_LIST_LIMIT: i64 = 200;
pub const DEFAULT_CANCEL_REASON: &str = "Canceled by user";
/// Name of the single lock row serializing blocking jobs
pub const GLOBAL_LOCK: &str = "global";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[display("import_all")]
    ImportAll,
    #[display("import_source")]
    ImportSource,
    #[display("import_supplier")]
    ImportSupplier,
    #[display("finalize")]
    Finalize,
    #[display("export")]
    Export,
    #[display("horoshop_sync")]
    HoroshopSync,
    #[display("horoshop_import")]
    HoroshopImport,
    #[display("update_pipeline")]
    UpdatePipeline,
    #[display("cleanup")]
    Cleanup,
}

impl JobType {
    /// Job types that may never run concurrently with each other
    pub const BLOCKING: [JobType; 8] = [
        JobType::ImportAll,
        JobType::ImportSource,
        JobType::ImportSupplier,
        JobType::Finalize,
        JobType::Export,
        JobType::HoroshopSync,
        JobType::HoroshopImport,
        JobType::UpdatePipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImportAll => "import_all",
            Self::ImportSource => "import_source",
            Self::ImportSupplier => "import_supplier",
            Self::Finalize => "finalize",
            Self::Export => "export",
            Self::HoroshopSync => "horoshop_sync",
            Self::HoroshopImport => "horoshop_import",
            Self::UpdatePipeline => "update_pipeline",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn is_blocking(&self) -> bool {
        Self::BLOCKING.contains(self)
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Cleanup]
            .into_iter()
            .chain(Self::BLOCKING)
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown job type {s}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("canceled")]
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => return Err(anyhow::anyhow!("Unknown job status {s}")),
        })
    }
}

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq)]
#[Id(get_id, ref_id)]
pub struct Job {
    #[id]
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub meta: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Job {
    /// Error message recorded on failure or cancellation
    pub fn error(&self) -> Option<&str> {
        self.meta.get("error").and_then(|e| e.as_str())
    }

    /// Failed by the stale job sweep
    pub fn is_timed_out(&self) -> bool {
        self.meta.get("timed_out").and_then(|t| t.as_bool()) == Some(true)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub meta: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            meta: serde_json::json!({}),
        }
    }

    pub fn with_meta(job_type: JobType, meta: serde_json::Value) -> Self {
        Self { job_type, meta }
    }
}

impl Dao for NewJob {
    type Parent = Job;
    type Args = (IdentityOf<Job>, OffsetDateTime);

    fn enrich(self, (id, created_at): Self::Args) -> Job {
        Job {
            id,
            job_type: self.job_type,
            status: JobStatus::Queued,
            meta: self.meta,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[display("debug")]
    Debug,
    #[display("info")]
    Info,
    #[display("warn")]
    Warn,
    #[display("error")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(anyhow::anyhow!("Unknown log level {s}")),
        })
    }
}

impl From<LogLevel> for log::Level {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq)]
#[Id(get_id, ref_id)]
pub struct LogEntry {
    #[id]
    pub id: i64,
    pub job_id: Option<IdentityOf<Job>>,
    pub level: LogLevel,
    pub message: String,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub job_id: Option<IdentityOf<Job>>,
    pub level: LogLevel,
    pub message: String,
    pub data: serde_json::Value,
}

impl Dao for NewLogEntry {
    type Parent = LogEntry;
    type Args = (IdentityOf<LogEntry>, OffsetDateTime);

    fn enrich(self, (id, created_at): Self::Args) -> LogEntry {
        LogEntry {
            id,
            job_id: self.job_id,
            level: self.level,
            message: self.message,
            data: self.data,
            created_at,
        }
    }
}

/// Newest log entries, optionally for one job or one level
#[derive(Deserialize, Debug, Clone)]
pub struct LogFilter {
    #[serde(default, rename = "jobId", alias = "job_id")]
    pub job_id: Option<IdentityOf<Job>>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default = "default_log_limit")]
    pub limit: i64,
}

fn default_log_limit() -> i64 {
    DEFAULT_LOG_LIST_LIMIT
}

impl Selector for LogFilter {}
impl SelectBy<LogFilter> for LogEntry {}

#[derive(Debug, Display, Error)]
pub enum JobError {
    #[display("Another job is running: #{job_id} ({job_type})")]
    Conflict {
        job_id: IdentityOf<Job>,
        job_type: JobType,
    },
    #[display("Another job is running")]
    LockBusy,
    #[display("job not found")]
    NotFound,
    #[display("job is not running")]
    NotCancelable,
    #[display("Job canceled")]
    Canceled,
    #[display("Job timed out")]
    TimedOut,
    #[error(ignore)]
    #[display("{_0}")]
    Internal(anyhow::Error),
}

impl JobError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::LockBusy)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<JobError>() {
            Ok(err) => err,
            Err(err) => Self::Internal(err),
        }
    }
}
