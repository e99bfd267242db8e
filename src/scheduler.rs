use crate::config::SchedulerConfig;
use crate::runner::{JobOutcome, Runner};
use actix::Addr;
use catalog_types::job::service::{JobService, SweepTimeouts};
use log_error::LogError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledTask {
    UpdatePipeline { supplier: String },
    Cleanup,
    HoroshopSync,
}

impl ScheduledTask {
    fn name(&self) -> &'static str {
        match self {
            Self::UpdatePipeline { .. } => "update_pipeline",
            Self::Cleanup => "cleanup",
            Self::HoroshopSync => "horoshop_sync",
        }
    }
}

/// Daily tasks with their UTC start time
pub fn daily_tasks(config: &SchedulerConfig) -> Vec<(ScheduledTask, time::Time)> {
    let mut tasks = vec![
        (
            ScheduledTask::UpdatePipeline {
                supplier: config.update_pipeline_supplier.clone(),
            },
            config.update_pipeline_at,
        ),
        (ScheduledTask::Cleanup, config.cleanup_at),
    ];
    if let Some(at) = config.horoshop_sync_at {
        tasks.push((ScheduledTask::HoroshopSync, at));
    }
    tasks
}

/// Runs one scheduled task. A conflict with a running job only warns.
pub async fn trigger(runner: &Runner, task: &ScheduledTask) -> Option<JobOutcome> {
    log::info!("Scheduled {} started", task.name());
    let res = match task {
        ScheduledTask::UpdatePipeline { supplier } => runner.update_pipeline(Some(supplier)).await,
        ScheduledTask::Cleanup => runner.cleanup().await,
        ScheduledTask::HoroshopSync => runner.horoshop_sync().await,
    };
    match res {
        Ok(outcome) => {
            log::info!("Scheduled {} finished: job #{}", task.name(), outcome.job_id);
            Some(outcome)
        }
        Err(err) if err.is_conflict() => {
            log::warn!("Scheduled {} skipped: {err}", task.name());
            None
        }
        Err(err) => {
            log::error!("Scheduled {} failed: {err}", task.name());
            None
        }
    }
}

pub fn start(
    config: &SchedulerConfig,
    runner: Runner,
    jobs: Addr<JobService>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    if !config.enabled {
        log::info!("Scheduler is disabled");
        return Vec::new();
    }
    let mut handles = daily_tasks(config)
        .into_iter()
        .map(|(task, at)| {
            log::info!("Scheduling {} daily at {at} UTC", task.name());
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(crate::duration_until(at)) => (),
                    }
                    trigger(&runner, &task).await;
                }
            })
        })
        .collect::<Vec<_>>();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(SWEEP_INTERVAL) => (),
            }
            let timed_out = jobs
                .send(SweepTimeouts)
                .await
                .log_error("Unable to sweep stale jobs")
                .unwrap_or_default();
            if !timed_out.is_empty() {
                log::warn!("{} stale jobs timed out", timed_out.len());
            }
        }
    }));
    handles
}
