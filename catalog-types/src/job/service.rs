use crate::job::repository::JobRepository;
use crate::job::{Job, JobError, DEFAULT_CANCEL_REASON};
use actix::prelude::*;
use actix_broker::BrokerIssue;
use anyhow::Context as AnyhowContext;
use log_error::*;
use std::sync::Arc;
use typesafe_repository::IdentityOf;

pub struct JobService {
    repo: Arc<dyn JobRepository>,
    /// Zero disables the stale job sweep
    timeout_minutes: u64,
}

impl JobService {
    pub fn new(repo: Arc<dyn JobRepository>, timeout_minutes: u64) -> Self {
        Self {
            repo,
            timeout_minutes,
        }
    }
}

impl Actor for JobService {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "Result<Option<Job>, anyhow::Error>")]
pub struct Get(pub IdentityOf<Job>);

/// Newest jobs, after failing the stale ones
#[derive(Message)]
#[rtype(result = "Result<Vec<Job>, anyhow::Error>")]
pub struct List(pub i64);

#[derive(Message)]
#[rtype(result = "Result<Job, JobError>")]
pub struct Cancel {
    pub id: IdentityOf<Job>,
    pub reason: Option<String>,
}

#[derive(Message)]
#[rtype(result = "Vec<Job>")]
pub struct SweepTimeouts;

#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct JobCanceled {
    pub job: Job,
    pub reason: String,
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct JobTimedOut {
    pub job: Job,
    pub timeout_minutes: u64,
}

impl Handler<Get> for JobService {
    type Result = ResponseActFuture<Self, Result<Option<Job>, anyhow::Error>>;

    fn handle(&mut self, Get(id): Get, _: &mut Self::Context) -> Self::Result {
        let repo = self.repo.clone();
        Box::pin(async move { repo.get_one(&id).await.context("Unable to get job") }.into_actor(self))
    }
}

impl Handler<List> for JobService {
    type Result = ResponseActFuture<Self, Result<Vec<Job>, anyhow::Error>>;

    fn handle(&mut self, List(limit): List, ctx: &mut Self::Context) -> Self::Result {
        let repo = self.repo.clone();
        let addr = ctx.address();
        Box::pin(
            async move {
                addr.send(SweepTimeouts)
                    .await
                    .log_error("Unable to sweep stale jobs");
                repo.list_recent(limit).await.context("Unable to list jobs")
            }
            .into_actor(self),
        )
    }
}

impl Handler<Cancel> for JobService {
    type Result = ResponseActFuture<Self, Result<Job, JobError>>;

    fn handle(&mut self, Cancel { id, reason }: Cancel, _: &mut Self::Context) -> Self::Result {
        let repo = self.repo.clone();
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        let event_reason = reason.clone();
        Box::pin(
            async move {
                let job = repo.get_one(&id).await?.ok_or(JobError::NotFound)?;
                if !job.status.is_cancelable() || !repo.cancel(&id, &reason).await? {
                    return Err(JobError::NotCancelable);
                }
                Ok(job)
            }
            .into_actor(self)
            .map(move |res, act, _| {
                if let Ok(job) = &res {
                    act.issue_system_async(JobCanceled {
                        job: job.clone(),
                        reason: event_reason,
                    });
                }
                res
            }),
        )
    }
}

impl Handler<SweepTimeouts> for JobService {
    type Result = ResponseActFuture<Self, Vec<Job>>;

    fn handle(&mut self, _: SweepTimeouts, _: &mut Self::Context) -> Self::Result {
        let repo = self.repo.clone();
        let minutes = self.timeout_minutes;
        Box::pin(
            async move {
                if minutes == 0 {
                    return Vec::new();
                }
                repo.timeout_stale(minutes)
                    .await
                    .log_error("Unable to apply job timeouts")
                    .unwrap_or_default()
            }
            .into_actor(self)
            .map(move |jobs, act, _| {
                for job in &jobs {
                    act.issue_system_async(JobTimedOut {
                        job: job.clone(),
                        timeout_minutes: minutes,
                    });
                }
                jobs
            }),
        )
    }
}
