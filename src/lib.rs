#![deny(clippy::unwrap_used)]

use async_trait::async_trait;
use refinery::embed_migrations;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod control;
pub mod export;
pub mod finalize;
pub mod google_sheets;
pub mod horoshop;
pub mod horoshop_sync;
pub mod import;
pub mod job;
pub mod journal;
pub mod pricing;
pub mod row_mapper;
pub mod row_source;
pub mod runner;
pub mod scheduler;
pub mod telegram;

embed_migrations!("./migrations");

#[derive(Debug)]
pub struct SqlWrapper<T>(pub T);

impl<T> SqlWrapper<T> {
    pub fn from_sql<R>(r: R) -> Result<T, <Self as TryFrom<R>>::Error>
    where
        Self: TryFrom<R>,
    {
        r.try_into().map(|w: Self| w.0)
    }
}

/// Lets one request through per `interval`
pub struct RateLimiter(Arc<Notify>);

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        tokio::spawn(async move {
            let notify = n;
            loop {
                notify.notify_one();
                sleep(interval).await;
            }
        });
        Self(notify)
    }
}

#[async_trait]
impl reqwest_ratelimit::RateLimiter for RateLimiter {
    async fn acquire_permit(&self) {
        self.0.notified().await;
    }
}

/// Time left until the next occurrence of `at` (UTC)
pub fn duration_until(at: time::Time) -> Duration {
    duration_until_from(time::OffsetDateTime::now_utc(), at)
}

pub fn duration_until_from(now: time::OffsetDateTime, at: time::Time) -> Duration {
    let mut next = now.replace_time(at);
    if now >= next {
        next += time::Duration::DAY;
    }
    Duration::from_millis((next - now).whole_milliseconds().max(0) as u64)
}

/// Parses `HH:MM`
pub fn parse_time_of_day<S: AsRef<str>>(s: S) -> Result<time::Time, anyhow::Error> {
    let s = s.as_ref().trim();
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid time of day {s}, expected HH:MM"))?;
    Ok(time::Time::from_hms(h.trim().parse()?, m.trim().parse()?, 0)?)
}
