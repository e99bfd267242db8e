use crate::config::HoroshopConfig;
use crate::export::PreviewStore;
use crate::horoshop::{normalize_product, CatalogApi, HoroshopError, ImportProduct, RetryPolicy};
use crate::journal::Journal;
use async_trait::async_trait;
use catalog_types::horoshop::MirrorRow;
use catalog_types::job::{Job, JobError};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use typesafe_repository::IdentityOf;

pub const PUSH_BATCH_SIZE: i64 = 500;

/// Local copy of the storefront catalog
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Inserts or refreshes rows by article, stamping them as seen by `run_at`
    async fn upsert(&self, rows: &[MirrorRow], run_at: OffsetDateTime)
        -> Result<u64, anyhow::Error>;
    /// Drops rows not seen by `run_at`
    async fn evict_unseen(&self, run_at: OffsetDateTime) -> Result<u64, anyhow::Error>;
    async fn supplier_rows(&self, supplier: &str) -> Result<Vec<MirrorRow>, anyhow::Error>;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullSummary {
    pub total: u64,
    pub deleted: u64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSummary {
    pub total: u64,
    pub batches: u64,
}

pub struct HoroshopSync {
    api: Arc<dyn CatalogApi>,
    mirror: Arc<dyn MirrorStore>,
    preview: Arc<dyn PreviewStore>,
    journal: Journal,
    config: HoroshopConfig,
}

async fn pause(wait: Duration, cancel: &CancellationToken) -> Result<(), JobError> {
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = cancel.cancelled() => Err(JobError::Canceled),
    }
}

fn check(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Canceled)
    } else {
        Ok(())
    }
}

impl HoroshopSync {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        mirror: Arc<dyn MirrorStore>,
        preview: Arc<dyn PreviewStore>,
        journal: Journal,
        config: HoroshopConfig,
    ) -> Self {
        Self {
            api,
            mirror,
            preview,
            journal,
            config,
        }
    }

    async fn logged<T, F>(
        &self,
        job_id: IdentityOf<Job>,
        failure: &str,
        f: F,
    ) -> Result<T, anyhow::Error>
    where
        F: Future<Output = Result<T, anyhow::Error>>,
    {
        let res = f.await;
        if let Err(err) = &res {
            self.journal
                .error(job_id, failure, json!({"error": err.to_string()}))
                .await;
        }
        res
    }

    /// Refreshes the mirror from the storefront export, evicting articles the
    /// storefront no longer reports
    pub async fn pull(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<PullSummary, anyhow::Error> {
        self.logged(job_id, "Horoshop sync failed", self.pull_pages(job_id, cancel))
            .await
    }

    async fn pull_pages(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<PullSummary, anyhow::Error> {
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            refresh_auth: false,
        };
        let limit = self.config.export_limit.max(1);
        let run_at = OffsetDateTime::now_utc();
        let mut token = self.api.authenticate().await?;
        let mut page = 0;
        let mut batch = 0u64;
        let mut total = 0u64;
        let mut attempt = 0;
        loop {
            check(cancel)?;
            let offset = page * limit;
            let products = match self.api.export_page(&token, offset, limit).await {
                Ok(products) => {
                    attempt = 0;
                    products
                }
                Err(err) => {
                    let Some(wait) = policy.backoff(&err, attempt) else {
                        return Err(err.into());
                    };
                    attempt += 1;
                    self.journal
                        .warn(
                            job_id,
                            "Horoshop sync rate limited",
                            json!({
                                "attempt": attempt,
                                "wait_ms": wait.as_millis() as u64,
                                "retry_after_seconds": retry_after_seconds(&err),
                                "offset": offset,
                                "limit": limit,
                            }),
                        )
                        .await;
                    pause(wait, cancel).await?;
                    token = self.api.authenticate().await?;
                    self.journal
                        .info(
                            job_id,
                            "Horoshop token refreshed after wait",
                            json!({"offset": offset}),
                        )
                        .await;
                    continue;
                }
            };
            if products.is_empty() {
                if batch == 0 {
                    self.journal
                        .warn(
                            job_id,
                            "Horoshop export returned empty batch",
                            json!({"offset": offset, "limit": limit}),
                        )
                        .await;
                }
                break;
            }
            let rows = products
                .iter()
                .filter_map(|p| normalize_product(p, self.config.store_raw))
                .collect::<Vec<_>>();
            let inserted = if rows.is_empty() {
                0
            } else {
                self.mirror.upsert(&rows, run_at).await?
            };
            total += inserted;
            batch += 1;
            self.journal
                .info(
                    job_id,
                    "Horoshop sync progress",
                    json!({
                        "batch": batch,
                        "fetched": products.len(),
                        "inserted": inserted,
                        "total": total,
                    }),
                )
                .await;
            if products.len() < limit {
                break;
            }
            if !self.config.sync_delay.is_zero() {
                pause(self.config.sync_delay, cancel).await?;
            }
            page += 1;
        }
        let deleted = self.mirror.evict_unseen(run_at).await?;
        let summary = PullSummary { total, deleted };
        self.journal
            .info(job_id, "Horoshop sync completed", json!(summary))
            .await;
        Ok(summary)
    }

    /// Sends the staged preview to the storefront import endpoint in id order
    pub async fn push(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<PushSummary, anyhow::Error> {
        self.logged(job_id, "Horoshop import failed", self.push_batches(job_id, cancel))
            .await
    }

    async fn push_batches(
        &self,
        job_id: IdentityOf<Job>,
        cancel: &CancellationToken,
    ) -> Result<PushSummary, anyhow::Error> {
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            refresh_auth: true,
        };
        let mut token = self.api.authenticate().await?;
        let mut last_id = 0;
        let mut total = 0u64;
        let mut batches = 0u64;
        let mut attempt = 0;
        loop {
            check(cancel)?;
            let rows = self.preview.page_after(last_id, PUSH_BATCH_SIZE).await?;
            let Some(last) = rows.last() else {
                break;
            };
            last_id = last.id;
            let products = rows
                .iter()
                .filter(|r| !r.row.article.trim().is_empty())
                .map(ImportProduct::from)
                .collect::<Vec<_>>();
            if products.is_empty() {
                continue;
            }
            loop {
                let err = match self.api.import_batch(&token, &products).await {
                    Ok(()) => {
                        attempt = 0;
                        break;
                    }
                    Err(err) => err,
                };
                let Some(wait) = policy.backoff(&err, attempt) else {
                    return Err(err.into());
                };
                attempt += 1;
                if let HoroshopError::AuthExpired = err {
                    token = self.api.authenticate().await?;
                    self.journal
                        .warn(
                            job_id,
                            "Horoshop import auth refreshed",
                            json!({"attempt": attempt, "batch": batches + 1}),
                        )
                        .await;
                    continue;
                }
                self.journal
                    .warn(
                        job_id,
                        "Horoshop import rate limited",
                        json!({
                            "attempt": attempt,
                            "wait_ms": wait.as_millis() as u64,
                            "retry_after_seconds": retry_after_seconds(&err),
                            "batch": batches + 1,
                        }),
                    )
                    .await;
                pause(wait, cancel).await?;
                token = self.api.authenticate().await?;
                self.journal
                    .info(
                        job_id,
                        "Horoshop token refreshed after wait",
                        json!({"batch": batches + 1}),
                    )
                    .await;
            }
            batches += 1;
            total += products.len() as u64;
            self.journal
                .info(
                    job_id,
                    "Horoshop import batch sent",
                    json!({"batch": batches, "sent": products.len(), "total": total}),
                )
                .await;
        }
        let summary = PushSummary { total, batches };
        self.journal
            .info(job_id, "Horoshop import completed", json!(summary))
            .await;
        Ok(summary)
    }
}

fn retry_after_seconds(err: &HoroshopError) -> Option<u64> {
    match err {
        HoroshopError::RateLimited {
            retry_after: Some(wait),
        } => Some(wait.as_secs()),
        _ => None,
    }
}

pub struct PostgresMirrorStore {
    client: Arc<Client>,
}

impl PostgresMirrorStore {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MirrorStore for PostgresMirrorStore {
    async fn upsert(
        &self,
        rows: &[MirrorRow],
        run_at: OffsetDateTime,
    ) -> Result<u64, anyhow::Error> {
        // one row per article, a page may repeat articles
        let rows = rows
            .iter()
            .map(|r| (r.article.as_str(), r))
            .collect::<BTreeMap<_, _>>();
        let articles = rows.keys().copied().collect::<Vec<_>>();
        let suppliers = rows.values().map(|r| r.supplier.as_deref()).collect::<Vec<_>>();
        let presence = rows
            .values()
            .map(|r| r.presence_ua.as_deref())
            .collect::<Vec<_>>();
        let display = rows
            .values()
            .map(|r| r.display_in_showcase)
            .collect::<Vec<_>>();
        let parents = rows
            .values()
            .map(|r| r.parent_article.as_deref())
            .collect::<Vec<_>>();
        let prices = rows.values().map(|r| r.price).collect::<Vec<_>>();
        let raw = rows.values().map(|r| r.raw.as_ref()).collect::<Vec<_>>();
        let n = self
            .client
            .execute(
                "INSERT INTO horoshop_mirror
                (article, supplier, presence_ua, display_in_showcase, parent_article, price, raw, seen_at)
                SELECT t.*, $8::timestamptz FROM UNNEST($1::text[], $2::text[], $3::text[], $4::bool[], $5::text[], $6::numeric[], $7::jsonb[]) AS t
                ON CONFLICT (article) DO UPDATE SET
                  supplier = EXCLUDED.supplier,
                  presence_ua = EXCLUDED.presence_ua,
                  display_in_showcase = EXCLUDED.display_in_showcase,
                  parent_article = EXCLUDED.parent_article,
                  price = EXCLUDED.price,
                  raw = EXCLUDED.raw,
                  synced_at = NOW(),
                  seen_at = EXCLUDED.seen_at",
                &[
                    &articles, &suppliers, &presence, &display, &parents, &prices, &raw, &run_at,
                ],
            )
            .await?;
        Ok(n)
    }

    async fn evict_unseen(&self, run_at: OffsetDateTime) -> Result<u64, anyhow::Error> {
        Ok(self
            .client
            .execute(
                "DELETE FROM horoshop_mirror WHERE seen_at IS DISTINCT FROM $1",
                &[&run_at],
            )
            .await?)
    }

    async fn supplier_rows(&self, supplier: &str) -> Result<Vec<MirrorRow>, anyhow::Error> {
        let res = self
            .client
            .query(
                "SELECT article, supplier, presence_ua, display_in_showcase, parent_article, price
                FROM horoshop_mirror
                WHERE LOWER(TRIM(supplier)) = LOWER(TRIM($1))
                ORDER BY article",
                &[&supplier],
            )
            .await?;
        res.into_iter()
            .map(|r| {
                Ok(MirrorRow {
                    article: r.try_get("article")?,
                    supplier: r.try_get("supplier")?,
                    presence_ua: r.try_get("presence_ua")?,
                    display_in_showcase: r.try_get("display_in_showcase")?,
                    parent_article: r.try_get("parent_article")?,
                    price: r.try_get("price")?,
                    raw: None,
                })
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()
    }
}
