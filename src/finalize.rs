use crate::journal::Journal;
use crate::pricing::{calculate_final_price, Markup};
use async_trait::async_trait;
use catalog_types::job::repository::JobRepository;
use catalog_types::job::{Job, JobType};
use catalog_types::product::{FinalProduct, ProductKey};
use catalog_types::supplier::Supplier;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use typesafe_repository::IdentityOf;

/// Raw row of the import batch joined with its supplier's pricing rules
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub raw_id: i64,
    pub article: String,
    pub size: Option<String>,
    pub quantity: i32,
    pub price_base: Decimal,
    pub extra: String,
    pub supplier_id: IdentityOf<Supplier>,
    pub priority: i32,
    pub markup: Markup,
}

impl Candidate {
    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.article.clone(), self.size.clone())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub raw_count: u64,
    pub final_count: u64,
}

/// One priced row per (article, size): lowest supplier priority wins, then
/// lowest final price, then the earliest raw row
pub fn select_final(job_id: IdentityOf<Job>, candidates: Vec<Candidate>) -> Vec<FinalProduct> {
    let mut best: HashMap<ProductKey, (Decimal, Candidate)> = HashMap::new();
    for c in candidates {
        let price = calculate_final_price(c.price_base, c.markup);
        let rank = (c.priority, price, c.raw_id);
        match best.get(&c.key()) {
            Some((p, b)) if (b.priority, *p, b.raw_id) <= rank => (),
            _ => {
                best.insert(c.key(), (price, c));
            }
        }
    }
    let mut rows = best
        .into_values()
        .map(|(price_final, c)| FinalProduct {
            job_id,
            article: c.article,
            size: c.size,
            quantity: c.quantity,
            price_base: c.price_base,
            price_final,
            extra: c.extra,
            supplier_id: c.supplier_id,
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| (&a.article, &a.size).cmp(&(&b.article, &b.size)));
    rows
}

/// Active manual prices replace computed ones
pub fn apply_overrides(rows: &mut [FinalProduct], overrides: &HashMap<ProductKey, Decimal>) {
    for row in rows {
        if let Some(price) = overrides.get(&ProductKey::new(row.article.clone(), row.size.clone())) {
            row.price_final = *price;
        }
    }
}

/// Atomic swap of the final catalog
#[async_trait]
pub trait FinalCatalogStore: Send + Sync {
    /// Replaces the final catalog with the deduplicated rows of `import_job_id`.
    /// Readers see either the previous or the new catalog.
    async fn rebuild(
        &self,
        job_id: IdentityOf<Job>,
        import_job_id: IdentityOf<Job>,
    ) -> Result<FinalizeSummary, anyhow::Error>;
}

pub struct Finalizer {
    store: Arc<dyn FinalCatalogStore>,
    jobs: Arc<dyn JobRepository>,
    journal: Journal,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn FinalCatalogStore>,
        jobs: Arc<dyn JobRepository>,
        journal: Journal,
    ) -> Self {
        Self {
            store,
            jobs,
            journal,
        }
    }

    pub async fn finalize(&self, job_id: IdentityOf<Job>) -> Result<FinalizeSummary, anyhow::Error> {
        let res = async {
            let import_job = self
                .jobs
                .latest_successful(JobType::ImportAll)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No import_all job found"))?;
            let summary = self.store.rebuild(job_id, import_job.id).await?;
            Ok::<_, anyhow::Error>((import_job.id, summary))
        }
        .await;
        match res {
            Ok((import_job_id, summary)) => {
                self.journal
                    .info(
                        job_id,
                        "Final dataset built",
                        json!({
                            "raw_count": summary.raw_count,
                            "final_count": summary.final_count,
                            "import_job_id": import_job_id,
                        }),
                    )
                    .await;
                Ok(summary)
            }
            Err(err) => {
                self.journal
                    .error(
                        job_id,
                        "Final dataset build failed",
                        json!({"error": err.to_string()}),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

/// Runs the rebuild in one transaction on a dedicated connection
pub struct PostgresFinalCatalogStore {
    client: Arc<Mutex<Client>>,
}

impl PostgresFinalCatalogStore {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FinalCatalogStore for PostgresFinalCatalogStore {
    async fn rebuild(
        &self,
        job_id: IdentityOf<Job>,
        import_job_id: IdentityOf<Job>,
    ) -> Result<FinalizeSummary, anyhow::Error> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let raw_count: i64 = tx
            .query_one(
                "SELECT COUNT(*) AS count FROM products_raw WHERE job_id = $1",
                &[&import_job_id],
            )
            .await?
            .try_get("count")?;
        let candidates = tx
            .query(
                "SELECT pr.id, pr.article, pr.size, pr.quantity, pr.price, pr.extra, pr.supplier_id,
                s.priority, s.markup_percent, s.min_profit_enabled, s.min_profit_amount
                FROM products_raw pr
                JOIN suppliers s ON s.id = pr.supplier_id
                WHERE s.is_active = TRUE AND pr.job_id = $1",
                &[&import_job_id],
            )
            .await?
            .into_iter()
            .map(|r| -> Result<Candidate, anyhow::Error> {
                Ok(Candidate {
                    raw_id: r.try_get("id")?,
                    article: r.try_get("article")?,
                    size: r.try_get("size")?,
                    quantity: r.try_get("quantity")?,
                    price_base: r.try_get("price")?,
                    extra: r.try_get("extra")?,
                    supplier_id: r.try_get("supplier_id")?,
                    priority: r.try_get("priority")?,
                    markup: Markup {
                        percent: r.try_get("markup_percent")?,
                        min_profit_enabled: r.try_get("min_profit_enabled")?,
                        min_profit_amount: r.try_get("min_profit_amount")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let overrides = tx
            .query(
                "SELECT article, size, price_final FROM price_overrides WHERE is_active = TRUE",
                &[],
            )
            .await?
            .into_iter()
            .map(|r| -> Result<(ProductKey, Decimal), anyhow::Error> {
                Ok((
                    ProductKey::new(
                        r.try_get::<_, String>("article")?,
                        r.try_get("size")?,
                    ),
                    r.try_get("price_final")?,
                ))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let mut rows = select_final(job_id, candidates);
        apply_overrides(&mut rows, &overrides);

        tx.execute("TRUNCATE products_final", &[]).await?;
        let mut articles = Vec::with_capacity(rows.len());
        let mut sizes = Vec::with_capacity(rows.len());
        let mut quantities = Vec::with_capacity(rows.len());
        let mut bases = Vec::with_capacity(rows.len());
        let mut finals = Vec::with_capacity(rows.len());
        let mut extras = Vec::with_capacity(rows.len());
        let mut suppliers = Vec::with_capacity(rows.len());
        for r in rows {
            articles.push(r.article);
            sizes.push(r.size);
            quantities.push(r.quantity);
            bases.push(r.price_base);
            finals.push(r.price_final);
            extras.push(r.extra);
            suppliers.push(r.supplier_id);
        }
        let final_count = tx
            .execute(
                "INSERT INTO products_final
                (job_id, article, size, quantity, price_base, price_final, extra, supplier_id)
                SELECT $1::bigint, * FROM UNNEST($2::text[], $3::text[], $4::int[], $5::numeric[], $6::numeric[], $7::text[], $8::bigint[])",
                &[
                    &job_id,
                    &articles,
                    &sizes,
                    &quantities,
                    &bases,
                    &finals,
                    &extras,
                    &suppliers,
                ],
            )
            .await?;
        tx.commit().await?;
        Ok(FinalizeSummary {
            raw_count: raw_count.max(0) as u64,
            final_count,
        })
    }
}
