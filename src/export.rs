use crate::config::ExportFilesConfig;
use crate::horoshop_sync::MirrorStore;
use crate::journal::Journal;
use crate::SqlWrapper;
use async_trait::async_trait;
use catalog_types::horoshop::{MirrorRow, Presence, PreviewRow, StoredPreviewRow};
use catalog_types::job::repository::JobRepository;
use catalog_types::job::{Job, JobType};
use catalog_types::product::{default_page_limit, Page};
use catalog_types::supplier::DEFAULT_SUPPLIER_FILTER;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::row::Row;
use tokio_postgres::Client;
use typesafe_repository::IdentityOf;

pub const PREVIEW_BATCH_SIZE: usize = 500;

/// Storefront SKU of a catalog item. Sizes are encoded as an `-size` suffix
/// unless the article already ends with the size.
pub fn derive_sku(article: &str, size: Option<&str>) -> String {
    let article = article.trim();
    if article.is_empty() {
        return String::new();
    }
    let size = size.map(catalog_types::normalize_size).unwrap_or_default();
    if size.is_empty() || article.to_lowercase().ends_with(&size.to_lowercase()) {
        article.to_string()
    } else {
        format!("{article}-{size}")
    }
}

/// Final catalog row with the price an export should publish
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub id: i64,
    pub article: String,
    pub size: Option<String>,
    pub price_final: Decimal,
    pub supplier_priority: i32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Diff {
    pub rows: Vec<PreviewRow>,
    pub total: u64,
    pub api_total: u64,
    pub api_show_total: u64,
    pub api_hide_total: u64,
    pub api_skipped: u64,
}

impl Diff {
    fn emit(&mut self, emitted: &mut HashSet<String>, row: PreviewRow) -> bool {
        if emitted.insert(row.article.clone()) {
            self.rows.push(row);
            true
        } else {
            false
        }
    }
}

fn same_state(mirror: &MirrorRow, desired: &PreviewRow) -> bool {
    let price_matches = match (mirror.price, desired.price) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() <= Decimal::new(1, 2),
        _ => false,
    };
    mirror.presence() == Some(desired.presence_ua)
        && mirror.display_in_showcase.unwrap_or(false) == desired.display_in_showcase
        && price_matches
        && mirror.parent().unwrap_or_default() == desired.parent_article
}

fn hidden(mirror: &MirrorRow, parent_article: String) -> PreviewRow {
    PreviewRow {
        article: mirror.article.trim().to_string(),
        supplier: mirror.supplier.clone().unwrap_or_default(),
        presence_ua: Presence::OutOfStock,
        display_in_showcase: false,
        parent_article,
        price: None,
    }
}

/// Winner per derived SKU: lowest supplier priority, then price, then row id
fn winners(rows: Vec<ExportRow>) -> BTreeMap<String, ExportRow> {
    let mut best: BTreeMap<String, ExportRow> = BTreeMap::new();
    for row in rows {
        if row.article.trim().is_empty() {
            continue;
        }
        let sku = derive_sku(&row.article, row.size.as_deref());
        let rank = (row.supplier_priority, row.price_final, row.id);
        match best.get(&sku) {
            Some(b) if (b.supplier_priority, b.price_final, b.id) <= rank => (),
            _ => {
                best.insert(sku, row);
            }
        }
    }
    best
}

/// Outbound update set for the storefront articles of `supplier`.
/// Articles already in the desired state are counted as skipped and left
/// out of `total`, so diffing an unchanged catalog against a mirror updated
/// from the previous run yields no rows.
pub fn build_diff(final_rows: Vec<ExportRow>, mirror: &[MirrorRow], supplier: &str) -> Diff {
    let mirror = mirror
        .iter()
        .filter(|m| m.supplier_is(supplier) && !m.article.trim().is_empty())
        .collect::<Vec<_>>();
    let by_article = mirror
        .iter()
        .map(|m| (m.article.trim(), *m))
        .collect::<HashMap<_, _>>();
    let mut diff = Diff::default();
    let mut present = HashSet::new();
    let mut emitted = HashSet::new();

    for (sku, row) in winners(final_rows) {
        let found = by_article
            .get(sku.as_str())
            .or_else(|| by_article.get(row.article.trim()));
        present.insert(sku.clone());
        let Some(m) = found else {
            diff.total += 1;
            continue;
        };
        present.insert(m.article.trim().to_string());
        let desired = PreviewRow {
            article: m.article.trim().to_string(),
            supplier: m.supplier.clone().unwrap_or_default(),
            presence_ua: Presence::InStock,
            display_in_showcase: true,
            parent_article: m.parent().unwrap_or_default().to_string(),
            price: Some(row.price_final),
        };
        if emitted.contains(&desired.article) {
            diff.total += 1;
            continue;
        }
        if same_state(m, &desired) {
            diff.api_skipped += 1;
            emitted.insert(desired.article);
            continue;
        }
        diff.total += 1;
        if diff.emit(&mut emitted, desired) {
            diff.api_total += 1;
        }
    }

    let mut groups: BTreeMap<&str, Vec<&MirrorRow>> = BTreeMap::new();
    for m in &mirror {
        if let Some(parent) = m.parent() {
            groups.entry(parent).or_default().push(*m);
        }
    }
    for (parent, members) in groups {
        if !members.iter().all(|m| m.display_in_showcase == Some(false)) {
            continue;
        }
        let Some(first) = members.iter().min_by(|a, b| a.article.trim().cmp(b.article.trim())) else {
            continue;
        };
        let article = first.article.trim();
        if present.contains(article) || emitted.contains(article) {
            continue;
        }
        let row = hidden(first, parent.to_string());
        if same_state(first, &row) || first.presence() == Some(Presence::OutOfStock) {
            diff.api_skipped += 1;
            emitted.insert(row.article);
            continue;
        }
        if diff.emit(&mut emitted, row) {
            diff.api_show_total += 1;
        }
    }

    for m in &mirror {
        let article = m.article.trim();
        if present.contains(article) || emitted.contains(article) {
            continue;
        }
        let already_hidden = m.display_in_showcase == Some(false)
            && m.presence() == Some(Presence::OutOfStock);
        if already_hidden {
            continue;
        }
        if diff.emit(&mut emitted, hidden(m, String::new())) {
            diff.api_hide_total += 1;
        }
    }
    diff
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub total: u64,
    pub api_total: u64,
    pub api_show_total: u64,
    pub api_hide_total: u64,
    pub api_skipped: u64,
    pub supplier: String,
    pub finalize_job_id: IdentityOf<Job>,
    pub api_file_path: Option<String>,
}

#[async_trait]
pub trait FinalCatalogReader: Send + Sync {
    /// Rows of the final batch with active overrides applied
    async fn export_rows(
        &self,
        finalize_job_id: IdentityOf<Job>,
    ) -> Result<Vec<ExportRow>, anyhow::Error>;
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PreviewSearch {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub supplier: Option<String>,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[async_trait]
pub trait PreviewStore: Send + Sync {
    /// Swaps the preview table content for `rows`
    async fn replace(
        &self,
        job_id: IdentityOf<Job>,
        rows: &[PreviewRow],
    ) -> Result<(), anyhow::Error>;
    /// Rows with id greater than `after`, in id order
    async fn page_after(
        &self,
        after: i64,
        limit: i64,
    ) -> Result<Vec<StoredPreviewRow>, anyhow::Error>;
    async fn search(&self, q: &PreviewSearch) -> Result<Page<StoredPreviewRow>, anyhow::Error>;
}

pub struct Exporter {
    catalog: Arc<dyn FinalCatalogReader>,
    mirror: Arc<dyn MirrorStore>,
    preview: Arc<dyn PreviewStore>,
    jobs: Arc<dyn JobRepository>,
    journal: Journal,
    files: ExportFilesConfig,
}

impl Exporter {
    pub fn new(
        catalog: Arc<dyn FinalCatalogReader>,
        mirror: Arc<dyn MirrorStore>,
        preview: Arc<dyn PreviewStore>,
        jobs: Arc<dyn JobRepository>,
        journal: Journal,
        files: ExportFilesConfig,
    ) -> Self {
        Self {
            catalog,
            mirror,
            preview,
            jobs,
            journal,
            files,
        }
    }

    pub async fn export(
        &self,
        job_id: IdentityOf<Job>,
        supplier: Option<&str>,
    ) -> Result<ExportSummary, anyhow::Error> {
        let supplier = supplier
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUPPLIER_FILTER)
            .to_string();
        let finalize_job = self
            .jobs
            .latest_successful(JobType::Finalize)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No finalize job found"))?;
        let rows = self.catalog.export_rows(finalize_job.id).await?;
        let mirror = self.mirror.supplier_rows(&supplier).await?;
        let diff = build_diff(rows, &mirror, &supplier);
        self.preview.replace(job_id, &diff.rows).await?;
        let api_file_path = if self.files.enabled {
            let path = self.files.dir.join(format!("horoshop_api_{job_id}.xlsx"));
            let rows = diff.rows.clone();
            let written = path.clone();
            tokio::task::spawn_blocking(move || write_preview_file(written, &rows)).await??;
            Some(path.display().to_string())
        } else {
            None
        };
        let summary = ExportSummary {
            total: diff.total,
            api_total: diff.api_total,
            api_show_total: diff.api_show_total,
            api_hide_total: diff.api_hide_total,
            api_skipped: diff.api_skipped,
            supplier,
            finalize_job_id: finalize_job.id,
            api_file_path,
        };
        self.journal
            .info(job_id, "Export completed", json!(summary))
            .await;
        Ok(summary)
    }
}

pub fn write_preview_file(path: PathBuf, rows: &[PreviewRow]) -> Result<(), anyhow::Error> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("API")?;
    let header = [
        "Артикул",
        "Постачальник",
        "Наявність",
        "Відображати",
        "Батьківський артикул",
        "Ціна",
    ];
    for (i, name) in header.iter().enumerate() {
        sheet.write_string(0, i as u16, *name)?;
    }
    for (i, row) in rows.iter().enumerate() {
        let r = i as u32 + 1;
        sheet.write_string(r, 0, &row.article)?;
        sheet.write_string(r, 1, &row.supplier)?;
        sheet.write_string(r, 2, row.presence_ua.as_str())?;
        sheet.write_boolean(r, 3, row.display_in_showcase)?;
        sheet.write_string(r, 4, &row.parent_article)?;
        if let Some(price) = row.price.and_then(|p| p.to_f64()) {
            sheet.write_number(r, 5, price)?;
        }
    }
    workbook.save(&path)?;
    Ok(())
}

pub struct PostgresFinalCatalogReader {
    client: Arc<Client>,
}

impl PostgresFinalCatalogReader {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FinalCatalogReader for PostgresFinalCatalogReader {
    async fn export_rows(
        &self,
        finalize_job_id: IdentityOf<Job>,
    ) -> Result<Vec<ExportRow>, anyhow::Error> {
        let res = self
            .client
            .query(
                "SELECT pf.id, pf.article, pf.size,
                COALESCE(po.price_final, pf.price_final) AS price_final,
                COALESCE(sp.priority, 9999) AS supplier_priority
                FROM products_final pf
                LEFT JOIN suppliers sp ON sp.id = pf.supplier_id
                LEFT JOIN price_overrides po
                  ON po.article = pf.article
                 AND NULLIF(po.size, '') IS NOT DISTINCT FROM NULLIF(pf.size, '')
                 AND po.is_active = TRUE
                WHERE pf.job_id = $1",
                &[&finalize_job_id],
            )
            .await?;
        res.into_iter()
            .map(|r| {
                Ok(ExportRow {
                    id: r.try_get("id")?,
                    article: r.try_get("article")?,
                    size: r.try_get("size")?,
                    price_final: r.try_get("price_final")?,
                    supplier_priority: r.try_get("supplier_priority")?,
                })
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()
    }
}

impl TryFrom<Row> for SqlWrapper<StoredPreviewRow> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        let presence = r.try_get::<_, &str>("presence_ua")?;
        Ok(SqlWrapper(StoredPreviewRow {
            id: r.try_get("id")?,
            job_id: r.try_get("job_id")?,
            row: PreviewRow {
                article: r.try_get("article")?,
                supplier: r.try_get("supplier")?,
                presence_ua: Presence::parse(presence)
                    .ok_or_else(|| anyhow::anyhow!("Unknown presence label {presence}"))?,
                display_in_showcase: r.try_get("display_in_showcase")?,
                parent_article: r.try_get("parent_article")?,
                price: r.try_get("price")?,
            },
        }))
    }
}

const PREVIEW_COLUMNS: &str =
    "id, job_id, article, supplier, presence_ua, display_in_showcase, parent_article, price";

pub struct PostgresPreviewStore {
    client: Arc<Client>,
    tx_client: Arc<Mutex<Client>>,
}

impl PostgresPreviewStore {
    pub fn new(client: Arc<Client>, tx_client: Arc<Mutex<Client>>) -> Self {
        Self { client, tx_client }
    }
}

#[async_trait]
impl PreviewStore for PostgresPreviewStore {
    async fn replace(
        &self,
        job_id: IdentityOf<Job>,
        rows: &[PreviewRow],
    ) -> Result<(), anyhow::Error> {
        let mut client = self.tx_client.lock().await;
        let tx = client.transaction().await?;
        tx.execute("TRUNCATE horoshop_api_preview RESTART IDENTITY", &[])
            .await?;
        for chunk in rows.chunks(PREVIEW_BATCH_SIZE) {
            let articles = chunk.iter().map(|r| r.article.as_str()).collect::<Vec<_>>();
            let suppliers = chunk.iter().map(|r| r.supplier.as_str()).collect::<Vec<_>>();
            let presence = chunk
                .iter()
                .map(|r| r.presence_ua.as_str())
                .collect::<Vec<_>>();
            let display = chunk
                .iter()
                .map(|r| r.display_in_showcase)
                .collect::<Vec<_>>();
            let parents = chunk
                .iter()
                .map(|r| r.parent_article.as_str())
                .collect::<Vec<_>>();
            let prices = chunk.iter().map(|r| r.price).collect::<Vec<_>>();
            tx.execute(
                "INSERT INTO horoshop_api_preview
                (job_id, article, supplier, presence_ua, display_in_showcase, parent_article, price)
                SELECT $1::bigint, t.article, t.supplier, t.presence_ua, t.display_in_showcase, t.parent_article, t.price
                FROM UNNEST($2::text[], $3::text[], $4::text[], $5::bool[], $6::text[], $7::numeric[])
                WITH ORDINALITY AS t(article, supplier, presence_ua, display_in_showcase, parent_article, price, n)
                ORDER BY n",
                &[
                    &job_id, &articles, &suppliers, &presence, &display, &parents, &prices,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn page_after(
        &self,
        after: i64,
        limit: i64,
    ) -> Result<Vec<StoredPreviewRow>, anyhow::Error> {
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {PREVIEW_COLUMNS} FROM horoshop_api_preview WHERE id > $1 ORDER BY id LIMIT $2"
                ),
                &[&after, &limit],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }

    async fn search(&self, q: &PreviewSearch) -> Result<Page<StoredPreviewRow>, anyhow::Error> {
        let pattern = q
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));
        let supplier = q
            .supplier
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let filter = "WHERE ($1::text IS NULL OR article ILIKE $1 OR parent_article ILIKE $1)
            AND ($2::text IS NULL OR LOWER(supplier) = LOWER($2))";
        let total: i64 = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) AS total FROM horoshop_api_preview {filter}"),
                &[&pattern, &supplier],
            )
            .await?
            .try_get("total")?;
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {PREVIEW_COLUMNS} FROM horoshop_api_preview {filter} ORDER BY id LIMIT $3 OFFSET $4"
                ),
                &[
                    &pattern,
                    &supplier,
                    &q.limit.clamp(1, 1000),
                    &q.offset.max(0),
                ],
            )
            .await?;
        Ok(Page {
            total,
            rows: res
                .into_iter()
                .map(SqlWrapper::from_sql)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_types::horoshop::{PRESENCE_IN_STOCK, PRESENCE_OUT_OF_STOCK};
    use rust_decimal_macros::dec;

    fn final_row(id: i64, article: &str, size: Option<&str>, priority: i32, price: Decimal) -> ExportRow {
        ExportRow {
            id,
            article: article.to_string(),
            size: size.map(str::to_string),
            price_final: price,
            supplier_priority: priority,
        }
    }

    fn mirror(article: &str, presence: &str, display: bool, parent: Option<&str>, price: Option<Decimal>) -> MirrorRow {
        MirrorRow {
            article: article.to_string(),
            supplier: Some("Drop".to_string()),
            presence_ua: Some(presence.to_string()),
            display_in_showcase: Some(display),
            parent_article: parent.map(str::to_string),
            price,
            raw: None,
        }
    }

    /// Mirror as the storefront would look after pushing `rows`
    fn apply(mirror: &[MirrorRow], rows: &[PreviewRow]) -> Vec<MirrorRow> {
        mirror
            .iter()
            .map(|m| match rows.iter().find(|r| r.article == m.article) {
                Some(r) => MirrorRow {
                    presence_ua: Some(r.presence_ua.as_str().to_string()),
                    display_in_showcase: Some(r.display_in_showcase),
                    price: r.price.or(m.price),
                    ..m.clone()
                },
                None => m.clone(),
            })
            .collect()
    }

    #[test]
    fn derives_size_suffixed_skus() {
        assert_eq!("SHOE100-42", derive_sku("SHOE100-42", Some("42")));
        assert_eq!("SHOE100-42", derive_sku("SHOE100", Some("42")));
        assert_eq!("SHOE100-42.5", derive_sku("SHOE100", Some("42,5")));
        assert_eq!("SHOE100", derive_sku(" SHOE100 ", Some("  ")));
        assert_eq!("BOOTXL", derive_sku("BOOTXL", Some("xl")));
        assert_eq!("", derive_sku(" ", Some("42")));
    }

    #[test]
    fn sku_collision_keeps_preferred_row() {
        let best = winners(vec![
            final_row(1, "A-42", None, 2, dec!(100)),
            final_row(2, "A", Some("42"), 1, dec!(500)),
            final_row(3, "A", Some("42"), 1, dec!(500)),
        ]);
        assert_eq!(1, best.len());
        assert_eq!(2, best["A-42"].id);
    }

    #[test]
    fn shows_changed_items_and_skips_unchanged() {
        let diff = build_diff(
            vec![
                final_row(1, "A", Some("42"), 1, dec!(1100)),
                final_row(2, "B", None, 1, dec!(200)),
                final_row(3, "C", None, 1, dec!(300)),
            ],
            &[
                mirror("A-42", PRESENCE_OUT_OF_STOCK, false, Some("A"), Some(dec!(1000))),
                mirror("B", PRESENCE_IN_STOCK, true, None, Some(dec!(200.004))),
            ],
            "drop",
        );
        assert_eq!(2, diff.total);
        assert_eq!(1, diff.api_total);
        assert_eq!(1, diff.api_skipped);
        assert_eq!(
            vec![PreviewRow {
                article: "A-42".to_string(),
                supplier: "Drop".to_string(),
                presence_ua: Presence::InStock,
                display_in_showcase: true,
                parent_article: "A".to_string(),
                price: Some(dec!(1100)),
            }],
            diff.rows
        );
    }

    #[test]
    fn hides_supplier_items_missing_from_catalog() {
        let mut other = mirror("Z", PRESENCE_IN_STOCK, true, None, Some(dec!(1)));
        other.supplier = Some("warehouse".to_string());
        let diff = build_diff(
            vec![],
            &[
                mirror("GONE", PRESENCE_IN_STOCK, true, None, Some(dec!(100))),
                mirror("DONE", PRESENCE_OUT_OF_STOCK, false, None, None),
                other,
            ],
            "drop",
        );
        assert_eq!(1, diff.api_hide_total);
        assert_eq!(1, diff.rows.len());
        assert_eq!("GONE", diff.rows[0].article);
        assert_eq!(Presence::OutOfStock, diff.rows[0].presence_ua);
        assert!(!diff.rows[0].display_in_showcase);
        assert_eq!(None, diff.rows[0].price);
        assert_eq!("", diff.rows[0].parent_article);
    }

    #[test]
    fn hidden_parent_group_is_kept_hidden() {
        let diff = build_diff(
            vec![],
            &[
                mirror("P-2", PRESENCE_IN_STOCK, false, Some("P"), Some(dec!(10))),
                mirror("P-1", PRESENCE_IN_STOCK, false, Some("P"), Some(dec!(10))),
            ],
            "drop",
        );
        assert_eq!(1, diff.api_show_total);
        assert_eq!("P-1", diff.rows[0].article);
        assert_eq!("P", diff.rows[0].parent_article);
        assert_eq!(1, diff.api_hide_total);
        assert_eq!("P-2", diff.rows[1].article);
    }

    #[test]
    fn second_export_against_updated_mirror_is_empty() {
        let catalog = || {
            vec![
                final_row(1, "A", Some("42"), 1, dec!(1100)),
                final_row(2, "B", None, 1, dec!(250)),
            ]
        };
        let initial = vec![
            mirror("A-42", PRESENCE_OUT_OF_STOCK, false, Some("A"), Some(dec!(1000))),
            mirror("B", PRESENCE_IN_STOCK, true, None, Some(dec!(200))),
            mirror("OLD", PRESENCE_IN_STOCK, true, None, Some(dec!(5))),
            mirror("G-1", PRESENCE_IN_STOCK, false, Some("G"), Some(dec!(5))),
        ];
        let first = build_diff(catalog(), &initial, "drop");
        assert!(!first.rows.is_empty());
        let updated = apply(&initial, &first.rows);
        let second = build_diff(catalog(), &updated, "drop");
        assert!(second.rows.is_empty(), "unexpected rows {:?}", second.rows);
        assert_eq!(0, second.api_total);
        assert_eq!(0, second.total);
    }
}
