use crate::pricing::{calculate_final_price, Markup};
use crate::SqlWrapper;
use async_trait::async_trait;
use catalog_types::mapping::repository::ColumnMappingRepository;
use catalog_types::mapping::{ColumnMapping, CurrentMapping, NewColumnMapping, SourceMapping};
use catalog_types::product::repository::{
    FinalPriceRepository, PriceOverrideRepository, RawProductRepository,
};
use catalog_types::product::{
    NewPriceOverride, OverrideSearch, Page, PriceOverride, ProductKey, RawProduct,
};
use catalog_types::supplier::repository::{SourceRepository, SupplierRepository};
use catalog_types::supplier::{
    ActiveSources, NewSource, NewSupplier, Source, SourcesOf, Supplier,
};
use futures::stream::StreamExt;
use rust_decimal::Decimal;
use std::pin::pin;
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::row::Row;
use tokio_postgres::Client;
use typesafe_repository::async_ops::{Create, Find, Get, List, Save, Select};
use typesafe_repository::{Dao, IdentityOf, Repository};

/// Whether `err` is a Postgres unique constraint violation
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<tokio_postgres::Error>()
        .and_then(tokio_postgres::Error::code)
        == Some(&SqlState::UNIQUE_VIOLATION)
}

const SUPPLIER_COLUMNS: &str =
    "id, name, markup_percent, priority, min_profit_enabled, min_profit_amount, is_active";

pub struct PostgresSupplierRepository {
    client: Arc<Client>,
}

impl PostgresSupplierRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Repository<Supplier> for PostgresSupplierRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<Supplier> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(Supplier {
            id: r.try_get("id")?,
            name: r.try_get("name")?,
            markup_percent: r.try_get("markup_percent")?,
            priority: r.try_get("priority")?,
            min_profit_enabled: r.try_get("min_profit_enabled")?,
            min_profit_amount: r.try_get("min_profit_amount")?,
            is_active: r.try_get("is_active")?,
        }))
    }
}

#[async_trait]
impl Create<Supplier, NewSupplier> for PostgresSupplierRepository {
    async fn create(&self, supplier: NewSupplier) -> Result<IdentityOf<Supplier>, Self::Error> {
        let s = supplier.enrich(0);
        let row = self
            .client
            .query_one(
                "INSERT INTO suppliers (name, markup_percent, priority, min_profit_enabled, min_profit_amount, is_active)
                VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &s.name.trim(),
                    &s.markup_percent,
                    &s.priority,
                    &s.min_profit_enabled,
                    &s.min_profit_amount,
                    &s.is_active,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Get<Supplier> for PostgresSupplierRepository {
    async fn get_one(&self, id: &IdentityOf<Supplier>) -> Result<Option<Supplier>, Self::Error> {
        let mut res = pin!(
            self.client
                .query_raw(
                    &format!("SELECT {SUPPLIER_COLUMNS} FROM suppliers WHERE id = $1"),
                    &[id]
                )
                .await?
        );
        res.next()
            .await
            .transpose()?
            .map(SqlWrapper::<Supplier>::from_sql)
            .transpose()
    }
}

#[async_trait]
impl List<Supplier> for PostgresSupplierRepository {
    async fn list(&self) -> Result<Vec<Supplier>, Self::Error> {
        let res = self
            .client
            .query(
                &format!("SELECT {SUPPLIER_COLUMNS} FROM suppliers ORDER BY name"),
                &[],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }
}

#[async_trait]
impl Save<Supplier> for PostgresSupplierRepository {
    async fn save(&self, s: Supplier) -> Result<(), Self::Error> {
        self.client
            .execute(
                "UPDATE suppliers SET name = $2, markup_percent = $3, priority = $4,
                min_profit_enabled = $5, min_profit_amount = $6, is_active = $7
                WHERE id = $1",
                &[
                    &s.id,
                    &s.name.trim(),
                    &s.markup_percent,
                    &s.priority,
                    &s.min_profit_enabled,
                    &s.min_profit_amount,
                    &s.is_active,
                ],
            )
            .await?;
        Ok(())
    }
}

impl SupplierRepository for PostgresSupplierRepository {}

const SOURCE_COLUMNS: &str =
    "s.id, s.supplier_id, s.name, s.source_type, s.source_url, s.sheet_name, s.is_active";

pub struct PostgresSourceRepository {
    client: Arc<Client>,
}

impl PostgresSourceRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Repository<Source> for PostgresSourceRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<Source> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(Source {
            id: r.try_get("id")?,
            supplier_id: r.try_get("supplier_id")?,
            name: r.try_get("name")?,
            source_type: r.try_get::<_, String>("source_type")?.into(),
            source_url: r.try_get("source_url")?,
            sheet_name: r.try_get("sheet_name")?,
            is_active: r.try_get("is_active")?,
        }))
    }
}

#[async_trait]
impl Create<Source, NewSource> for PostgresSourceRepository {
    async fn create(&self, source: NewSource) -> Result<IdentityOf<Source>, Self::Error> {
        let s = source.enrich(0);
        let row = self
            .client
            .query_one(
                "INSERT INTO sources (supplier_id, name, source_type, source_url, sheet_name, is_active)
                VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &s.supplier_id,
                    &s.name,
                    &s.source_type.as_str(),
                    &s.source_url.trim(),
                    &s.sheet_name,
                    &s.is_active,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Get<Source> for PostgresSourceRepository {
    async fn get_one(&self, id: &IdentityOf<Source>) -> Result<Option<Source>, Self::Error> {
        let mut res = pin!(
            self.client
                .query_raw(
                    &format!("SELECT {SOURCE_COLUMNS} FROM sources s WHERE s.id = $1"),
                    &[id]
                )
                .await?
        );
        res.next()
            .await
            .transpose()?
            .map(SqlWrapper::<Source>::from_sql)
            .transpose()
    }
}

#[async_trait]
impl Save<Source> for PostgresSourceRepository {
    async fn save(&self, s: Source) -> Result<(), Self::Error> {
        self.client
            .execute(
                "UPDATE sources SET supplier_id = $2, name = $3, source_type = $4, source_url = $5,
                sheet_name = $6, is_active = $7
                WHERE id = $1",
                &[
                    &s.id,
                    &s.supplier_id,
                    &s.name,
                    &s.source_type.as_str(),
                    &s.source_url.trim(),
                    &s.sheet_name,
                    &s.is_active,
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Select<Source, ActiveSources> for PostgresSourceRepository {
    async fn select(&self, ActiveSources(supplier_id): &ActiveSources) -> Result<Vec<Source>, Self::Error> {
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM sources s
                    JOIN suppliers sp ON sp.id = s.supplier_id
                    WHERE s.is_active = TRUE AND sp.is_active = TRUE
                    AND ($1::bigint IS NULL OR s.supplier_id = $1)
                    ORDER BY s.id"
                ),
                &[supplier_id],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }
}

#[async_trait]
impl Select<Source, SourcesOf> for PostgresSourceRepository {
    async fn select(&self, SourcesOf(supplier_id): &SourcesOf) -> Result<Vec<Source>, Self::Error> {
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM sources s
                    WHERE ($1::bigint IS NULL OR s.supplier_id = $1)
                    ORDER BY s.id"
                ),
                &[supplier_id],
            )
            .await?;
        res.into_iter().map(SqlWrapper::from_sql).collect()
    }
}

impl SourceRepository for PostgresSourceRepository {}

const MAPPING_COLUMNS: &str = "id, supplier_id, source_id, mapping, header_row, mapping_meta";

pub struct PostgresColumnMappingRepository {
    client: Arc<Client>,
}

impl PostgresColumnMappingRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    async fn first(
        &self,
        query: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<ColumnMapping>, anyhow::Error> {
        let res = self.client.query(query, params).await?;
        res.into_iter().next().map(SqlWrapper::from_sql).transpose()
    }
}

impl Repository<ColumnMapping> for PostgresColumnMappingRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<ColumnMapping> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(ColumnMapping {
            id: r.try_get("id")?,
            supplier_id: r.try_get("supplier_id")?,
            source_id: r.try_get("source_id")?,
            mapping: serde_json::from_value(r.try_get("mapping")?)?,
            header_row: r
                .try_get::<_, Option<i32>>("header_row")?
                .map(u32::try_from)
                .transpose()?,
            mapping_meta: r
                .try_get::<_, Option<serde_json::Value>>("mapping_meta")?
                .map(serde_json::from_value)
                .transpose()?,
        }))
    }
}

#[async_trait]
impl Create<ColumnMapping, NewColumnMapping> for PostgresColumnMappingRepository {
    async fn create(
        &self,
        m: NewColumnMapping,
    ) -> Result<IdentityOf<ColumnMapping>, Self::Error> {
        let header_row = m.header_row.map(i32::try_from).transpose()?;
        let meta = m.mapping_meta.as_ref().map(serde_json::to_value).transpose()?;
        let row = self
            .client
            .query_one(
                "INSERT INTO column_mappings (supplier_id, source_id, mapping, header_row, mapping_meta)
                VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[
                    &m.supplier_id,
                    &m.source_id,
                    &serde_json::to_value(&m.mapping)?,
                    &header_row,
                    &meta,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Get<ColumnMapping> for PostgresColumnMappingRepository {
    async fn get_one(
        &self,
        id: &IdentityOf<ColumnMapping>,
    ) -> Result<Option<ColumnMapping>, Self::Error> {
        self.first(
            &format!("SELECT {MAPPING_COLUMNS} FROM column_mappings WHERE id = $1"),
            &[id],
        )
        .await
    }
}

#[async_trait]
impl Find<ColumnMapping, CurrentMapping> for PostgresColumnMappingRepository {
    async fn find(&self, q: &CurrentMapping) -> Result<Option<ColumnMapping>, Self::Error> {
        self.first(
            &format!(
                "SELECT {MAPPING_COLUMNS} FROM column_mappings
                WHERE supplier_id = $1 AND (source_id IS NULL OR source_id = $2)
                ORDER BY (source_id IS NOT DISTINCT FROM $2) DESC, id DESC
                LIMIT 1"
            ),
            &[&q.supplier_id, &q.source_id],
        )
        .await
    }
}

#[async_trait]
impl Find<ColumnMapping, SourceMapping> for PostgresColumnMappingRepository {
    async fn find(&self, q: &SourceMapping) -> Result<Option<ColumnMapping>, Self::Error> {
        self.first(
            &format!(
                "SELECT {MAPPING_COLUMNS} FROM column_mappings
                WHERE supplier_id = $1 AND source_id = $2
                ORDER BY id DESC LIMIT 1"
            ),
            &[&q.supplier_id, &q.source_id],
        )
        .await
    }
}

impl ColumnMappingRepository for PostgresColumnMappingRepository {}

pub struct PostgresRawProductRepository {
    client: Arc<Client>,
}

impl PostgresRawProductRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RawProductRepository for PostgresRawProductRepository {
    async fn add_batch(&self, rows: Vec<RawProduct>) -> Result<u64, anyhow::Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut jobs = Vec::with_capacity(rows.len());
        let mut suppliers = Vec::with_capacity(rows.len());
        let mut sources = Vec::with_capacity(rows.len());
        let mut articles = Vec::with_capacity(rows.len());
        let mut sizes = Vec::with_capacity(rows.len());
        let mut quantities = Vec::with_capacity(rows.len());
        let mut prices = Vec::with_capacity(rows.len());
        let mut extras = Vec::with_capacity(rows.len());
        let mut data = Vec::with_capacity(rows.len());
        for r in rows {
            jobs.push(r.job_id);
            suppliers.push(r.supplier_id);
            sources.push(r.source_id);
            articles.push(r.article);
            sizes.push(r.size);
            quantities.push(r.quantity);
            prices.push(r.price);
            extras.push(r.extra);
            data.push(r.row_data);
        }
        Ok(self
            .client
            .execute(
                "INSERT INTO products_raw
                (job_id, supplier_id, source_id, article, size, quantity, price, extra, row_data)
                SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::text[], $5::text[],
                $6::int[], $7::numeric[], $8::text[], $9::jsonb[])",
                &[
                    &jobs,
                    &suppliers,
                    &sources,
                    &articles,
                    &sizes,
                    &quantities,
                    &prices,
                    &extras,
                    &data,
                ],
            )
            .await?)
    }
}

const OVERRIDE_COLUMNS: &str = "id, article, size, price_final, notes, is_active";

pub struct PostgresPriceOverrideRepository {
    client: Arc<Client>,
}

impl PostgresPriceOverrideRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Repository<PriceOverride> for PostgresPriceOverrideRepository {
    type Error = anyhow::Error;
}

impl TryFrom<Row> for SqlWrapper<PriceOverride> {
    type Error = anyhow::Error;

    fn try_from(r: Row) -> Result<Self, Self::Error> {
        Ok(SqlWrapper(PriceOverride {
            id: r.try_get("id")?,
            article: r.try_get("article")?,
            size: r.try_get("size")?,
            price_final: r.try_get("price_final")?,
            notes: r.try_get("notes")?,
            is_active: r.try_get("is_active")?,
        }))
    }
}

/// Upserts by (article, size) and reactivates an existing override
#[async_trait]
impl Create<PriceOverride, NewPriceOverride> for PostgresPriceOverrideRepository {
    async fn create(
        &self,
        o: NewPriceOverride,
    ) -> Result<IdentityOf<PriceOverride>, Self::Error> {
        let key = o.key();
        let row = self
            .client
            .query_one(
                "INSERT INTO price_overrides (article, size, price_final, notes, is_active)
                VALUES ($1, $2, $3, $4, TRUE)
                ON CONFLICT (article, (COALESCE(NULLIF(size, ''), ''))) DO UPDATE SET
                  price_final = EXCLUDED.price_final,
                  notes = EXCLUDED.notes,
                  is_active = TRUE,
                  updated_at = NOW()
                RETURNING id",
                &[&key.article.trim(), &key.size, &o.price_final, &o.notes],
            )
            .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl Get<PriceOverride> for PostgresPriceOverrideRepository {
    async fn get_one(
        &self,
        id: &IdentityOf<PriceOverride>,
    ) -> Result<Option<PriceOverride>, Self::Error> {
        let mut res = pin!(
            self.client
                .query_raw(
                    &format!("SELECT {OVERRIDE_COLUMNS} FROM price_overrides WHERE id = $1"),
                    &[id]
                )
                .await?
        );
        res.next()
            .await
            .transpose()?
            .map(SqlWrapper::<PriceOverride>::from_sql)
            .transpose()
    }
}

#[async_trait]
impl Save<PriceOverride> for PostgresPriceOverrideRepository {
    async fn save(&self, o: PriceOverride) -> Result<(), Self::Error> {
        self.client
            .execute(
                "UPDATE price_overrides SET price_final = $2, notes = $3, is_active = $4, updated_at = NOW()
                WHERE id = $1",
                &[&o.id, &o.price_final, &o.notes, &o.is_active],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Find<PriceOverride, ProductKey> for PostgresPriceOverrideRepository {
    async fn find(&self, key: &ProductKey) -> Result<Option<PriceOverride>, Self::Error> {
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {OVERRIDE_COLUMNS} FROM price_overrides
                    WHERE article = $1 AND NULLIF(size, '') IS NOT DISTINCT FROM $2::text
                    ORDER BY id DESC LIMIT 1"
                ),
                &[&key.article, &key.size],
            )
            .await?;
        res.into_iter().next().map(SqlWrapper::from_sql).transpose()
    }
}

#[async_trait]
impl PriceOverrideRepository for PostgresPriceOverrideRepository {
    async fn search(&self, q: &OverrideSearch) -> Result<Page<PriceOverride>, anyhow::Error> {
        let pattern = q
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));
        let filter = "WHERE ($1::text IS NULL OR article ILIKE $1 OR size ILIKE $1 OR notes ILIKE $1)";
        let total: i64 = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) AS total FROM price_overrides {filter}"),
                &[&pattern],
            )
            .await?
            .try_get("total")?;
        let res = self
            .client
            .query(
                &format!(
                    "SELECT {OVERRIDE_COLUMNS} FROM price_overrides {filter}
                    ORDER BY updated_at DESC, id DESC LIMIT $2 OFFSET $3"
                ),
                &[&pattern, &q.limit.clamp(1, 1000), &q.offset.max(0)],
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

pub struct PostgresFinalPriceRepository {
    client: Arc<Client>,
}

impl PostgresFinalPriceRepository {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FinalPriceRepository for PostgresFinalPriceRepository {
    async fn set_price(&self, key: &ProductKey, price: Decimal) -> Result<u64, anyhow::Error> {
        Ok(self
            .client
            .execute(
                "UPDATE products_final SET price_final = $3
                WHERE article = $1 AND NULLIF(size, '') IS NOT DISTINCT FROM $2::text",
                &[&key.article, &key.size, &price],
            )
            .await?)
    }

    async fn recompute_price(&self, key: &ProductKey) -> Result<u64, anyhow::Error> {
        let rows = self
            .client
            .query(
                "SELECT pf.id, pf.price_base, s.markup_percent, s.min_profit_enabled, s.min_profit_amount
                FROM products_final pf
                JOIN suppliers s ON s.id = pf.supplier_id
                WHERE pf.article = $1 AND NULLIF(pf.size, '') IS NOT DISTINCT FROM $2::text",
                &[&key.article, &key.size],
            )
            .await?;
        let mut updated = 0;
        for r in rows {
            let id: i64 = r.try_get("id")?;
            let markup = Markup {
                percent: r.try_get("markup_percent")?,
                min_profit_enabled: r.try_get("min_profit_enabled")?,
                min_profit_amount: r.try_get("min_profit_amount")?,
            };
            let price = calculate_final_price(r.try_get("price_base")?, markup);
            updated += self
                .client
                .execute(
                    "UPDATE products_final SET price_final = $2 WHERE id = $1",
                    &[&id, &price],
                )
                .await?;
        }
        Ok(updated)
    }
}
