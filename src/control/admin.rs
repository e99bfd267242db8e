use crate::catalog::is_unique_violation;
use crate::control::{ControllerError, Response};
use crate::export::{PreviewSearch, PreviewStore};
use actix::Addr;
use actix_web::web::{Data, Json, Path, Query};
use actix_web::{delete, get, post, put, HttpResponse};
use catalog_types::job::repository::LogRepository;
use catalog_types::job::service::{self, JobService};
use catalog_types::job::{LogFilter, DEFAULT_JOB_LIST_LIMIT};
use catalog_types::mapping::repository::ColumnMappingRepository;
use catalog_types::mapping::{CurrentMapping, Mapping, MappingMeta, NewColumnMapping};
use catalog_types::product::repository::{FinalPriceRepository, PriceOverrideRepository};
use catalog_types::product::{NewPriceOverride, OverrideSearch, PriceOverride, PriceOverridePatch};
use catalog_types::supplier::repository::{SourceRepository, SupplierRepository};
use catalog_types::supplier::{
    NewSource, NewSupplier, Source, SourcePatch, SourcesOf, Supplier, SupplierPatch,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use typesafe_repository::async_ops::{Create, Find, Get, List, Save, Select};
use typesafe_repository::IdentityOf;

pub fn scope() -> actix_web::Scope {
    actix_web::web::scope("/admin/api")
        .service(list_suppliers)
        .service(create_supplier)
        .service(update_supplier)
        .service(list_sources)
        .service(create_source)
        .service(update_source)
        .service(deactivate_source)
        .service(get_mapping)
        .service(save_mapping)
        .service(list_jobs)
        .service(list_logs)
        .service(list_price_overrides)
        .service(upsert_price_override)
        .service(update_price_override)
        .service(horoshop_api_preview)
}

fn conflict_on_duplicate(msg: &'static str) -> impl Fn(anyhow::Error) -> ControllerError {
    move |err| {
        if is_unique_violation(&err) {
            ControllerError::Conflict(msg.to_string())
        } else {
            err.into()
        }
    }
}

#[get("/suppliers")]
pub async fn list_suppliers(repo: Data<Arc<dyn SupplierRepository>>) -> Response {
    let mut suppliers = repo.list().await?;
    suppliers.sort_by_key(|s| s.id);
    Ok(HttpResponse::Ok().json(suppliers))
}

#[post("/suppliers")]
pub async fn create_supplier(
    repo: Data<Arc<dyn SupplierRepository>>,
    supplier: Json<NewSupplier>,
) -> Response {
    let mut supplier = supplier.into_inner();
    supplier.name = supplier.name.trim().to_string();
    if supplier.name.is_empty() {
        return Err(ControllerError::invalid("name", "name is required"));
    }
    let id = repo
        .create(supplier)
        .await
        .map_err(conflict_on_duplicate("supplier name already exists"))?;
    Ok(HttpResponse::Ok().json(fetch_supplier(&repo, id).await?))
}

#[put("/suppliers/{id}")]
pub async fn update_supplier(
    repo: Data<Arc<dyn SupplierRepository>>,
    id: Path<IdentityOf<Supplier>>,
    patch: Json<SupplierPatch>,
) -> Response {
    let patch = patch.into_inner();
    if patch.is_empty() {
        return Err(ControllerError::invalid("body", "no fields to update"));
    }
    let supplier = patch.apply(fetch_supplier(&repo, id.into_inner()).await?);
    repo.save(supplier.clone())
        .await
        .map_err(conflict_on_duplicate("supplier name already exists"))?;
    Ok(HttpResponse::Ok().json(supplier))
}

async fn fetch_supplier(
    repo: &Arc<dyn SupplierRepository>,
    id: IdentityOf<Supplier>,
) -> Result<Supplier, ControllerError> {
    repo.get_one(&id)
        .await?
        .ok_or(ControllerError::NotFound { what: "supplier" })
}

#[derive(Deserialize, Debug, Default)]
pub struct SourcesQuery {
    #[serde(default, rename = "supplierId")]
    pub supplier_id: Option<IdentityOf<Supplier>>,
}

#[get("/sources")]
pub async fn list_sources(
    repo: Data<Arc<dyn SourceRepository>>,
    q: Query<SourcesQuery>,
) -> Response {
    let sources = repo.select(&SourcesOf(q.supplier_id)).await?;
    Ok(HttpResponse::Ok().json(sources))
}

#[post("/sources")]
pub async fn create_source(
    repo: Data<Arc<dyn SourceRepository>>,
    source: Json<NewSource>,
) -> Response {
    let source = source.into_inner();
    if source.source_url.trim().is_empty() || source.source_type.as_str().trim().is_empty() {
        return Err(ControllerError::invalid(
            "source_url",
            "supplier_id, source_type, source_url are required",
        ));
    }
    let id = repo
        .create(source)
        .await
        .map_err(conflict_on_duplicate("source already exists"))?;
    Ok(HttpResponse::Ok().json(fetch_source(&repo, id).await?))
}

#[put("/sources/{id}")]
pub async fn update_source(
    repo: Data<Arc<dyn SourceRepository>>,
    id: Path<IdentityOf<Source>>,
    patch: Json<SourcePatch>,
) -> Response {
    let patch = patch.into_inner();
    if patch.is_empty() {
        return Err(ControllerError::invalid("body", "no fields to update"));
    }
    let source = patch.apply(fetch_source(&repo, id.into_inner()).await?);
    repo.save(source.clone()).await?;
    Ok(HttpResponse::Ok().json(source))
}

/// Sources are never deleted, only switched off
#[delete("/sources/{id}")]
pub async fn deactivate_source(
    repo: Data<Arc<dyn SourceRepository>>,
    id: Path<IdentityOf<Source>>,
) -> Response {
    let mut source = fetch_source(&repo, id.into_inner()).await?;
    source.is_active = false;
    repo.save(source.clone()).await?;
    Ok(HttpResponse::Ok().json(source))
}

async fn fetch_source(
    repo: &Arc<dyn SourceRepository>,
    id: IdentityOf<Source>,
) -> Result<Source, ControllerError> {
    repo.get_one(&id)
        .await?
        .ok_or(ControllerError::NotFound { what: "source" })
}

#[derive(Deserialize, Debug, Default)]
pub struct MappingQuery {
    #[serde(default, rename = "sourceId")]
    pub source_id: Option<IdentityOf<Source>>,
}

#[get("/mappings/{supplier_id}")]
pub async fn get_mapping(
    repo: Data<Arc<dyn ColumnMappingRepository>>,
    supplier_id: Path<IdentityOf<Supplier>>,
    q: Query<MappingQuery>,
) -> Response {
    let mapping = repo
        .find(&CurrentMapping {
            supplier_id: supplier_id.into_inner(),
            source_id: q.source_id.filter(|id| *id > 0),
        })
        .await?;
    Ok(HttpResponse::Ok().json(mapping))
}

#[derive(Deserialize, Debug, Default)]
pub struct MappingBody {
    #[serde(default)]
    pub mapping: Option<Mapping>,
    #[serde(default)]
    pub header_row: Option<u32>,
    #[serde(default)]
    pub mapping_meta: Option<MappingMeta>,
    #[serde(default)]
    pub source_id: Option<IdentityOf<Source>>,
}

impl MappingBody {
    /// New mapping version; the source falls back to the one named in the meta
    pub fn into_new(
        self,
        supplier_id: IdentityOf<Supplier>,
    ) -> Result<NewColumnMapping, ControllerError> {
        let mapping = self
            .mapping
            .ok_or_else(|| ControllerError::invalid("mapping", "mapping is required"))?;
        let source_id = self
            .source_id
            .or_else(|| self.mapping_meta.as_ref().and_then(|m| m.source_id));
        Ok(NewColumnMapping {
            supplier_id,
            source_id,
            mapping,
            header_row: self.header_row,
            mapping_meta: self.mapping_meta,
        })
    }
}

#[post("/mappings/{supplier_id}")]
pub async fn save_mapping(
    repo: Data<Arc<dyn ColumnMappingRepository>>,
    supplier_id: Path<IdentityOf<Supplier>>,
    body: Json<MappingBody>,
) -> Response {
    let new = body.into_inner().into_new(supplier_id.into_inner())?;
    let id = repo.create(new).await?;
    let saved = repo
        .get_one(&id)
        .await?
        .ok_or(ControllerError::NotFound { what: "mapping" })?;
    Ok(HttpResponse::Ok().json(saved))
}

#[derive(Deserialize, Debug)]
pub struct JobsQuery {
    #[serde(default = "default_job_limit")]
    pub limit: i64,
}

fn default_job_limit() -> i64 {
    DEFAULT_JOB_LIST_LIMIT
}

#[get("/jobs")]
pub async fn list_jobs(jobs: Data<Addr<JobService>>, q: Query<JobsQuery>) -> Response {
    let jobs = jobs.send(service::List(q.limit.max(1))).await??;
    Ok(HttpResponse::Ok().json(jobs))
}

#[get("/logs")]
pub async fn list_logs(repo: Data<Arc<dyn LogRepository>>, q: Query<LogFilter>) -> Response {
    let logs = repo.select(&q.into_inner()).await?;
    Ok(HttpResponse::Ok().json(logs))
}

#[get("/price-overrides")]
pub async fn list_price_overrides(
    repo: Data<Arc<dyn PriceOverrideRepository>>,
    q: Query<OverrideSearch>,
) -> Response {
    Ok(HttpResponse::Ok().json(repo.search(&q).await?))
}

#[post("/price-overrides")]
pub async fn upsert_price_override(
    overrides: Data<Arc<dyn PriceOverrideRepository>>,
    prices: Data<Arc<dyn FinalPriceRepository>>,
    body: Json<NewPriceOverride>,
) -> Response {
    let o = upsert_override(&overrides, &prices, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(o))
}

#[put("/price-overrides/{id}")]
pub async fn update_price_override(
    overrides: Data<Arc<dyn PriceOverrideRepository>>,
    prices: Data<Arc<dyn FinalPriceRepository>>,
    id: Path<IdentityOf<PriceOverride>>,
    patch: Json<PriceOverridePatch>,
) -> Response {
    let o = update_override(&overrides, &prices, id.into_inner(), patch.into_inner()).await?;
    Ok(HttpResponse::Ok().json(o))
}

/// Stores the override and applies its price to the live catalog right away
pub async fn upsert_override(
    overrides: &Arc<dyn PriceOverrideRepository>,
    prices: &Arc<dyn FinalPriceRepository>,
    mut o: NewPriceOverride,
) -> Result<PriceOverride, ControllerError> {
    o.article = o.article.trim().to_string();
    if o.article.is_empty() || o.price_final <= Decimal::ZERO {
        return Err(ControllerError::invalid(
            "price_final",
            "article and price_final are required",
        ));
    }
    let (key, price) = (o.key(), o.price_final);
    let id = overrides.create(o).await?;
    let updated = prices.set_price(&key, price).await?;
    log::info!("Price override #{id} for {} applied to {updated} rows", key.article);
    overrides
        .get_one(&id)
        .await?
        .ok_or(ControllerError::NotFound { what: "override" })
}

/// Activation applies the override price, deactivation restores the markup
/// price. A price change alone is applied only while the override is active.
pub async fn update_override(
    overrides: &Arc<dyn PriceOverrideRepository>,
    prices: &Arc<dyn FinalPriceRepository>,
    id: IdentityOf<PriceOverride>,
    patch: PriceOverridePatch,
) -> Result<PriceOverride, ControllerError> {
    let current = overrides
        .get_one(&id)
        .await?
        .ok_or(ControllerError::NotFound { what: "override" })?;
    if patch.is_empty() {
        return Err(ControllerError::invalid("body", "no fields to update"));
    }
    let updated = patch.apply(current);
    overrides.save(updated.clone()).await?;
    let key = updated.key();
    match (patch.is_active, patch.price_final) {
        (Some(true), _) => {
            prices.set_price(&key, updated.price_final).await?;
        }
        (Some(false), _) => {
            prices.recompute_price(&key).await?;
        }
        (None, Some(price)) if updated.is_active => {
            prices.set_price(&key, price).await?;
        }
        (None, _) => (),
    }
    Ok(updated)
}

#[get("/horoshop-api-preview")]
pub async fn horoshop_api_preview(
    preview: Data<Arc<dyn PreviewStore>>,
    q: Query<PreviewSearch>,
) -> Response {
    Ok(HttpResponse::Ok().json(preview.search(&q).await?))
}
