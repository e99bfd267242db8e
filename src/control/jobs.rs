use crate::control::{ControllerError, Response};
use crate::runner::Runner;
use actix::Addr;
use actix_web::web::{Data, Json, Path};
use actix_web::{get, post, HttpResponse};
use catalog_types::job::service::{self, JobService};
use catalog_types::job::Job;
use catalog_types::supplier::{Source, Supplier};
use serde::Deserialize;
use serde_json::json;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use typesafe_repository::IdentityOf;

pub fn scope() -> actix_web::Scope {
    actix_web::web::scope("/jobs")
        .service(finalize)
        .service(export)
        .service(import_source)
        .service(import_all)
        .service(import_supplier)
        .service(horoshop_sync)
        .service(horoshop_import)
        .service(update_pipeline)
        .service(cleanup)
        .service(cancel)
        .service(get_job)
}

#[derive(Deserialize, Debug, Default)]
pub struct SupplierBody {
    #[serde(default)]
    pub supplier: Option<String>,
}

#[serde_as]
#[derive(Deserialize, Debug, Default)]
pub struct ImportSourceBody {
    #[serde(default, rename = "sourceId")]
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub source_id: Option<IdentityOf<Source>>,
}

#[serde_as]
#[derive(Deserialize, Debug, Default)]
pub struct ImportSupplierBody {
    #[serde(default, rename = "supplierId")]
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub supplier_id: Option<IdentityOf<Supplier>>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

fn body<T: Default>(b: Option<Json<T>>) -> T {
    b.map(Json::into_inner).unwrap_or_default()
}

#[post("/finalize")]
pub async fn finalize(runner: Data<Runner>) -> Response {
    Ok(HttpResponse::Ok().json(runner.finalize().await?))
}

#[post("/export")]
pub async fn export(runner: Data<Runner>, b: Option<Json<SupplierBody>>) -> Response {
    let SupplierBody { supplier } = body(b);
    Ok(HttpResponse::Ok().json(runner.export(supplier.as_deref()).await?))
}

#[post("/import-source")]
pub async fn import_source(runner: Data<Runner>, b: Option<Json<ImportSourceBody>>) -> Response {
    let source_id = body(b)
        .source_id
        .ok_or_else(|| ControllerError::invalid("sourceId", "sourceId is required"))?;
    Ok(HttpResponse::Ok().json(runner.import_source(source_id).await?))
}

#[post("/import-all")]
pub async fn import_all(runner: Data<Runner>) -> Response {
    Ok(HttpResponse::Ok().json(runner.import_all().await?))
}

#[post("/import-supplier")]
pub async fn import_supplier(
    runner: Data<Runner>,
    b: Option<Json<ImportSupplierBody>>,
) -> Response {
    let supplier_id = body(b)
        .supplier_id
        .ok_or_else(|| ControllerError::invalid("supplierId", "supplierId is required"))?;
    Ok(HttpResponse::Ok().json(runner.import_supplier(supplier_id).await?))
}

#[post("/horoshop-sync")]
pub async fn horoshop_sync(runner: Data<Runner>) -> Response {
    Ok(HttpResponse::Ok().json(runner.horoshop_sync().await?))
}

#[post("/horoshop-import")]
pub async fn horoshop_import(runner: Data<Runner>) -> Response {
    Ok(HttpResponse::Ok().json(runner.horoshop_import().await?))
}

#[post("/update-pipeline")]
pub async fn update_pipeline(runner: Data<Runner>, b: Option<Json<SupplierBody>>) -> Response {
    let SupplierBody { supplier } = body(b);
    Ok(HttpResponse::Ok().json(runner.update_pipeline(supplier.as_deref()).await?))
}

#[post("/cleanup")]
pub async fn cleanup(runner: Data<Runner>) -> Response {
    Ok(HttpResponse::Ok().json(runner.cleanup().await?))
}

#[post("/{id}/cancel")]
pub async fn cancel(
    jobs: Data<Addr<JobService>>,
    id: Path<IdentityOf<Job>>,
    b: Option<Json<CancelBody>>,
) -> Response {
    let job = jobs
        .send(service::Cancel {
            id: id.into_inner(),
            reason: body(b).reason,
        })
        .await??;
    Ok(HttpResponse::Ok().json(json!({ "jobId": job.id, "status": "canceled" })))
}

#[get("/{id}")]
pub async fn get_job(jobs: Data<Addr<JobService>>, id: Path<IdentityOf<Job>>) -> Response {
    let job = jobs
        .send(service::Get(id.into_inner()))
        .await??
        .ok_or(ControllerError::NotFound { what: "job" })?;
    Ok(HttpResponse::Ok().json(job))
}
