use crate::catalog::is_unique_violation;
use crate::horoshop::HoroshopError;
use crate::import::ImportError;
use crate::row_source::RowSourceError;
use actix_web::http::StatusCode;
use actix_web::web::{JsonConfig, PathConfig, QueryConfig};
use actix_web::{get, HttpResponse};
use catalog_types::job::JobError;
use derive_more::{Display, Error};
use serde_json::json;

pub mod admin;
pub mod jobs;

pub type Response = Result<HttpResponse, ControllerError>;

#[derive(Debug, Display, Error)]
pub enum ControllerError {
    #[display("{what} not found")]
    NotFound { what: &'static str },
    #[error(ignore)]
    #[display("{_0}")]
    Conflict(String),
    #[display("{msg}")]
    InvalidInput { field: &'static str, msg: String },
    #[error(ignore)]
    #[display("{_0}")]
    External(anyhow::Error),
    #[error(ignore)]
    #[display("{_0}")]
    InternalServerError(anyhow::Error),
}

impl ControllerError {
    pub fn invalid<M: Into<String>>(field: &'static str, msg: M) -> Self {
        Self::InvalidInput {
            field,
            msg: msg.into(),
        }
    }
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        if is_unique_violation(&err) {
            return Self::Conflict("already exists".to_string());
        }
        if let Some(import) = err.downcast_ref::<ImportError>() {
            match import {
                ImportError::SourceNotFound => return Self::NotFound { what: "source" },
                ImportError::Mapping(_)
                | ImportError::EmptySheet
                | ImportError::HeaderNotDetected
                | ImportError::UnsupportedSourceType => {
                    return Self::invalid("mapping", import.to_string())
                }
                ImportError::Source(_) => return Self::External(err),
                ImportError::Canceled | ImportError::Storage(_) => (),
            }
        }
        if err.downcast_ref::<RowSourceError>().is_some() {
            return Self::External(err);
        }
        match err.downcast_ref::<HoroshopError>() {
            Some(HoroshopError::NotConfigured { .. }) => Self::invalid("horoshop", err.to_string()),
            Some(_) => Self::External(err),
            None => Self::InternalServerError(err),
        }
    }
}

impl From<JobError> for ControllerError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Conflict { .. } | JobError::LockBusy | JobError::NotCancelable => {
                Self::Conflict(err.to_string())
            }
            JobError::Canceled | JobError::TimedOut => Self::Conflict(err.to_string()),
            JobError::NotFound => Self::NotFound { what: "job" },
            JobError::Internal(err) => err.into(),
        }
    }
}

impl From<actix::MailboxError> for ControllerError {
    fn from(err: actix::MailboxError) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl actix_web::error::ResponseError for ControllerError {
    fn status_code(&self) -> StatusCode {
        use ControllerError::*;
        match self {
            NotFound { .. } => StatusCode::NOT_FOUND,
            Conflict(_) => StatusCode::CONFLICT,
            InvalidInput { .. } => StatusCode::BAD_REQUEST,
            External(_) => StatusCode::BAD_GATEWAY,
            InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ControllerError::InternalServerError(err) => log::error!("{err:?}"),
            err => log::warn!("{err}"),
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[get("/health")]
pub async fn health() -> Response {
    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

pub async fn not_found() -> Response {
    Err(ControllerError::NotFound { what: "route" })
}

/// Malformed bodies answer with the same JSON error shape as handlers
pub fn json_config() -> JsonConfig {
    JsonConfig::default()
        .error_handler(|err, _| ControllerError::invalid("body", err.to_string()).into())
}

pub fn query_config() -> QueryConfig {
    QueryConfig::default()
        .error_handler(|err, _| ControllerError::invalid("query", err.to_string()).into())
}

pub fn path_config() -> PathConfig {
    PathConfig::default()
        .error_handler(|err, _| ControllerError::invalid("path", err.to_string()).into())
}
