use crate::config::HoroshopConfig;
use async_trait::async_trait;
use catalog_types::horoshop::{MirrorRow, StoredPreviewRow};
use derive_more::{Display, Error};
use lazy_regex::{regex_captures, regex_is_match};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{
    default_on_request_failure, RetryTransientMiddleware, Retryable, RetryableStrategy,
};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::time::Duration;

pub const RATE_LIMIT_STEP: Duration = Duration::from_secs(60);
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Display, Error)]
pub enum HoroshopError {
    #[display("Horoshop {what} is not set")]
    NotConfigured { what: &'static str },
    #[display("Horoshop requests limit has been exceeded")]
    RateLimited { retry_after: Option<Duration> },
    #[display("Horoshop rejected the token: incorrect auth data")]
    AuthExpired,
    #[display("Horoshop authentication failed: {message}")]
    AuthFailed { message: String },
    #[display("Horoshop {operation} error: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[display("Horoshop request failed: {error}")]
    Transport {
        #[error(ignore)]
        error: anyhow::Error,
    },
}

impl From<reqwest_middleware::Error> for HoroshopError {
    fn from(err: reqwest_middleware::Error) -> Self {
        Self::Transport { error: err.into() }
    }
}

impl From<reqwest::Error> for HoroshopError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport { error: err.into() }
    }
}

/// Storefront API base URL, `https://` is assumed when no scheme is given
pub fn api_base(domain: &str) -> Result<String, HoroshopError> {
    let domain = domain.trim().trim_end_matches('/');
    if domain.is_empty() {
        return Err(HoroshopError::NotConfigured { what: "domain" });
    }
    if domain.starts_with("http://") || domain.starts_with("https://") {
        Ok(domain.to_string())
    } else {
        Ok(format!("https://{domain}"))
    }
}

/// Error text as reported in any of the envelope shapes the API uses
fn error_message(body: &Value) -> Option<String> {
    let text = |v: &Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    [
        &body["error"]["message"],
        &body["response"]["error"]["message"],
        &body["response"]["message"],
        &body["message"],
        &body["error"],
        &body["response"]["error"],
    ]
    .into_iter()
    .find_map(text)
}

/// Maps a failed call to the kind the retry policy branches on
pub fn classify(operation: &'static str, status: Option<StatusCode>, message: &str) -> HoroshopError {
    if let Some((_, secs)) = regex_captures!(r"(?i)Retry after\s+(\d+)\s*seconds", message) {
        return HoroshopError::RateLimited {
            retry_after: secs.parse().ok().map(Duration::from_secs),
        };
    }
    if status == Some(StatusCode::TOO_MANY_REQUESTS)
        || regex_is_match!(r"(?i)requests limit has been exceeded", message)
    {
        return HoroshopError::RateLimited { retry_after: None };
    }
    if regex_is_match!(r"(?i)incorrect auth data", message) {
        return HoroshopError::AuthExpired;
    }
    HoroshopError::Api {
        operation,
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Zero retries forever
    pub max_retries: u32,
    /// Whether `incorrect auth data` answers are retried with a new token
    pub refresh_auth: bool,
}

impl RetryPolicy {
    /// Pause before retrying after the `attempt`-th consecutive failure (0-based),
    /// `None` when the error must propagate. Every retry re-authenticates.
    pub fn backoff(&self, err: &HoroshopError, attempt: u32) -> Option<Duration> {
        if self.max_retries != 0 && attempt >= self.max_retries {
            return None;
        }
        match err {
            HoroshopError::RateLimited {
                retry_after: Some(wait),
            } => Some(*wait),
            HoroshopError::RateLimited { retry_after: None } => {
                Some((RATE_LIMIT_STEP * (attempt + 1)).min(MAX_RATE_LIMIT_WAIT))
            }
            HoroshopError::AuthExpired if self.refresh_auth => Some(Duration::ZERO),
            _ => None,
        }
    }
}

/// Mirror row from one exported product, `None` when it has no article
pub fn normalize_product(product: &Value, store_raw: bool) -> Option<MirrorRow> {
    let text = |v: &Value| v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let article = text(&product["article"])?;
    let display_in_showcase = match &product["display_in_showcase"] {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => true,
    };
    let price = match &product["price"] {
        Value::Number(n) => n
            .as_i64()
            .map(Decimal::from)
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    }
    .filter(|p| !p.is_zero());
    Some(MirrorRow {
        article,
        supplier: text(&product["supplier"]["value"]).or_else(|| text(&product["supplier"])),
        presence_ua: text(&product["presence"]["value"]["ua"])
            .or_else(|| text(&product["presence"]["ua"])),
        display_in_showcase: Some(display_in_showcase),
        parent_article: text(&product["parent_article"])
            .or_else(|| text(&product["parentArticle"])),
        price,
        raw: store_raw.then(|| product.clone()),
    })
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LocalizedText {
    pub ua: String,
}

/// Product update in the catalog import format
#[skip_serializing_none]
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImportProduct {
    pub article: String,
    pub presence: Option<LocalizedText>,
    pub display_in_showcase: Option<bool>,
    pub parent_article: Option<String>,
    pub price: Option<f64>,
}

impl From<&StoredPreviewRow> for ImportProduct {
    fn from(r: &StoredPreviewRow) -> Self {
        let row = &r.row;
        Self {
            article: row.article.clone(),
            presence: Some(LocalizedText {
                ua: row.presence_ua.as_str().to_string(),
            }),
            display_in_showcase: Some(row.display_in_showcase),
            parent_article: Some(row.parent_article.trim().to_string()).filter(|p| !p.is_empty()),
            price: row.price.and_then(|p| p.to_f64()),
        }
    }
}

/// Remote catalog operations
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn authenticate(&self) -> Result<String, HoroshopError>;
    /// Raw exported products starting at `offset`
    async fn export_page(
        &self,
        token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, HoroshopError>;
    async fn import_batch(
        &self,
        token: &str,
        products: &[ImportProduct],
    ) -> Result<(), HoroshopError>;
}

/// Retries transport failures only, HTTP answers go to [`RetryPolicy`]
struct TransportOnly;

impl RetryableStrategy for TransportOnly {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(_) => None,
            Err(err) => default_on_request_failure(err),
        }
    }
}

pub struct HoroshopClient {
    client: ClientWithMiddleware,
    domain: String,
    login: String,
    password: String,
}

impl HoroshopClient {
    pub fn new(client: reqwest::Client, config: &HoroshopConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransportOnly,
            ))
            .build();
        Self {
            client,
            domain: config.domain.clone(),
            login: config.login.clone(),
            password: config.password.clone(),
        }
    }

    async fn post(
        &self,
        operation: &'static str,
        path: &str,
        payload: &Value,
    ) -> Result<Value, HoroshopError> {
        let url = format!("{}{path}", api_base(&self.domain)?);
        log::debug!("POST {url}");
        let res = self.client.post(&url).json(payload).send().await?;
        let status = res.status();
        let text = res.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| status.to_string());
            return Err(classify(operation, Some(status), &message));
        }
        Ok(body)
    }
}

#[async_trait]
impl CatalogApi for HoroshopClient {
    async fn authenticate(&self) -> Result<String, HoroshopError> {
        if self.login.is_empty() || self.password.is_empty() {
            return Err(HoroshopError::NotConfigured { what: "credentials" });
        }
        let body = self
            .post(
                "auth",
                "/api/auth/",
                &json!({"login": self.login, "password": self.password}),
            )
            .await
            .map_err(|err| match err {
                HoroshopError::Api { message, .. } => HoroshopError::AuthFailed { message },
                err => err,
            })?;
        body["response"]["token"]
            .as_str()
            .or_else(|| body["token"].as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HoroshopError::AuthFailed {
                message: error_message(&body)
                    .unwrap_or_else(|| "Horoshop token not received".to_string()),
            })
    }

    async fn export_page(
        &self,
        token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, HoroshopError> {
        let body = self
            .post(
                "export",
                "/api/catalog/export/",
                &json!({"token": token, "offset": offset, "limit": limit}),
            )
            .await?;
        export_products(body)
    }

    async fn import_batch(
        &self,
        token: &str,
        products: &[ImportProduct],
    ) -> Result<(), HoroshopError> {
        let body = self
            .post(
                "import",
                "/api/catalog/import/",
                &json!({"token": token, "products": products}),
            )
            .await?;
        match error_message(&body) {
            Some(message) => Err(classify("import", None, &message)),
            None => Ok(()),
        }
    }
}

/// Product list of an export answer, which is either `response: [...]`
/// or `response.products` / `products`
pub fn export_products(mut body: Value) -> Result<Vec<Value>, HoroshopError> {
    let nested = match body.get_mut("response") {
        Some(Value::Array(products)) => return Ok(std::mem::take(products)),
        Some(response) => response.get_mut("products").map(Value::take),
        None => None,
    };
    if let Some(Value::Array(products)) = nested {
        return Ok(products);
    }
    if let Some(Value::Array(products)) = body.get_mut("products").map(Value::take) {
        return Ok(products);
    }
    let message = error_message(&body).unwrap_or_else(|| {
        let keys = body
            .as_object()
            .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "none".to_string());
        format!("invalid response (keys: {keys})")
    });
    Err(classify("export", None, &message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_types::horoshop::{Presence, PreviewRow};
    use rust_decimal_macros::dec;

    #[test]
    fn normalizes_api_base() {
        assert_eq!("https://shop.example", api_base(" shop.example/ ").expect("base"));
        assert_eq!("http://localhost:3000", api_base("http://localhost:3000//").expect("base"));
        assert!(matches!(
            api_base(""),
            Err(HoroshopError::NotConfigured { what: "domain" })
        ));
    }

    #[test]
    fn classifies_rate_limits_and_auth() {
        assert!(matches!(
            classify("export", None, "Retry after 42 seconds"),
            HoroshopError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(42)
        ));
        assert!(matches!(
            classify("import", None, "The Requests limit has been exceeded"),
            HoroshopError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            classify("import", Some(StatusCode::TOO_MANY_REQUESTS), "slow down"),
            HoroshopError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            classify("import", None, "Incorrect auth data"),
            HoroshopError::AuthExpired
        ));
        assert_eq!(
            "Horoshop export error: boom",
            classify("export", None, "boom").to_string()
        );
    }

    #[test]
    fn retry_policy_depends_on_error_kind() {
        let push = RetryPolicy {
            max_retries: 2,
            refresh_auth: true,
        };
        let pull = RetryPolicy {
            refresh_auth: false,
            ..push
        };
        let limited = HoroshopError::RateLimited { retry_after: None };
        assert_eq!(Some(Duration::from_secs(60)), push.backoff(&limited, 0));
        assert_eq!(Some(Duration::from_secs(120)), push.backoff(&limited, 1));
        assert_eq!(None, push.backoff(&limited, 2));
        assert_eq!(
            Some(Duration::from_secs(7)),
            pull.backoff(
                &HoroshopError::RateLimited {
                    retry_after: Some(Duration::from_secs(7))
                },
                0
            )
        );
        assert_eq!(Some(Duration::ZERO), push.backoff(&HoroshopError::AuthExpired, 0));
        assert_eq!(None, pull.backoff(&HoroshopError::AuthExpired, 0));
        let api = classify("export", None, "boom");
        assert_eq!(None, push.backoff(&api, 0));
    }

    #[test]
    fn fallback_wait_is_capped_and_zero_retries_is_unbounded() {
        let policy = RetryPolicy {
            max_retries: 0,
            refresh_auth: false,
        };
        let limited = HoroshopError::RateLimited { retry_after: None };
        assert_eq!(Some(MAX_RATE_LIMIT_WAIT), policy.backoff(&limited, 100));
    }

    #[test]
    fn normalizes_exported_products() {
        let product = json!({
            "article": " A-42 ",
            "supplier": {"value": "Drop"},
            "presence": {"value": {"ua": "В наявності"}},
            "display_in_showcase": 1,
            "parent_article": "A",
            "price": "1100.50",
        });
        let row = normalize_product(&product, false).expect("article present");
        assert_eq!("A-42", row.article);
        assert_eq!(Some("Drop".to_string()), row.supplier);
        assert_eq!(Some(Presence::InStock), row.presence());
        assert_eq!(Some(true), row.display_in_showcase);
        assert_eq!(Some("A".to_string()), row.parent_article);
        assert_eq!(Some(dec!(1100.50)), row.price);
        assert_eq!(None, row.raw);

        let flat = normalize_product(
            &json!({"article": "B", "supplier": "Drop", "presence": {"ua": "Немає в наявності"}, "price": 0}),
            true,
        )
        .expect("article present");
        assert_eq!(Some(false), flat.display_in_showcase);
        assert_eq!(None, flat.price);
        assert!(flat.raw.is_some());
        assert_eq!(None, normalize_product(&json!({"article": ""}), false));
    }

    #[test]
    fn import_shape_omits_absent_fields() {
        let row = StoredPreviewRow {
            id: 1,
            job_id: 2,
            row: PreviewRow {
                article: "GONE".to_string(),
                supplier: "Drop".to_string(),
                presence_ua: Presence::OutOfStock,
                display_in_showcase: false,
                parent_article: String::new(),
                price: None,
            },
        };
        assert_eq!(
            json!({
                "article": "GONE",
                "presence": {"ua": "Немає в наявності"},
                "display_in_showcase": false,
            }),
            serde_json::to_value(ImportProduct::from(&row)).expect("serializable")
        );
    }

    #[test]
    fn reads_export_envelopes() {
        assert_eq!(
            1,
            export_products(json!({"response": [{"article": "A"}]}))
                .expect("products")
                .len()
        );
        assert_eq!(
            1,
            export_products(json!({"response": {"products": [{"article": "A"}]}}))
                .expect("products")
                .len()
        );
        assert!(matches!(
            export_products(json!({"status": "ERROR", "response": {"message": "Retry after 3 seconds"}})),
            Err(HoroshopError::RateLimited { .. })
        ));
        assert_eq!(
            "Horoshop export error: invalid response (keys: status)",
            export_products(json!({"status": "OK"}))
                .expect_err("no products")
                .to_string()
        );
    }
}
