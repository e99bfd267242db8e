use crate::config::SheetsConfig;
use crate::row_mapper::Row;
use crate::row_source::{RowSource, RowSourceError, SheetInfo};
use crate::RateLimiter;
use async_trait::async_trait;
use lazy_regex::regex_captures;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const QUOTA_RETRIES: u32 = 3;
const QUOTA_BACKOFF: Duration = Duration::from_secs(60);

/// Spreadsheet id from a sheet URL, an `?id=` link or a bare id
pub fn parse_sheet_id<S: AsRef<str>>(url: S) -> Option<String> {
    let value = url.as_ref().trim();
    if let Some((_, id)) = regex_captures!(r"spreadsheets/d/([a-zA-Z0-9\-_]+)", value) {
        return Some(id.to_string());
    }
    if let Some((_, id)) = regex_captures!(r"[?&]id=([a-zA-Z0-9\-_]+)", value) {
        return Some(id.to_string());
    }
    regex_captures!(r"^[a-zA-Z0-9\-_]{15,}$", value).map(|id| id.to_string())
}

/// A1 range covering whole rows of a sheet
pub fn row_range(sheet_name: &str, start: u32, end: u32) -> String {
    format!("'{}'!{start}:{end}", sheet_name.replace('\'', "''"))
}

#[derive(Deserialize, Debug, Default)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetails,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorDetails {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

/// Failed response as the operator should see it
#[derive(Debug)]
enum ApiFailure {
    Quota,
    /// Requested rows past the grid end
    GridLimit { max_rows: u32 },
    Error(RowSourceError),
}

fn classify(status: StatusCode, body: &str) -> ApiFailure {
    let details = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_default();
    let message = details.message.as_str();
    let reason = details
        .errors
        .first()
        .map(|r| r.reason.as_str())
        .unwrap_or_default();
    let lower = message.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || details.status == "RESOURCE_EXHAUSTED"
        || reason == "rateLimitExceeded"
        || reason == "userRateLimitExceeded"
        || lower.contains("quota exceeded")
        || lower.contains("rate limit")
        || lower.contains("read requests per minute per user")
    {
        return ApiFailure::Quota;
    }
    if let Some((_, rows, _)) =
        regex_captures!(r"(?i)Max rows:\s*(\d+),\s*max columns:\s*(\d+)", message)
    {
        if let Ok(max_rows) = rows.parse() {
            return ApiFailure::GridLimit { max_rows };
        }
    }
    if status == StatusCode::FORBIDDEN || lower.contains("permission") || reason == "forbidden" {
        return ApiFailure::Error(RowSourceError::PermissionDenied);
    }
    if status == StatusCode::NOT_FOUND || lower.contains("not found") || reason == "notFound" {
        return ApiFailure::Error(RowSourceError::NotFound);
    }
    if lower.contains("unable to parse range") {
        return ApiFailure::Error(RowSourceError::SheetRenamed);
    }
    ApiFailure::Error(RowSourceError::Other(anyhow::anyhow!(
        "Google Sheets request failed with {status}: {message}"
    )))
}

#[derive(Deserialize, Debug)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Deserialize, Debug)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    title: String,
    #[serde(default)]
    grid_properties: Option<GridProperties>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    row_count: Option<u32>,
    column_count: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct GoogleSheetsClient {
    client: ClientWithMiddleware,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl GoogleSheetsClient {
    /// Requests are spaced by the configured minimum interval
    pub fn new(client: reqwest::Client, config: &SheetsConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(reqwest_ratelimit::all(RateLimiter::new(config.min_interval)))
            .build();
        Self {
            client,
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        }
    }

    fn url(&self, spreadsheet_id: &str, range: Option<&str>) -> Result<url::Url, RowSourceError> {
        let mut url = url::Url::parse(API_BASE).map_err(anyhow::Error::from)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Invalid Google Sheets API base"))?;
            segments.push(spreadsheet_id);
            if let Some(range) = range {
                segments.push("values").push(range);
            }
        }
        Ok(url)
    }

    /// Retries quota errors with a growing pause, maps the rest to operator categories
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: url::Url,
        query: &[(&str, &str)],
    ) -> Result<T, ApiFailure> {
        let mut attempt = 0;
        loop {
            let mut req = self.client.get(url.clone()).query(query);
            if let Some(key) = &self.api_key {
                req = req.query(&[("key", key)]);
            }
            if let Some(token) = &self.access_token {
                req = req.bearer_auth(token);
            }
            let res = req
                .send()
                .await
                .map_err(|err| ApiFailure::Error(err.into()))?;
            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|err| ApiFailure::Error(err.into()))?;
            if status.is_success() {
                return serde_json::from_str(&body)
                    .map_err(|err| ApiFailure::Error(RowSourceError::Other(err.into())));
            }
            match classify(status, &body) {
                ApiFailure::Quota if attempt < QUOTA_RETRIES => {
                    attempt += 1;
                    log::warn!("Google Sheets quota exceeded, retry {attempt} of {QUOTA_RETRIES}");
                    tokio::time::sleep(QUOTA_BACKOFF * attempt).await;
                }
                failure => return Err(failure),
            }
        }
    }

    async fn spreadsheet(&self, url: &str) -> Result<(String, Spreadsheet), RowSourceError> {
        let id = parse_sheet_id(url).ok_or(RowSourceError::InvalidUrl)?;
        let meta = self
            .get_json::<Spreadsheet>(self.url(&id, None)?, &[("fields", "sheets.properties")])
            .await
            .map_err(into_error)?;
        Ok((id, meta))
    }
}

fn into_error(failure: ApiFailure) -> RowSourceError {
    match failure {
        ApiFailure::Quota => RowSourceError::RateLimited,
        ApiFailure::GridLimit { .. } => RowSourceError::HeaderRowOutOfRange,
        ApiFailure::Error(err) => err,
    }
}

#[async_trait]
impl RowSource for GoogleSheetsClient {
    async fn sheet_info(
        &self,
        url: &str,
        sheet_name: Option<&str>,
    ) -> Result<SheetInfo, RowSourceError> {
        let (spreadsheet_id, meta) = self.spreadsheet(url).await?;
        let sheet = match sheet_name.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => meta.sheets.into_iter().find(|s| s.properties.title == name),
            None => meta.sheets.into_iter().next(),
        }
        .ok_or(RowSourceError::SheetRenamed)?;
        let grid = sheet.properties.grid_properties;
        Ok(SheetInfo {
            spreadsheet_id,
            row_count: grid.as_ref().and_then(|g| g.row_count),
            column_count: grid.as_ref().and_then(|g| g.column_count),
            sheet_name: sheet.properties.title,
        })
    }

    async fn row_chunk(
        &self,
        sheet: &SheetInfo,
        start: u32,
        end: u32,
    ) -> Result<Vec<Row>, RowSourceError> {
        let mut end = end;
        loop {
            if end < start {
                return Ok(Vec::new());
            }
            let range = row_range(&sheet.sheet_name, start, end);
            let url = self.url(&sheet.spreadsheet_id, Some(&range))?;
            let res = self
                .get_json::<ValueRange>(
                    url,
                    &[
                        ("majorDimension", "ROWS"),
                        ("valueRenderOption", "FORMATTED_VALUE"),
                    ],
                )
                .await;
            match res {
                Ok(v) => {
                    return Ok(v
                        .values
                        .into_iter()
                        .map(|row| row.into_iter().map(cell_text).collect())
                        .collect())
                }
                Err(ApiFailure::GridLimit { max_rows }) if start > max_rows => {
                    return Ok(Vec::new())
                }
                Err(ApiFailure::GridLimit { max_rows }) if end > max_rows => end = max_rows,
                Err(failure) => return Err(into_error(failure)),
            }
        }
    }

    async fn sheet_names(&self, url: &str) -> Result<Vec<String>, RowSourceError> {
        let (_, meta) = self.spreadsheet(url).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| s.properties.title)
            .filter(|t| !t.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sheet_ids() {
        assert_eq!(
            Some("1AbC-def_123".to_string()),
            parse_sheet_id("https://docs.google.com/spreadsheets/d/1AbC-def_123/edit#gid=0")
        );
        assert_eq!(
            Some("xyz987".to_string()),
            parse_sheet_id("https://drive.google.com/open?id=xyz987")
        );
        assert_eq!(
            Some("abcdefghijklmnop".to_string()),
            parse_sheet_id(" abcdefghijklmnop ")
        );
        assert_eq!(None, parse_sheet_id("short"));
    }

    #[test]
    fn quotes_sheet_names_in_ranges() {
        assert_eq!("'Лист 1'!1:20", row_range("Лист 1", 1, 20));
        assert_eq!("'Bob''s'!5:5", row_range("Bob's", 5, 5));
    }

    #[test]
    fn classifies_api_errors() {
        let quota = r#"{"error":{"code":429,"message":"Quota exceeded for quota metric","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, quota),
            ApiFailure::Quota
        ));
        let denied = r#"{"error":{"code":403,"message":"The caller does not have permission","status":"PERMISSION_DENIED"}}"#;
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, denied),
            ApiFailure::Error(RowSourceError::PermissionDenied)
        ));
        let range = r#"{"error":{"code":400,"message":"Unable to parse range: 'Old'!1:20","status":"INVALID_ARGUMENT"}}"#;
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, range),
            ApiFailure::Error(RowSourceError::SheetRenamed)
        ));
        let grid = r#"{"error":{"code":400,"message":"Range ('Data'!1:10000) exceeds grid limits. Max rows: 812, max columns: 26","status":"INVALID_ARGUMENT"}}"#;
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, grid),
            ApiFailure::GridLimit { max_rows: 812 }
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, "not json"),
            ApiFailure::Error(RowSourceError::NotFound)
        ));
    }
}
