use crate::row_mapper::Row;
use async_trait::async_trait;
use derive_more::{Display, Error};

/// Opened sheet of a spreadsheet source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    /// Grid size, `None` when the source does not report it
    pub row_count: Option<u32>,
    pub column_count: Option<u32>,
}

#[derive(Debug, Display, Error)]
pub enum RowSourceError {
    #[display("Немає доступу до Google Sheets. Файл закритий або доступ відкликано. Поділіться таблицею з обліковим записом сервісу.")]
    PermissionDenied,
    #[display("Google Sheets не знайдено або доступ закритий.")]
    NotFound,
    #[display("Аркуш не знайдено або перейменовано. Оновіть назву аркуша.")]
    SheetRenamed,
    #[display("Header row out of range")]
    HeaderRowOutOfRange,
    #[display("Google Sheets quota exceeded")]
    RateLimited,
    #[display("Invalid Google Sheets URL or ID")]
    InvalidUrl,
    #[error(ignore)]
    #[display("{_0}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for RowSourceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

impl From<reqwest_middleware::Error> for RowSourceError {
    fn from(err: reqwest_middleware::Error) -> Self {
        Self::Other(err.into())
    }
}

impl From<reqwest::Error> for RowSourceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Other(err.into())
    }
}

/// Spreadsheet-like feed that yields rows by 1-based inclusive range
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Opens `sheet_name`, or the first sheet when none is given
    async fn sheet_info(
        &self,
        url: &str,
        sheet_name: Option<&str>,
    ) -> Result<SheetInfo, RowSourceError>;

    /// Rows `start..=end`. Trailing empty cells may be missing.
    async fn row_chunk(
        &self,
        sheet: &SheetInfo,
        start: u32,
        end: u32,
    ) -> Result<Vec<Row>, RowSourceError>;

    async fn sheet_names(&self, url: &str) -> Result<Vec<String>, RowSourceError>;
}
