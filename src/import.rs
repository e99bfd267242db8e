use crate::journal::Journal;
use crate::row_mapper::{detect_mapping, map_row, normalize_header, Row, RowSkip, SkipReason};
use crate::row_source::{RowSource, RowSourceError, SheetInfo};
use catalog_types::job::Job;
use catalog_types::mapping::repository::ColumnMappingRepository;
use catalog_types::mapping::{ColumnMapping, Field, Mapping, MappingEntry, MappingMeta, SourceMapping};
use catalog_types::product::repository::RawProductRepository;
use catalog_types::product::RawProduct;
use catalog_types::supplier::repository::{SourceRepository, SupplierRepository};
use catalog_types::supplier::{ActiveSources, Source, SourceType, Supplier};
use derive_more::{Display, Error};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use typesafe_repository::IdentityOf;

pub const RAW_BATCH_SIZE: usize = 500;
pub const HEADER_SCAN_ROWS: u32 = 20;
pub const MAX_SKIP_SAMPLES: usize = 5;

#[derive(Debug, Display, Error, PartialEq)]
pub enum MappingError {
    #[display("Mapping source mismatch. Please remap columns.")]
    SourceMismatch { mapping_source_id: i64 },
    #[display("Header row out of range. Please remap columns.")]
    HeaderRowOutOfRange { header_row: u32 },
    #[display("Header row not found. Please remap columns.")]
    HeaderRowNotFound { header_row: u32 },
    #[display("Mapping validation failed. Please remap columns.")]
    Invalid { errors: Vec<String> },
}

#[derive(Debug, Display, Error)]
pub enum ImportError {
    #[display("sheet is empty")]
    EmptySheet,
    #[display("header not detected")]
    HeaderNotDetected,
    #[display("unsupported source type")]
    UnsupportedSourceType,
    #[display("source not found")]
    SourceNotFound,
    #[display("{_0}")]
    Mapping(MappingError),
    #[display("{_0}")]
    Source(RowSourceError),
    #[display("Job canceled")]
    Canceled,
    #[error(ignore)]
    #[display("{_0}")]
    Storage(anyhow::Error),
}

impl From<RowSourceError> for ImportError {
    fn from(err: RowSourceError) -> Self {
        Self::Source(err)
    }
}

impl From<MappingError> for ImportError {
    fn from(err: MappingError) -> Self {
        Self::Mapping(err)
    }
}

impl From<anyhow::Error> for ImportError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Accepted row count plus the mapping that was applied
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub imported: u64,
    pub mapping: Option<Mapping>,
}

/// Result line of one source inside a multi-source import
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SourceSummary {
    pub source_id: IdentityOf<Source>,
    pub source_name: String,
    pub supplier_name: Option<String>,
    pub imported: u64,
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct SkipSample {
    row: u32,
    #[serde(flatten)]
    skip: RowSkip,
}

#[derive(Debug, Default)]
struct SkipLog {
    stats: BTreeMap<SkipReason, u64>,
    samples: Vec<SkipSample>,
}

impl SkipLog {
    fn new() -> Self {
        Self {
            stats: SkipReason::ALL.into_iter().map(|r| (r, 0)).collect(),
            samples: Vec::new(),
        }
    }

    fn record(&mut self, row: u32, skip: RowSkip) {
        *self.stats.entry(skip.reason).or_default() += 1;
        if self.samples.len() < MAX_SKIP_SAMPLES {
            self.samples.push(SkipSample { row, skip });
        }
    }

    fn total(&self) -> u64 {
        self.stats.values().sum()
    }
}

/// Checks column bindings against the sheet. With a header row, captured
/// header texts must still match the cells they point to.
pub fn check_mapping(
    mapping: &Mapping,
    meta: &MappingMeta,
    header: Option<&[String]>,
    max_columns: u32,
) -> Vec<String> {
    let mut errors = Vec::new();
    let out_of_range = |i: u32| max_columns > 0 && i > max_columns;
    let check_header = |field: Field, index: u32, errors: &mut Vec<String>| {
        let (Some(header), Some(expected)) = (header, meta.headers.get(&field)) else {
            return;
        };
        let actual = header
            .get(index as usize - 1)
            .map(String::as_str)
            .unwrap_or_default();
        if !expected.is_empty() && normalize_header(expected) != normalize_header(actual) {
            errors.push(format!(
                "Header mismatch for {field}: expected \"{expected}\" got \"{actual}\""
            ));
        }
    };
    for field in Field::REQUIRED {
        match mapping.get(field) {
            Some(MappingEntry::Static(v)) => {
                if v.trim().is_empty() {
                    errors.push(format!("Missing static value for {field}"));
                }
            }
            None | Some(MappingEntry::Column(0)) => {
                errors.push(format!("Missing mapping for {field}"))
            }
            Some(MappingEntry::Column(i)) if out_of_range(*i) => {
                errors.push(format!("Column index out of range for {field}"))
            }
            Some(MappingEntry::Column(i)) => check_header(field, *i, &mut errors),
        }
    }
    if header.is_some() {
        for field in meta.headers.keys().filter(|f| !f.is_required()) {
            match mapping.get(*field) {
                Some(MappingEntry::Static(_)) => (),
                Some(MappingEntry::Column(i)) if *i > 0 && !out_of_range(*i) => {
                    check_header(*field, *i, &mut errors)
                }
                _ => errors.push(format!("Column index out of range for {field}")),
            }
        }
    }
    errors
}

/// Streams one spreadsheet source into raw rows of an import batch
pub struct SheetImporter {
    rows: Arc<dyn RowSource>,
    raw: Arc<dyn RawProductRepository>,
    journal: Journal,
    chunk_size: u32,
}

impl SheetImporter {
    pub fn new(
        rows: Arc<dyn RowSource>,
        raw: Arc<dyn RawProductRepository>,
        journal: Journal,
        chunk_size: u32,
    ) -> Self {
        Self {
            rows,
            raw,
            journal,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn row_source(&self) -> &Arc<dyn RowSource> {
        &self.rows
    }

    async fn failed(
        &self,
        job_id: IdentityOf<Job>,
        message: &str,
        mut context: serde_json::Value,
        extra: serde_json::Value,
        err: ImportError,
    ) -> ImportError {
        if let (Some(c), serde_json::Value::Object(extra)) = (context.as_object_mut(), extra) {
            c.extend(extra);
        }
        self.journal.error(job_id, message, context).await;
        err
    }

    async fn scan_rows(&self, sheet: &SheetInfo) -> Result<Vec<Row>, ImportError> {
        let end = sheet
            .row_count
            .map(|c| c.clamp(1, HEADER_SCAN_ROWS))
            .unwrap_or(HEADER_SCAN_ROWS);
        Ok(self.rows.row_chunk(sheet, 1, end).await?)
    }

    /// Header row index after validating a stored mapping against the sheet
    async fn validate(
        &self,
        job_id: IdentityOf<Job>,
        source: &Source,
        sheet: &SheetInfo,
        mapping: &Mapping,
        meta: &MappingMeta,
        context: &serde_json::Value,
    ) -> Result<Option<u32>, ImportError> {
        if let Some(mapping_source_id) = meta.source_id.filter(|id| *id != source.id) {
            let err = MappingError::SourceMismatch { mapping_source_id };
            return Err(self
                .failed(
                    job_id,
                    "Mapping source mismatch",
                    context.clone(),
                    json!({"mapping_source_id": mapping_source_id}),
                    err.into(),
                )
                .await);
        }
        let header_row = meta.header_row.unwrap_or(1);
        let (header_index, errors) = if header_row > 0 {
            if sheet.row_count.map(|c| header_row > c).unwrap_or(false) {
                return Err(self
                    .failed(
                        job_id,
                        "Header row out of range",
                        context.clone(),
                        json!({"header_row": header_row}),
                        MappingError::HeaderRowOutOfRange { header_row }.into(),
                    )
                    .await);
            }
            let header = self
                .rows
                .row_chunk(sheet, header_row, header_row)
                .await?
                .into_iter()
                .next();
            let Some(header) = header else {
                return Err(self
                    .failed(
                        job_id,
                        "Header row not found",
                        context.clone(),
                        json!({"header_row": header_row}),
                        MappingError::HeaderRowNotFound { header_row }.into(),
                    )
                    .await);
            };
            let max_columns = sheet
                .column_count
                .filter(|c| *c > 0)
                .unwrap_or(header.len() as u32);
            (
                Some(header_row),
                check_mapping(mapping, meta, Some(header.as_slice()), max_columns),
            )
        } else {
            let sample = self.scan_rows(sheet).await?;
            let max_columns = sheet
                .column_count
                .filter(|c| *c > 0)
                .unwrap_or_else(|| sample.iter().map(Vec::len).max().unwrap_or(0) as u32);
            (None, check_mapping(mapping, meta, None, max_columns))
        };
        if !errors.is_empty() {
            return Err(self
                .failed(
                    job_id,
                    "Mapping validation failed",
                    context.clone(),
                    json!({"errors": errors}),
                    MappingError::Invalid { errors }.into(),
                )
                .await);
        }
        Ok(header_index)
    }

    /// Imports one source into the batch of `job_id`. Data problems of the
    /// source are journaled and returned as errors; raw rows written before
    /// a failure stay in the batch.
    pub async fn import_source(
        &self,
        job_id: IdentityOf<Job>,
        source: &Source,
        supplier_name: Option<&str>,
        stored: Option<&ColumnMapping>,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, ImportError> {
        let context = json!({
            "source_id": source.id,
            "source_name": source.name,
            "supplier_name": supplier_name,
        });
        if source.source_type != SourceType::GoogleSheet {
            return Err(self
                .failed(
                    job_id,
                    "Unsupported source type",
                    context,
                    json!({"source_type": source.source_type}),
                    ImportError::UnsupportedSourceType,
                )
                .await);
        }
        let meta = stored.map(ColumnMapping::effective_meta).unwrap_or_default();
        let sheet_name = meta
            .sheet_name
            .as_deref()
            .or(source.sheet_name.as_deref());
        let sheet = match self.rows.sheet_info(&source.source_url, sheet_name).await {
            Ok(sheet) => sheet,
            Err(err) => {
                let data = json!({"sheet_name": sheet_name, "error": err.to_string()});
                return Err(self
                    .failed(job_id, "Google sheet load failed", context, data, err.into())
                    .await);
            }
        };

        let mut mapping = stored.map(|m| m.mapping.clone());
        let mut header_index = None;
        if let Some(mapping) = &mapping {
            header_index = self
                .validate(job_id, source, &sheet, mapping, &meta, &context)
                .await?;
        } else {
            let scan = match sheet.row_count {
                Some(0) => Vec::new(),
                _ => self.scan_rows(&sheet).await?,
            };
            if scan.is_empty() {
                return Err(self
                    .failed(
                        job_id,
                        "Google sheet is empty",
                        context,
                        json!({}),
                        ImportError::EmptySheet,
                    )
                    .await);
            }
            if let Some((i, detected)) = scan
                .iter()
                .enumerate()
                .find_map(|(i, row)| detect_mapping(row).map(|m| (i, m)))
            {
                header_index = Some(i as u32 + 1);
                let mut data = context.clone();
                if let Some(d) = data.as_object_mut() {
                    d.insert("header_row".to_string(), json!(i + 1));
                    d.insert("mapping".to_string(), json!(detected));
                }
                self.journal
                    .info(job_id, "Header detected (Google Sheets)", data)
                    .await;
                mapping = Some(detected);
            }
        }
        let Some(mapping) = mapping else {
            return Err(self
                .failed(
                    job_id,
                    "Header not detected (Google Sheets)",
                    context,
                    json!({}),
                    ImportError::HeaderNotDetected,
                )
                .await);
        };

        let mut skips = SkipLog::new();
        let mut batch = Vec::with_capacity(RAW_BATCH_SIZE);
        let mut imported = 0;
        let mut has_data = false;
        let mut start = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Canceled);
            }
            if sheet.row_count.map(|c| start > c).unwrap_or(false) {
                break;
            }
            let end = start.saturating_add(self.chunk_size - 1);
            let end = sheet.row_count.map(|c| end.min(c)).unwrap_or(end);
            let rows = self.rows.row_chunk(&sheet, start, end).await?;
            if rows.is_empty() {
                break;
            }
            if !has_data {
                has_data = true;
                let mut data = context.clone();
                if let Some(d) = data.as_object_mut() {
                    d.insert("sheet_name".to_string(), json!(sheet.sheet_name));
                }
                self.journal.info(job_id, "Google sheet loaded", data).await;
            }
            for (i, row) in rows.into_iter().enumerate() {
                let row_number = start + i as u32;
                if header_index == Some(row_number) {
                    continue;
                }
                match map_row(&mapping, &row) {
                    Ok(mapped) => batch.push(RawProduct {
                        job_id,
                        supplier_id: source.supplier_id,
                        source_id: Some(source.id),
                        article: mapped.article,
                        size: mapped.size,
                        quantity: mapped.quantity,
                        price: mapped.price,
                        extra: mapped.extra,
                        row_data: json!(row),
                    }),
                    Err(skip) => skips.record(row_number, skip),
                }
                if batch.len() >= RAW_BATCH_SIZE {
                    imported += self.raw.add_batch(std::mem::take(&mut batch)).await?;
                }
            }
            start = start.saturating_add(self.chunk_size);
        }
        if !has_data {
            return Err(self
                .failed(
                    job_id,
                    "Google sheet is empty",
                    context,
                    json!({}),
                    ImportError::EmptySheet,
                )
                .await);
        }
        if !batch.is_empty() {
            imported += self.raw.add_batch(batch).await?;
        }
        let skipped_total = skips.total();
        if skipped_total > 0 {
            self.journal
                .warn(
                    job_id,
                    "Import skipped rows",
                    json!({
                        "source_id": source.id,
                        "skipped_total": skipped_total,
                        "skip_stats": skips.stats,
                        "samples": skips.samples,
                    }),
                )
                .await;
        }
        Ok(ImportOutcome {
            imported,
            mapping: Some(mapping),
        })
    }
}

/// Resolves sources and mappings from the catalog and feeds them to a [`SheetImporter`]
pub struct Importer {
    sheets: SheetImporter,
    suppliers: Arc<dyn SupplierRepository>,
    sources: Arc<dyn SourceRepository>,
    mappings: Arc<dyn ColumnMappingRepository>,
    journal: Journal,
}

impl Importer {
    pub fn new(
        sheets: SheetImporter,
        suppliers: Arc<dyn SupplierRepository>,
        sources: Arc<dyn SourceRepository>,
        mappings: Arc<dyn ColumnMappingRepository>,
        journal: Journal,
    ) -> Self {
        Self {
            sheets,
            suppliers,
            sources,
            mappings,
            journal,
        }
    }

    pub fn sheets(&self) -> &SheetImporter {
        &self.sheets
    }

    /// Source with its supplier, only when both are active
    pub async fn active_source(
        &self,
        id: IdentityOf<Source>,
    ) -> Result<(Source, Supplier), ImportError> {
        let source = self
            .sources
            .get_one(&id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(ImportError::SourceNotFound)?;
        let supplier = self
            .suppliers
            .get_one(&source.supplier_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(ImportError::SourceNotFound)?;
        Ok((source, supplier))
    }

    pub async fn import_source(
        &self,
        job_id: IdentityOf<Job>,
        source: &Source,
        supplier_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, ImportError> {
        let stored = self
            .mappings
            .find(&SourceMapping {
                supplier_id: source.supplier_id,
                source_id: source.id,
            })
            .await?;
        self.sheets
            .import_source(job_id, source, supplier_name, stored.as_ref(), cancel)
            .await
    }

    /// Imports every active source, optionally of one supplier. A failing
    /// source is recorded in its summary line and the rest continue.
    pub async fn import_sources(
        &self,
        job_id: IdentityOf<Job>,
        supplier_id: Option<IdentityOf<Supplier>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceSummary>, ImportError> {
        let names = self
            .suppliers
            .list()
            .await?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect::<HashMap<_, _>>();
        let sources = self.sources.select(&ActiveSources(supplier_id)).await?;
        let mut summary = Vec::with_capacity(sources.len());
        for source in sources {
            if cancel.is_cancelled() {
                return Err(ImportError::Canceled);
            }
            let supplier_name = names.get(&source.supplier_id).map(String::as_str);
            let res = self
                .import_source(job_id, &source, supplier_name, cancel)
                .await;
            let (imported, error) = match res {
                Ok(outcome) => (outcome.imported, None),
                Err(ImportError::Canceled) => return Err(ImportError::Canceled),
                Err(err) => {
                    if let ImportError::Storage(_) | ImportError::Source(_) = err {
                        self.journal
                            .error(
                                job_id,
                                "Import source failed",
                                json!({
                                    "source_id": source.id,
                                    "source_name": source.name,
                                    "supplier_name": supplier_name,
                                    "error": err.to_string(),
                                }),
                            )
                            .await;
                    }
                    (0, Some(err.to_string()))
                }
            };
            summary.push(SourceSummary {
                source_id: source.id,
                source_name: source.name,
                supplier_name: supplier_name.map(str::to_string),
                imported,
                error,
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory sheet; a missing grid size makes the importer stop on the first empty chunk
    pub struct FakeSheet {
        pub rows: Vec<Row>,
        pub report_size: bool,
        pub requests: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeSheet {
        pub fn new(rows: &[&[&str]]) -> Self {
            Self {
                rows: rows
                    .iter()
                    .map(|r| r.iter().map(|c| c.to_string()).collect())
                    .collect(),
                report_size: true,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RowSource for FakeSheet {
        async fn sheet_info(
            &self,
            _: &str,
            sheet_name: Option<&str>,
        ) -> Result<SheetInfo, RowSourceError> {
            if sheet_name == Some("missing") {
                return Err(RowSourceError::SheetRenamed);
            }
            Ok(SheetInfo {
                spreadsheet_id: "sheet".to_string(),
                sheet_name: sheet_name.unwrap_or("Sheet1").to_string(),
                row_count: self.report_size.then_some(self.rows.len() as u32),
                column_count: None,
            })
        }

        async fn row_chunk(
            &self,
            _: &SheetInfo,
            start: u32,
            end: u32,
        ) -> Result<Vec<Row>, RowSourceError> {
            self.requests.lock().expect("lock").push((start, end));
            let from = (start as usize - 1).min(self.rows.len());
            let to = (end as usize).min(self.rows.len());
            Ok(self.rows[from..to.max(from)].to_vec())
        }

        async fn sheet_names(&self, _: &str) -> Result<Vec<String>, RowSourceError> {
            Ok(vec!["Sheet1".to_string()])
        }
    }

    #[derive(Default)]
    pub struct MemoryRawProducts(pub Mutex<Vec<RawProduct>>);

    #[async_trait]
    impl RawProductRepository for MemoryRawProducts {
        async fn add_batch(&self, rows: Vec<RawProduct>) -> Result<u64, anyhow::Error> {
            let n = rows.len() as u64;
            self.0.lock().expect("lock").extend(rows);
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::journal::testing::MemoryLogRepository;
    use rust_decimal_macros::dec;

    fn source() -> Source {
        Source {
            id: 7,
            supplier_id: 3,
            name: "Main".to_string(),
            source_type: SourceType::GoogleSheet,
            source_url: "https://docs.google.com/spreadsheets/d/abcdefghijklmnop".to_string(),
            sheet_name: None,
            is_active: true,
        }
    }

    struct Setup {
        importer: SheetImporter,
        sheet: Arc<FakeSheet>,
        raw: Arc<MemoryRawProducts>,
        logs: Arc<MemoryLogRepository>,
    }

    fn setup(sheet: FakeSheet, chunk_size: u32) -> Setup {
        let sheet = Arc::new(sheet);
        let raw = Arc::new(MemoryRawProducts::default());
        let logs = Arc::new(MemoryLogRepository::default());
        let journal = Journal::new(logs.clone(), None);
        Setup {
            importer: SheetImporter::new(sheet.clone(), raw.clone(), journal, chunk_size),
            sheet,
            raw,
            logs,
        }
    }

    fn stored(mapping: Mapping, meta: MappingMeta) -> ColumnMapping {
        ColumnMapping {
            id: 1,
            supplier_id: 3,
            source_id: Some(7),
            mapping,
            header_row: None,
            mapping_meta: Some(meta),
        }
    }

    fn columns(article: u32, quantity: u32, price: u32) -> Mapping {
        let mut m = Mapping::default();
        m.set(Field::Article, MappingEntry::Column(article));
        m.set(Field::Quantity, MappingEntry::Column(quantity));
        m.set(Field::Price, MappingEntry::Column(price));
        m
    }

    #[tokio::test]
    async fn detects_header_and_skips_bad_rows() {
        let s = setup(
            FakeSheet::new(&[
                &["Прайс"],
                &["Артикул", "Розмір", "Кількість", "Ціна"],
                &["A1", "42,5", "", "1 234,50"],
                &["A2", "", "0", "100"],
                &["", "", "3", "100"],
                &["A3", "", "2", "abc"],
                &["", "", "", ""],
                &["A4", "", "5", "99"],
            ]),
            3,
        );
        let res = s
            .importer
            .import_source(1, &source(), Some("drop"), None, &CancellationToken::new())
            .await
            .expect("import succeeds");
        assert_eq!(2, res.imported);
        let raw = s.raw.0.lock().expect("lock").clone();
        assert_eq!("A1", raw[0].article);
        assert_eq!(Some("42.5".to_string()), raw[0].size);
        assert_eq!(1, raw[0].quantity);
        assert_eq!(dec!(1234.50), raw[0].price);
        assert_eq!(Some(7), raw[0].source_id);
        assert_eq!("A4", raw[1].article);

        let detected = s
            .logs
            .find("Header detected (Google Sheets)")
            .expect("header logged");
        assert_eq!(2, detected.data["header_row"]);
        let skipped = s.logs.find("Import skipped rows").expect("skips logged");
        assert_eq!(5, skipped.data["skipped_total"]);
        assert_eq!(1, skipped.data["skip_stats"]["empty_row"]);
        assert_eq!(1, skipped.data["skip_stats"]["zero_quantity"]);
        assert_eq!(1, skipped.data["skip_stats"]["missing_article"]);
        assert_eq!(2, skipped.data["skip_stats"]["missing_price"]);
        assert_eq!(0, skipped.data["skip_stats"]["invalid_price"]);
        assert_eq!(1, skipped.data["samples"][0]["row"]);
        assert_eq!("missing_price", skipped.data["samples"][0]["reason"]);
        assert_eq!(
            1,
            s.logs
                .messages()
                .iter()
                .filter(|m| *m == "Import skipped rows")
                .count()
        );
    }

    #[tokio::test]
    async fn batches_raw_rows_by_500() {
        let mut rows = vec![vec![
            "sku".to_string(),
            "qty".to_string(),
            "price".to_string(),
        ]];
        for i in 0..1203 {
            rows.push(vec![format!("A{i}"), "1".to_string(), "10".to_string()]);
        }
        let mut sheet = FakeSheet::new(&[]);
        sheet.rows = rows;
        let s = setup(sheet, 1000);
        let res = s
            .importer
            .import_source(1, &source(), None, None, &CancellationToken::new())
            .await
            .expect("import succeeds");
        assert_eq!(1203, res.imported);
        assert_eq!(1203, s.raw.0.lock().expect("lock").len());
        let requests = s.sheet.requests.lock().expect("lock").clone();
        assert_eq!(vec![(1, 20), (1, 1000), (1001, 1204)], requests);
    }

    #[tokio::test]
    async fn empty_and_headerless_sheets_fail() {
        let s = setup(FakeSheet::new(&[]), 10);
        let err = s
            .importer
            .import_source(1, &source(), None, None, &CancellationToken::new())
            .await
            .expect_err("empty sheet");
        assert!(matches!(err, ImportError::EmptySheet));
        assert_eq!("sheet is empty", err.to_string());

        let s = setup(FakeSheet::new(&[&["foo", "bar"], &["1", "2"]]), 10);
        let err = s
            .importer
            .import_source(1, &source(), None, None, &CancellationToken::new())
            .await
            .expect_err("no header");
        assert_eq!("header not detected", err.to_string());
        assert!(s.logs.find("Header not detected (Google Sheets)").is_some());
    }

    #[tokio::test]
    async fn stored_mapping_detects_header_drift() {
        let s = setup(
            FakeSheet::new(&[&["Код", "Ціна", "Кількість"], &["A1", "10", "1"]]),
            10,
        );
        let meta = MappingMeta {
            headers: [
                (Field::Article, "Код".to_string()),
                (Field::Quantity, "Кількість".to_string()),
                (Field::Price, "Ціна".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let mapping = stored(columns(1, 2, 3), meta);
        let err = s
            .importer
            .import_source(1, &source(), None, Some(&mapping), &CancellationToken::new())
            .await
            .expect_err("columns were swapped");
        let ImportError::Mapping(MappingError::Invalid { errors }) = err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(
            vec![
                "Header mismatch for quantity: expected \"Кількість\" got \"Ціна\"".to_string(),
                "Header mismatch for price: expected \"Ціна\" got \"Кількість\"".to_string(),
            ],
            errors
        );
        assert!(s.logs.find("Mapping validation failed").is_some());
    }

    #[tokio::test]
    async fn stored_mapping_bound_to_other_source_is_rejected() {
        let s = setup(FakeSheet::new(&[&["a"]]), 10);
        let meta = MappingMeta {
            source_id: Some(99),
            ..Default::default()
        };
        let err = s
            .importer
            .import_source(
                1,
                &source(),
                None,
                Some(&stored(columns(1, 2, 3), meta)),
                &CancellationToken::new(),
            )
            .await
            .expect_err("mismatch");
        assert_eq!("Mapping source mismatch. Please remap columns.", err.to_string());
    }

    #[tokio::test]
    async fn header_row_beyond_sheet_is_rejected() {
        let s = setup(FakeSheet::new(&[&["a"], &["b"]]), 10);
        let meta = MappingMeta {
            header_row: Some(5),
            ..Default::default()
        };
        let err = s
            .importer
            .import_source(
                1,
                &source(),
                None,
                Some(&stored(columns(1, 2, 3), meta)),
                &CancellationToken::new(),
            )
            .await
            .expect_err("out of range");
        assert!(matches!(
            err,
            ImportError::Mapping(MappingError::HeaderRowOutOfRange { header_row: 5 })
        ));
    }

    #[tokio::test]
    async fn headerless_mapping_imports_every_row() {
        let s = setup(FakeSheet::new(&[&["A1", "2", "10"], &["A2", "3", "20"]]), 10);
        let meta = MappingMeta {
            header_row: Some(0),
            ..Default::default()
        };
        let res = s
            .importer
            .import_source(
                1,
                &source(),
                None,
                Some(&stored(columns(1, 2, 3), meta)),
                &CancellationToken::new(),
            )
            .await
            .expect("import succeeds");
        assert_eq!(2, res.imported);
    }

    #[tokio::test]
    async fn canceled_import_stops_before_next_chunk() {
        let s = setup(FakeSheet::new(&[&["sku", "qty", "price"], &["A", "1", "1"]]), 10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = s
            .importer
            .import_source(1, &source(), None, None, &cancel)
            .await
            .expect_err("canceled");
        assert!(matches!(err, ImportError::Canceled));
        assert!(s.raw.0.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unknown_source_type_fails_fast() {
        let s = setup(FakeSheet::new(&[]), 10);
        let mut src = source();
        src.source_type = SourceType::Other("ftp".to_string());
        let err = s
            .importer
            .import_source(1, &src, None, None, &CancellationToken::new())
            .await
            .expect_err("unsupported");
        assert_eq!("unsupported source type", err.to_string());
        assert!(s.sheet.requests.lock().expect("lock").is_empty());
    }

    #[test]
    fn headerless_check_only_validates_bounds() {
        let mut mapping = columns(1, 4, 0);
        mapping.set(Field::Size, MappingEntry::Column(9));
        let errors = check_mapping(&mapping, &MappingMeta::default(), None, 3);
        assert_eq!(
            vec![
                "Column index out of range for quantity".to_string(),
                "Missing mapping for price".to_string(),
            ],
            errors
        );
    }

    #[test]
    fn static_required_values_must_not_be_blank() {
        let mut mapping = columns(1, 2, 3);
        mapping.set(Field::Quantity, MappingEntry::Static(" ".to_string()));
        let errors = check_mapping(&mapping, &MappingMeta::default(), None, 3);
        assert_eq!(vec!["Missing static value for quantity".to_string()], errors);
    }
}
