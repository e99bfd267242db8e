use catalog_types::mapping::{Field, Mapping, MappingEntry};
use derive_more::Display;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;

/// One spreadsheet row, cells as formatted text
pub type Row = Vec<String>;

static SYNONYMS: Lazy<Vec<(Field, Vec<String>)>> = Lazy::new(|| {
    [
        (Field::Article, &["артикул", "sku", "код", "код товара", "article"][..]),
        (Field::Size, &["розмір", "размер", "size"][..]),
        (
            Field::Quantity,
            &["кількість", "количество", "qty", "quantity", "остаток", "залишок"][..],
        ),
        (
            Field::Price,
            &["ціна", "цена", "price", "дроп ціна", "дроп цена", "drop price"][..],
        ),
        (Field::Extra, &["назва", "name", "title", "товар"][..]),
    ]
    .into_iter()
    .map(|(field, words)| (field, words.iter().map(normalize_header).collect()))
    .collect()
});

/// Case and diacritic insensitive form of a header cell
pub fn normalize_header<S: AsRef<str>>(value: S) -> String {
    let mut res = String::new();
    let mut gap = false;
    for c in value
        .as_ref()
        .chars()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .flat_map(char::to_lowercase)
    {
        if c.is_alphanumeric() {
            if gap && !res.is_empty() {
                res.push(' ');
            }
            gap = false;
            res.push(c);
        } else {
            gap = true;
        }
    }
    res
}

/// First matching column (1-based) per field, whatever was found
pub fn detect_columns(headers: &[String]) -> Mapping {
    let normalized = headers.iter().map(normalize_header).collect::<Vec<_>>();
    let mut mapping = Mapping::default();
    for (field, candidates) in SYNONYMS.iter() {
        if let Some(index) = normalized.iter().position(|h| candidates.contains(h)) {
            mapping.set(*field, MappingEntry::Column(index as u32 + 1));
        }
    }
    mapping
}

/// Mapping detected from a header row, if article, price and quantity all resolve
pub fn detect_mapping(headers: &[String]) -> Option<Mapping> {
    Some(detect_columns(headers)).filter(Mapping::has_required_fields)
}

/// Static entries always win, column entries read the 1-based cell
pub fn resolve_value<'a>(entry: Option<&'a MappingEntry>, row: &'a [String]) -> Option<&'a str> {
    match entry? {
        MappingEntry::Static(v) => Some(v.as_str()),
        MappingEntry::Column(0) => None,
        MappingEntry::Column(i) => row.get(*i as usize - 1).map(String::as_str),
    }
}

pub fn has_mapped_values(mapping: &Mapping, row: &[String]) -> bool {
    mapping.columns().any(|(_, i)| {
        row.get(i as usize - 1)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    })
}

/// Strips spaces and currency noise, aligns the decimal separator to `.`
pub fn normalize_numeric<S: AsRef<str>>(value: S) -> String {
    let s = value
        .as_ref()
        .chars()
        .filter(|c| *c != '\u{a0}' && !c.is_whitespace())
        .collect::<String>();
    let s = match (s.contains(','), s.contains('.')) {
        (true, true) => s.replace(',', ""),
        (true, false) => s.replace(',', "."),
        _ => s,
    };
    s.chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

/// Leading `-?\d+(\.\d+)?` of a normalized value
fn numeric_prefix(s: &str, fraction: bool) -> &str {
    let bytes = s.as_bytes();
    let mut end = usize::from(bytes.first() == Some(&b'-'));
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == int_start {
        return "";
    }
    if fraction && end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    &s[..end]
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    #[display("empty_row")]
    EmptyRow,
    #[display("missing_article")]
    MissingArticle,
    #[display("missing_price")]
    MissingPrice,
    #[display("invalid_price")]
    InvalidPrice,
    #[display("zero_quantity")]
    ZeroQuantity,
    #[display("invalid_quantity")]
    InvalidQuantity,
}

impl SkipReason {
    pub const ALL: [SkipReason; 6] = [
        SkipReason::EmptyRow,
        SkipReason::MissingArticle,
        SkipReason::MissingPrice,
        SkipReason::InvalidPrice,
        SkipReason::ZeroQuantity,
        SkipReason::InvalidQuantity,
    ];
}

/// Blank means "in stock, count unknown" and defaults to 1.
/// Fractions are truncated: `12,5` gives 12.
pub fn parse_quantity(raw: Option<&str>) -> Result<i32, SkipReason> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw == "0" {
        return Err(SkipReason::ZeroQuantity);
    }
    if raw.is_empty() {
        return Ok(1);
    }
    let normalized = normalize_numeric(raw);
    match numeric_prefix(&normalized, false).parse::<i32>() {
        Ok(q) if q > 0 => Ok(q),
        _ => Err(SkipReason::InvalidQuantity),
    }
}

pub fn parse_price(raw: Option<&str>) -> Result<Decimal, SkipReason> {
    let normalized = normalize_numeric(raw.unwrap_or_default());
    if normalized.is_empty() {
        return Err(SkipReason::MissingPrice);
    }
    match Decimal::from_str(numeric_prefix(&normalized, true)) {
        Ok(p) if p > Decimal::ZERO => Ok(p.normalize()),
        _ => Err(SkipReason::InvalidPrice),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub article: String,
    pub size: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
    pub extra: String,
}

/// Why a row was rejected, with the raw values an operator needs to find it
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RowSkip {
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
}

impl RowSkip {
    fn new(reason: SkipReason) -> Self {
        Self {
            reason,
            article: None,
            price: None,
            quantity: None,
        }
    }
}

/// Checks run in order: empty row, article, quantity, price
pub fn map_row(mapping: &Mapping, row: &[String]) -> Result<MappedRow, RowSkip> {
    if !has_mapped_values(mapping, row) {
        return Err(RowSkip::new(SkipReason::EmptyRow));
    }
    let article = resolve_value(mapping.get(Field::Article), row)
        .map(str::trim)
        .unwrap_or_default();
    if article.is_empty() {
        return Err(RowSkip::new(SkipReason::MissingArticle));
    }
    let raw_quantity = resolve_value(mapping.get(Field::Quantity), row);
    let raw_price = resolve_value(mapping.get(Field::Price), row);
    let skip = |reason| RowSkip {
        reason,
        article: Some(article.to_string()),
        price: raw_price.map(str::to_string),
        quantity: raw_quantity.map(str::to_string),
    };
    let quantity = parse_quantity(raw_quantity).map_err(skip)?;
    let price = parse_price(raw_price).map_err(skip)?;
    let size = resolve_value(mapping.get(Field::Size), row)
        .map(catalog_types::normalize_size)
        .filter(|s| !s.is_empty());
    let extra = resolve_value(mapping.get(Field::Extra), row)
        .map(|e| e.trim().to_string())
        .unwrap_or_default();
    Ok(MappedRow {
        article: article.to_string(),
        size,
        quantity,
        price,
        extra,
    })
}
