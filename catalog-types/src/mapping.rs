use derive_more::Display;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use typesafe_repository::macros::Id;
use typesafe_repository::{Dao, GetIdentity, Identity, IdentityOf, RefIdentity, SelectBy, Selector};

use crate::supplier::{Source, Supplier};

pub mod repository;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    #[display("article")]
    Article,
    #[display("size")]
    Size,
    #[display("quantity")]
    Quantity,
    #[display("price")]
    Price,
    #[display("extra")]
    Extra,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Article,
        Field::Size,
        Field::Quantity,
        Field::Price,
        Field::Extra,
    ];
    pub const REQUIRED: [Field; 3] = [Field::Article, Field::Quantity, Field::Price];

    pub fn is_required(&self) -> bool {
        Self::REQUIRED.contains(self)
    }
}

/// Where the value of a logical field comes from
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "EntryRepr")]
pub enum MappingEntry {
    /// Literal applied to every row
    Static(String),
    /// 1-based column index
    Column(u32),
}

impl MappingEntry {
    pub fn is_set(&self) -> bool {
        match self {
            Self::Static(v) => !v.trim().is_empty(),
            Self::Column(i) => *i > 0,
        }
    }
}

impl Serialize for MappingEntry {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Column(index) => s.serialize_u32(*index),
            Self::Static(value) => {
                let mut st = s.serialize_struct("MappingEntry", 2)?;
                st.serialize_field("type", "static")?;
                st.serialize_field("value", value)?;
                st.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntryRepr {
    Index(u32),
    Tagged {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        index: Option<serde_json::Value>,
    },
    Text(String),
}

fn value_as_index(v: &serde_json::Value) -> Option<u32> {
    match v {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_text(v: Option<serde_json::Value>) -> String {
    match v {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl TryFrom<EntryRepr> for MappingEntry {
    type Error = String;

    fn try_from(repr: EntryRepr) -> Result<Self, Self::Error> {
        match repr {
            EntryRepr::Index(i) => Ok(Self::Column(i)),
            EntryRepr::Text(s) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                    trimmed
                        .parse()
                        .map(Self::Column)
                        .map_err(|err| format!("Invalid column index {trimmed}: {err}"))
                } else {
                    Ok(Self::Static(trimmed.to_string()))
                }
            }
            EntryRepr::Tagged { kind, value, index } => match kind.as_deref() {
                Some("static") => Ok(Self::Static(value_as_text(value))),
                Some("column") => index
                    .as_ref()
                    .or(value.as_ref())
                    .and_then(value_as_index)
                    .map(Self::Column)
                    .ok_or_else(|| "Column mapping without index".to_string()),
                Some(other) => Err(format!("Unknown mapping entry type {other}")),
                None => match (index.as_ref().and_then(value_as_index), value) {
                    (Some(i), _) => Ok(Self::Column(i)),
                    (None, Some(v)) => Ok(Self::Static(value_as_text(Some(v)))),
                    (None, None) => Err("Empty mapping entry".to_string()),
                },
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Mapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<MappingEntry>,
}

impl Mapping {
    pub fn get(&self, field: Field) -> Option<&MappingEntry> {
        match field {
            Field::Article => self.article.as_ref(),
            Field::Size => self.size.as_ref(),
            Field::Quantity => self.quantity.as_ref(),
            Field::Price => self.price.as_ref(),
            Field::Extra => self.extra.as_ref(),
        }
    }

    pub fn set(&mut self, field: Field, entry: MappingEntry) {
        let slot = match field {
            Field::Article => &mut self.article,
            Field::Size => &mut self.size,
            Field::Quantity => &mut self.quantity,
            Field::Price => &mut self.price,
            Field::Extra => &mut self.extra,
        };
        *slot = Some(entry);
    }

    pub fn has_required_fields(&self) -> bool {
        Field::REQUIRED
            .iter()
            .all(|f| self.get(*f).map(MappingEntry::is_set).unwrap_or(false))
    }

    /// Column-bound fields with their 1-based index
    pub fn columns(&self) -> impl Iterator<Item = (Field, u32)> + '_ {
        Field::ALL.into_iter().filter_map(|f| match self.get(f) {
            Some(MappingEntry::Column(i)) if *i > 0 => Some((f, *i)),
            _ => None,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MappingMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<IdentityOf<Source>>,
    #[serde(
        default,
        deserialize_with = "crate::de_blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub sheet_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_row: Option<u32>,
    /// Header text captured per field when the mapping was saved
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<Field, String>,
}

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq, Eq)]
#[Id(get_id, ref_id)]
pub struct ColumnMapping {
    #[id]
    pub id: i64,
    pub supplier_id: IdentityOf<Supplier>,
    pub source_id: Option<IdentityOf<Source>>,
    pub mapping: Mapping,
    pub header_row: Option<u32>,
    pub mapping_meta: Option<MappingMeta>,
}

impl ColumnMapping {
    /// Meta as seen by the importer: the record's own source and header row fill in gaps
    pub fn effective_meta(&self) -> MappingMeta {
        let mut meta = self.mapping_meta.clone().unwrap_or_default();
        match self.source_id {
            None => meta.source_id = None,
            Some(id) => {
                meta.source_id.get_or_insert(id);
            }
        }
        if meta.header_row.is_none() {
            meta.header_row = self.header_row;
        }
        meta
    }
}

#[derive(Debug, Clone)]
pub struct NewColumnMapping {
    pub supplier_id: IdentityOf<Supplier>,
    pub source_id: Option<IdentityOf<Source>>,
    pub mapping: Mapping,
    pub header_row: Option<u32>,
    pub mapping_meta: Option<MappingMeta>,
}

impl Dao for NewColumnMapping {
    type Parent = ColumnMapping;
    type Args = IdentityOf<ColumnMapping>;

    fn enrich(self, id: Self::Args) -> ColumnMapping {
        ColumnMapping {
            id,
            supplier_id: self.supplier_id,
            source_id: self.source_id,
            mapping: self.mapping,
            header_row: self.header_row,
            mapping_meta: self.mapping_meta,
        }
    }
}

/// Newest mapping for a supplier. With a source, prefers one bound to it and
/// falls back to the newest mapping without a source.
#[derive(Debug, Clone, Copy)]
pub struct CurrentMapping {
    pub supplier_id: IdentityOf<Supplier>,
    pub source_id: Option<IdentityOf<Source>>,
}

impl Selector for CurrentMapping {}
impl SelectBy<CurrentMapping> for ColumnMapping {}

/// Newest mapping bound to exactly this source, used by importers
#[derive(Debug, Clone, Copy)]
pub struct SourceMapping {
    pub supplier_id: IdentityOf<Supplier>,
    pub source_id: IdentityOf<Source>,
}

impl Selector for SourceMapping {}
impl SelectBy<SourceMapping> for ColumnMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stored_mapping_shapes() {
        let mapping: Mapping = serde_json::from_str(
            r#"{"article": 1, "size": "4", "quantity": {"type": "static", "value": "5"},
                "price": {"type": "column", "index": 3}, "extra": "  Літо  "}"#,
        )
        .expect("valid mapping");
        assert_eq!(Some(&MappingEntry::Column(1)), mapping.get(Field::Article));
        assert_eq!(Some(&MappingEntry::Column(4)), mapping.get(Field::Size));
        assert_eq!(
            Some(&MappingEntry::Static("5".to_string())),
            mapping.get(Field::Quantity)
        );
        assert_eq!(Some(&MappingEntry::Column(3)), mapping.get(Field::Price));
        assert_eq!(
            Some(&MappingEntry::Static("Літо".to_string())),
            mapping.get(Field::Extra)
        );
    }

    #[test]
    fn serializes_columns_as_plain_numbers() {
        let mut mapping = Mapping::default();
        mapping.set(Field::Article, MappingEntry::Column(2));
        mapping.set(Field::Price, MappingEntry::Static("100".to_string()));
        let json = serde_json::to_value(&mapping).expect("serializable");
        assert_eq!(
            serde_json::json!({"article": 2, "price": {"type": "static", "value": "100"}}),
            json
        );
    }

    #[test]
    fn required_fields_need_usable_entries() {
        let mut mapping = Mapping::default();
        mapping.set(Field::Article, MappingEntry::Column(1));
        mapping.set(Field::Price, MappingEntry::Column(2));
        assert!(!mapping.has_required_fields());
        mapping.set(Field::Quantity, MappingEntry::Static(" ".to_string()));
        assert!(!mapping.has_required_fields());
        mapping.set(Field::Quantity, MappingEntry::Static("1".to_string()));
        assert!(mapping.has_required_fields());
        mapping.set(Field::Article, MappingEntry::Column(0));
        assert!(!mapping.has_required_fields());
    }

    #[test]
    fn effective_meta_fills_gaps_from_record() {
        let record = ColumnMapping {
            id: 1,
            supplier_id: 2,
            source_id: Some(3),
            mapping: Mapping::default(),
            header_row: Some(2),
            mapping_meta: Some(MappingMeta {
                sheet_name: Some("Drop".to_string()),
                ..Default::default()
            }),
        };
        let meta = record.effective_meta();
        assert_eq!(Some(3), meta.source_id);
        assert_eq!(Some(2), meta.header_row);
        assert_eq!(Some("Drop".to_string()), meta.sheet_name);

        let unbound = ColumnMapping {
            source_id: None,
            mapping_meta: Some(MappingMeta {
                source_id: Some(9),
                header_row: Some(0),
                ..Default::default()
            }),
            ..record
        };
        let meta = unbound.effective_meta();
        assert_eq!(None, meta.source_id);
        assert_eq!(Some(0), meta.header_row);
    }
}
