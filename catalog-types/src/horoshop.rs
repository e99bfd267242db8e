use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::job::Job;
use typesafe_repository::IdentityOf;

pub const PRESENCE_IN_STOCK: &str = "В наявності";
pub const PRESENCE_OUT_OF_STOCK: &str = "Немає в наявності";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Presence {
    #[display("В наявності")]
    #[serde(rename = "В наявності")]
    InStock,
    #[display("Немає в наявності")]
    #[serde(rename = "Немає в наявності")]
    OutOfStock,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InStock => PRESENCE_IN_STOCK,
            Self::OutOfStock => PRESENCE_OUT_OF_STOCK,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            PRESENCE_IN_STOCK => Some(Self::InStock),
            PRESENCE_OUT_OF_STOCK => Some(Self::OutOfStock),
            _ => None,
        }
    }
}

/// Last known remote state of one storefront article
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub article: String,
    pub supplier: Option<String>,
    /// Raw UA presence label as reported by the storefront
    pub presence_ua: Option<String>,
    pub display_in_showcase: Option<bool>,
    pub parent_article: Option<String>,
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl MirrorRow {
    pub fn presence(&self) -> Option<Presence> {
        self.presence_ua.as_deref().and_then(Presence::parse)
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent_article
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn supplier_is(&self, supplier: &str) -> bool {
        self.supplier
            .as_deref()
            .map(|s| s.trim().to_lowercase() == supplier.trim().to_lowercase())
            .unwrap_or(false)
    }
}

/// Desired remote state of one article computed by an export
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PreviewRow {
    pub article: String,
    pub supplier: String,
    pub presence_ua: Presence,
    pub display_in_showcase: bool,
    /// Empty when the article has no parent
    pub parent_article: String,
    pub price: Option<Decimal>,
}

/// Preview row as stored, with the export job that produced it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredPreviewRow {
    pub id: i64,
    pub job_id: IdentityOf<Job>,
    #[serde(flatten)]
    pub row: PreviewRow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_serializes_as_ua_label() {
        assert_eq!(
            serde_json::json!("Немає в наявності"),
            serde_json::to_value(Presence::OutOfStock).expect("serializable")
        );
        assert_eq!(Some(Presence::InStock), Presence::parse(" В наявності "));
        assert_eq!(None, Presence::parse("Під замовлення"));
    }

    #[test]
    fn supplier_match_ignores_case() {
        let row = MirrorRow {
            article: "A1".to_string(),
            supplier: Some("Drop".to_string()),
            presence_ua: None,
            display_in_showcase: None,
            parent_article: Some("  ".to_string()),
            price: None,
            raw: None,
        };
        assert!(row.supplier_is("drop"));
        assert!(!row.supplier_is("other"));
        assert_eq!(None, row.parent());
    }
}
