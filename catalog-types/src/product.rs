use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use typesafe_repository::macros::Id;
use typesafe_repository::{Dao, GetIdentity, Identity, IdentityOf, RefIdentity, SelectBy, Selector};

use crate::job::Job;
use crate::supplier::{Source, Supplier};

pub mod repository;

/// Accepted spreadsheet row of one import batch
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawProduct {
    pub job_id: IdentityOf<Job>,
    pub supplier_id: IdentityOf<Supplier>,
    pub source_id: Option<IdentityOf<Source>>,
    pub article: String,
    pub size: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
    pub extra: String,
    /// Row cells as fetched from the source
    pub row_data: serde_json::Value,
}

/// Row of the current priced catalog
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FinalProduct {
    pub job_id: IdentityOf<Job>,
    pub article: String,
    pub size: Option<String>,
    pub quantity: i32,
    pub price_base: Decimal,
    pub price_final: Decimal,
    pub extra: String,
    pub supplier_id: IdentityOf<Supplier>,
}

/// Identifies a catalog item. Blank size equals no size.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProductKey {
    pub article: String,
    pub size: Option<String>,
}

impl ProductKey {
    pub fn new<A: Into<String>>(article: A, size: Option<String>) -> Self {
        Self {
            article: article.into(),
            size: crate::blank_as_none(size),
        }
    }
}

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq, Eq)]
#[Id(get_id, ref_id)]
pub struct PriceOverride {
    #[id]
    pub id: i64,
    pub article: String,
    pub size: Option<String>,
    pub price_final: Decimal,
    pub notes: Option<String>,
    pub is_active: bool,
}

impl PriceOverride {
    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.article.clone(), self.size.clone())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewPriceOverride {
    pub article: String,
    #[serde(default, deserialize_with = "crate::de_blank_as_none")]
    pub size: Option<String>,
    pub price_final: Decimal,
    #[serde(default, deserialize_with = "crate::de_blank_as_none")]
    pub notes: Option<String>,
}

impl NewPriceOverride {
    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.article.clone(), self.size.clone())
    }
}

impl Dao for NewPriceOverride {
    type Parent = PriceOverride;
    type Args = IdentityOf<PriceOverride>;

    fn enrich(self, id: Self::Args) -> PriceOverride {
        PriceOverride {
            id,
            article: self.article,
            size: self.size,
            price_final: self.price_final,
            notes: self.notes,
            is_active: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PriceOverridePatch {
    pub price_final: Option<Decimal>,
    pub notes: Option<String>,
    pub is_active: Option<bool>,
}

impl PriceOverridePatch {
    pub fn is_empty(&self) -> bool {
        self.price_final.is_none() && self.notes.is_none() && self.is_active.is_none()
    }

    pub fn apply(&self, mut o: PriceOverride) -> PriceOverride {
        if let Some(price) = self.price_final {
            o.price_final = price;
        }
        if let Some(notes) = &self.notes {
            o.notes = crate::blank_as_none(Some(notes.clone()));
        }
        if let Some(active) = self.is_active {
            o.is_active = active;
        }
        o
    }
}

/// Newest override for an (article, size) pair regardless of state
impl Selector for ProductKey {}
impl SelectBy<ProductKey> for PriceOverride {}

#[derive(Deserialize, Debug, Clone)]
pub struct OverrideSearch {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

pub fn default_page_limit() -> i64 {
    100
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: i64,
    pub rows: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn blank_size_keys_match_missing_size() {
        assert_eq!(
            ProductKey::new("A1", Some(" ".to_string())),
            ProductKey::new("A1", None)
        );
    }

    #[test]
    fn patch_keeps_untouched_fields() {
        let o = NewPriceOverride {
            article: "A1".to_string(),
            size: Some("42".to_string()),
            price_final: dec!(990),
            notes: Some("promo".to_string()),
        }
        .enrich(5);
        let patched = PriceOverridePatch {
            is_active: Some(false),
            ..Default::default()
        }
        .apply(o.clone());
        assert!(!patched.is_active);
        assert_eq!(o.price_final, patched.price_final);
        assert_eq!(o.notes, patched.notes);
    }
}
