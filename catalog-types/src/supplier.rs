use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use typesafe_repository::macros::Id;
use typesafe_repository::{Dao, GetIdentity, Identity, IdentityOf, RefIdentity, SelectBy, Selector};

pub mod repository;

pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_SUPPLIER_FILTER: &str = "drop";

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq, Eq)]
#[Id(get_id, ref_id)]
pub struct Supplier {
    #[id]
    pub id: i64,
    pub name: String,
    pub markup_percent: Decimal,
    /// Lower value wins when several suppliers sell the same item
    pub priority: i32,
    pub min_profit_enabled: bool,
    pub min_profit_amount: Decimal,
    pub is_active: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewSupplier {
    pub name: String,
    #[serde(default)]
    pub markup_percent: Decimal,
    pub priority: Option<i32>,
    pub min_profit_enabled: Option<bool>,
    pub min_profit_amount: Option<Decimal>,
}

impl Dao for NewSupplier {
    type Parent = Supplier;
    type Args = IdentityOf<Supplier>;

    fn enrich(self, id: Self::Args) -> Supplier {
        let min_profit_enabled = self.min_profit_enabled.unwrap_or(true);
        let min_profit_amount = if min_profit_enabled {
            self.min_profit_amount.unwrap_or_default().max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        Supplier {
            id,
            name: self.name,
            markup_percent: self.markup_percent,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            min_profit_enabled,
            min_profit_amount,
            is_active: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SupplierPatch {
    pub name: Option<String>,
    pub markup_percent: Option<Decimal>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub min_profit_enabled: Option<bool>,
    pub min_profit_amount: Option<Decimal>,
}

impl SupplierPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.markup_percent.is_none()
            && self.priority.is_none()
            && self.is_active.is_none()
            && self.min_profit_enabled.is_none()
            && self.min_profit_amount.is_none()
    }

    pub fn apply(self, mut supplier: Supplier) -> Supplier {
        if let Some(name) = self.name {
            supplier.name = name;
        }
        if let Some(markup) = self.markup_percent {
            supplier.markup_percent = markup;
        }
        if let Some(priority) = self.priority {
            supplier.priority = priority;
        }
        if let Some(active) = self.is_active {
            supplier.is_active = active;
        }
        match self.min_profit_enabled {
            Some(false) => {
                supplier.min_profit_enabled = false;
                supplier.min_profit_amount = Decimal::ZERO;
            }
            enabled => {
                if let Some(enabled) = enabled {
                    supplier.min_profit_enabled = enabled;
                }
                if let Some(amount) = self.min_profit_amount {
                    supplier.min_profit_amount = amount.max(Decimal::ZERO);
                }
            }
        }
        supplier
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum SourceType {
    GoogleSheet,
    Other(String),
}

impl SourceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GoogleSheet => "google_sheet",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for SourceType {
    fn from(s: String) -> Self {
        match s.trim() {
            "google_sheet" => Self::GoogleSheet,
            _ => Self::Other(s),
        }
    }
}

impl From<SourceType> for String {
    fn from(t: SourceType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Id, Debug, Clone, PartialEq, Eq)]
#[Id(get_id, ref_id)]
pub struct Source {
    #[id]
    pub id: i64,
    pub supplier_id: IdentityOf<Supplier>,
    pub name: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub sheet_name: Option<String>,
    pub is_active: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewSource {
    pub supplier_id: IdentityOf<Supplier>,
    pub source_type: SourceType,
    pub source_url: String,
    #[serde(default, deserialize_with = "crate::de_blank_as_none")]
    pub sheet_name: Option<String>,
    #[serde(default, deserialize_with = "crate::de_blank_as_none")]
    pub name: Option<String>,
}

impl Dao for NewSource {
    type Parent = Source;
    type Args = IdentityOf<Source>;

    fn enrich(self, id: Self::Args) -> Source {
        let name = self
            .name
            .or_else(|| self.sheet_name.clone())
            .unwrap_or_else(|| "Source".to_string());
        Source {
            id,
            supplier_id: self.supplier_id,
            name,
            source_type: self.source_type,
            source_url: self.source_url,
            sheet_name: self.sheet_name,
            is_active: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SourcePatch {
    pub supplier_id: Option<IdentityOf<Supplier>>,
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub sheet_name: Option<String>,
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

impl SourcePatch {
    pub fn is_empty(&self) -> bool {
        self.supplier_id.is_none()
            && self.source_type.is_none()
            && self.source_url.is_none()
            && self.sheet_name.is_none()
            && self.name.is_none()
            && self.is_active.is_none()
    }

    pub fn apply(self, mut source: Source) -> Source {
        if let Some(supplier_id) = self.supplier_id {
            source.supplier_id = supplier_id;
        }
        if let Some(t) = self.source_type {
            source.source_type = t;
        }
        if let Some(url) = self.source_url {
            source.source_url = url;
        }
        if let Some(sheet) = self.sheet_name {
            source.sheet_name = crate::blank_as_none(Some(sheet));
        }
        if let Some(name) = self.name {
            source.name = name;
        }
        if let Some(active) = self.is_active {
            source.is_active = active;
        }
        source
    }
}

/// Active sources of active suppliers, ordered by id, optionally limited to one supplier
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveSources(pub Option<IdentityOf<Supplier>>);

impl Selector for ActiveSources {}
impl SelectBy<ActiveSources> for Source {}

/// Every source regardless of state, optionally limited to one supplier
#[derive(Debug, Clone, Copy, Default)]
pub struct SourcesOf(pub Option<IdentityOf<Supplier>>);

impl Selector for SourcesOf {}
impl SelectBy<SourcesOf> for Source {}
