use crate::product::{
    NewPriceOverride, OverrideSearch, Page, PriceOverride, ProductKey, RawProduct,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use typesafe_repository::async_ops::{Create, Find, Get, Save};
use typesafe_repository::Repository;

#[async_trait]
pub trait RawProductRepository: Send + Sync {
    /// Persists accepted rows, returns the number written
    async fn add_batch(&self, rows: Vec<RawProduct>) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait PriceOverrideRepository:
    Repository<PriceOverride, Error = anyhow::Error>
    + Create<PriceOverride, NewPriceOverride>
    + Get<PriceOverride>
    + Save<PriceOverride>
    + Find<PriceOverride, ProductKey>
    + Send
    + Sync
{
    async fn search(&self, q: &OverrideSearch) -> Result<Page<PriceOverride>, anyhow::Error>;
}

/// Price maintenance on the live final catalog
#[async_trait]
pub trait FinalPriceRepository: Send + Sync {
    async fn set_price(&self, key: &ProductKey, price: Decimal) -> Result<u64, anyhow::Error>;
    /// Restores the markup-derived price of matching rows
    async fn recompute_price(&self, key: &ProductKey) -> Result<u64, anyhow::Error>;
}
