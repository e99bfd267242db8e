use crate::mapping::{ColumnMapping, CurrentMapping, NewColumnMapping, SourceMapping};
use typesafe_repository::async_ops::{Create, Find, Get};
use typesafe_repository::Repository;

pub trait ColumnMappingRepository:
    Repository<ColumnMapping, Error = anyhow::Error>
    + Create<ColumnMapping, NewColumnMapping>
    + Get<ColumnMapping>
    + Find<ColumnMapping, CurrentMapping>
    + Find<ColumnMapping, SourceMapping>
    + Send
    + Sync
{
}
