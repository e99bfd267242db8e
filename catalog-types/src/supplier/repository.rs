use crate::supplier::{ActiveSources, NewSource, NewSupplier, Source, SourcesOf, Supplier};
use typesafe_repository::async_ops::{Create, Get, List, Save, Select};
use typesafe_repository::Repository;

pub trait SupplierRepository:
    Repository<Supplier, Error = anyhow::Error>
    + Create<Supplier, NewSupplier>
    + Get<Supplier>
    + List<Supplier>
    + Save<Supplier>
    + Send
    + Sync
{
}

pub trait SourceRepository:
    Repository<Source, Error = anyhow::Error>
    + Create<Source, NewSource>
    + Get<Source>
    + Save<Source>
    + Select<Source, ActiveSources>
    + Select<Source, SourcesOf>
    + Send
    + Sync
{
}
