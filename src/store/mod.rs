//! Storage collaborators.
//!
//! The spatial index, tile resolver and feature tile extractor depend only on
//! these traits. `SqliteGeoPackage` implements all of them over an sqlx pool.

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::bounds::GeometryEnvelope;
use crate::error::Result;
use crate::model::{
    ExtensionRecord, FeatureRow, FeatureTable, SpatialIndexEntry, SpatialReferenceSystem,
    TableIndex, TileMatrix, TileMatrixSet, TileRange, TileRow,
};

mod sqlite;

pub use sqlite::SqliteGeoPackage;

#[async_trait]
pub trait SrsStore: Send + Sync {
    async fn spatial_reference_system(&self, srs_id: i64)
        -> Result<Option<SpatialReferenceSystem>>;

    /// Inserts or replaces a definition. Cached projections for the id are dropped.
    async fn put_spatial_reference_system(&self, srs: &SpatialReferenceSystem) -> Result<()>;
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Fails with `TableNotFound` for tables without a registered geometry column.
    async fn feature_table(&self, table: &str) -> Result<FeatureTable>;

    async fn feature_tables(&self) -> Result<Vec<String>>;

    async fn get_row(&self, table: &FeatureTable, id: i64) -> Result<Option<FeatureRow>>;

    /// Streams every row of the table through `visitor`, in id order.
    async fn for_each_row(
        &self,
        table: &FeatureTable,
        visitor: &mut (dyn FnMut(FeatureRow) + Send),
    ) -> Result<()>;

    async fn count_rows(&self, table: &FeatureTable) -> Result<u64>;

    /// Opens a unit of work pairing row writes with index entry changes.
    async fn begin(&self) -> Result<Box<dyn FeatureTransaction>>;
}

/// Row writes and index entry changes that commit or roll back together.
///
/// Dropping the transaction without calling `commit` rolls it back.
#[async_trait]
pub trait FeatureTransaction: Send {
    /// Returns the id of the written row.
    async fn insert(&mut self, table: &FeatureTable, row: &FeatureRow) -> Result<i64>;

    async fn update(&mut self, table: &FeatureTable, row: &FeatureRow) -> Result<()>;

    async fn delete(&mut self, table: &FeatureTable, id: i64) -> Result<()>;

    async fn put_index_entry(&mut self, entry: &SpatialIndexEntry) -> Result<()>;

    async fn remove_index_entry(&mut self, table: &str, row_id: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn table_index(&self, table: &str) -> Result<Option<TableIndex>>;

    async fn has_table(&self, name: &str) -> Result<bool>;

    /// Replaces every entry of the table, records the completion timestamp and
    /// writes the extension record, all in one transaction.
    async fn replace_index(
        &self,
        index: &TableIndex,
        extension: &ExtensionRecord,
        entries: &[SpatialIndexEntry],
    ) -> Result<()>;

    /// Removes entries, timestamp and extension record in one transaction.
    async fn drop_index(&self, extension: &ExtensionRecord) -> Result<()>;

    /// Row ids whose geometry index envelope intersects `envelope`, boundary inclusive.
    fn query_index<'a>(
        &'a self,
        table: &str,
        envelope: &GeometryEnvelope,
    ) -> BoxStream<'a, Result<i64>>;

    /// Row ids whose R-tree envelope intersects `envelope`, boundary inclusive.
    fn query_rtree<'a>(
        &'a self,
        rtree_table: &str,
        envelope: &GeometryEnvelope,
    ) -> BoxStream<'a, Result<i64>>;
}

#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn extension(
        &self,
        extension_name: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<ExtensionRecord>>;

    async fn extensions_for_table(&self, table: &str) -> Result<Vec<ExtensionRecord>>;

    async fn put_extension(&self, record: &ExtensionRecord) -> Result<()>;

    async fn delete_extension(&self, record: &ExtensionRecord) -> Result<()>;
}

#[async_trait]
pub trait TileStore: Send + Sync {
    /// Fails with `TileNotFound` when the table has no tile matrix set.
    async fn tile_matrix_set(&self, table: &str) -> Result<TileMatrixSet>;

    /// Matrices ordered by zoom level.
    async fn tile_matrices(&self, table: &str) -> Result<Vec<TileMatrix>>;

    async fn get_tile(
        &self,
        table: &str,
        zoom_level: i64,
        tile_column: i64,
        tile_row: i64,
    ) -> Result<Option<TileRow>>;

    async fn count_tiles(&self, table: &str, zoom_level: i64, range: &TileRange) -> Result<u64>;

    async fn tiles_in_range(
        &self,
        table: &str,
        zoom_level: i64,
        range: &TileRange,
    ) -> Result<Vec<TileRow>>;
}

/// Everything a GeoPackage-backed store provides.
pub trait GeoPackageStore: SrsStore + FeatureStore + IndexStore + ExtensionStore + TileStore {}

impl<T> GeoPackageStore for T where
    T: SrsStore + FeatureStore + IndexStore + ExtensionStore + TileStore
{
}
