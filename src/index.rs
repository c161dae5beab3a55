//! Spatial index over the rows of feature tables.
//!
//! Tables are indexed either by the GeoPackage R-tree extension, which is
//! maintained by database triggers and only read here, or by the
//! `nga_geometry_index` extension, which this module builds and keeps current.
//! When both are present the R-tree wins.

use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::bounds::GeometryEnvelope;
use crate::error::{Error, Result};
use crate::geometry;
use crate::model::{
    ExtensionRecord, ExtensionScope, FeatureRow, FeatureTable, SpatialIndexEntry, TableIndex,
};
use crate::store::{FeatureTransaction, GeoPackageStore};

pub const GEOMETRY_INDEX_EXTENSION: &str = "nga_geometry_index";
pub const GEOMETRY_INDEX_DEFINITION: &str =
    "http://ngageoint.github.io/GeoPackage/docs/extensions/geometry-index.html";

pub const RTREE_EXTENSION: &str = "gpkg_rtree_index";
pub const RTREE_DEFINITION: &str = "http://www.geopackage.org/spec/#extension_rtree";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// Envelopes stored in `nga_geometry_index`.
    GeometryIndex,
    /// A `rtree_<table>_<column>` virtual table.
    RTree,
}

/// Outcome of `SpatialIndex::build`.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildReport {
    pub table_name: String,
    /// Rows with an entry in the index.
    pub indexed: u64,
    /// Rows whose geometry could not be decoded.
    pub skipped: Vec<i64>,
    pub last_indexed: Option<DateTime<Utc>>,
    /// False when an existing index was left untouched.
    pub rebuilt: bool,
}

/// A feature table together with how it is currently indexed.
///
/// Resolved before a write transaction opens, so maintenance inside the
/// transaction never needs a second connection.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexTarget {
    pub table: FeatureTable,
    pub kind: Option<IndexKind>,
}

pub fn rtree_table_name(table: &FeatureTable) -> String {
    format!("rtree_{}_{}", table.table_name, table.geometry_column)
}

fn geometry_index_extension(table: &FeatureTable) -> ExtensionRecord {
    ExtensionRecord {
        table_name: Some(table.table_name.clone()),
        column_name: Some(table.geometry_column.clone()),
        extension_name: String::from(GEOMETRY_INDEX_EXTENSION),
        definition: String::from(GEOMETRY_INDEX_DEFINITION),
        scope: ExtensionScope::ReadWrite,
    }
}

pub struct SpatialIndex<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: GeoPackageStore + ?Sized> SpatialIndex<'a, S> {
    pub fn new(store: &'a S) -> Self {
        SpatialIndex { store }
    }

    pub async fn index_kind(&self, table: &FeatureTable) -> Result<Option<IndexKind>> {
        let column = &table.geometry_column;

        if self
            .store
            .extension(RTREE_EXTENSION, &table.table_name, column)
            .await?
            .is_some()
            && self.store.has_table(&rtree_table_name(table)).await?
        {
            return Ok(Some(IndexKind::RTree));
        }

        if self
            .store
            .extension(GEOMETRY_INDEX_EXTENSION, &table.table_name, column)
            .await?
            .is_some()
            && self.store.table_index(&table.table_name).await?.is_some()
        {
            return Ok(Some(IndexKind::GeometryIndex));
        }

        Ok(None)
    }

    pub async fn is_indexed(&self, table: &str) -> Result<bool> {
        let table = self.store.feature_table(table).await?;

        Ok(self.index_kind(&table).await?.is_some())
    }

    /// Completion record of the geometry index, if one was built.
    pub async fn table_index(&self, table: &str) -> Result<Option<TableIndex>> {
        self.store.table_index(table).await
    }

    pub async fn target(&self, table: &str) -> Result<IndexTarget> {
        let table = self.store.feature_table(table).await?;
        let kind = self.index_kind(&table).await?;

        Ok(IndexTarget { table, kind })
    }

    /// Indexes every row of `table`.
    ///
    /// An indexed table is left alone unless `force` is set. `progress`
    /// receives the fraction of rows visited. Rows whose geometry fails to
    /// decode are skipped and reported; the entries and completion timestamp
    /// are committed together, so readers never see a partial index.
    pub async fn build(
        &self,
        table: &str,
        force: bool,
        mut progress: impl FnMut(f64) + Send,
    ) -> Result<BuildReport> {
        let table = self.store.feature_table(table).await?;

        if !force {
            if let Some(kind) = self.index_kind(&table).await? {
                debug!(table = %table.table_name, ?kind, "Index already built");
                progress(1.0);
                return Ok(BuildReport {
                    table_name: table.table_name.clone(),
                    indexed: 0,
                    skipped: Vec::new(),
                    last_indexed: self
                        .store
                        .table_index(&table.table_name)
                        .await?
                        .map(|index| index.last_indexed),
                    rebuilt: false,
                });
            }
        }

        let total = self.store.count_rows(&table).await?;
        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        let mut visited = 0u64;

        self.store
            .for_each_row(&table, &mut |row: FeatureRow| {
                visited += 1;

                if let Some(row_id) = row.id {
                    match row.geometry.as_deref().map(geometry::decode_envelope).transpose() {
                        Ok(Some(Some(envelope))) => entries.push(SpatialIndexEntry {
                            table_name: table.table_name.clone(),
                            row_id,
                            envelope,
                        }),
                        // Null and empty geometries have nothing to index.
                        Ok(_) => {}
                        Err(e) => {
                            warn!(table = %table.table_name, row_id, error = %e, "Skipping row with an undecodable geometry");
                            skipped.push(row_id);
                        }
                    }
                }

                if total > 0 {
                    progress((visited as f64 / total as f64).min(1.0));
                }
            })
            .await?;

        // Stored timestamps keep millisecond precision.
        let last_indexed = Utc::now().trunc_subsecs(3);
        let index = TableIndex {
            table_name: table.table_name.clone(),
            last_indexed,
        };

        self.store
            .replace_index(&index, &geometry_index_extension(&table), &entries)
            .await?;

        progress(1.0);

        info!(
            table = %table.table_name,
            indexed = entries.len(),
            skipped = skipped.len(),
            "Built geometry index"
        );

        Ok(BuildReport {
            table_name: table.table_name,
            indexed: entries.len() as u64,
            skipped,
            last_indexed: Some(last_indexed),
            rebuilt: true,
        })
    }

    /// Builds the index of every feature table. `progress` receives the
    /// table name with the fraction of its rows visited.
    pub async fn index_all(
        &self,
        force: bool,
        mut progress: impl FnMut(&str, f64) + Send,
    ) -> Result<Vec<BuildReport>> {
        let mut reports = Vec::new();

        for table in self.store.feature_tables().await? {
            let report = self
                .build(&table, force, |fraction| progress(table.as_str(), fraction))
                .await?;
            reports.push(report);
        }

        Ok(reports)
    }

    /// Removes the geometry index of a table. Returns false when there was none.
    pub async fn delete_index(&self, table: &str) -> Result<bool> {
        let table = self.store.feature_table(table).await?;

        let Some(extension) = self
            .store
            .extension(GEOMETRY_INDEX_EXTENSION, &table.table_name, &table.geometry_column)
            .await?
        else {
            return Ok(false);
        };

        self.store.drop_index(&extension).await?;
        info!(table = %table.table_name, "Deleted geometry index");

        Ok(true)
    }

    async fn sync_entry(
        &self,
        tx: &mut dyn FeatureTransaction,
        target: &IndexTarget,
        row_id: i64,
        geometry: Option<&[u8]>,
    ) -> Result<()> {
        if target.kind != Some(IndexKind::GeometryIndex) {
            return Ok(());
        }

        match geometry.map(geometry::decode_envelope).transpose()?.flatten() {
            Some(envelope) => {
                tx.put_index_entry(&SpatialIndexEntry {
                    table_name: target.table.table_name.clone(),
                    row_id,
                    envelope,
                })
                .await
            }
            None => {
                tx.remove_index_entry(&target.table.table_name, row_id)
                    .await
            }
        }
    }

    /// Adds the entry of a newly written row, inside the row's transaction.
    pub async fn on_row_inserted(
        &self,
        tx: &mut dyn FeatureTransaction,
        target: &IndexTarget,
        row_id: i64,
        geometry: Option<&[u8]>,
    ) -> Result<()> {
        self.sync_entry(tx, target, row_id, geometry).await
    }

    /// Replaces the entry of a rewritten row, inside the row's transaction.
    pub async fn on_row_updated(
        &self,
        tx: &mut dyn FeatureTransaction,
        target: &IndexTarget,
        row_id: i64,
        geometry: Option<&[u8]>,
    ) -> Result<()> {
        self.sync_entry(tx, target, row_id, geometry).await
    }

    /// Removes the entry of a deleted row, inside the row's transaction.
    pub async fn on_row_deleted(
        &self,
        tx: &mut dyn FeatureTransaction,
        target: &IndexTarget,
        row_id: i64,
    ) -> Result<()> {
        if target.kind != Some(IndexKind::GeometryIndex) {
            return Ok(());
        }

        tx.remove_index_entry(&target.table.table_name, row_id)
            .await
    }

    /// Writes a row and its index entry atomically. Returns the row id.
    pub async fn insert_row(&self, table: &str, row: &FeatureRow) -> Result<i64> {
        let target = self.target(table).await?;

        let mut tx = self.store.begin().await?;
        let row_id = tx.insert(&target.table, row).await?;
        self.on_row_inserted(tx.as_mut(), &target, row_id, row.geometry.as_deref())
            .await?;
        tx.commit().await?;

        Ok(row_id)
    }

    pub async fn update_row(&self, table: &str, row: &FeatureRow) -> Result<()> {
        let target = self.target(table).await?;
        let row_id = row.id.ok_or_else(|| Error::RowNotFound {
            table: table.to_string(),
            id: None,
        })?;

        let mut tx = self.store.begin().await?;
        tx.update(&target.table, row).await?;
        self.on_row_updated(tx.as_mut(), &target, row_id, row.geometry.as_deref())
            .await?;
        tx.commit().await
    }

    pub async fn delete_row(&self, table: &str, row_id: i64) -> Result<()> {
        let target = self.target(table).await?;

        let mut tx = self.store.begin().await?;
        tx.delete(&target.table, row_id).await?;
        self.on_row_deleted(tx.as_mut(), &target, row_id).await?;
        tx.commit().await
    }

    /// Ids of rows whose envelope intersects `envelope`, boundary inclusive.
    ///
    /// An envelope with `min_x > max_x` wraps the antimeridian and is queried
    /// as its two halves; ids are reported once. Fails with `IndexNotBuilt`
    /// when the table has neither index.
    pub async fn query_envelope_intersect(
        &self,
        table: &str,
        envelope: &GeometryEnvelope,
    ) -> Result<BoxStream<'a, Result<i64>>> {
        let table = self.store.feature_table(table).await?;
        let kind = self
            .index_kind(&table)
            .await?
            .ok_or_else(|| Error::IndexNotBuilt(table.table_name.clone()))?;

        let envelopes = if envelope.crosses_antimeridian() {
            let (east, west) = envelope.split_antimeridian();
            vec![east, west]
        } else {
            vec![*envelope]
        };

        let store = self.store;
        let rtree = rtree_table_name(&table);
        let queries: Vec<BoxStream<'a, Result<i64>>> = envelopes
            .iter()
            .map(|envelope| match kind {
                IndexKind::GeometryIndex => store.query_index(&table.table_name, envelope),
                IndexKind::RTree => store.query_rtree(&rtree, envelope),
            })
            .collect();

        let mut seen = HashSet::new();
        Ok(stream::iter(queries)
            .flatten()
            .try_filter(move |id| future::ready(seen.insert(*id)))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::store::{ExtensionStore, FeatureStore, IndexStore};

    const PLACES: &[(f64, f64, &str)] = &[
        (2.35, 48.85, "paris"),
        (-74.0, 40.7, "new york"),
        (151.2, -33.9, "sydney"),
        (175.0, -41.3, "wellington"),
        (-175.2, -21.1, "nuku'alofa"),
    ];

    async fn query(
        index: &SpatialIndex<'_, crate::store::SqliteGeoPackage>,
        table: &str,
        envelope: GeometryEnvelope,
    ) -> Vec<i64> {
        let mut ids: Vec<i64> = index
            .query_envelope_intersect(table, &envelope)
            .await
            .expect("Unable to query")
            .try_collect()
            .await
            .expect("Unable to read results");
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn test_build_indexes_every_row() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);

        assert!(!index.is_indexed("places").await.expect("check"));

        let mut fractions = Vec::new();
        let report = index
            .build("places", false, |fraction| fractions.push(fraction))
            .await
            .expect("Unable to build");

        assert!(report.rebuilt);
        assert_eq!(PLACES.len() as u64, report.indexed);
        assert!(report.skipped.is_empty());
        assert_eq!(Some(&1.0), fractions.last());
        assert!(index.is_indexed("places").await.expect("check"));

        // Every row is found by a query of its own envelope.
        let mut rows = Vec::new();
        store
            .for_each_row(&table, &mut |row: FeatureRow| rows.push(row))
            .await
            .expect("Unable to read rows");
        for row in rows {
            let envelope = geometry::decode_envelope(row.geometry.as_deref().expect("geometry"))
                .expect("valid")
                .expect("not empty");
            let ids = query(&index, "places", envelope).await;
            assert!(ids.contains(&row.id.expect("id")));
        }
    }

    #[tokio::test]
    async fn test_build_records_extension_and_timestamp() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);

        let report = index.build("places", false, |_| {}).await.expect("build");

        let extension = store
            .extension(GEOMETRY_INDEX_EXTENSION, "places", "geom")
            .await
            .expect("query")
            .expect("extension recorded");
        assert_eq!(ExtensionScope::ReadWrite, extension.scope);
        assert_eq!(GEOMETRY_INDEX_DEFINITION, extension.definition);
        assert_eq!("nga", extension.author());

        let recorded = index
            .table_index("places")
            .await
            .expect("query")
            .expect("timestamp recorded");
        assert_eq!(report.last_indexed, Some(recorded.last_indexed));
    }

    #[tokio::test]
    async fn test_build_is_idempotent_unless_forced() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);

        let first = index.build("places", false, |_| {}).await.expect("build");
        std::thread::sleep(std::time::Duration::from_millis(20));

        let again = index.build("places", false, |_| {}).await.expect("build");
        assert!(!again.rebuilt);
        assert_eq!(first.last_indexed, again.last_indexed);

        let forced = index.build("places", true, |_| {}).await.expect("build");
        assert!(forced.rebuilt);
        assert!(forced.last_indexed > first.last_indexed);
        assert_eq!(PLACES.len() as u64, forced.indexed);
    }

    #[tokio::test]
    async fn test_query_requires_an_index() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);

        let result = index
            .query_envelope_intersect("places", &GeometryEnvelope::new(-1.0, 1.0, -1.0, 1.0))
            .await;
        assert!(matches!(result, Err(Error::IndexNotBuilt(_))));
    }

    #[tokio::test]
    async fn test_query_is_boundary_inclusive() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        let touching = query(&index, "places", GeometryEnvelope::new(2.35, 10.0, 48.85, 60.0)).await;
        assert_eq!(vec![1], touching);

        let nothing = query(&index, "places", GeometryEnvelope::new(10.0, 20.0, 10.0, 20.0)).await;
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn test_query_across_the_antimeridian() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        let wrapped = query(&index, "places", GeometryEnvelope::new(170.0, -170.0, -50.0, 0.0)).await;
        assert_eq!(vec![4, 5], wrapped);

        let east_only = query(&index, "places", GeometryEnvelope::new(170.0, 180.0, -50.0, 0.0)).await;
        assert_eq!(vec![4], east_only);
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_skipped() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;

        let mut tx = store.begin().await.expect("begin");
        let broken = tx
            .insert(&table, &FeatureRow::new(Some(vec![0x47, 0x50, 0x00])))
            .await
            .expect("insert");
        tx.insert(&table, &FeatureRow::new(None)).await.expect("insert");
        tx.commit().await.expect("commit");

        let index = SpatialIndex::new(&store);
        let report = index.build("places", false, |_| {}).await.expect("build");

        assert_eq!(vec![broken], report.skipped);
        assert_eq!(PLACES.len() as u64, report.indexed);
    }

    #[tokio::test]
    async fn test_writes_maintain_the_index() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        let around_rome = GeometryEnvelope::new(12.0, 13.0, 41.0, 42.5);
        let around_oslo = GeometryEnvelope::new(10.0, 11.5, 59.0, 60.5);

        let id = index
            .insert_row("places", &FeatureRow::new(Some(fixtures::point(12.5, 41.9))))
            .await
            .expect("insert");
        assert_eq!(vec![id], query(&index, "places", around_rome).await);

        let mut moved = FeatureRow::new(Some(fixtures::point(10.75, 59.9)));
        moved.id = Some(id);
        index.update_row("places", &moved).await.expect("update");
        assert!(query(&index, "places", around_rome).await.is_empty());
        assert_eq!(vec![id], query(&index, "places", around_oslo).await);

        index.delete_row("places", id).await.expect("delete");
        assert!(query(&index, "places", around_oslo).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_of_missing_row() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        let mut ghost = FeatureRow::new(Some(fixtures::point(12.5, 41.9)));
        assert!(matches!(
            index.update_row("places", &ghost).await,
            Err(Error::RowNotFound { id: None, .. })
        ));

        ghost.id = Some(999);
        assert!(matches!(
            index.update_row("places", &ghost).await,
            Err(Error::RowNotFound { id: Some(999), .. })
        ));
        let around_rome = GeometryEnvelope::new(12.0, 13.0, 41.0, 42.5);
        assert!(query(&index, "places", around_rome).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_row_and_entry() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        let result = index
            .insert_row("places", &FeatureRow::new(Some(vec![0x47, 0x50, 0x00, 0x01])))
            .await;

        assert!(matches!(result, Err(Error::MalformedGeometry(_))));
        assert_eq!(
            PLACES.len() as u64,
            store.count_rows(&table).await.expect("count")
        );
    }

    #[tokio::test]
    async fn test_delete_index() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);

        assert!(!index.delete_index("places").await.expect("delete"));

        index.build("places", false, |_| {}).await.expect("build");
        assert!(index.delete_index("places").await.expect("delete"));
        assert!(!index.is_indexed("places").await.expect("check"));
        assert!(store.table_index("places").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn test_index_all() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        fixtures::points_table(&store, "more_places", &PLACES[..2]).await;
        let index = SpatialIndex::new(&store);

        let mut finished = Vec::new();
        let reports = index
            .index_all(false, |table, fraction| {
                if fraction >= 1.0 {
                    finished.push(table.to_owned());
                }
            })
            .await
            .expect("index all");

        assert_eq!(2, reports.len());
        assert!(finished.contains(&String::from("places")));
        assert!(finished.contains(&String::from("more_places")));
        assert!(index.is_indexed("more_places").await.expect("check"));
    }

    #[tokio::test]
    async fn test_rtree_is_preferred() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;

        sqlx::query("CREATE VIRTUAL TABLE rtree_places_geom USING rtree(id, minx, maxx, miny, maxy)")
            .execute(store.pool())
            .await
            .expect("create rtree");
        sqlx::query("INSERT INTO rtree_places_geom VALUES (1, 2.35, 2.35, 48.85, 48.85)")
            .execute(store.pool())
            .await
            .expect("fill rtree");
        store
            .put_extension(&ExtensionRecord {
                table_name: Some(String::from("places")),
                column_name: Some(String::from("geom")),
                extension_name: String::from(RTREE_EXTENSION),
                definition: String::from(RTREE_DEFINITION),
                scope: ExtensionScope::WriteOnly,
            })
            .await
            .expect("register rtree");

        let index = SpatialIndex::new(&store);
        assert_eq!(
            Some(IndexKind::RTree),
            index.index_kind(&table).await.expect("kind")
        );

        // Only the single R-tree entry exists, whatever the table holds.
        let ids = query(&index, "places", GeometryEnvelope::new(-180.0, 180.0, -90.0, 90.0)).await;
        assert_eq!(vec![1], ids);

        // Writes leave trigger-maintained R-trees alone.
        let report = index.build("places", false, |_| {}).await.expect("build");
        assert!(!report.rebuilt);
    }
}
