//! Features intersecting an XYZ tile, with geometries in tile pixel space.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::bounds::{BoundingBox, GeometryEnvelope};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::geometry::{self, Geometry};
use crate::index::SpatialIndex;
use crate::model::{FeatureTable, Value};
use crate::store::GeoPackageStore;
use crate::transform::{CoordinateTransform, Transformer};

/// A feature with its geometry projected into tile pixels.
///
/// Pixel coordinates run from `(0, 0)` at the tile's north-west corner to
/// `(tile_size, tile_size)` at its south-east corner. Geometries are not
/// clipped, so parts reaching past the tile fall outside that range.
#[derive(Clone, Debug, PartialEq)]
pub struct TileFeature {
    pub id: i64,
    pub geometry: Geometry,
    pub attributes: BTreeMap<String, Value>,
}

pub struct FeatureTiles<'a, S: ?Sized> {
    store: &'a S,
    index: SpatialIndex<'a, S>,
    transform: CoordinateTransform<'a, S>,
    tile_size: u32,
}

impl<'a, S: GeoPackageStore + ?Sized> FeatureTiles<'a, S> {
    pub fn new(store: &'a S) -> Self {
        FeatureTiles {
            store,
            index: SpatialIndex::new(store),
            transform: CoordinateTransform::new(store),
            tile_size: 256,
        }
    }

    pub fn configured(store: &'a S, config: &StoreConfig) -> Self {
        Self::new(store).with_tile_size(config.feature_tile_size)
    }

    pub fn with_transform(mut self, transform: CoordinateTransform<'a, S>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// Features of `table` whose index envelope intersects tile `x`/`y`/`zoom`
    /// of the grid in `srs_id`.
    ///
    /// The table must be indexed. Rows deleted after the index lookup are
    /// skipped; rows that fail to decode or project are reported as errors in
    /// the stream without ending it. Out-of-grid addresses yield nothing.
    pub async fn features_in_tile(
        &self,
        table: &str,
        x: i32,
        y: i32,
        zoom: u8,
        srs_id: i64,
    ) -> Result<BoxStream<'_, Result<TileFeature>>> {
        let feature_table = self.store.feature_table(table).await?;

        let Some(tile_bounds) = self.transform.xyz_bounds(x, y, zoom, srs_id).await? else {
            return Ok(stream::empty().boxed());
        };

        let to_native = self
            .transform
            .transformer(srs_id, feature_table.srs_id)
            .await?;
        let native = to_native.transform_bounds(&tile_bounds)?;

        // Ids are gathered before any row is read so the lookup never holds a
        // connection that the row reads need.
        let ids: Vec<i64> = self
            .index
            .query_envelope_intersect(table, &GeometryEnvelope::from_bounds(&native))
            .await?
            .try_collect()
            .await?;

        debug!(table, x, y, zoom, candidates = ids.len(), "Extracting tile features");

        let to_tile = Arc::new(
            self.transform
                .transformer(feature_table.srs_id, srs_id)
                .await?,
        );
        let feature_table = Arc::new(feature_table);
        let tile_size = f64::from(self.tile_size);

        Ok(stream::iter(ids)
            .then(move |id| {
                let feature_table = Arc::clone(&feature_table);
                let to_tile = Arc::clone(&to_tile);
                async move {
                    self.tile_feature(&feature_table, &to_tile, &tile_bounds, tile_size, id)
                        .await
                }
            })
            .filter_map(|feature| future::ready(feature.transpose()))
            .boxed())
    }

    async fn tile_feature(
        &self,
        table: &FeatureTable,
        to_tile: &Transformer,
        tile_bounds: &BoundingBox,
        tile_size: f64,
        id: i64,
    ) -> Result<Option<TileFeature>> {
        let Some(row) = self.store.get_row(table, id).await? else {
            return Ok(None);
        };
        let Some(bytes) = row.geometry.as_deref() else {
            return Ok(None);
        };
        let Some(geometry) = geometry::decode(bytes)?.geometry else {
            return Ok(None);
        };

        let scale_x = tile_size / tile_bounds.width();
        let scale_y = tile_size / tile_bounds.height();

        let projected = geometry::try_map_coords(&geometry, |coord| -> Result<_> {
            let (x, y) = to_tile.transform(coord.x, coord.y)?;
            Ok(geo_types::Coord {
                x: (x - tile_bounds.min_x) * scale_x,
                y: (tile_bounds.max_y - y) * scale_y,
            })
        })?;

        Ok(Some(TileFeature {
            id,
            geometry: projected,
            attributes: row.attributes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fixtures;
    use crate::model::FeatureRow;
    use crate::store::FeatureStore;
    use crate::transform::WGS84;
    use assert_approx_eq::assert_approx_eq;

    const PLACES: &[(f64, f64, &str)] = &[
        (10.0, 10.0, "inside"),
        (-120.0, 40.0, "west"),
        (150.0, -30.0, "south"),
    ];

    async fn collect(
        tiles: &FeatureTiles<'_, crate::store::SqliteGeoPackage>,
        x: i32,
        y: i32,
        zoom: u8,
        srs_id: i64,
    ) -> Vec<TileFeature> {
        tiles
            .features_in_tile("places", x, y, zoom, srs_id)
            .await
            .expect("Unable to query the tile")
            .try_collect()
            .await
            .expect("Unable to read features")
    }

    #[tokio::test]
    async fn test_features_in_web_mercator_tile() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        SpatialIndex::new(&store)
            .build("places", false, |_| {})
            .await
            .expect("build");
        let tiles = FeatureTiles::new(&store);

        let features = collect(&tiles, 1, 0, 1, 3857).await;

        assert_eq!(1, features.len());
        let feature = &features[0];
        assert_eq!(1, feature.id);
        assert_eq!(
            Some(&Value::Text(String::from("inside"))),
            feature.attributes.get("name")
        );

        let Geometry::Point(point) = &feature.geometry else {
            panic!("expected a point, got {:?}", feature.geometry);
        };
        assert_approx_eq!(10.0 / 180.0 * 256.0, point.x(), 1e-6);
        assert!(point.y() > 200.0 && point.y() < 256.0);
    }

    #[tokio::test]
    async fn test_features_in_geographic_tile() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        SpatialIndex::new(&store)
            .build("places", false, |_| {})
            .await
            .expect("build");
        let mut config = StoreConfig::in_memory();
        config.feature_tile_size = 4096;
        let tiles = FeatureTiles::configured(&store, &config);

        let features = collect(&tiles, 0, 0, 1, WGS84).await;

        assert_eq!(1, features.len());
        let Geometry::Point(point) = &features[0].geometry else {
            panic!("expected a point");
        };
        // Longitude -120 sits a third of the way into the western tile.
        assert_approx_eq!(4096.0 / 3.0, point.x(), 1e-6);
    }

    #[tokio::test]
    async fn test_deleted_rows_are_skipped() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;
        let index = SpatialIndex::new(&store);
        index.build("places", false, |_| {}).await.expect("build");

        // Removed behind the index's back, leaving a stale entry.
        let mut tx = store.begin().await.expect("begin");
        tx.delete(&table, 1).await.expect("delete");
        tx.commit().await.expect("commit");

        let tiles = FeatureTiles::new(&store);
        assert!(collect(&tiles, 1, 0, 1, 3857).await.is_empty());
    }

    #[tokio::test]
    async fn test_requires_an_index() {
        let store = fixtures::store().await;
        fixtures::points_table(&store, "places", PLACES).await;
        let tiles = FeatureTiles::new(&store);

        let result = tiles.features_in_tile("places", 0, 0, 0, 3857).await;
        assert!(matches!(result, Err(Error::IndexNotBuilt(_))));
    }

    #[tokio::test]
    async fn test_empty_and_off_grid_tiles() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", PLACES).await;
        let mut tx = store.begin().await.expect("begin");
        tx.insert(&table, &FeatureRow::new(None)).await.expect("insert");
        tx.commit().await.expect("commit");
        SpatialIndex::new(&store)
            .build("places", false, |_| {})
            .await
            .expect("build");
        let tiles = FeatureTiles::new(&store);

        assert!(collect(&tiles, 5, 5, 1, 3857).await.is_empty());
        assert_eq!(3, collect(&tiles, 0, 0, 0, 3857).await.len());
    }
}
