//! Shared helpers for unit tests.

use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};

use crate::bounds::WEB_MERCATOR_HALF_EXTENT;
use crate::geometry::{self, Endianness, Geometry};
use crate::model::{
    DataType, FeatureColumn, FeatureRow, FeatureTable, TileMatrix, TileMatrixSet, TileRow, Value,
};
use crate::store::{FeatureStore, SqliteGeoPackage};

pub const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
pub const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);
pub const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
pub const YELLOW: Rgba<u8> = Rgba([255, 255, 0, 255]);
pub const GRAY: Rgba<u8> = Rgba([128, 128, 128, 255]);

pub async fn store() -> SqliteGeoPackage {
    SqliteGeoPackage::open_in_memory()
        .await
        .expect("Unable to open an in-memory store")
}

pub fn point(x: f64, y: f64) -> Vec<u8> {
    geometry::encode(
        &Geometry::Point(geo_types::Point::new(x, y)),
        4326,
        Endianness::LittleEndian,
    )
    .expect("Unable to encode a point")
}

/// A `points` table of named WGS84 points, written without touching any index.
pub async fn points_table(
    store: &SqliteGeoPackage,
    name: &str,
    points: &[(f64, f64, &str)],
) -> FeatureTable {
    let table = store
        .create_feature_table(
            name,
            "geom",
            "POINT",
            4326,
            &[FeatureColumn {
                name: String::from("name"),
                data_type: DataType::Text,
            }],
        )
        .await
        .expect("Unable to create the feature table");

    let mut tx = store.begin().await.expect("Unable to begin");
    for &(x, y, label) in points {
        let row = FeatureRow::new(Some(point(x, y)))
            .with_attribute("name", Value::Text(label.to_owned()));
        tx.insert(&table, &row).await.expect("Unable to insert");
    }
    tx.commit().await.expect("Unable to commit");

    table
}

pub fn png(width: u32, height: u32, paint: impl Fn(u32, u32) -> Rgba<u8>) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, paint);
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .expect("Unable to encode the test tile");
    bytes
}

pub fn solid_png(color: Rgba<u8>) -> Vec<u8> {
    png(256, 256, |_, _| color)
}

pub fn decode_png(bytes: &[u8]) -> RgbaImage {
    image::load_from_memory(bytes)
        .expect("Unable to decode the tile")
        .to_rgba8()
}

/// A standard Web Mercator pyramid with zoom levels 0 and 1.
///
/// Zoom 0 is gray. At zoom 1 the north-west tile is red, the north-east
/// tile blue and the south-east tile yellow; the south-west tile is missing.
pub async fn web_mercator_tiles(store: &SqliteGeoPackage, name: &str) {
    let h = WEB_MERCATOR_HALF_EXTENT;
    let set = TileMatrixSet {
        table_name: name.to_owned(),
        srs_id: 3857,
        min_x: -h,
        min_y: -h,
        max_x: h,
        max_y: h,
    };
    let matrices = [(0, 1), (1, 2)].map(|(zoom_level, size)| TileMatrix {
        table_name: name.to_owned(),
        zoom_level,
        matrix_width: size,
        matrix_height: size,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size: 2.0 * h / (256.0 * size as f64),
        pixel_y_size: 2.0 * h / (256.0 * size as f64),
    });

    store
        .create_tile_table(&set, &matrices)
        .await
        .expect("Unable to create the tile table");

    for (zoom_level, tile_column, tile_row, color) in [
        (0, 0, 0, GRAY),
        (1, 0, 0, RED),
        (1, 1, 0, BLUE),
        (1, 1, 1, YELLOW),
    ] {
        store
            .insert_tile(&TileRow {
                table_name: name.to_owned(),
                zoom_level,
                tile_column,
                tile_row,
                tile_data: solid_png(color),
            })
            .await
            .expect("Unable to insert a tile");
    }
}
