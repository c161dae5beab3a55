//! # GeoPackage Sorcerer
//!
//! Tools for indexing, querying and rendering tiles from GeoPackage files.
//!
//! ## Current status
//!
//! This crate should be regarded as stable in terms of code reliability/correctness, but not
//! yet stable in terms of trait and method signatures. We are releasing this code in Rust
//! tradition as 0.x until we feel the interface and feature set have stabilized, but welcome
//! usage and contributions from the Rust GIS community.
//!
//! ## Current features
//!
//! Given a GeoPackage (an SQLite database following the OGC GeoPackage encoding), this crate
//! will help you:
//!
//! * Build and maintain a spatial index over a feature table, and query it by envelope
//!   ([`index::SpatialIndex`]).
//! * Serve raster tiles for any XYZ tile in any known SRS, compositing and reprojecting the
//!   stored tile pyramid when its grid does not line up with the request
//!   ([`tiles::TileResolver`]).
//! * Extract the features intersecting an XYZ tile with their geometries in tile pixel space
//!   ([`features::FeatureTiles`]).
//!
//! ## Known Limitations
//!
//! Stored tiles are expected to be PNG or JPEG; output tiles are always PNG. Projections are
//! resolved through `proj4rs`, so spatial reference systems without a known EPSG code need a
//! PROJ.4 string as their definition. Spatial indexes created by other tools as SQLite R-tree
//! virtual tables are queried, but never created or maintained.
//!
//! The trait-based design allows for further extensibility, so additional stores, tile
//! formats, etc. will likely be added in the future.

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;

/// Renders one slippy map tile in XYZ format. Implemented by
/// [`tiles::TileTable`] for stored raster pyramids.
#[async_trait]
pub trait TileSource {
    /// Renders the tile at `zoom`/`x`/`y` as image bytes.
    async fn render_tile(&self, zoom: u8, x: i32, y: i32) -> error::Result<Vec<u8>>;
}

pub mod bounds;
pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod index;
pub mod model;
pub mod store;
pub mod tiles;
pub mod transform;

#[cfg(test)]
mod fixtures;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use features::{FeatureTiles, TileFeature};
pub use index::SpatialIndex;
pub use store::{GeoPackageStore, SqliteGeoPackage};
pub use tiles::{TileRequest, TileResolver, TileTable};
