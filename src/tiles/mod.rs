//! Raster tiles served from stored tile pyramids.
//!
//! A request names a tile of the XYZ grid in any SRS. The resolver picks the
//! stored zoom level whose resolution best matches, then either returns a
//! stored tile untouched, when the grids line up exactly, or composites and
//! reprojects the overlapping stored tiles into a new PNG.

// TODO: remove once async fn in traits become stable
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bounds::BoundingBox;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::model::{TileMatrix, TileMatrixSet, TileRange, TileRow};
use crate::store::GeoPackageStore;
use crate::transform::{CoordinateTransform, Transformer, WEB_MERCATOR, WGS84};
use crate::TileSource;

mod canvas;
pub mod matrix;

use canvas::{blank_png, Canvas, Fragment};
pub use canvas::Resampling;

/// Relative tolerance when deciding whether a request lines up with a stored tile.
const ALIGNMENT_TOLERANCE: f64 = 1e-9;

/// One output tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRequest<'r> {
    pub table: &'r str,
    pub x: i32,
    pub y: i32,
    pub zoom: u8,
    pub srs_id: i64,
    pub width: u32,
    pub height: u32,
}

impl<'r> TileRequest<'r> {
    /// A 256 pixel Web Mercator tile.
    pub fn web_mercator(table: &'r str, x: i32, y: i32, zoom: u8) -> Self {
        TileRequest {
            table,
            x,
            y,
            zoom,
            srs_id: WEB_MERCATOR,
            width: 256,
            height: 256,
        }
    }

    pub fn with_srs(self, srs_id: i64) -> Self {
        TileRequest { srs_id, ..self }
    }

    pub fn with_size(self, width: u32, height: u32) -> Self {
        TileRequest {
            width,
            height,
            ..self
        }
    }
}

/// What `plan` decided for one request.
struct Plan {
    matrix: TileMatrix,
    range: TileRange,
    to_native: Transformer,
    /// Requested extent in the request SRS.
    target_bounds: BoundingBox,
    /// Requested extent in the pyramid SRS.
    native_bounds: BoundingBox,
}

pub struct TileResolver<'a, S: ?Sized> {
    store: &'a S,
    transform: CoordinateTransform<'a, S>,
    resampling: Resampling,
}

impl<'a, S: GeoPackageStore + ?Sized> TileResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        TileResolver {
            store,
            transform: CoordinateTransform::new(store),
            resampling: Resampling::default(),
        }
    }

    /// A resolver sampling the way `config` asks.
    pub fn configured(store: &'a S, config: &StoreConfig) -> Self {
        Self::new(store).with_resampling(config.resampling)
    }

    pub fn with_transform(mut self, transform: CoordinateTransform<'a, S>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    /// Renders one tile as PNG.
    ///
    /// Addresses outside the grid or the pyramid's extent produce a fully
    /// transparent tile, as do areas with no stored tiles. A request that
    /// lines up with exactly one stored tile returns its bytes unchanged.
    pub async fn resolve_tile(&self, request: &TileRequest<'_>) -> Result<Vec<u8>> {
        let set = self.store.tile_matrix_set(request.table).await?;

        let Some(bounds) = self
            .transform
            .xyz_bounds(request.x, request.y, request.zoom, request.srs_id)
            .await?
        else {
            return blank_png(request.width, request.height);
        };

        self.render(&set, bounds, request.srs_id, request.width, request.height)
            .await
    }

    /// Renders an arbitrary WGS84 extent, reprojected into `srs_id`.
    pub async fn resolve_bounds(
        &self,
        table: &str,
        wgs84_bounds: &BoundingBox,
        srs_id: i64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let set = self.store.tile_matrix_set(table).await?;
        let bounds = self
            .transform
            .transform_bounds(wgs84_bounds, WGS84, srs_id)
            .await?;

        self.render(&set, bounds, srs_id, width, height).await
    }

    /// Whether any stored tile would contribute to the request.
    pub async fn has_tile(&self, request: &TileRequest<'_>) -> Result<bool> {
        let set = self.store.tile_matrix_set(request.table).await?;

        let Some(bounds) = self
            .transform
            .xyz_bounds(request.x, request.y, request.zoom, request.srs_id)
            .await?
        else {
            return Ok(false);
        };

        let Some(plan) = self
            .plan(&set, bounds, request.srs_id, request.width)
            .await?
        else {
            return Ok(false);
        };

        let count = self
            .store
            .count_tiles(&set.table_name, plan.matrix.zoom_level, &plan.range)
            .await?;

        Ok(count > 0)
    }

    /// The pyramid's full extent in Web Mercator metres.
    pub async fn web_mercator_bounding_box(&self, table: &str) -> Result<BoundingBox> {
        let set = self.store.tile_matrix_set(table).await?;

        self.transform
            .transform_bounds(&set.bounds(), set.srs_id, WEB_MERCATOR)
            .await
    }

    /// Stored tiles of one zoom level overlapping a WGS84 extent.
    pub async fn tiles_in_bounding_box(
        &self,
        table: &str,
        zoom_level: i64,
        wgs84_bounds: &BoundingBox,
    ) -> Result<Vec<TileRow>> {
        let set = self.store.tile_matrix_set(table).await?;
        let matrices = self.store.tile_matrices(table).await?;

        let Some(matrix) = matrices.iter().find(|m| m.zoom_level == zoom_level) else {
            return Ok(Vec::new());
        };

        let native = self
            .transform
            .transform_bounds(wgs84_bounds, WGS84, set.srs_id)
            .await?;

        match matrix::tile_range(&set, matrix, &native) {
            Some(range) => self.store.tiles_in_range(table, zoom_level, &range).await,
            None => Ok(Vec::new()),
        }
    }

    async fn plan(
        &self,
        set: &TileMatrixSet,
        target_bounds: BoundingBox,
        srs_id: i64,
        width: u32,
    ) -> Result<Option<Plan>> {
        let to_native = self.transform.transformer(srs_id, set.srs_id).await?;

        let native_bounds = match to_native.transform_bounds(&target_bounds) {
            Ok(bounds) => bounds,
            Err(e) => {
                warn!(table = %set.table_name, error = %e, "Request does not project into the pyramid");
                return Ok(None);
            }
        };

        if native_bounds.overlap(&set.bounds()).is_none() {
            return Ok(None);
        }

        let matrices = self.store.tile_matrices(&set.table_name).await?;
        let pixel_size = native_bounds.width() / f64::from(width.max(1));

        let Some(matrix) = matrix::select_matrix(&matrices, pixel_size) else {
            return Ok(None);
        };
        let Some(range) = matrix::tile_range(set, matrix, &native_bounds) else {
            return Ok(None);
        };

        Ok(Some(Plan {
            matrix: matrix.clone(),
            range,
            to_native,
            target_bounds,
            native_bounds,
        }))
    }

    async fn render(
        &self,
        set: &TileMatrixSet,
        target_bounds: BoundingBox,
        srs_id: i64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let Some(plan) = self.plan(set, target_bounds, srs_id, width).await? else {
            return blank_png(width, height);
        };

        debug!(
            table = %set.table_name,
            zoom_level = plan.matrix.zoom_level,
            tiles = plan.range.len(),
            "Resolving tile"
        );

        if let Some(tile) = self.aligned_tile(set, &plan, width, height).await? {
            return Ok(tile);
        }

        // Only rows that exist come back, however sparse the covered range is.
        let tiles = self
            .store
            .tiles_in_range(&set.table_name, plan.matrix.zoom_level, &plan.range)
            .await?;
        debug!(table = %set.table_name, stored = tiles.len(), "Compositing stored tiles");

        let coords = pixel_coordinates(&plan, width, height);
        let mut canvas = Canvas::new(width, height);
        for tile in tiles {
            let fragment = fragment(set, &plan.matrix, &tile)?;
            canvas.paint(&fragment, &coords, self.resampling);
        }

        canvas.encode()
    }

    /// The stored bytes of the one tile matching the request exactly, if any.
    async fn aligned_tile(
        &self,
        set: &TileMatrixSet,
        plan: &Plan,
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<u8>>> {
        let matrix = &plan.matrix;
        if !plan.to_native.is_identity()
            || plan.range.len() != 1
            || i64::from(width) != matrix.tile_width
            || i64::from(height) != matrix.tile_height
        {
            return Ok(None);
        }

        let (column, row) = (plan.range.min_column, plan.range.min_row);
        let bounds = matrix::tile_bounds(set, matrix, column, row);
        if !bounds.approx_eq(&plan.native_bounds, ALIGNMENT_TOLERANCE) {
            return Ok(None);
        }

        let tile = self
            .store
            .get_tile(&set.table_name, matrix.zoom_level, column, row)
            .await?;

        Ok(Some(match tile {
            Some(tile) => tile.tile_data,
            None => blank_png(width, height)?,
        }))
    }
}

/// A stored tile decoded and placed in the pyramid SRS.
fn fragment(set: &TileMatrixSet, matrix: &TileMatrix, tile: &TileRow) -> Result<Fragment> {
    let image = image::load_from_memory(&tile.tile_data)?.to_rgba8();

    Ok(Fragment {
        bounds: matrix::tile_bounds(set, matrix, tile.tile_column, tile.tile_row),
        image,
    })
}

/// The pyramid SRS coordinate of every output pixel centre, row-major.
fn pixel_coordinates(plan: &Plan, width: u32, height: u32) -> Vec<Option<(f64, f64)>> {
    let bounds = &plan.target_bounds;
    let step_x = bounds.width() / f64::from(width);
    let step_y = bounds.height() / f64::from(height);
    let mut failures = 0usize;

    let coords: Vec<_> = (0..height)
        .flat_map(|py| (0..width).map(move |px| (px, py)))
        .map(|(px, py)| {
            let x = bounds.min_x + (f64::from(px) + 0.5) * step_x;
            let y = bounds.max_y - (f64::from(py) + 0.5) * step_y;
            match plan.to_native.transform(x, y) {
                Ok(native) => Some(native),
                Err(_) => {
                    failures += 1;
                    None
                }
            }
        })
        .collect();

    if failures > 0 {
        debug!(failures, "Pixels outside the pyramid projection left blank");
    }

    coords
}

/// A tile table rendered at a fixed size in a fixed SRS.
pub struct TileTable<'a, S: ?Sized> {
    resolver: TileResolver<'a, S>,
    table: String,
    srs_id: i64,
    width: u32,
    height: u32,
}

impl<'a, S: GeoPackageStore + ?Sized> TileTable<'a, S> {
    /// 256 pixel Web Mercator tiles.
    pub fn new(resolver: TileResolver<'a, S>, table: &str) -> Self {
        TileTable {
            resolver,
            table: table.to_owned(),
            srs_id: WEB_MERCATOR,
            width: 256,
            height: 256,
        }
    }

    /// Web Mercator tiles sized and sampled per `config`.
    pub fn configured(store: &'a S, table: &str, config: &StoreConfig) -> Self {
        Self::new(TileResolver::configured(store, config), table)
            .with_size(config.tile_width, config.tile_height)
    }

    pub fn with_srs(mut self, srs_id: i64) -> Self {
        self.srs_id = srs_id;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn request(&self, zoom: u8, x: i32, y: i32) -> TileRequest<'_> {
        TileRequest {
            table: &self.table,
            x,
            y,
            zoom,
            srs_id: self.srs_id,
            width: self.width,
            height: self.height,
        }
    }
}

#[async_trait]
impl<'a, S: GeoPackageStore + ?Sized> TileSource for TileTable<'a, S> {
    async fn render_tile(&self, zoom: u8, x: i32, y: i32) -> Result<Vec<u8>> {
        self.resolver.resolve_tile(&self.request(zoom, x, y)).await
    }
}
