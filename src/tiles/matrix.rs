//! Tile matrix arithmetic: which zoom level serves a request, and which of its
//! tiles cover an area.

use crate::bounds::BoundingBox;
use crate::model::{TileMatrix, TileMatrixSet, TileRange};

/// Absorbs floating point noise when an edge falls exactly on a tile boundary.
const EDGE_EPSILON: f64 = 1e-9;

/// Relative slack when comparing pixel sizes.
const PIXEL_SIZE_TOLERANCE: f64 = 1e-6;

/// The coarsest matrix at least as detailed as `pixel_size`, or the most
/// detailed matrix when none is.
pub fn select_matrix(matrices: &[TileMatrix], pixel_size: f64) -> Option<&TileMatrix> {
    let limit = pixel_size * (1.0 + PIXEL_SIZE_TOLERANCE);

    matrices
        .iter()
        .filter(|matrix| matrix.pixel_x_size <= limit)
        .max_by(|a, b| a.pixel_x_size.total_cmp(&b.pixel_x_size))
        .or_else(|| {
            matrices
                .iter()
                .min_by(|a, b| a.pixel_x_size.total_cmp(&b.pixel_x_size))
        })
}

/// Bounds of one tile in the matrix set's SRS.
pub fn tile_bounds(set: &TileMatrixSet, matrix: &TileMatrix, column: i64, row: i64) -> BoundingBox {
    let span_x = matrix.tile_span_x();
    let span_y = matrix.tile_span_y();

    let min_x = set.min_x + column as f64 * span_x;
    let max_y = set.max_y - row as f64 * span_y;

    BoundingBox::new(min_x, max_y - span_y, min_x + span_x, max_y)
}

/// Tiles of `matrix` overlapping `bounds`, clamped to the matrix.
pub fn tile_range(set: &TileMatrixSet, matrix: &TileMatrix, bounds: &BoundingBox) -> Option<TileRange> {
    let span_x = matrix.tile_span_x();
    let span_y = matrix.tile_span_y();
    if span_x <= 0.0 || span_y <= 0.0 {
        return None;
    }

    let min_column = ((bounds.min_x - set.min_x) / span_x + EDGE_EPSILON).floor() as i64;
    let max_column = ((bounds.max_x - set.min_x) / span_x - EDGE_EPSILON).ceil() as i64 - 1;
    let min_row = ((set.max_y - bounds.max_y) / span_y + EDGE_EPSILON).floor() as i64;
    let max_row = ((set.max_y - bounds.min_y) / span_y - EDGE_EPSILON).ceil() as i64 - 1;

    let range = TileRange {
        min_column: min_column.max(0),
        max_column: max_column.min(matrix.matrix_width - 1),
        min_row: min_row.max(0),
        max_row: max_row.min(matrix.matrix_height - 1),
    };

    if range.min_column <= range.max_column && range.min_row <= range.max_row {
        Some(range)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::WEB_MERCATOR_HALF_EXTENT as H;

    fn matrix(zoom_level: i64, size: i64) -> TileMatrix {
        TileMatrix {
            table_name: String::from("tiles"),
            zoom_level,
            matrix_width: size,
            matrix_height: size,
            tile_width: 256,
            tile_height: 256,
            pixel_x_size: 2.0 * H / (256.0 * size as f64),
            pixel_y_size: 2.0 * H / (256.0 * size as f64),
        }
    }

    fn world() -> TileMatrixSet {
        TileMatrixSet {
            table_name: String::from("tiles"),
            srs_id: 3857,
            min_x: -H,
            min_y: -H,
            max_x: H,
            max_y: H,
        }
    }

    #[test]
    fn test_select_matrix() {
        let matrices = vec![matrix(0, 1), matrix(1, 2), matrix(2, 4)];

        // Exact match.
        assert_eq!(1, select_matrix(&matrices, 2.0 * H / 512.0).map(|m| m.zoom_level).unwrap());
        // Between levels the more detailed one serves.
        assert_eq!(2, select_matrix(&matrices, 2.0 * H / 700.0).map(|m| m.zoom_level).unwrap());
        // Coarser than everything.
        assert_eq!(0, select_matrix(&matrices, H).map(|m| m.zoom_level).unwrap());
        // Finer than everything upsamples the most detailed level.
        assert_eq!(2, select_matrix(&matrices, 1.0).map(|m| m.zoom_level).unwrap());
        assert!(select_matrix(&[], 1.0).is_none());
    }

    #[test]
    fn test_tile_range_on_exact_edges() {
        let set = world();
        let z1 = matrix(1, 2);

        let north_east = BoundingBox::new(0.0, 0.0, H, H);
        assert_eq!(
            Some(TileRange {
                min_column: 1,
                max_column: 1,
                min_row: 0,
                max_row: 0,
            }),
            tile_range(&set, &z1, &north_east)
        );
        assert_eq!(north_east, tile_bounds(&set, &z1, 1, 0));
    }

    #[test]
    fn test_tile_range_is_clamped() {
        let set = world();
        let z1 = matrix(1, 2);

        let larger = BoundingBox::new(-3.0 * H, -3.0 * H, 3.0 * H, 3.0 * H);
        assert_eq!(4, tile_range(&set, &z1, &larger).unwrap().len());

        let outside = BoundingBox::new(1.5 * H, 0.0, 2.0 * H, H);
        assert_eq!(None, tile_range(&set, &z1, &outside));
    }
}
