//! Axis-aligned bounding boxes and geometry envelopes.
//!
//! Bounds are `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]` in
//! whatever SRS the caller is working in. Tile addresses follow the slippy map
//! convention: column grows eastward and row grows southward from the
//! north-west corner.

use serde::{Deserialize, Serialize};

/// Half the earth's circumference in Web Mercator metres.
pub const WEB_MERCATOR_HALF_EXTENT: f64 = 20_037_508.342_789_244;

/// An axis-aligned rectangle in a single SRS.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Bounds of an XYZ tile in EPSG:3857 metres.
    pub fn web_mercator_tile(x: u32, y: u32, zoom: u8) -> Self {
        let tile_size = 2.0 * WEB_MERCATOR_HALF_EXTENT / f64::from(1u32 << zoom);

        let min_x = -WEB_MERCATOR_HALF_EXTENT + f64::from(x) * tile_size;
        let max_y = WEB_MERCATOR_HALF_EXTENT - f64::from(y) * tile_size;

        BoundingBox::new(min_x, max_y - tile_size, min_x + tile_size, max_y)
    }

    /// Bounds of an XYZ tile in WGS84 degrees.
    pub fn wgs84_tile(x: u32, y: u32, zoom: u8) -> Self {
        let (west, north) = slippy_map_tilenames::tile2lonlat(x, y, zoom);
        let (east, south) = slippy_map_tilenames::tile2lonlat(x + 1, y + 1, zoom);

        BoundingBox::new(west, south, east, north)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// True when the two boxes share any point, edges included.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// The shared area of two boxes, if it has positive width and height.
    pub fn overlap(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let overlap = BoundingBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );

        if overlap.width() > 0.0 && overlap.height() > 0.0 {
            Some(overlap)
        } else {
            None
        }
    }

    /// Point containment with the west and north edges inclusive, so that
    /// adjacent tiles never both claim a point.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x < self.max_x && y > self.min_y && y <= self.max_y
    }

    /// Equality within `tolerance` times the larger of the two extents.
    pub fn approx_eq(&self, other: &BoundingBox, tolerance: f64) -> bool {
        let scale = self.width().max(self.height()).max(other.width()).max(other.height());
        let eps = scale * tolerance;

        (self.min_x - other.min_x).abs() <= eps
            && (self.min_y - other.min_y).abs() <= eps
            && (self.max_x - other.max_x).abs() <= eps
            && (self.max_y - other.max_y).abs() <= eps
    }
}

/// Bounding envelope of a geometry's coordinates.
///
/// Z and M ranges are present only when the geometry carries those ordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeometryEnvelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: Option<f64>,
    pub max_z: Option<f64>,
    pub min_m: Option<f64>,
    pub max_m: Option<f64>,
}

impl GeometryEnvelope {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        GeometryEnvelope {
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: None,
            max_z: None,
            min_m: None,
            max_m: None,
        }
    }

    pub fn from_bounds(bounds: &BoundingBox) -> Self {
        GeometryEnvelope::new(bounds.min_x, bounds.max_x, bounds.min_y, bounds.max_y)
    }

    pub fn to_bounds(&self) -> BoundingBox {
        BoundingBox::new(self.min_x, self.min_y, self.max_x, self.max_y)
    }

    /// XY intersection, boundary inclusive.
    pub fn intersects(&self, other: &GeometryEnvelope) -> bool {
        self.to_bounds().intersects(&other.to_bounds())
    }

    /// A query envelope whose west edge lies east of its east edge has wrapped
    /// past the antimeridian.
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_x > self.max_x
    }

    /// Splits a wrapped envelope into its eastern (`min_x..180`) and western
    /// (`-180..max_x`) halves.
    pub fn split_antimeridian(&self) -> (GeometryEnvelope, GeometryEnvelope) {
        let mut east = *self;
        east.max_x = 180.0;

        let mut west = *self;
        west.min_x = -180.0;

        (east, west)
    }

    pub(crate) fn expand(&mut self, x: f64, y: f64, z: Option<f64>, m: Option<f64>) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);

        if let Some(z) = z {
            self.min_z = Some(self.min_z.map_or(z, |v| v.min(z)));
            self.max_z = Some(self.max_z.map_or(z, |v| v.max(z)));
        }
        if let Some(m) = m {
            self.min_m = Some(self.min_m.map_or(m, |v| v.min(m)));
            self.max_m = Some(self.max_m.map_or(m, |v| v.max(m)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_web_mercator_tile_bounds() {
        let world = BoundingBox::web_mercator_tile(0, 0, 0);
        assert_eq!(-WEB_MERCATOR_HALF_EXTENT, world.min_x);
        assert_eq!(WEB_MERCATOR_HALF_EXTENT, world.max_y);
        assert_approx_eq!(WEB_MERCATOR_HALF_EXTENT, world.max_x);
        assert_approx_eq!(-WEB_MERCATOR_HALF_EXTENT, world.min_y);

        let north_east = BoundingBox::web_mercator_tile(1, 0, 1);
        assert_approx_eq!(0.0, north_east.min_x);
        assert_approx_eq!(0.0, north_east.min_y);
    }

    #[test]
    fn test_wgs84_tile_bounds() {
        let tile = BoundingBox::wgs84_tile(1, 0, 1);
        assert_approx_eq!(0.0, tile.min_x);
        assert_approx_eq!(180.0, tile.max_x);
        assert_approx_eq!(0.0, tile.min_y);
        assert_approx_eq!(85.051_128_779_806_59, tile.max_y, 1e-9);
    }

    #[test]
    fn test_intersects_is_boundary_inclusive() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let touching = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        let apart = BoundingBox::new(10.5, 0.0, 20.0, 10.0);

        assert!(a.intersects(&touching));
        assert!(!a.intersects(&apart));
        assert_eq!(None, a.overlap(&touching));
        assert_eq!(
            Some(BoundingBox::new(5.0, 5.0, 10.0, 10.0)),
            a.overlap(&BoundingBox::new(5.0, 5.0, 15.0, 15.0))
        );
    }

    #[test]
    fn test_split_antimeridian() {
        let wrapped = GeometryEnvelope::new(170.0, -170.0, -10.0, 10.0);
        assert!(wrapped.crosses_antimeridian());

        let (east, west) = wrapped.split_antimeridian();
        assert_eq!(GeometryEnvelope::new(170.0, 180.0, -10.0, 10.0), east);
        assert_eq!(GeometryEnvelope::new(-180.0, -170.0, -10.0, 10.0), west);
    }

    #[test]
    fn test_expand_tracks_optional_axes() {
        let mut envelope = GeometryEnvelope::new(1.0, 1.0, 2.0, 2.0);
        envelope.expand(-1.0, 5.0, Some(3.0), None);
        envelope.expand(0.0, 0.0, Some(-3.0), None);

        assert_eq!(-1.0, envelope.min_x);
        assert_eq!(5.0, envelope.max_y);
        assert_eq!(Some(-3.0), envelope.min_z);
        assert_eq!(Some(3.0), envelope.max_z);
        assert_eq!(None, envelope.min_m);
    }
}
