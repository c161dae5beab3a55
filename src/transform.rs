//! Coordinate transforms between spatial reference systems.
//!
//! Projections are resolved from the store's SRS definitions and cached for the
//! life of the process, keyed by the definition itself and the backend that
//! parsed it. A redefined id or a second store with a different definition
//! under the same id resolves to its own entry.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use proj4rs::proj::Proj;
use tracing::{debug, warn};

use crate::bounds::{BoundingBox, WEB_MERCATOR_HALF_EXTENT};
use crate::error::{Error, Result};
use crate::model::SpatialReferenceSystem;
use crate::store::SrsStore;

pub const WGS84: i64 = 4326;
pub const WEB_MERCATOR: i64 = 3857;

/// Highest latitude representable in Web Mercator.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_6;

/// Points sampled along each edge when transforming a bounding box.
const EDGE_SAMPLES: usize = 20;

/// Highest zoom level whose tile grid still fits the column arithmetic.
pub const MAX_ZOOM: u8 = 30;

/// A projection between WGS84 longitude/latitude and one SRS.
pub trait Projection: Send + Sync + fmt::Debug {
    /// WGS84 degrees to SRS coordinates.
    fn forward(&self, lon: f64, lat: f64) -> std::result::Result<(f64, f64), String>;

    /// SRS coordinates to WGS84 degrees.
    fn inverse(&self, x: f64, y: f64) -> std::result::Result<(f64, f64), String>;
}

/// Turns stored SRS definitions into projections.
pub trait ProjectionBackend: Send + Sync {
    /// `None` when the definition is not understood.
    fn parse(&self, srs: &SpatialReferenceSystem) -> Option<Arc<dyn Projection>>;

    /// Separates this backend's cached projections from other backends'.
    fn cache_tag(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug)]
struct Geographic;

impl Projection for Geographic {
    fn forward(&self, lon: f64, lat: f64) -> std::result::Result<(f64, f64), String> {
        if lon.is_finite() && lat.is_finite() {
            Ok((lon, lat))
        } else {
            Err(String::from("non-finite coordinate"))
        }
    }

    fn inverse(&self, x: f64, y: f64) -> std::result::Result<(f64, f64), String> {
        self.forward(x, y)
    }
}

#[derive(Debug)]
struct WebMercator;

impl Projection for WebMercator {
    fn forward(&self, lon: f64, lat: f64) -> std::result::Result<(f64, f64), String> {
        if !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0 {
            return Err(format!("latitude {lat} is outside the valid range"));
        }

        let lat = lat.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
        let x = lon * WEB_MERCATOR_HALF_EXTENT / 180.0;
        let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * WEB_MERCATOR_HALF_EXTENT / PI;

        Ok((x, y))
    }

    fn inverse(&self, x: f64, y: f64) -> std::result::Result<(f64, f64), String> {
        if !x.is_finite() || !y.is_finite() {
            return Err(String::from("non-finite coordinate"));
        }

        let lon = x * 180.0 / WEB_MERCATOR_HALF_EXTENT;
        let lat = (2.0 * (y * PI / WEB_MERCATOR_HALF_EXTENT).exp().atan() - PI / 2.0).to_degrees();

        Ok((lon, lat))
    }
}

/// A projection evaluated by proj4rs.
pub struct Proj4Projection {
    definition: String,
    proj: Proj,
    wgs84: Proj,
    geographic: bool,
}

impl fmt::Debug for Proj4Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proj4Projection")
            .field("definition", &self.definition)
            .field("geographic", &self.geographic)
            .finish_non_exhaustive()
    }
}

impl Proj4Projection {
    pub fn new(definition: &str) -> std::result::Result<Self, String> {
        let proj = Proj::from_proj_string(definition)
            .map_err(|e| format!("invalid projection {definition}: {e:?}"))?;
        let wgs84 = Proj::from_proj_string("+proj=longlat +datum=WGS84 +no_defs")
            .map_err(|e| format!("invalid WGS84 projection: {e:?}"))?;

        Ok(Proj4Projection {
            definition: definition.to_owned(),
            proj,
            wgs84,
            geographic: definition.contains("+proj=longlat") || definition.contains("+proj=latlong"),
        })
    }
}

impl Projection for Proj4Projection {
    fn forward(&self, lon: f64, lat: f64) -> std::result::Result<(f64, f64), String> {
        let mut point = (lon.to_radians(), lat.to_radians(), 0.0);
        proj4rs::transform::transform(&self.wgs84, &self.proj, &mut point)
            .map_err(|e| format!("transform failed: {e:?}"))?;

        if self.geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    fn inverse(&self, x: f64, y: f64) -> std::result::Result<(f64, f64), String> {
        let mut point = if self.geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(&self.proj, &self.wgs84, &mut point)
            .map_err(|e| format!("transform failed: {e:?}"))?;

        Ok((point.0.to_degrees(), point.1.to_degrees()))
    }
}

/// PROJ strings for EPSG codes that have no inline implementation.
pub fn epsg_proj_string(code: i64) -> Option<String> {
    let definition = match code {
        4269 => String::from("+proj=longlat +datum=NAD83 +no_defs"),
        4258 => String::from("+proj=longlat +ellps=GRS80 +no_defs"),
        3395 => String::from("+proj=merc +lon_0=0 +k=1 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs"),
        32601..=32660 => format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            code - 32600
        ),
        32701..=32760 => format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        ),
        _ => return None,
    };

    Some(definition)
}

/// Inline WGS84 and Web Mercator, proj4rs for everything else.
#[derive(Clone, Copy, Debug, Default)]
pub struct Proj4Backend;

impl ProjectionBackend for Proj4Backend {
    fn parse(&self, srs: &SpatialReferenceSystem) -> Option<Arc<dyn Projection>> {
        let code = srs
            .organization
            .eq_ignore_ascii_case("EPSG")
            .then_some(srs.organization_coordsys_id);

        match code {
            Some(4326) => return Some(Arc::new(Geographic)),
            Some(3857 | 900_913 | 3785 | 102_100) => return Some(Arc::new(WebMercator)),
            _ => {}
        }

        // The undefined geographic SRS is plain longitude/latitude.
        if srs.srs_id == 0 {
            return Some(Arc::new(Geographic));
        }

        let definition = code.and_then(epsg_proj_string).or_else(|| {
            let definition = srs.definition.trim();
            definition.starts_with('+').then(|| definition.to_owned())
        })?;

        match Proj4Projection::new(&definition) {
            Ok(projection) => Some(Arc::new(projection)),
            Err(e) => {
                warn!(srs_id = srs.srs_id, error = %e, "Unusable projection definition");
                None
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ProjectionKey {
    backend: &'static str,
    srs_id: i64,
    organization: String,
    organization_coordsys_id: i64,
    definition: String,
}

impl ProjectionKey {
    fn new(backend: &dyn ProjectionBackend, srs: &SpatialReferenceSystem) -> Self {
        ProjectionKey {
            backend: backend.cache_tag(),
            srs_id: srs.srs_id,
            organization: srs.organization.clone(),
            organization_coordsys_id: srs.organization_coordsys_id,
            definition: srs.definition.clone(),
        }
    }
}

static PROJECTIONS: Lazy<RwLock<HashMap<ProjectionKey, Arc<dyn Projection>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Transforms points and boxes between any two SRS ids known to a store.
pub struct CoordinateTransform<'a, S: ?Sized> {
    store: &'a S,
    backend: Arc<dyn ProjectionBackend>,
}

impl<'a, S: SrsStore + ?Sized> CoordinateTransform<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_backend(store, Arc::new(Proj4Backend))
    }

    pub fn with_backend(store: &'a S, backend: Arc<dyn ProjectionBackend>) -> Self {
        CoordinateTransform { store, backend }
    }

    /// Resolves the projection of an SRS id. Only parsing is cached; the
    /// definition is read from the store every time.
    pub async fn projection(&self, srs_id: i64) -> Result<Arc<dyn Projection>> {
        let srs = self
            .store
            .spatial_reference_system(srs_id)
            .await?
            .ok_or(Error::UnknownSrs(srs_id))?;
        let key = ProjectionKey::new(self.backend.as_ref(), &srs);

        let cached = {
            let cache = PROJECTIONS.read().unwrap_or_else(|e| e.into_inner());
            cache.get(&key).cloned()
        };
        if let Some(projection) = cached {
            return Ok(projection);
        }

        let projection = self.backend.parse(&srs).ok_or(Error::UnknownSrs(srs_id))?;

        debug!(srs_id, ?projection, "Resolved projection");

        let mut cache = PROJECTIONS.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(key).or_insert(projection).clone())
    }

    /// Builds a reusable transformer. Equal ids never touch the store.
    pub async fn transformer(&self, from_srs: i64, to_srs: i64) -> Result<Transformer> {
        if from_srs == to_srs {
            return Ok(Transformer::identity(from_srs));
        }

        let from = self.projection(from_srs).await?;
        let to = self.projection(to_srs).await?;

        Ok(Transformer {
            from_srs,
            to_srs,
            projections: Some((from, to)),
        })
    }

    pub async fn transform(&self, point: (f64, f64), from_srs: i64, to_srs: i64) -> Result<(f64, f64)> {
        self.transformer(from_srs, to_srs)
            .await?
            .transform(point.0, point.1)
    }

    pub async fn transform_bounds(
        &self,
        bounds: &BoundingBox,
        from_srs: i64,
        to_srs: i64,
    ) -> Result<BoundingBox> {
        self.transformer(from_srs, to_srs)
            .await?
            .transform_bounds(bounds)
    }

    /// Bounds of an XYZ tile in `srs_id`, or `None` for addresses outside the grid.
    ///
    /// Web Mercator bounds are exact; every other SRS gets the WGS84 tile
    /// bounds projected into it.
    pub async fn xyz_bounds(&self, x: i32, y: i32, zoom: u8, srs_id: i64) -> Result<Option<BoundingBox>> {
        if zoom > MAX_ZOOM || x < 0 || y < 0 {
            return Ok(None);
        }

        let tiles = 1i64 << zoom;
        let (x, y) = (x as u32, y as u32);
        if i64::from(x) >= tiles || i64::from(y) >= tiles {
            return Ok(None);
        }

        if srs_id == WEB_MERCATOR {
            return Ok(Some(BoundingBox::web_mercator_tile(x, y, zoom)));
        }

        let wgs84 = BoundingBox::wgs84_tile(x, y, zoom);
        Ok(Some(self.transform_bounds(&wgs84, WGS84, srs_id).await?))
    }
}

/// A resolved pair of projections.
#[derive(Clone, Debug)]
pub struct Transformer {
    from_srs: i64,
    to_srs: i64,
    projections: Option<(Arc<dyn Projection>, Arc<dyn Projection>)>,
}

impl Transformer {
    pub fn identity(srs_id: i64) -> Self {
        Transformer {
            from_srs: srs_id,
            to_srs: srs_id,
            projections: None,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.projections.is_none()
    }

    pub fn from_srs(&self) -> i64 {
        self.from_srs
    }

    pub fn to_srs(&self) -> i64 {
        self.to_srs
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some((from, to)) = &self.projections else {
            return Ok((x, y));
        };

        let failure = |srs_id: i64, reason: String| Error::ProjectionFailure {
            srs_id,
            x,
            y,
            reason,
        };

        let (lon, lat) = from
            .inverse(x, y)
            .map_err(|reason| failure(self.from_srs, reason))?;
        let (tx, ty) = to
            .forward(lon, lat)
            .map_err(|reason| failure(self.to_srs, reason))?;

        if tx.is_finite() && ty.is_finite() {
            Ok((tx, ty))
        } else {
            Err(failure(self.to_srs, String::from("non-finite result")))
        }
    }

    /// Transforms a box by sampling its edges, so curved edges are covered.
    /// Samples that fail to project are skipped; the box fails only when
    /// none succeed.
    pub fn transform_bounds(&self, bounds: &BoundingBox) -> Result<BoundingBox> {
        if self.is_identity() {
            return Ok(*bounds);
        }

        let mut result: Option<BoundingBox> = None;
        let mut first_error = None;

        for i in 0..=EDGE_SAMPLES {
            let t = i as f64 / EDGE_SAMPLES as f64;
            let x = bounds.min_x + t * bounds.width();
            let y = bounds.min_y + t * bounds.height();

            for (sx, sy) in [
                (x, bounds.min_y),
                (x, bounds.max_y),
                (bounds.min_x, y),
                (bounds.max_x, y),
            ] {
                match self.transform(sx, sy) {
                    Ok((tx, ty)) => {
                        result = Some(match result {
                            None => BoundingBox::new(tx, ty, tx, ty),
                            Some(b) => BoundingBox::new(
                                b.min_x.min(tx),
                                b.min_y.min(ty),
                                b.max_x.max(tx),
                                b.max_y.max(ty),
                            ),
                        });
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match (result, first_error) {
            (Some(bounds), _) => Ok(bounds),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::ProjectionFailure {
                srs_id: self.from_srs,
                x: bounds.min_x,
                y: bounds.min_y,
                reason: String::from("no samples"),
            }),
        }
    }
}
