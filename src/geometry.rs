//! GeoPackage binary geometry codec.
//!
//! A stored geometry is a `GP` header (version, flags, SRS id and an optional
//! envelope) followed by a standard WKB body. The header is read here; the
//! body is read and written by the `wkb` crate and surfaces as `geo_types`
//! geometries. Header and body each carry their own byte order.
//!
//! Further reading: http://www.geopackage.org/spec/#gpb_format

use geo_traits::{
    CoordTrait, Dimensions, GeometryCollectionTrait, GeometryTrait, GeometryType,
    LineStringTrait, MultiLineStringTrait, MultiPointTrait, MultiPolygonTrait, PointTrait,
    PolygonTrait,
};
use geo_types::{
    Coord, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon, Point,
    Polygon,
};
use wkb::reader::{read_wkb, Wkb};
use wkb::writer::{write_geometry, WriteOptions};

use crate::bounds::GeometryEnvelope;
use crate::error::{Error, Result};

pub use geo_types::Geometry;
pub use wkb::Endianness;

const MAGIC: &[u8; 2] = b"GP";
const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const FLAG_EMPTY: u8 = 0b0001_0000;
const FLAG_EXTENDED: u8 = 0b0010_0000;

/// Magic, version, flags and SRS id.
const HEADER_SIZE: usize = 8;
/// Byte order plus geometry type.
const WKB_HEADER_SIZE: usize = 5;

/// A decoded GeoPackage binary geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoPackageGeometry {
    pub srs_id: i32,
    /// Envelope as written in the header, if any.
    pub header_envelope: Option<GeometryEnvelope>,
    /// Envelope computed from the WKB coordinates, Z and M included.
    pub envelope: Option<GeometryEnvelope>,
    /// `None` when the header's empty flag is set.
    pub geometry: Option<Geometry>,
}

struct Header {
    srs_id: i32,
    envelope: Option<GeometryEnvelope>,
    empty: bool,
    size: usize,
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedGeometry(reason.into())
}

fn header_bytes<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| {
            malformed(format!(
                "truncated header: needed {} bytes at offset {}, have {}",
                N,
                offset,
                bytes.len()
            ))
        })
}

fn read_header(bytes: &[u8]) -> Result<Header> {
    if &header_bytes::<2>(bytes, 0)? != MAGIC {
        return Err(malformed("missing GP magic number"));
    }
    let flags = header_bytes::<1>(bytes, 3)?[0];
    if flags & FLAG_EXTENDED != 0 {
        return Err(malformed("extended geometry types are not supported"));
    }

    let little_endian = flags & FLAG_LITTLE_ENDIAN != 0;
    let f64_at = |offset: usize| -> Result<f64> {
        let raw = header_bytes::<8>(bytes, offset)?;
        Ok(if little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    };

    let raw_srs_id = header_bytes::<4>(bytes, 4)?;
    let srs_id = if little_endian {
        i32::from_le_bytes(raw_srs_id)
    } else {
        i32::from_be_bytes(raw_srs_id)
    };

    // Envelope ordinates follow the SRS id as min/max pairs: x, y, then z and/or m.
    let indicator = (flags >> 1) & 0b111;
    let pairs = match indicator {
        0 => 0,
        1 => 2,
        2 | 3 => 3,
        4 => 4,
        other => return Err(malformed(format!("invalid envelope indicator {}", other))),
    };
    let envelope = if pairs == 0 {
        None
    } else {
        let ordinate = |n: usize| f64_at(HEADER_SIZE + n * 8);
        let mut envelope =
            GeometryEnvelope::new(ordinate(0)?, ordinate(1)?, ordinate(2)?, ordinate(3)?);
        if indicator == 2 || indicator == 4 {
            envelope.min_z = Some(ordinate(4)?);
            envelope.max_z = Some(ordinate(5)?);
        }
        if indicator == 3 {
            envelope.min_m = Some(ordinate(4)?);
            envelope.max_m = Some(ordinate(5)?);
        }
        if indicator == 4 {
            envelope.min_m = Some(ordinate(6)?);
            envelope.max_m = Some(ordinate(7)?);
        }
        Some(envelope)
    };

    Ok(Header {
        srs_id,
        envelope,
        empty: flags & FLAG_EMPTY != 0,
        size: HEADER_SIZE + pairs * 16,
    })
}

/// The `wkb` reader takes a top level point's ordinates on trust, so its
/// length is checked up front.
fn check_point_length(body: &[u8]) -> Result<()> {
    let raw: Option<[u8; 4]> = body.get(1..WKB_HEADER_SIZE).and_then(|raw| raw.try_into().ok());
    let code = match (body.first(), raw) {
        (Some(0), Some(raw)) => u32::from_be_bytes(raw),
        (Some(1), Some(raw)) => u32::from_le_bytes(raw),
        _ => return Ok(()),
    };

    let iso = code & 0x0FFF_FFFF;
    if iso % 1000 != 1 {
        return Ok(());
    }
    let ordinates = match iso / 1000 {
        1 | 2 => 3,
        3 => 4,
        _ => 2,
    } + (code >> 31 & 1) as usize
        + (code >> 30 & 1) as usize;

    let needed = WKB_HEADER_SIZE + ordinates * 8;
    if body.len() < needed {
        return Err(malformed(format!(
            "truncated point: needed {} bytes, have {}",
            needed,
            body.len()
        )));
    }
    Ok(())
}

/// Bytes a WKB geometry occupies, worked out from its element counts alone.
fn wkb_size<G: GeometryTrait<T = f64>>(geometry: &G) -> usize {
    let coord = geometry.dim().size() * 8;
    let coords = |n: usize| 4usize.saturating_add(n.saturating_mul(coord));

    let body = match geometry.as_type() {
        GeometryType::Point(_) => coord,
        GeometryType::LineString(line) => coords(line.num_coords()),
        GeometryType::Polygon(polygon) => polygon_size(polygon, coord),
        GeometryType::MultiPoint(points) => {
            coords(points.num_points()).saturating_add(points.num_points() * WKB_HEADER_SIZE)
        }
        GeometryType::MultiLineString(lines) => lines.line_strings().fold(4, |size: usize, line| {
            size.saturating_add(WKB_HEADER_SIZE + coords(line.num_coords()))
        }),
        GeometryType::MultiPolygon(polygons) => polygons.polygons().fold(4, |size: usize, polygon| {
            size.saturating_add(WKB_HEADER_SIZE + polygon_size(&polygon, coord))
        }),
        GeometryType::GeometryCollection(collection) => collection
            .geometries()
            .fold(4, |size: usize, member| size.saturating_add(wkb_size(&member))),
        _ => 0,
    };
    WKB_HEADER_SIZE.saturating_add(body)
}

fn polygon_size<P: PolygonTrait<T = f64>>(polygon: &P, coord: usize) -> usize {
    polygon
        .exterior()
        .into_iter()
        .chain(polygon.interiors())
        .fold(4, |size, ring| {
            size.saturating_add(4 + ring.num_coords().saturating_mul(coord))
        })
}

fn read_body(body: &[u8]) -> Result<Wkb<'_>> {
    check_point_length(body)?;
    let wkb = read_wkb(body).map_err(|e| malformed(e.to_string()))?;

    let needed = wkb_size(&wkb);
    if needed > body.len() {
        return Err(malformed(format!(
            "truncated WKB: element counts need {} bytes, have {}",
            needed,
            body.len()
        )));
    }
    Ok(wkb)
}

fn expand_coord<C: CoordTrait<T = f64>>(coord: &C, envelope: &mut Option<GeometryEnvelope>) {
    let (x, y) = (coord.x(), coord.y());
    // WKB writes an empty point as NaN ordinates.
    if x.is_nan() && y.is_nan() {
        return;
    }
    let (z, m) = match coord.dim() {
        Dimensions::Xyz => (coord.nth(2), None),
        Dimensions::Xym => (None, coord.nth(2)),
        Dimensions::Xyzm => (coord.nth(2), coord.nth(3)),
        _ => (None, None),
    };

    match envelope.as_mut() {
        Some(e) => e.expand(x, y, z, m),
        None => {
            let mut e = GeometryEnvelope::new(x, x, y, y);
            e.expand(x, y, z, m);
            *envelope = Some(e);
        }
    }
}

fn expand_line<L: LineStringTrait<T = f64>>(line: &L, envelope: &mut Option<GeometryEnvelope>) {
    line.coords().for_each(|c| expand_coord(&c, envelope));
}

fn expand_polygon<P: PolygonTrait<T = f64>>(polygon: &P, envelope: &mut Option<GeometryEnvelope>) {
    polygon
        .exterior()
        .into_iter()
        .chain(polygon.interiors())
        .for_each(|ring| expand_line(&ring, envelope));
}

fn expand<G: GeometryTrait<T = f64>>(geometry: &G, envelope: &mut Option<GeometryEnvelope>) {
    match geometry.as_type() {
        GeometryType::Point(point) => {
            if let Some(c) = point.coord() {
                expand_coord(&c, envelope);
            }
        }
        GeometryType::LineString(line) => expand_line(line, envelope),
        GeometryType::Polygon(polygon) => expand_polygon(polygon, envelope),
        GeometryType::MultiPoint(points) => points.points().for_each(|point| {
            if let Some(c) = point.coord() {
                expand_coord(&c, envelope);
            }
        }),
        GeometryType::MultiLineString(lines) => lines
            .line_strings()
            .for_each(|line| expand_line(&line, envelope)),
        GeometryType::MultiPolygon(polygons) => polygons
            .polygons()
            .for_each(|polygon| expand_polygon(&polygon, envelope)),
        GeometryType::GeometryCollection(collection) => collection
            .geometries()
            .for_each(|member| expand(&member, envelope)),
        _ => {}
    }
}

/// Envelope of all non-empty coordinates, or `None` for an empty geometry.
pub fn compute_envelope<G: GeometryTrait<T = f64>>(geometry: &G) -> Option<GeometryEnvelope> {
    let mut envelope = None;
    expand(geometry, &mut envelope);
    envelope
}

fn convert_point<P, E>(
    point: &P,
    f: &mut impl FnMut(Coord) -> std::result::Result<Coord, E>,
) -> std::result::Result<Point, E>
where
    P: PointTrait<T = f64>,
{
    match point.coord() {
        Some(c) => Ok(Point(f(Coord { x: c.x(), y: c.y() })?)),
        None => Ok(Point::new(f64::NAN, f64::NAN)),
    }
}

fn convert_line<L, E>(
    line: &L,
    f: &mut impl FnMut(Coord) -> std::result::Result<Coord, E>,
) -> std::result::Result<LineString, E>
where
    L: LineStringTrait<T = f64>,
{
    line.coords()
        .map(|c| f(Coord { x: c.x(), y: c.y() }))
        .collect::<std::result::Result<Vec<_>, E>>()
        .map(LineString)
}

fn convert_polygon<P, E>(
    polygon: &P,
    f: &mut impl FnMut(Coord) -> std::result::Result<Coord, E>,
) -> std::result::Result<Polygon, E>
where
    P: PolygonTrait<T = f64>,
{
    let exterior = match polygon.exterior() {
        Some(ring) => convert_line(&ring, &mut *f)?,
        None => LineString(Vec::new()),
    };
    let interiors = polygon
        .interiors()
        .map(|ring| convert_line(&ring, &mut *f))
        .collect::<std::result::Result<Vec<_>, E>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn convert<G, E>(
    geometry: &G,
    f: &mut impl FnMut(Coord) -> std::result::Result<Coord, E>,
) -> std::result::Result<Geometry, E>
where
    G: GeometryTrait<T = f64>,
{
    Ok(match geometry.as_type() {
        GeometryType::Point(point) => Geometry::Point(convert_point(point, f)?),
        GeometryType::LineString(line) => Geometry::LineString(convert_line(line, f)?),
        GeometryType::Polygon(polygon) => Geometry::Polygon(convert_polygon(polygon, f)?),
        GeometryType::MultiPoint(points) => Geometry::MultiPoint(MultiPoint(
            points
                .points()
                .map(|point| convert_point(&point, &mut *f))
                .collect::<std::result::Result<_, E>>()?,
        )),
        GeometryType::MultiLineString(lines) => Geometry::MultiLineString(MultiLineString(
            lines
                .line_strings()
                .map(|line| convert_line(&line, &mut *f))
                .collect::<std::result::Result<_, E>>()?,
        )),
        GeometryType::MultiPolygon(polygons) => Geometry::MultiPolygon(MultiPolygon(
            polygons
                .polygons()
                .map(|polygon| convert_polygon(&polygon, &mut *f))
                .collect::<std::result::Result<_, E>>()?,
        )),
        GeometryType::GeometryCollection(collection) => {
            Geometry::GeometryCollection(GeometryCollection(
                collection
                    .geometries()
                    .map(|member| convert(&member, &mut *f))
                    .collect::<std::result::Result<_, E>>()?,
            ))
        }
        // WKB has no rect, triangle or line types.
        _ => Geometry::GeometryCollection(GeometryCollection(Vec::new())),
    })
}

/// Rebuilds a geometry with every non-empty coordinate passed through `f`.
pub fn try_map_coords<E>(
    geometry: &Geometry,
    mut f: impl FnMut(Coord) -> std::result::Result<Coord, E>,
) -> std::result::Result<Geometry, E> {
    convert(geometry, &mut f)
}

/// Decodes a GeoPackage binary geometry.
pub fn decode(bytes: &[u8]) -> Result<GeoPackageGeometry> {
    let header = read_header(bytes)?;

    let (envelope, geometry) = if header.empty {
        (None, None)
    } else {
        let wkb = read_body(&bytes[header.size..])?;
        let geometry = convert(&wkb, &mut |c| Ok::<_, Error>(c))?;
        (compute_envelope(&wkb), Some(geometry))
    };

    Ok(GeoPackageGeometry {
        srs_id: header.srs_id,
        header_envelope: header.envelope,
        envelope,
        geometry,
    })
}

/// Envelope of a GeoPackage binary geometry, or `None` when it is empty.
///
/// Only the WKB element structure is walked; no `geo_types` geometry is built.
pub fn decode_envelope(bytes: &[u8]) -> Result<Option<GeometryEnvelope>> {
    let header = read_header(bytes)?;
    if header.empty {
        return Ok(None);
    }
    Ok(compute_envelope(&read_body(&bytes[header.size..])?))
}

/// Encodes a geometry as GeoPackage binary with an XY header envelope. Empty
/// geometries get the empty flag and no envelope.
pub fn encode(geometry: &Geometry, srs_id: i32, endianness: Endianness) -> Result<Vec<u8>> {
    let envelope = compute_envelope(geometry);
    let little_endian = matches!(endianness, Endianness::LittleEndian);

    let mut flags = match envelope {
        Some(_) => 1 << 1,
        None => FLAG_EMPTY,
    };
    if little_endian {
        flags |= FLAG_LITTLE_ENDIAN;
    }

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC);
    out.push(0);
    out.push(flags);

    let put_f64 = |out: &mut Vec<u8>, v: f64| {
        if little_endian {
            out.extend_from_slice(&v.to_le_bytes());
        } else {
            out.extend_from_slice(&v.to_be_bytes());
        }
    };
    if little_endian {
        out.extend_from_slice(&srs_id.to_le_bytes());
    } else {
        out.extend_from_slice(&srs_id.to_be_bytes());
    }
    if let Some(e) = envelope {
        for v in [e.min_x, e.max_x, e.min_y, e.max_y] {
            put_f64(&mut out, v);
        }
    }

    write_geometry(&mut out, geometry, &WriteOptions { endianness })
        .map_err(|e| malformed(e.to_string()))?;
    Ok(out)
}
