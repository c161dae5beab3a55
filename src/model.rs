//! Typed rows and metadata records of a GeoPackage store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bounds::{BoundingBox, GeometryEnvelope};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialReferenceSystem {
    pub srs_name: String,
    pub srs_id: i64,
    pub organization: String,
    pub organization_coordsys_id: i64,
    /// Projection definition; WKT in most stores, PROJ strings are also accepted.
    pub definition: String,
    pub description: Option<String>,
}

/// Full extent of a tile pyramid, in the pyramid's own SRS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileMatrixSet {
    pub table_name: String,
    pub srs_id: i64,
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl TileMatrixSet {
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// One zoom level of a tile pyramid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileMatrix {
    pub table_name: String,
    pub zoom_level: i64,
    pub matrix_width: i64,
    pub matrix_height: i64,
    pub tile_width: i64,
    pub tile_height: i64,
    pub pixel_x_size: f64,
    pub pixel_y_size: f64,
}

impl TileMatrix {
    /// Width of one tile in SRS units.
    pub fn tile_span_x(&self) -> f64 {
        self.tile_width as f64 * self.pixel_x_size
    }

    /// Height of one tile in SRS units.
    pub fn tile_span_y(&self) -> f64 {
        self.tile_height as f64 * self.pixel_y_size
    }
}

/// Inclusive column and row span of one tile matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRange {
    pub min_column: i64,
    pub max_column: i64,
    pub min_row: i64,
    pub max_row: i64,
}

impl TileRange {
    pub fn len(&self) -> usize {
        let columns = (self.max_column - self.min_column + 1).max(0);
        let rows = (self.max_row - self.min_row + 1).max(0);
        (columns * rows) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileRow {
    pub table_name: String,
    pub zoom_level: i64,
    pub tile_column: i64,
    pub tile_row: i64,
    pub tile_data: Vec<u8>,
}

/// Declared type of a feature table attribute column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Real,
    Text,
    Blob,
    DateTime,
}

impl DataType {
    /// Maps a SQLite declared column type onto an attribute type.
    pub fn from_declared(declared: &str) -> DataType {
        let declared = declared.to_ascii_uppercase();
        if declared.starts_with("DATE") {
            DataType::DateTime
        } else if declared.contains("INT") || declared == "BOOLEAN" {
            DataType::Integer
        } else if declared.contains("REAL")
            || declared.contains("FLOA")
            || declared.contains("DOUB")
        {
            DataType::Real
        } else if declared.contains("BLOB") || declared.is_empty() {
            DataType::Blob
        } else {
            DataType::Text
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Text => "TEXT",
            DataType::Blob => "BLOB",
            DataType::DateTime => "DATETIME",
        }
    }
}

/// A single attribute value of a feature row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Blob(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub data_type: DataType,
}

/// Table-level metadata of a feature table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub table_name: String,
    pub id_column: String,
    pub geometry_column: String,
    pub geometry_type_name: String,
    pub srs_id: i64,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureRow {
    /// `None` until the row has been written.
    pub id: Option<i64>,
    /// GeoPackage binary geometry.
    pub geometry: Option<Vec<u8>>,
    pub attributes: BTreeMap<String, Value>,
}

impl FeatureRow {
    pub fn new(geometry: Option<Vec<u8>>) -> Self {
        FeatureRow {
            id: None,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_owned(), value);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionScope {
    #[serde(rename = "read-write")]
    ReadWrite,
    #[serde(rename = "write-only")]
    WriteOnly,
}

impl ExtensionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionScope::ReadWrite => "read-write",
            ExtensionScope::WriteOnly => "write-only",
        }
    }
}

impl fmt::Display for ExtensionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtensionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-write" => Ok(ExtensionScope::ReadWrite),
            "write-only" => Ok(ExtensionScope::WriteOnly),
            other => Err(format!("unknown extension scope {other}")),
        }
    }
}

/// A row of `gpkg_extensions`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub table_name: Option<String>,
    pub column_name: Option<String>,
    pub extension_name: String,
    pub definition: String,
    pub scope: ExtensionScope,
}

impl ExtensionRecord {
    /// The `<author>` part of an `<author>_<extension>` name.
    pub fn author(&self) -> &str {
        self.extension_name
            .split_once('_')
            .map_or(self.extension_name.as_str(), |(author, _)| author)
    }

    /// The extension name with its author prefix removed.
    pub fn name_without_author(&self) -> &str {
        self.extension_name
            .split_once('_')
            .map_or(self.extension_name.as_str(), |(_, name)| name)
    }
}

/// Completion marker of a geometry index build.
#[derive(Clone, Debug, PartialEq)]
pub struct TableIndex {
    pub table_name: String,
    pub last_indexed: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpatialIndexEntry {
    pub table_name: String,
    pub row_id: i64,
    pub envelope: GeometryEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_types() {
        assert_eq!(DataType::Integer, DataType::from_declared("MEDIUMINT"));
        assert_eq!(DataType::Integer, DataType::from_declared("boolean"));
        assert_eq!(DataType::Real, DataType::from_declared("DOUBLE"));
        assert_eq!(DataType::Text, DataType::from_declared("TEXT(32)"));
        assert_eq!(DataType::DateTime, DataType::from_declared("DATE"));
        assert_eq!(DataType::Blob, DataType::from_declared("BLOB"));
    }

    #[test]
    fn test_extension_name_parts() {
        let record = ExtensionRecord {
            table_name: Some(String::from("rivers")),
            column_name: Some(String::from("geom")),
            extension_name: String::from("nga_geometry_index"),
            definition: String::new(),
            scope: ExtensionScope::ReadWrite,
        };

        assert_eq!("nga", record.author());
        assert_eq!("geometry_index", record.name_without_author());
        assert_eq!(Ok(ExtensionScope::WriteOnly), "write-only".parse());
    }

    #[test]
    fn test_tile_range_len() {
        let range = TileRange {
            min_column: 2,
            max_column: 3,
            min_row: 5,
            max_row: 6,
        };
        assert_eq!(4, range.len());

        let inverted = TileRange {
            min_column: 3,
            max_column: 2,
            ..range
        };
        assert!(inverted.is_empty());
    }
}
