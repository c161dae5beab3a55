use std::str::FromStr;
use std::time::Duration;

use async_stream::try_stream;
// TODO: remove once async fn in traits become stable
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Row, Sqlite, Transaction, TypeInfo, ValueRef};
use tracing::{debug, info};

use super::{
    ExtensionStore, FeatureStore, FeatureTransaction, IndexStore, SrsStore, TileStore,
};
use crate::bounds::GeometryEnvelope;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    DataType, ExtensionRecord, ExtensionScope, FeatureColumn, FeatureRow, FeatureTable,
    SpatialIndexEntry, SpatialReferenceSystem, TableIndex, TileMatrix, TileMatrixSet, TileRange,
    TileRow, Value,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
        srs_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL PRIMARY KEY,
        organization TEXT NOT NULL,
        organization_coordsys_id INTEGER NOT NULL,
        definition TEXT NOT NULL,
        description TEXT
    )",
    "CREATE TABLE IF NOT EXISTS gpkg_contents (
        table_name TEXT NOT NULL PRIMARY KEY,
        data_type TEXT NOT NULL,
        identifier TEXT UNIQUE,
        description TEXT DEFAULT '',
        last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        min_x DOUBLE,
        min_y DOUBLE,
        max_x DOUBLE,
        max_y DOUBLE,
        srs_id INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
        table_name TEXT NOT NULL,
        column_name TEXT NOT NULL,
        geometry_type_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL,
        z TINYINT NOT NULL,
        m TINYINT NOT NULL,
        CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name)
    )",
    "CREATE TABLE IF NOT EXISTS gpkg_tile_matrix_set (
        table_name TEXT NOT NULL PRIMARY KEY,
        srs_id INTEGER NOT NULL,
        min_x DOUBLE NOT NULL,
        min_y DOUBLE NOT NULL,
        max_x DOUBLE NOT NULL,
        max_y DOUBLE NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS gpkg_tile_matrix (
        table_name TEXT NOT NULL,
        zoom_level INTEGER NOT NULL,
        matrix_width INTEGER NOT NULL,
        matrix_height INTEGER NOT NULL,
        tile_width INTEGER NOT NULL,
        tile_height INTEGER NOT NULL,
        pixel_x_size DOUBLE NOT NULL,
        pixel_y_size DOUBLE NOT NULL,
        CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level)
    )",
    "CREATE TABLE IF NOT EXISTS gpkg_extensions (
        table_name TEXT,
        column_name TEXT,
        extension_name TEXT NOT NULL,
        definition TEXT NOT NULL,
        scope TEXT NOT NULL,
        CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
    )",
    "CREATE TABLE IF NOT EXISTS nga_table_index (
        table_name TEXT NOT NULL PRIMARY KEY,
        last_indexed DATETIME
    )",
    "CREATE TABLE IF NOT EXISTS nga_geometry_index (
        table_name TEXT NOT NULL,
        geom_id INTEGER NOT NULL,
        min_x DOUBLE NOT NULL,
        max_x DOUBLE NOT NULL,
        min_y DOUBLE NOT NULL,
        max_y DOUBLE NOT NULL,
        min_z DOUBLE,
        max_z DOUBLE,
        min_m DOUBLE,
        max_m DOUBLE,
        CONSTRAINT pk_ngi PRIMARY KEY (table_name, geom_id)
    )",
];

const WGS84_WKT: &str = "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,\
AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],\
UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],AUTHORITY[\"EPSG\",\"4326\"]]";

const WEB_MERCATOR_WKT: &str = "PROJCS[\"WGS 84 / Pseudo-Mercator\",GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",\
SPHEROID[\"WGS 84\",6378137,298.257223563,AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],\
PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],\
AUTHORITY[\"EPSG\",\"4326\"]],PROJECTION[\"Mercator_1SP\"],PARAMETER[\"central_meridian\",0],\
PARAMETER[\"scale_factor\",1],PARAMETER[\"false_easting\",0],PARAMETER[\"false_northing\",0],\
UNIT[\"metre\",1,AUTHORITY[\"EPSG\",\"9001\"]],AXIS[\"X\",EAST],AXIS[\"Y\",NORTH],\
EXTENSION[\"PROJ4\",\"+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +wktext +no_defs\"],\
AUTHORITY[\"EPSG\",\"3857\"]]";

/// The definitions every GeoPackage carries.
fn default_spatial_reference_systems() -> Vec<SpatialReferenceSystem> {
    vec![
        SpatialReferenceSystem {
            srs_name: String::from("Undefined cartesian SRS"),
            srs_id: -1,
            organization: String::from("NONE"),
            organization_coordsys_id: -1,
            definition: String::from("undefined"),
            description: Some(String::from("undefined cartesian coordinate reference system")),
        },
        SpatialReferenceSystem {
            srs_name: String::from("Undefined geographic SRS"),
            srs_id: 0,
            organization: String::from("NONE"),
            organization_coordsys_id: 0,
            definition: String::from("undefined"),
            description: Some(String::from("undefined geographic coordinate reference system")),
        },
        SpatialReferenceSystem {
            srs_name: String::from("WGS 84 geodetic"),
            srs_id: 4326,
            organization: String::from("EPSG"),
            organization_coordsys_id: 4326,
            definition: String::from(WGS84_WKT),
            description: Some(String::from("longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid")),
        },
        SpatialReferenceSystem {
            srs_name: String::from("WGS 84 / Pseudo-Mercator"),
            srs_id: 3857,
            organization: String::from("EPSG"),
            organization_coordsys_id: 3857,
            definition: String::from(WEB_MERCATOR_WKT),
            description: Some(String::from("spherical mercator projection used by web maps")),
        },
    ]
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|e| Error::Database(sqlx::Error::Decode(Box::new(e))))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::DateTime(v) => query.bind(format_timestamp(v)),
        Value::Blob(v) => query.bind(v.clone()),
    }
}

/// Reads a column by its stored type; SQLite column affinity is only a hint.
fn read_value(row: &SqliteRow, index: usize, declared: Option<DataType>) -> Result<Value> {
    let storage = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let name = raw.type_info().name().to_owned();
        name
    };

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get(index)?),
        "REAL" | "NUMERIC" => Value::Real(row.try_get(index)?),
        "BLOB" => Value::Blob(row.try_get(index)?),
        _ => {
            let text: String = row.try_get(index)?;
            match declared {
                Some(DataType::DateTime) => DateTime::parse_from_rfc3339(&text)
                    .map(|timestamp| Value::DateTime(timestamp.with_timezone(&Utc)))
                    .unwrap_or(Value::Text(text)),
                _ => Value::Text(text),
            }
        }
    };

    Ok(value)
}

fn read_feature(table: &FeatureTable, row: &SqliteRow) -> Result<FeatureRow> {
    let mut feature = FeatureRow::default();

    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if name == table.id_column {
            feature.id = Some(row.try_get(index)?);
        } else if name == table.geometry_column {
            feature.geometry = row.try_get(index)?;
        } else {
            let declared = table
                .columns
                .iter()
                .find(|column| column.name == name)
                .map(|column| column.data_type);
            feature
                .attributes
                .insert(name.to_owned(), read_value(row, index, declared)?);
        }
    }

    Ok(feature)
}

fn extension_from_row(
    (table_name, column_name, extension_name, definition, scope): (
        Option<String>,
        Option<String>,
        String,
        String,
        String,
    ),
) -> Result<ExtensionRecord> {
    let scope = ExtensionScope::from_str(&scope)
        .map_err(|reason| Error::Database(sqlx::Error::Decode(reason.into())))?;

    Ok(ExtensionRecord {
        table_name,
        column_name,
        extension_name,
        definition,
        scope,
    })
}

/// A GeoPackage backed by a pool of SQLite connections.
pub struct SqliteGeoPackage {
    pool: SqlitePool,
}

impl SqliteGeoPackage {
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let options = if config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(config.create_if_missing)
                .journal_mode(SqliteJournalMode::Wal)
        }
        .busy_timeout(Duration::from_secs(5));

        let pool_options = if config.is_in_memory() {
            // The database lives and dies with its only connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = SqliteGeoPackage { pool };
        store.migrate().await?;

        info!(path = %config.path, "Opened GeoPackage");

        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the core and index tables when missing and seeds the default SRS rows.
    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for srs in default_spatial_reference_systems() {
            sqlx::query(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                    (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(srs.srs_name)
            .bind(srs.srs_id)
            .bind(srs.organization)
            .bind(srs.organization_coordsys_id)
            .bind(srs.definition)
            .bind(srs.description)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Creates a feature table with an integer `id` key, registers it in the
    /// contents and geometry column tables, and returns its metadata.
    pub async fn create_feature_table(
        &self,
        table: &str,
        geometry_column: &str,
        geometry_type_name: &str,
        srs_id: i64,
        columns: &[FeatureColumn],
    ) -> Result<FeatureTable> {
        let mut definitions = vec![
            String::from("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL"),
            format!("{} {}", quote(geometry_column), geometry_type_name),
        ];
        definitions.extend(
            columns
                .iter()
                .map(|column| format!("{} {}", quote(&column.name), column.data_type.sql_name())),
        );

        let mut tx = self.pool.begin().await?;

        let ddl = format!("CREATE TABLE {} ({})", quote(table), definitions.join(", "));
        sqlx::query(&ddl).execute(&mut *tx).await?;

        sqlx::query(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id)
             VALUES (?, 'features', ?, ?)",
        )
        .bind(table)
        .bind(table)
        .bind(srs_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO gpkg_geometry_columns
                (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES (?, ?, ?, ?, 0, 0)",
        )
        .bind(table)
        .bind(geometry_column)
        .bind(geometry_type_name)
        .bind(srs_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(table, "Created feature table");

        self.feature_table(table).await
    }

    /// Creates a tile pyramid table and its matrix set and matrix metadata.
    pub async fn create_tile_table(
        &self,
        set: &TileMatrixSet,
        matrices: &[TileMatrix],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let ddl = format!(
            "CREATE TABLE {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zoom_level INTEGER NOT NULL,
                tile_column INTEGER NOT NULL,
                tile_row INTEGER NOT NULL,
                tile_data BLOB NOT NULL,
                UNIQUE (zoom_level, tile_column, tile_row)
            )",
            quote(&set.table_name)
        );
        sqlx::query(&ddl).execute(&mut *tx).await?;

        sqlx::query(
            "INSERT INTO gpkg_contents
                (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
             VALUES (?, 'tiles', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&set.table_name)
        .bind(&set.table_name)
        .bind(set.min_x)
        .bind(set.min_y)
        .bind(set.max_x)
        .bind(set.max_y)
        .bind(set.srs_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO gpkg_tile_matrix_set (table_name, srs_id, min_x, min_y, max_x, max_y)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&set.table_name)
        .bind(set.srs_id)
        .bind(set.min_x)
        .bind(set.min_y)
        .bind(set.max_x)
        .bind(set.max_y)
        .execute(&mut *tx)
        .await?;

        for matrix in matrices {
            sqlx::query(
                "INSERT INTO gpkg_tile_matrix
                    (table_name, zoom_level, matrix_width, matrix_height,
                     tile_width, tile_height, pixel_x_size, pixel_y_size)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&set.table_name)
            .bind(matrix.zoom_level)
            .bind(matrix.matrix_width)
            .bind(matrix.matrix_height)
            .bind(matrix.tile_width)
            .bind(matrix.tile_height)
            .bind(matrix.pixel_x_size)
            .bind(matrix.pixel_y_size)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    pub async fn insert_tile(&self, tile: &TileRow) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (zoom_level, tile_column, tile_row, tile_data)
             VALUES (?, ?, ?, ?)",
            quote(&tile.table_name)
        );

        sqlx::query(&sql)
            .bind(tile.zoom_level)
            .bind(tile.tile_column)
            .bind(tile.tile_row)
            .bind(&tile.tile_data)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SrsStore for SqliteGeoPackage {
    async fn spatial_reference_system(
        &self,
        srs_id: i64,
    ) -> Result<Option<SpatialReferenceSystem>> {
        let row: Option<(String, i64, String, i64, String, Option<String>)> = sqlx::query_as(
            "SELECT srs_name, srs_id, organization, organization_coordsys_id, definition, description
             FROM gpkg_spatial_ref_sys WHERE srs_id = ?",
        )
        .bind(srs_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(srs_name, srs_id, organization, organization_coordsys_id, definition, description)| {
                SpatialReferenceSystem {
                    srs_name,
                    srs_id,
                    organization,
                    organization_coordsys_id,
                    definition,
                    description,
                }
            },
        ))
    }

    async fn put_spatial_reference_system(&self, srs: &SpatialReferenceSystem) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO gpkg_spatial_ref_sys
                (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&srs.srs_name)
        .bind(srs.srs_id)
        .bind(&srs.organization)
        .bind(srs.organization_coordsys_id)
        .bind(&srs.definition)
        .bind(&srs.description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FeatureStore for SqliteGeoPackage {
    async fn feature_table(&self, table: &str) -> Result<FeatureTable> {
        let geometry: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT column_name, geometry_type_name, srs_id
             FROM gpkg_geometry_columns WHERE table_name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let Some((geometry_column, geometry_type_name, srs_id)) = geometry else {
            return Err(Error::TableNotFound(table.to_owned()));
        };

        let info: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;

        // Feature tables are required to carry an integer primary key.
        let Some(id_column) = info
            .iter()
            .find(|(_, _, pk)| *pk == 1)
            .map(|(name, _, _)| name.clone())
        else {
            return Err(Error::TableNotFound(table.to_owned()));
        };

        let columns = info
            .into_iter()
            .filter(|(name, _, _)| *name != id_column && *name != geometry_column)
            .map(|(name, declared, _)| FeatureColumn {
                name,
                data_type: DataType::from_declared(&declared),
            })
            .collect();

        Ok(FeatureTable {
            table_name: table.to_owned(),
            id_column,
            geometry_column,
            geometry_type_name,
            srs_id,
            columns,
        })
    }

    async fn feature_tables(&self) -> Result<Vec<String>> {
        let tables = sqlx::query_scalar(
            "SELECT DISTINCT table_name FROM gpkg_geometry_columns ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(tables)
    }

    async fn get_row(&self, table: &FeatureTable, id: i64) -> Result<Option<FeatureRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote(&table.table_name),
            quote(&table.id_column)
        );

        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        row.map(|row| read_feature(table, &row)).transpose()
    }

    async fn for_each_row(
        &self,
        table: &FeatureTable,
        visitor: &mut (dyn FnMut(FeatureRow) + Send),
    ) -> Result<()> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote(&table.table_name),
            quote(&table.id_column)
        );

        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visitor(read_feature(table, &row)?);
        }

        Ok(())
    }

    async fn count_rows(&self, table: &FeatureTable) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&table.table_name));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;

        Ok(count.max(0) as u64)
    }

    async fn begin(&self) -> Result<Box<dyn FeatureTransaction>> {
        let tx = self.pool.begin().await?;

        Ok(Box::new(SqliteFeatureTransaction { tx }))
    }
}

struct SqliteFeatureTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl FeatureTransaction for SqliteFeatureTransaction {
    async fn insert(&mut self, table: &FeatureTable, row: &FeatureRow) -> Result<i64> {
        let mut columns = Vec::with_capacity(row.attributes.len() + 2);
        if row.id.is_some() {
            columns.push(quote(&table.id_column));
        }
        columns.push(quote(&table.geometry_column));
        columns.extend(row.attributes.keys().map(|name| quote(name)));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&table.table_name),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(id) = row.id {
            query = query.bind(id);
        }
        query = query.bind(row.geometry.clone());
        for value in row.attributes.values() {
            query = bind_value(query, value);
        }

        let result = query.execute(&mut *self.tx).await?;

        Ok(row.id.unwrap_or_else(|| result.last_insert_rowid()))
    }

    async fn update(&mut self, table: &FeatureTable, row: &FeatureRow) -> Result<()> {
        let id = row.id.ok_or_else(|| Error::RowNotFound {
            table: table.table_name.clone(),
            id: None,
        })?;

        let mut assignments = vec![format!("{} = ?", quote(&table.geometry_column))];
        assignments.extend(
            row.attributes
                .keys()
                .map(|name| format!("{} = ?", quote(name))),
        );

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote(&table.table_name),
            assignments.join(", "),
            quote(&table.id_column)
        );

        let mut query = sqlx::query(&sql).bind(row.geometry.clone());
        for value in row.attributes.values() {
            query = bind_value(query, value);
        }

        let result = query.bind(id).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound {
                table: table.table_name.clone(),
                id: Some(id),
            });
        }

        Ok(())
    }

    async fn delete(&mut self, table: &FeatureTable, id: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote(&table.table_name),
            quote(&table.id_column)
        );

        sqlx::query(&sql).bind(id).execute(&mut *self.tx).await?;

        Ok(())
    }

    async fn put_index_entry(&mut self, entry: &SpatialIndexEntry) -> Result<()> {
        insert_index_entry(&mut self.tx, entry).await
    }

    async fn remove_index_entry(&mut self, table: &str, row_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM nga_geometry_index WHERE table_name = ? AND geom_id = ?")
            .bind(table)
            .bind(row_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;

        Ok(())
    }
}

async fn insert_index_entry(
    tx: &mut Transaction<'static, Sqlite>,
    entry: &SpatialIndexEntry,
) -> Result<()> {
    let envelope = &entry.envelope;

    sqlx::query(
        "INSERT OR REPLACE INTO nga_geometry_index
            (table_name, geom_id, min_x, max_x, min_y, max_y, min_z, max_z, min_m, max_m)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.table_name)
    .bind(entry.row_id)
    .bind(envelope.min_x)
    .bind(envelope.max_x)
    .bind(envelope.min_y)
    .bind(envelope.max_y)
    .bind(envelope.min_z)
    .bind(envelope.max_z)
    .bind(envelope.min_m)
    .bind(envelope.max_m)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_extension(
    tx: &mut Transaction<'static, Sqlite>,
    record: &ExtensionRecord,
) -> Result<()> {
    delete_extension_row(tx, record).await?;

    sqlx::query(
        "INSERT INTO gpkg_extensions (table_name, column_name, extension_name, definition, scope)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.table_name)
    .bind(&record.column_name)
    .bind(&record.extension_name)
    .bind(&record.definition)
    .bind(record.scope.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn delete_extension_row(
    tx: &mut Transaction<'static, Sqlite>,
    record: &ExtensionRecord,
) -> Result<()> {
    // `IS` also matches the NULL table and column of store-wide extensions.
    sqlx::query(
        "DELETE FROM gpkg_extensions
         WHERE extension_name = ? AND table_name IS ? AND column_name IS ?",
    )
    .bind(&record.extension_name)
    .bind(&record.table_name)
    .bind(&record.column_name)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl IndexStore for SqliteGeoPackage {
    async fn table_index(&self, table: &str) -> Result<Option<TableIndex>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT table_name, last_indexed FROM nga_table_index WHERE table_name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((table_name, Some(last_indexed))) => Ok(Some(TableIndex {
                table_name,
                last_indexed: parse_timestamp(&last_indexed)?,
            })),
            _ => Ok(None),
        }
    }

    async fn has_table(&self, name: &str) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn replace_index(
        &self,
        index: &TableIndex,
        extension: &ExtensionRecord,
        entries: &[SpatialIndexEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM nga_geometry_index WHERE table_name = ?")
            .bind(&index.table_name)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            insert_index_entry(&mut tx, entry).await?;
        }

        sqlx::query("INSERT OR REPLACE INTO nga_table_index (table_name, last_indexed) VALUES (?, ?)")
            .bind(&index.table_name)
            .bind(format_timestamp(&index.last_indexed))
            .execute(&mut *tx)
            .await?;

        upsert_extension(&mut tx, extension).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn drop_index(&self, extension: &ExtensionRecord) -> Result<()> {
        let Some(table) = extension.table_name.as_deref() else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM nga_geometry_index WHERE table_name = ?")
            .bind(table)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nga_table_index WHERE table_name = ?")
            .bind(table)
            .execute(&mut *tx)
            .await?;
        delete_extension_row(&mut tx, extension).await?;

        tx.commit().await?;

        Ok(())
    }

    fn query_index<'a>(
        &'a self,
        table: &str,
        envelope: &GeometryEnvelope,
    ) -> BoxStream<'a, Result<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT geom_id FROM nga_geometry_index
             WHERE table_name = ? AND min_x <= ? AND max_x >= ? AND min_y <= ? AND max_y >= ?
             ORDER BY geom_id",
        )
        .bind(table.to_owned())
        .bind(envelope.max_x)
        .bind(envelope.min_x)
        .bind(envelope.max_y)
        .bind(envelope.min_y)
        .fetch(&self.pool)
        .map_err(Error::from)
        .boxed()
    }

    fn query_rtree<'a>(
        &'a self,
        rtree_table: &str,
        envelope: &GeometryEnvelope,
    ) -> BoxStream<'a, Result<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE minx <= ? AND maxx >= ? AND miny <= ? AND maxy >= ? ORDER BY id",
            quote(rtree_table)
        );
        let envelope = *envelope;

        // The stream owns the SQL text, so rows are pulled on demand like `query_index`.
        try_stream! {
            let mut ids = sqlx::query_scalar::<_, i64>(&sql)
                .bind(envelope.max_x)
                .bind(envelope.min_x)
                .bind(envelope.max_y)
                .bind(envelope.min_y)
                .fetch(&self.pool);
            while let Some(id) = ids.try_next().await.map_err(Error::from)? {
                yield id;
            }
        }
        .boxed()
    }
}

#[async_trait]
impl ExtensionStore for SqliteGeoPackage {
    async fn extension(
        &self,
        extension_name: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<ExtensionRecord>> {
        let row = sqlx::query_as(
            "SELECT table_name, column_name, extension_name, definition, scope
             FROM gpkg_extensions
             WHERE extension_name = ? AND table_name = ? AND column_name = ?",
        )
        .bind(extension_name)
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        row.map(extension_from_row).transpose()
    }

    async fn extensions_for_table(&self, table: &str) -> Result<Vec<ExtensionRecord>> {
        let rows = sqlx::query_as(
            "SELECT table_name, column_name, extension_name, definition, scope
             FROM gpkg_extensions WHERE table_name = ? ORDER BY extension_name",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(extension_from_row).collect()
    }

    async fn put_extension(&self, record: &ExtensionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_extension(&mut tx, record).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn delete_extension(&self, record: &ExtensionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_extension_row(&mut tx, record).await?;
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl TileStore for SqliteGeoPackage {
    async fn tile_matrix_set(&self, table: &str) -> Result<TileMatrixSet> {
        let row: Option<(String, i64, f64, f64, f64, f64)> = sqlx::query_as(
            "SELECT table_name, srs_id, min_x, min_y, max_x, max_y
             FROM gpkg_tile_matrix_set WHERE table_name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let (table_name, srs_id, min_x, min_y, max_x, max_y) =
            row.ok_or_else(|| Error::TileNotFound(table.to_owned()))?;

        Ok(TileMatrixSet {
            table_name,
            srs_id,
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    async fn tile_matrices(&self, table: &str) -> Result<Vec<TileMatrix>> {
        let rows: Vec<(String, i64, i64, i64, i64, i64, f64, f64)> = sqlx::query_as(
            "SELECT table_name, zoom_level, matrix_width, matrix_height,
                    tile_width, tile_height, pixel_x_size, pixel_y_size
             FROM gpkg_tile_matrix WHERE table_name = ? ORDER BY zoom_level",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    table_name,
                    zoom_level,
                    matrix_width,
                    matrix_height,
                    tile_width,
                    tile_height,
                    pixel_x_size,
                    pixel_y_size,
                )| TileMatrix {
                    table_name,
                    zoom_level,
                    matrix_width,
                    matrix_height,
                    tile_width,
                    tile_height,
                    pixel_x_size,
                    pixel_y_size,
                },
            )
            .collect())
    }

    async fn get_tile(
        &self,
        table: &str,
        zoom_level: i64,
        tile_column: i64,
        tile_row: i64,
    ) -> Result<Option<TileRow>> {
        let sql = format!(
            "SELECT tile_data FROM {} WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
            quote(table)
        );

        let data: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(zoom_level)
            .bind(tile_column)
            .bind(tile_row)
            .fetch_optional(&self.pool)
            .await?;

        Ok(data.map(|tile_data| TileRow {
            table_name: table.to_owned(),
            zoom_level,
            tile_column,
            tile_row,
            tile_data,
        }))
    }

    async fn count_tiles(&self, table: &str, zoom_level: i64, range: &TileRange) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}
             WHERE zoom_level = ? AND tile_column BETWEEN ? AND ? AND tile_row BETWEEN ? AND ?",
            quote(table)
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(zoom_level)
            .bind(range.min_column)
            .bind(range.max_column)
            .bind(range.min_row)
            .bind(range.max_row)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn tiles_in_range(
        &self,
        table: &str,
        zoom_level: i64,
        range: &TileRange,
    ) -> Result<Vec<TileRow>> {
        let sql = format!(
            "SELECT tile_column, tile_row, tile_data FROM {}
             WHERE zoom_level = ? AND tile_column BETWEEN ? AND ? AND tile_row BETWEEN ? AND ?
             ORDER BY tile_row, tile_column",
            quote(table)
        );

        let rows: Vec<(i64, i64, Vec<u8>)> = sqlx::query_as(&sql)
            .bind(zoom_level)
            .bind(range.min_column)
            .bind(range.max_column)
            .bind(range.min_row)
            .bind(range.max_row)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(tile_column, tile_row, tile_data)| TileRow {
                table_name: table.to_owned(),
                zoom_level,
                tile_column,
                tile_row,
                tile_data,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn test_default_spatial_reference_systems() {
        let store = fixtures::store().await;

        let wgs84 = store
            .spatial_reference_system(4326)
            .await
            .expect("query")
            .expect("seeded");
        assert_eq!("EPSG", wgs84.organization);
        assert!(store
            .spatial_reference_system(-1)
            .await
            .expect("query")
            .is_some());
        assert!(store
            .spatial_reference_system(2154)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn test_feature_round_trip() {
        let store = fixtures::store().await;
        let table = store
            .create_feature_table(
                "places",
                "geom",
                "POINT",
                4326,
                &[
                    FeatureColumn {
                        name: String::from("name"),
                        data_type: DataType::Text,
                    },
                    FeatureColumn {
                        name: String::from("population"),
                        data_type: DataType::Integer,
                    },
                ],
            )
            .await
            .expect("create table");

        assert_eq!("id", table.id_column);
        assert_eq!("geom", table.geometry_column);
        assert_eq!(2, table.columns.len());

        let row = FeatureRow::new(Some(fixtures::point(2.35, 48.85)))
            .with_attribute("name", Value::Text(String::from("Paris")))
            .with_attribute("population", Value::Integer(2_100_000));

        let mut tx = store.begin().await.expect("begin");
        let id = tx.insert(&table, &row).await.expect("insert");
        tx.commit().await.expect("commit");

        let stored = store
            .get_row(&table, id)
            .await
            .expect("get")
            .expect("row exists");
        assert_eq!(Some(id), stored.id);
        assert_eq!(row.geometry, stored.geometry);
        assert_eq!(row.attributes, stored.attributes);
        assert_eq!(1, store.count_rows(&table).await.expect("count"));
    }

    #[tokio::test]
    async fn test_uncommitted_writes_roll_back() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", &[]).await;

        {
            let mut tx = store.begin().await.expect("begin");
            tx.insert(&table, &FeatureRow::new(Some(fixtures::point(1.0, 1.0))))
                .await
                .expect("insert");
        }

        assert_eq!(0, store.count_rows(&table).await.expect("count"));
    }

    #[tokio::test]
    async fn test_update_of_missing_row() {
        let store = fixtures::store().await;
        let table = fixtures::points_table(&store, "places", &[(1.0, 1.0, "one")]).await;
        let mut row = FeatureRow::new(Some(fixtures::point(2.0, 2.0)));

        let mut tx = store.begin().await.expect("begin");
        match tx.update(&table, &row).await {
            Err(Error::RowNotFound { table, id: None }) => assert_eq!("places", table),
            other => panic!("expected a missing row id, got {:?}", other),
        }

        row.id = Some(42);
        match tx.update(&table, &row).await {
            Err(Error::RowNotFound { table, id }) => {
                assert_eq!("places", table);
                assert_eq!(Some(42), id);
            }
            other => panic!("expected row 42 to be missing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rtree_ids_stream_in_order() {
        let store = fixtures::store().await;
        sqlx::query("CREATE VIRTUAL TABLE rtree_places_geom USING rtree(id, minx, maxx, miny, maxy)")
            .execute(store.pool())
            .await
            .expect("create rtree");
        sqlx::query(
            "INSERT INTO rtree_places_geom VALUES
             (3, 5.0, 6.0, 5.0, 6.0), (1, 0.0, 1.0, 0.0, 1.0), (2, 2.0, 3.0, 2.0, 3.0)",
        )
        .execute(store.pool())
        .await
        .expect("fill rtree");
        let everything = GeometryEnvelope::new(-10.0, 10.0, -10.0, 10.0);

        let first: Vec<i64> = store
            .query_rtree("rtree_places_geom", &everything)
            .take(1)
            .try_collect()
            .await
            .expect("first id");
        assert_eq!(vec![1], first);

        // Dropping the partly read stream hands the connection back.
        let all: Vec<i64> = store
            .query_rtree("rtree_places_geom", &everything)
            .try_collect()
            .await
            .expect("all ids");
        assert_eq!(vec![1, 2, 3], all);
    }

    #[tokio::test]
    async fn test_unknown_tables() {
        let store = fixtures::store().await;

        assert!(matches!(
            store.feature_table("nowhere").await,
            Err(Error::TableNotFound(_))
        ));
        assert!(matches!(
            store.tile_matrix_set("nowhere").await,
            Err(Error::TileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_extension_records() {
        let store = fixtures::store().await;
        let record = ExtensionRecord {
            table_name: Some(String::from("places")),
            column_name: Some(String::from("geom")),
            extension_name: String::from("nga_geometry_index"),
            definition: String::from("http://example.com/index"),
            scope: ExtensionScope::ReadWrite,
        };

        store.put_extension(&record).await.expect("put");
        store.put_extension(&record).await.expect("put twice");

        assert_eq!(
            vec![record.clone()],
            store.extensions_for_table("places").await.expect("list")
        );

        store.delete_extension(&record).await.expect("delete");
        assert!(store
            .extension("nga_geometry_index", "places", "geom")
            .await
            .expect("query")
            .is_none());
    }
}
