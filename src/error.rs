#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No resolvable definition for SRS {0}")]
    UnknownSrs(i64),

    #[error("Unable to project ({x}, {y}) with SRS {srs_id}: {reason}")]
    ProjectionFailure {
        srs_id: i64,
        x: f64,
        y: f64,
        reason: String,
    },

    #[error("Malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("Feature table {0} has no spatial index")]
    IndexNotBuilt(String),

    #[error("Table {0} not found")]
    TableNotFound(String),

    #[error("Tile table {0} or its tile matrix set not found")]
    TileNotFound(String),

    /// `id` is `None` when the row to update carried no id at all.
    #[error("Row {id:?} not found in {table}")]
    RowNotFound { table: String, id: Option<i64> },

    #[error("Database error.")]
    Database(#[from] sqlx::Error),

    #[error("Unable to decode or encode tile image.")]
    Image(#[from] image::ImageError),

    #[error("Invalid YAML in store configuration.")]
    Config(#[from] serde_yaml::Error),

    #[error("I/O error.")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
