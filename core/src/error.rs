use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VelocityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Column '{column}' not found in {origin}")]
    MissingColumn { column: String, origin: String },

    #[error("Schema error in {origin}: {message}")]
    Schema { origin: String, message: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Historical store not found at {}", path.display())]
    StoreMissing { path: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VelocityError {
    pub fn schema(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// True for the SchemaError family (missing or mistyped columns).
    pub fn is_schema_error(&self) -> bool {
        matches!(self, Self::MissingColumn { .. } | Self::Schema { .. })
    }
}

pub type VelocityResult<T> = Result<T, VelocityError>;
