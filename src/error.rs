// Error handling shared by the ingestion pipeline, the stores and the HTTP API

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Archive error: {0}")]
    Archive(String),
    #[error("Parse error in {table} at line {line}: {reason}")]
    Parse {
        table: String,
        line: usize,
        reason: String,
    },
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid name '{0}': only letters, digits, '_', '-' and '.' are allowed")]
    InvalidName(String),
    #[error("Invalid feed: {0}")]
    InvalidFeed(String),
    #[error("Feed '{0}' not found")]
    FeedNotFound(String),
    #[error("Table '{table}' not found in feed '{dataset}'")]
    TableNotFound { dataset: String, table: String },
    #[error("Feed '{0}' already exists")]
    FeedExists(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, AtlasError>;
