use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Coordinate error: {0}")]
    Coordinate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Raster error: {0}")]
    Raster(String),

    #[error("Column decode error: {0}")]
    Decode(String),
}

impl From<config::ConfigError> for ViewerError {
    fn from(err: config::ConfigError) -> Self {
        ViewerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ViewerError>;
