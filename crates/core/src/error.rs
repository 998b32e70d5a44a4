//! Error types for terraflow

use thiserror::Error;

/// Main error type for terraflow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("block dimensions {width}x{height} are not powers of two")]
    BadBlockGeometry { width: usize, height: usize },

    #[error("DEM contains a depression with no pour point")]
    UndrainedRaster,

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("algorithm error: {0}")]
    Algorithm(String),
}

/// Result type alias for terraflow operations
pub type Result<T> = std::result::Result<T, Error>;
