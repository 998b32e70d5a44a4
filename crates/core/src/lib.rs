//! # Terraflow Core
//!
//! Raster plumbing for the terraflow routing engine:
//! - `ManagedRaster`: block-cached random access to rasters larger than
//!   memory
//! - `BlockCache`: the LRU of owned pixel blocks behind it
//! - `kernel`: D8 neighbor tables and MFD weight encoding
//! - `io`: GDAL glue (metadata, raster creation, window iteration)

pub mod error;
pub mod io;
pub mod kernel;
pub mod raster;

pub use error::{Error, Result};
pub use raster::{BlockCache, GeoTransform, ManagedRaster, RasterMode};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::io::RasterInfo;
    pub use crate::raster::{GeoTransform, ManagedRaster, RasterMode};
}
