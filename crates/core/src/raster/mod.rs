//! Raster data structures: block cache, managed raster, geotransform

mod cache;
mod geotransform;
mod managed;

pub use cache::{BlockCache, DEFAULT_CACHE_BLOCKS};
pub use geotransform::GeoTransform;
pub use managed::{ManagedRaster, RasterMode};
