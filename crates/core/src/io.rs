//! GDAL glue: raster metadata, raster creation, window iteration
//!
//! Everything that touches the GDAL library outside of the managed-raster
//! block loop lives here. Creation always produces tiled GeoTIFFs with
//! power-of-two blocks so the output of one routing step is a valid input
//! for the next.

use crate::error::{Error, Result};
use crate::raster::GeoTransform;
use gdal::raster::{Buffer, GdalDataType, GdalType, RasterCreationOption};
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use ndarray::Array2;
use std::path::Path;

/// Tile edge used for every raster terraflow creates (1 << 8)
pub const CREATION_TILE_SIZE: usize = 256;

/// Creation options for routing-friendly GeoTIFFs: tiled, lossless
/// compression, big-file support.
pub fn creation_options() -> Vec<RasterCreationOption<'static>> {
    vec![
        RasterCreationOption {
            key: "TILED",
            value: "YES",
        },
        RasterCreationOption {
            key: "BLOCKXSIZE",
            value: "256",
        },
        RasterCreationOption {
            key: "BLOCKYSIZE",
            value: "256",
        },
        RasterCreationOption {
            key: "COMPRESS",
            value: "LZW",
        },
        RasterCreationOption {
            key: "BIGTIFF",
            value: "IF_SAFER",
        },
    ]
}

/// Metadata of one raster band, read once at algorithm entry.
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: i64,
    pub height: i64,
    pub block_size: (usize, usize),
    pub nodata: Option<f64>,
    pub geotransform: GeoTransform,
    pub projection: String,
    pub band_count: usize,
    pub data_type: GdalDataType,
}

impl RasterInfo {
    /// Read the metadata of `band_index` (1-based) of the raster at `path`.
    pub fn read(path: &Path, band_index: usize) -> Result<Self> {
        validate_path_band(path, band_index)?;
        let dataset = Dataset::open(path)?;
        let band_count = dataset.raster_count();
        if band_index > band_count {
            return Err(Error::InvalidArgument(format!(
                "band {} requested but {} has {} band(s)",
                band_index,
                path.display(),
                band_count
            )));
        }
        let band = dataset.rasterband(band_index)?;
        let (width, height) = dataset.raster_size();
        let geotransform = match dataset.geo_transform() {
            Ok(gt) => GeoTransform::from_gdal(gt),
            Err(_) => GeoTransform::default(),
        };
        Ok(Self {
            width: width as i64,
            height: height as i64,
            block_size: band.block_size(),
            nodata: band.no_data_value(),
            geotransform,
            projection: dataset.projection(),
            band_count,
            data_type: band.band_type(),
        })
    }

    /// Whether both block dimensions are powers of two
    pub fn has_power_of_two_blocks(&self) -> bool {
        self.block_size.0.is_power_of_two() && self.block_size.1.is_power_of_two()
    }

    /// Geographic bounding box `(min_x, min_y, max_x, max_y)`
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.geotransform.bounds(self.width, self.height)
    }

    /// Number of pixels, used as an unreachable distance sentinel
    pub fn pixel_count(&self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

/// Check that a `(path, band)` raster argument is well formed.
pub fn validate_path_band(path: &Path, band_index: usize) -> Result<()> {
    if band_index < 1 {
        return Err(Error::InvalidArgument(format!(
            "band index for {} must be >= 1, got {}",
            path.display(),
            band_index
        )));
    }
    if !path.exists() {
        return Err(Error::InvalidArgument(format!(
            "raster path {} does not exist",
            path.display()
        )));
    }
    Ok(())
}

/// One tile-aligned read/write window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub xoff: i64,
    pub yoff: i64,
    pub width: usize,
    pub height: usize,
}

/// Iterate the tile windows of a raster in row-major block order, clipped
/// to the raster bounds.
pub fn iter_blocks(info: &RasterInfo) -> impl Iterator<Item = BlockWindow> {
    let (block_width, block_height) = info.block_size;
    let (width, height) = (info.width, info.height);
    let blocks_across = (width as usize).div_ceil(block_width);
    let blocks_down = (height as usize).div_ceil(block_height);
    (0..blocks_down).flat_map(move |by| {
        (0..blocks_across).map(move |bx| {
            let xoff = (bx * block_width) as i64;
            let yoff = (by * block_height) as i64;
            BlockWindow {
                xoff,
                yoff,
                width: block_width.min((width - xoff) as usize),
                height: block_height.min((height - yoff) as usize),
            }
        })
    })
}

/// Open a dataset for reading.
pub fn open_read(path: &Path) -> Result<Dataset> {
    Ok(Dataset::open(path)?)
}

/// Open a dataset for updating in place.
pub fn open_update(path: &Path) -> Result<Dataset> {
    Ok(Dataset::open_ex(
        path,
        DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_RASTER | GdalOpenFlags::GDAL_OF_UPDATE,
            ..Default::default()
        },
    )?)
}

/// Read a window expanded by a one-pixel halo, clipped to the raster.
///
/// The returned array is `(height + 2) x (width + 2)`; slots outside the
/// raster hold `fill`. Index `[1][1]` corresponds to `(xoff, yoff)`.
pub fn read_halo_window(
    dataset: &Dataset,
    band_index: usize,
    window: BlockWindow,
    fill: f64,
) -> Result<Array2<f64>> {
    let band = dataset.rasterband(band_index)?;
    let (raster_width, raster_height) = dataset.raster_size();
    let (raster_width, raster_height) = (raster_width as i64, raster_height as i64);

    let x0 = (window.xoff - 1).max(0);
    let y0 = (window.yoff - 1).max(0);
    let x1 = (window.xoff + window.width as i64 + 1).min(raster_width);
    let y1 = (window.yoff + window.height as i64 + 1).min(raster_height);
    let read_width = (x1 - x0) as usize;
    let read_height = (y1 - y0) as usize;

    let buffer = band.read_as::<f64>(
        (x0 as isize, y0 as isize),
        (read_width, read_height),
        (read_width, read_height),
        None,
    )?;

    let mut halo = Array2::from_elem((window.height + 2, window.width + 2), fill);
    let row_shift = (y0 - (window.yoff - 1)) as usize;
    let col_shift = (x0 - (window.xoff - 1)) as usize;
    let data = buffer.data();
    for row in 0..read_height {
        for col in 0..read_width {
            halo[(row + row_shift, col + col_shift)] = data[row * read_width + col];
        }
    }
    Ok(halo)
}

/// Create a new tiled raster with the template's dimensions, geotransform
/// and projection, optionally setting nodata and filling every pixel.
pub fn new_raster_from_template(
    template: &RasterInfo,
    target_path: &Path,
    data_type: GdalDataType,
    nodata: Option<f64>,
    fill: Option<f64>,
) -> Result<()> {
    match data_type {
        GdalDataType::UInt8 => create_typed::<u8>(template, target_path, nodata, fill),
        GdalDataType::UInt16 => create_typed::<u16>(template, target_path, nodata, fill),
        GdalDataType::Int16 => create_typed::<i16>(template, target_path, nodata, fill),
        GdalDataType::UInt32 => create_typed::<u32>(template, target_path, nodata, fill),
        GdalDataType::Int32 => create_typed::<i32>(template, target_path, nodata, fill),
        GdalDataType::Float32 => create_typed::<f32>(template, target_path, nodata, fill),
        GdalDataType::Float64 => create_typed::<f64>(template, target_path, nodata, fill),
        other => Err(Error::InvalidArgument(format!(
            "unsupported raster data type {other:?}"
        ))),
    }
}

fn create_typed<T: GdalType>(
    template: &RasterInfo,
    target_path: &Path,
    nodata: Option<f64>,
    fill: Option<f64>,
) -> Result<()> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = creation_options();
    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        target_path,
        template.width as usize,
        template.height as usize,
        1,
        &options,
    )?;
    dataset.set_geo_transform(&template.geotransform.to_gdal())?;
    if !template.projection.is_empty() {
        dataset.set_projection(&template.projection)?;
    }
    let mut band = dataset.rasterband(1)?;
    if let Some(nodata) = nodata {
        band.set_no_data_value(Some(nodata))?;
    }
    if let Some(fill) = fill {
        band.fill(fill, None)?;
    }
    dataset.flush_cache()?;
    Ok(())
}

/// Copy one band of a raster into a new tiled raster with power-of-two
/// blocks, preserving pixel type and nodata.
///
/// Used to seed the filled-DEM output and to rewrite DEMs whose block
/// geometry the managed raster cannot address.
pub fn copy_to_compatible_raster(
    source_path: &Path,
    band_index: usize,
    target_path: &Path,
) -> Result<RasterInfo> {
    let info = RasterInfo::read(source_path, band_index)?;
    new_raster_from_template(&info, target_path, info.data_type, info.nodata, None)?;

    let source = open_read(source_path)?;
    let source_band = source.rasterband(band_index)?;
    let mut target = open_update(target_path)?;
    let mut target_band = target.rasterband(1)?;

    let target_info = RasterInfo::read(target_path, 1)?;
    for window in iter_blocks(&target_info) {
        let data = source_band.read_as::<f64>(
            (window.xoff as isize, window.yoff as isize),
            (window.width, window.height),
            (window.width, window.height),
            None,
        )?;
        let mut staged = Buffer::new((window.width, window.height), data.data().to_vec());
        target_band.write(
            (window.xoff as isize, window.yoff as isize),
            (window.width, window.height),
            &mut staged,
        )?;
    }
    drop(target_band);
    target.flush_cache()?;
    RasterInfo::read(target_path, 1)
}
