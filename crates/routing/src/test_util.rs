//! Small-raster helpers for the routing test suites

use gdal::raster::{Buffer, GdalDataType};
use std::path::Path;
use tempfile::TempDir;
use terraflow_core::io::{new_raster_from_template, open_read, open_update, RasterInfo};
use terraflow_core::GeoTransform;

/// Temporary workspace for one test
pub(crate) fn workspace() -> TempDir {
    TempDir::new().unwrap()
}

fn info_for(width: usize, height: usize, nodata: Option<f64>) -> RasterInfo {
    RasterInfo {
        width: width as i64,
        height: height as i64,
        block_size: (256, 256),
        nodata,
        geotransform: GeoTransform::new(2.0, -2.0, 2.0, -2.0),
        projection: String::new(),
        band_count: 1,
        data_type: GdalDataType::Float64,
    }
}

/// Write `values` (row-major, `height` rows of `width`) into a new tiled
/// raster of the given pixel type.
pub(crate) fn new_test_raster_typed(
    path: &Path,
    width: usize,
    height: usize,
    values: &[f64],
    nodata: Option<f64>,
    data_type: GdalDataType,
) {
    assert_eq!(values.len(), width * height);
    let info = info_for(width, height, nodata);
    new_raster_from_template(&info, path, data_type, nodata, None).unwrap();
    let mut dataset = open_update(path).unwrap();
    let mut band = dataset.rasterband(1).unwrap();
    let mut staged = Buffer::new((width, height), values.to_vec());
    band.write((0, 0), (width, height), &mut staged).unwrap();
    drop(band);
    dataset.flush_cache().unwrap();
}

/// Float64 variant, the common case
pub(crate) fn new_test_raster(
    path: &Path,
    width: usize,
    height: usize,
    values: &[f64],
    nodata: Option<f64>,
) {
    new_test_raster_typed(path, width, height, values, nodata, GdalDataType::Float64);
}

/// Read band 1 back as a flat row-major f64 vector.
pub(crate) fn read_raster(path: &Path) -> Vec<f64> {
    let dataset = open_read(path).unwrap();
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(1).unwrap();
    band.read_as::<f64>((0, 0), (width, height), (width, height), None)
        .unwrap()
        .data()
        .to_vec()
}

/// Read band 1 back as i32 values (for packed MFD rasters).
pub(crate) fn read_raster_i32(path: &Path) -> Vec<i32> {
    let dataset = open_read(path).unwrap();
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(1).unwrap();
    band.read_as::<i32>((0, 0), (width, height), (width, height), None)
        .unwrap()
        .data()
        .to_vec()
}
