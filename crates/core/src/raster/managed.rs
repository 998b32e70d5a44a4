//! Pixel-addressable view over a tiled raster
//!
//! `ManagedRaster` lets routing kernels treat a raster larger than memory
//! as a uniform grid of f64 pixels. Blocks are loaded on demand into a
//! per-raster LRU cache; power-of-two block dimensions reduce pixel
//! addressing to shifts and masks. Dirty blocks are written back on
//! eviction and on close.
//!
//! The generic GDAL block cache is tuned for sequential scans; routing
//! kernels do essentially-random neighbor reads near a frontier, so a
//! dedicated cache of full blocks with flat-buffer indexing keeps the hot
//! loop free of per-pixel library calls.

use crate::error::{Error, Result};
use crate::io::{open_read, open_update};
use crate::raster::cache::{BlockCache, DEFAULT_CACHE_BLOCKS};
use gdal::raster::Buffer;
use gdal::Dataset;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Access mode for a managed raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterMode {
    Read,
    ReadWrite,
}

/// Block-cached random access to one band of a tiled raster.
///
/// All pixel values are exposed as f64 regardless of the on-disk type;
/// GDAL converts on block read and write-back. Callers are responsible for
/// bounds checking: coordinates outside `[0, width) x [0, height)` must
/// never reach `get`/`set`.
pub struct ManagedRaster {
    dataset: Dataset,
    path: PathBuf,
    band_index: usize,
    width: i64,
    height: i64,
    block_width: i64,
    block_height: i64,
    block_xbits: u32,
    block_ybits: u32,
    blocks_across: i64,
    nodata: Option<f64>,
    mode: RasterMode,
    cache: BlockCache,
    dirty: HashSet<usize>,
    closed: bool,
}

impl ManagedRaster {
    /// Open band `band_index` (1-based) of the raster at `path`.
    ///
    /// Fails with `BadBlockGeometry` if the band's block dimensions are not
    /// powers of two and with `InvalidArgument` on an out-of-range band.
    pub fn open(path: &Path, band_index: usize, mode: RasterMode) -> Result<Self> {
        if band_index < 1 {
            return Err(Error::InvalidArgument(format!(
                "band index for {} must be >= 1, got {}",
                path.display(),
                band_index
            )));
        }
        let dataset = match mode {
            RasterMode::Read => open_read(path)?,
            RasterMode::ReadWrite => open_update(path)?,
        };
        if band_index > dataset.raster_count() {
            return Err(Error::InvalidArgument(format!(
                "band {} requested but {} has {} band(s)",
                band_index,
                path.display(),
                dataset.raster_count()
            )));
        }
        let band = dataset.rasterband(band_index)?;
        let (block_width, block_height) = band.block_size();
        if !block_width.is_power_of_two() || !block_height.is_power_of_two() {
            return Err(Error::BadBlockGeometry {
                width: block_width,
                height: block_height,
            });
        }
        let nodata = band.no_data_value();
        let (width, height) = dataset.raster_size();
        drop(band);

        Ok(Self {
            dataset,
            path: path.to_path_buf(),
            band_index,
            width: width as i64,
            height: height as i64,
            block_width: block_width as i64,
            block_height: block_height as i64,
            block_xbits: block_width.trailing_zeros(),
            block_ybits: block_height.trailing_zeros(),
            blocks_across: (width as i64 + block_width as i64 - 1) / block_width as i64,
            nodata,
            mode,
            cache: BlockCache::new(DEFAULT_CACHE_BLOCKS),
            dirty: HashSet::new(),
            closed: false,
        })
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Whether `value` equals the band's nodata sentinel
    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        match self.nodata {
            Some(nodata) => value == nodata || (value.is_nan() && nodata.is_nan()),
            None => false,
        }
    }

    /// Whether `(x, y)` lies inside the raster
    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    /// Linear block index of the block containing `(x, y)`, also used as
    /// the deterministic tie-break key in elevation heaps.
    #[inline]
    pub fn block_index(&self, x: i64, y: i64) -> usize {
        let bx = x >> self.block_xbits;
        let by = y >> self.block_ybits;
        (by * self.blocks_across + bx) as usize
    }

    /// Offset of `(x, y)` within its block buffer
    #[inline]
    fn block_offset(&self, x: i64, y: i64) -> usize {
        let local_x = x & (self.block_width - 1);
        let local_y = y & (self.block_height - 1);
        (local_y * self.block_width + local_x) as usize
    }

    /// Read the pixel at `(x, y)`, loading its block if absent.
    pub fn get(&mut self, x: i64, y: i64) -> Result<f64> {
        debug_assert!(self.contains(x, y), "pixel ({x}, {y}) out of bounds");
        let block_index = self.block_index(x, y);
        let offset = self.block_offset(x, y);
        let block = self.block(block_index)?;
        Ok(block[offset])
    }

    /// Write the pixel at `(x, y)`, loading its block if absent and marking
    /// it dirty. Only valid in `ReadWrite` mode.
    pub fn set(&mut self, x: i64, y: i64, value: f64) -> Result<()> {
        debug_assert!(self.contains(x, y), "pixel ({x}, {y}) out of bounds");
        if self.mode != RasterMode::ReadWrite {
            return Err(Error::InvalidArgument(format!(
                "{} opened read-only",
                self.path.display()
            )));
        }
        let block_index = self.block_index(x, y);
        let offset = self.block_offset(x, y);
        let block = self.block(block_index)?;
        block[offset] = value;
        self.dirty.insert(block_index);
        Ok(())
    }

    /// Flush every dirty block and release all buffers. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for (block_index, buffer) in self.cache.drain() {
            if self.dirty.remove(&block_index) {
                self.write_block(block_index, &buffer)?;
            }
        }
        if self.mode == RasterMode::ReadWrite {
            self.dataset.flush_cache()?;
        }
        self.closed = true;
        Ok(())
    }

    /// Make the block resident and return its buffer.
    fn block(&mut self, block_index: usize) -> Result<&mut Vec<f64>> {
        if !self.cache.contains(block_index) {
            let buffer = self.read_block(block_index)?;
            if let Some((evicted_index, evicted_buffer)) = self.cache.put(block_index, buffer) {
                if self.dirty.remove(&evicted_index) {
                    self.write_block(evicted_index, &evicted_buffer)?;
                }
            }
        }
        Ok(self
            .cache
            .get_mut(block_index)
            .expect("block resident after load"))
    }

    /// Extent of a block clipped to the raster: `(xoff, yoff, valid_width,
    /// valid_height)`
    fn block_extent(&self, block_index: usize) -> (i64, i64, usize, usize) {
        let bx = block_index as i64 % self.blocks_across;
        let by = block_index as i64 / self.blocks_across;
        let xoff = bx * self.block_width;
        let yoff = by * self.block_height;
        let valid_width = self.block_width.min(self.width - xoff) as usize;
        let valid_height = self.block_height.min(self.height - yoff) as usize;
        (xoff, yoff, valid_width, valid_height)
    }

    /// Load the valid sub-rectangle of a block into a full-size buffer.
    fn read_block(&self, block_index: usize) -> Result<Vec<f64>> {
        let (xoff, yoff, valid_width, valid_height) = self.block_extent(block_index);
        let band = self.dataset.rasterband(self.band_index)?;
        let staged = band.read_as::<f64>(
            (xoff as isize, yoff as isize),
            (valid_width, valid_height),
            (valid_width, valid_height),
            None,
        )?;
        let mut buffer = vec![0.0; (self.block_width * self.block_height) as usize];
        let data = staged.data();
        for row in 0..valid_height {
            let src = row * valid_width;
            let dst = row * self.block_width as usize;
            buffer[dst..dst + valid_width].copy_from_slice(&data[src..src + valid_width]);
        }
        Ok(buffer)
    }

    /// Write the valid sub-rectangle of a block back to disk.
    fn write_block(&self, block_index: usize, buffer: &[f64]) -> Result<()> {
        let (xoff, yoff, valid_width, valid_height) = self.block_extent(block_index);
        let mut staged = Vec::with_capacity(valid_width * valid_height);
        for row in 0..valid_height {
            let src = row * self.block_width as usize;
            staged.extend_from_slice(&buffer[src..src + valid_width]);
        }
        let mut band = self.dataset.rasterband(self.band_index)?;
        let mut staged = Buffer::new((valid_width, valid_height), staged);
        band.write(
            (xoff as isize, yoff as isize),
            (valid_width, valid_height),
            &mut staged,
        )?;
        Ok(())
    }
}

impl Drop for ManagedRaster {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(
                "failed to flush {} on drop: {error}",
                self.path.display()
            );
        }
    }
}
