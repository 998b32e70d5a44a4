//! Pit filling
//!
//! Produces a copy of the input DEM in which every hydrologically
//! undrained region is raised to the elevation of its pour point. The
//! raster edge and nodata both act as drains; a region that can reach
//! neither is expanded in elevation order until water can spill somewhere
//! lower.

use crate::support::{scratch_dir, PixelRecord, ProgressLog};
use std::collections::{BinaryHeap, VecDeque};
use std::path::Path;
use terraflow_core::io::{
    copy_to_compatible_raster, iter_blocks, new_raster_from_template, open_read,
    read_halo_window, RasterInfo,
};
use terraflow_core::kernel::NEIGHBOR_OFFSETS;
use terraflow_core::{Error, ManagedRaster, RasterMode, Result};
use gdal::raster::GdalDataType;
use tracing::info;

/// Fill every undrained depression of `dem`, writing the filled DEM (same
/// pixel type as the input) to `target_dem_path`.
///
/// Scratch rasters live in a temporary directory under `working_dir`
/// (system temp when `None`) and are removed on success.
pub fn fill_pits(
    dem: (&Path, usize),
    target_dem_path: &Path,
    working_dir: Option<&Path>,
) -> Result<()> {
    let (dem_path, dem_band) = dem;
    let dem_info = RasterInfo::read(dem_path, dem_band)?;
    let scratch = scratch_dir(working_dir, "fill_pits_")?;

    // The output starts as a tiled copy of the input and is raised in
    // place; the unmodified input drives the sequential candidate scan.
    let filled_info = copy_to_compatible_raster(dem_path, dem_band, target_dem_path)?;

    let flat_mask_path = scratch.path().join("flat_region_mask.tif");
    let pit_mask_path = scratch.path().join("pit_mask.tif");
    new_raster_from_template(
        &filled_info,
        &flat_mask_path,
        GdalDataType::UInt8,
        None,
        Some(0.0),
    )?;
    new_raster_from_template(
        &filled_info,
        &pit_mask_path,
        GdalDataType::Int32,
        None,
        Some(0.0),
    )?;

    let mut filled = ManagedRaster::open(target_dem_path, 1, RasterMode::ReadWrite)?;
    let mut flat_mask = ManagedRaster::open(&flat_mask_path, 1, RasterMode::ReadWrite)?;
    let mut pit_mask = ManagedRaster::open(&pit_mask_path, 1, RasterMode::ReadWrite)?;

    let source = open_read(dem_path)?;
    let halo_fill = dem_info.nodata.unwrap_or(f64::NAN);
    let is_invalid = |value: f64| match dem_info.nodata {
        Some(nodata) => value == nodata || value.is_nan(),
        None => value.is_nan(),
    };

    let mut feature_id: i32 = 0;
    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&dem_info).collect();
    let total_windows = windows.len();

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "fill_pits: {:.1}% of {} complete",
                100.0 * window_index as f64 / total_windows as f64,
                dem_path.display()
            )
        });
        let halo = read_halo_window(&source, dem_band, window, halo_fill)?;
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                let value = halo[(local_y + 1, local_x + 1)];
                if is_invalid(value) {
                    continue;
                }
                // a pixel with a nodata, off-raster, or lower neighbor
                // drains locally
                let drains = NEIGHBOR_OFFSETS.iter().any(|&(dx, dy)| {
                    let neighbor = halo[(
                        (local_y as i64 + 1 + dy) as usize,
                        (local_x as i64 + 1 + dx) as usize,
                    )];
                    is_invalid(neighbor) || neighbor < value
                });
                if drains {
                    continue;
                }
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;
                if flat_mask.get(x, y)? == 1.0 {
                    continue;
                }
                process_region(
                    x,
                    y,
                    &mut filled,
                    &mut flat_mask,
                    &mut pit_mask,
                    &mut feature_id,
                )?;
            }
        }
    }

    filled.close()?;
    flat_mask.close()?;
    pit_mask.close()?;
    info!(
        "fill_pits: filled {} depression(s) in {}",
        feature_id,
        dem_path.display()
    );
    Ok(())
}

/// Classify the same-height region seeded at `(seed_x, seed_y)` and, if it
/// is an undrained pit, raise it to its pour-point elevation.
fn process_region(
    seed_x: i64,
    seed_y: i64,
    filled: &mut ManagedRaster,
    flat_mask: &mut ManagedRaster,
    pit_mask: &mut ManagedRaster,
    feature_id: &mut i32,
) -> Result<()> {
    let height = filled.get(seed_x, seed_y)?;

    // BFS the connected same-height region, recording whether any boundary
    // neighbor drains it. Every visited cell goes into the flat-region
    // mask so the region is never rediscovered from another seed.
    let mut queue = VecDeque::new();
    queue.push_back((seed_x, seed_y));
    flat_mask.set(seed_x, seed_y, 1.0)?;
    let mut region_drains = false;
    while let Some((x, y)) = queue.pop_front() {
        for &(dx, dy) in &NEIGHBOR_OFFSETS {
            let (nx, ny) = (x + dx, y + dy);
            if !filled.contains(nx, ny) {
                region_drains = true;
                continue;
            }
            let neighbor = filled.get(nx, ny)?;
            if filled.is_nodata(neighbor) || neighbor.is_nan() {
                region_drains = true;
                continue;
            }
            if neighbor < height {
                region_drains = true;
                continue;
            }
            if neighbor == height && flat_mask.get(nx, ny)? == 0.0 {
                flat_mask.set(nx, ny, 1.0)?;
                queue.push_back((nx, ny));
            }
        }
    }
    if region_drains {
        // plateau: water escapes somewhere, leave the DEM unchanged
        return Ok(());
    }

    // Undrained pit. Expand outward in increasing-elevation order until a
    // pop steps off-raster, hits nodata, or reveals an unvisited neighbor
    // below the popped elevation; that popped elevation is the fill height.
    *feature_id += 1;
    let marker = *feature_id as f64;
    let mut heap = BinaryHeap::new();
    heap.push(PixelRecord {
        value: height,
        x: seed_x,
        y: seed_y,
        tiebreak: filled.block_index(seed_x, seed_y),
    });
    pit_mask.set(seed_x, seed_y, marker)?;

    let mut fill_height = None;
    'expansion: while let Some(record) = heap.pop() {
        for &(dx, dy) in &NEIGHBOR_OFFSETS {
            let (nx, ny) = (record.x + dx, record.y + dy);
            if !filled.contains(nx, ny) {
                fill_height = Some(record.value);
                break 'expansion;
            }
            let neighbor = filled.get(nx, ny)?;
            if filled.is_nodata(neighbor) || neighbor.is_nan() {
                fill_height = Some(record.value);
                break 'expansion;
            }
            if pit_mask.get(nx, ny)? == marker {
                continue;
            }
            if neighbor < record.value {
                fill_height = Some(record.value);
                break 'expansion;
            }
            pit_mask.set(nx, ny, marker)?;
            heap.push(PixelRecord {
                value: neighbor,
                x: nx,
                y: ny,
                tiebreak: filled.block_index(nx, ny),
            });
        }
    }
    let Some(fill_height) = fill_height else {
        // the heap exhausted without finding anywhere for water to go
        return Err(Error::UndrainedRaster);
    };

    // Raise every pixel connected to the seed below the fill height;
    // pixels at or above it act as barriers.
    let mut queue = VecDeque::new();
    if filled.get(seed_x, seed_y)? < fill_height {
        filled.set(seed_x, seed_y, fill_height)?;
        queue.push_back((seed_x, seed_y));
    }
    while let Some((x, y)) = queue.pop_front() {
        for &(dx, dy) in &NEIGHBOR_OFFSETS {
            let (nx, ny) = (x + dx, y + dy);
            if !filled.contains(nx, ny) {
                continue;
            }
            let neighbor = filled.get(nx, ny)?;
            if filled.is_nodata(neighbor) || neighbor.is_nan() {
                continue;
            }
            if neighbor < fill_height {
                filled.set(nx, ny, fill_height)?;
                queue.push_back((nx, ny));
            }
        }
    }
    Ok(())
}
