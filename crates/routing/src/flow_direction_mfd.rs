//! Multiple flow direction (MFD)
//!
//! Instead of a single direction, every pixel records a distribution of
//! outflow over its eight neighbors, packed as 4-bit weights in an i32
//! (see `terraflow_core::kernel`). Downhill pixels split flow by adjusted
//! slope; plateau pixels split flow among the same-height neighbors that
//! sit closer to a drain. Weight distributions always sum to 15; the
//! all-zero value is nodata.

use crate::support::{scratch_dir, ProgressLog};
use gdal::raster::GdalDataType;
use std::collections::VecDeque;
use std::path::Path;
use terraflow_core::io::{
    copy_to_compatible_raster, iter_blocks, new_raster_from_template, open_read,
    read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{
    mfd_normalize, mfd_pack, slope_scale, step_cost, MFD_NODATA, NEIGHBOR_OFFSETS,
};
use terraflow_core::{ManagedRaster, RasterMode, Result};
use tracing::warn;

/// Compute the MFD flow direction of a filled DEM, writing an int32 raster
/// of packed weight nibbles (nodata 0) to `target_flow_dir_path`.
pub fn flow_dir_mfd(
    dem: (&Path, usize),
    target_flow_dir_path: &Path,
    working_dir: Option<&Path>,
) -> Result<()> {
    let (path, band) = dem;
    let mut dem_info = RasterInfo::read(path, band)?;
    let scratch = scratch_dir(working_dir, "flow_dir_mfd_")?;

    let mut dem_path = path.to_path_buf();
    let mut dem_band = band;
    if !dem_info.has_power_of_two_blocks() {
        warn!(
            "block size {:?} of {} cannot be cached; rewriting a tiled copy",
            dem_info.block_size,
            dem_path.display()
        );
        let compatible_path = scratch.path().join("routable_dem.tif");
        dem_info = copy_to_compatible_raster(&dem_path, dem_band, &compatible_path)?;
        dem_path = compatible_path;
        dem_band = 1;
    }

    new_raster_from_template(
        &dem_info,
        target_flow_dir_path,
        GdalDataType::Int32,
        Some(MFD_NODATA as f64),
        Some(MFD_NODATA as f64),
    )?;
    let distance_path = scratch.path().join("plateau_distance.tif");
    let flat_mask_path = scratch.path().join("flat_region_mask.tif");
    let drain_mask_path = scratch.path().join("plateau_drain_mask.tif");
    new_raster_from_template(
        &dem_info,
        &distance_path,
        GdalDataType::Float64,
        None,
        Some(dem_info.pixel_count()),
    )?;
    for mask_path in [&flat_mask_path, &drain_mask_path] {
        new_raster_from_template(&dem_info, mask_path, GdalDataType::UInt8, None, Some(0.0))?;
    }

    let mut dem_raster = ManagedRaster::open(&dem_path, dem_band, RasterMode::Read)?;
    let mut flow = ManagedRaster::open(target_flow_dir_path, 1, RasterMode::ReadWrite)?;
    let mut distance = ManagedRaster::open(&distance_path, 1, RasterMode::ReadWrite)?;
    let mut flat_mask = ManagedRaster::open(&flat_mask_path, 1, RasterMode::ReadWrite)?;
    let mut drain_mask = ManagedRaster::open(&drain_mask_path, 1, RasterMode::ReadWrite)?;

    let source = open_read(&dem_path)?;
    let halo_fill = dem_info.nodata.unwrap_or(f64::NAN);
    let is_invalid = |value: f64| match dem_info.nodata {
        Some(nodata) => value == nodata || value.is_nan(),
        None => value.is_nan(),
    };

    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&dem_info).collect();
    let total_windows = windows.len();

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "flow_dir_mfd: {:.1}% of {} complete",
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
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;

                // split flow by adjusted slope over every downhill neighbor
                let mut weights = [0.0f64; 8];
                let mut any_downhill = false;
                let mut has_level_neighbor = false;
                for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                    let neighbor = halo[(
                        (local_y as i64 + 1 + dy) as usize,
                        (local_x as i64 + 1 + dx) as usize,
                    )];
                    if is_invalid(neighbor) {
                        continue;
                    }
                    if neighbor < value {
                        weights[direction] = (value - neighbor) * slope_scale(direction);
                        any_downhill = true;
                    } else if neighbor == value {
                        has_level_neighbor = true;
                    }
                }
                if any_downhill {
                    flow.set(x, y, mfd_pack(mfd_normalize(weights)) as f64)?;
                    continue;
                }
                if !has_level_neighbor {
                    continue;
                }
                if flat_mask.get(x, y)? == 1.0 {
                    continue;
                }
                drain_plateau(
                    x,
                    y,
                    &mut dem_raster,
                    &mut flow,
                    &mut distance,
                    &mut flat_mask,
                    &mut drain_mask,
                    &is_invalid,
                )?;
            }
        }
    }

    dem_raster.close()?;
    flow.close()?;
    distance.close()?;
    flat_mask.close()?;
    drain_mask.close()?;
    Ok(())
}

/// Distribute flow across one flat region toward its drains.
#[allow(clippy::too_many_arguments)]
fn drain_plateau(
    seed_x: i64,
    seed_y: i64,
    dem: &mut ManagedRaster,
    flow: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    flat_mask: &mut ManagedRaster,
    drain_mask: &mut ManagedRaster,
    is_invalid: &dyn Fn(f64) -> bool,
) -> Result<()> {
    let height = dem.get(seed_x, seed_y)?;

    let mut region = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((seed_x, seed_y));
    flat_mask.set(seed_x, seed_y, 1.0)?;
    while let Some((x, y)) = queue.pop_front() {
        region.push((x, y));
        for &(dx, dy) in &NEIGHBOR_OFFSETS {
            let (nx, ny) = (x + dx, y + dy);
            if !dem.contains(nx, ny) {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if !is_invalid(neighbor) && neighbor == height && flat_mask.get(nx, ny)? == 0.0 {
                flat_mask.set(nx, ny, 1.0)?;
                queue.push_back((nx, ny));
            }
        }
    }

    // classify: real drains get a slope-weighted distribution, cells that
    // can only fall off the raster or into nodata get a uniform one held
    // back until we know the region has no real drain
    let mut drain_queue = VecDeque::new();
    let mut nodata_drains = Vec::new();
    for &(x, y) in &region {
        let mut downhill_weights = [0.0f64; 8];
        let mut nodata_weights = [0.0f64; 8];
        let mut any_downhill = false;
        let mut any_nodata = false;
        for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
            let (nx, ny) = (x + dx, y + dy);
            if !dem.contains(nx, ny) {
                nodata_weights[direction] = 1.0 / step_cost(direction);
                any_nodata = true;
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if is_invalid(neighbor) {
                nodata_weights[direction] = 1.0 / step_cost(direction);
                any_nodata = true;
            } else if neighbor < height {
                downhill_weights[direction] = (height - neighbor) * slope_scale(direction);
                any_downhill = true;
            }
        }
        if any_downhill {
            flow.set(x, y, mfd_pack(mfd_normalize(downhill_weights)) as f64)?;
            drain_mask.set(x, y, 1.0)?;
            distance.set(x, y, 0.0)?;
            drain_queue.push_back((x, y));
        } else if any_nodata {
            nodata_drains.push((x, y, nodata_weights));
        }
    }

    if drain_queue.is_empty() {
        for (x, y, weights) in nodata_drains {
            flow.set(x, y, mfd_pack(mfd_normalize(weights)) as f64)?;
            drain_mask.set(x, y, 1.0)?;
            distance.set(x, y, 0.0)?;
            drain_queue.push_back((x, y));
        }
    }

    // propagate drain distance across the region
    while let Some((x, y)) = drain_queue.pop_front() {
        let current = distance.get(x, y)?;
        for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
            let (nx, ny) = (x + dx, y + dy);
            if !dem.contains(nx, ny) {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if is_invalid(neighbor) || neighbor != height {
                continue;
            }
            let candidate = current + step_cost(direction);
            if distance.get(nx, ny)? > candidate {
                distance.set(nx, ny, candidate)?;
                drain_queue.push_back((nx, ny));
            }
        }
    }

    // interior cells split flow among the same-height neighbors that sit
    // strictly closer to a drain; a cell with no closer neighbor keeps
    // whatever it has
    for &(x, y) in &region {
        if drain_mask.get(x, y)? == 1.0 {
            continue;
        }
        let cell_distance = distance.get(x, y)?;
        let mut weights = [0.0f64; 8];
        let mut any_closer = false;
        for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
            let (nx, ny) = (x + dx, y + dy);
            if !dem.contains(nx, ny) {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if is_invalid(neighbor) || neighbor != height {
                continue;
            }
            if distance.get(nx, ny)? < cell_distance {
                weights[direction] = 1.0 / step_cost(direction);
                any_closer = true;
            }
        }
        if any_closer {
            flow.set(x, y, mfd_pack(mfd_normalize(weights)) as f64)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_test_raster, read_raster_i32, workspace};
    use terraflow_core::kernel::{mfd_weight, mfd_weight_sum};

    #[test]
    fn test_flow_dir_mfd_ramp_east() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 3, 1, &[3.0, 2.0, 1.0], None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster_i32(&flow_path);
        // all flow east for the two downhill cells, nodata for the sink
        assert_eq!(mfd_weight(flow[0], 0), 15);
        assert_eq!(mfd_weight(flow[1], 0), 15);
        assert_eq!(flow[2], 0);
    }

    #[test]
    fn test_flow_dir_mfd_three_way_split() {
        // flow out of the center must leave only through SW, S, SE
        #[rustfmt::skip]
        let dem = vec![
            2.0, 2.0, 2.0,
            2.0, 1.0, 2.0,
            0.0, 0.0, 0.0,
        ];
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 3, 3, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let center = read_raster_i32(&flow_path)[4];
        for direction in [0, 1, 2, 3, 4] {
            assert_eq!(
                mfd_weight(center, direction),
                0,
                "no flow may leave through direction {direction}"
            );
        }
        for direction in [5, 6, 7] {
            assert!(
                mfd_weight(center, direction) > 0,
                "direction {direction} should carry flow"
            );
        }
        assert_eq!(mfd_weight_sum(center), 15);
    }

    #[test]
    fn test_flow_dir_mfd_weights_sum_to_15() {
        // flat plain with a central channel: every cell gets a
        // distribution, plateau or not
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let mut dem = vec![0.0; 121];
        for x in 0..11 {
            dem[5 * 11 + x] = -1.0;
        }
        new_test_raster(&dem_path, 11, 11, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        for (index, &packed) in read_raster_i32(&flow_path).iter().enumerate() {
            assert_ne!(packed, 0, "cell {index} should have outflow");
            assert_eq!(
                mfd_weight_sum(packed),
                15,
                "cell {index} weights must sum to 15"
            );
        }
    }

    #[test]
    fn test_flow_dir_mfd_plateau_flows_toward_channel() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let mut dem = vec![0.0; 121];
        for x in 0..11 {
            dem[5 * 11 + x] = -1.0;
        }
        new_test_raster(&dem_path, 11, 11, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster_i32(&flow_path);
        // an interior cell of the top plateau drains south (SW, S, SE only)
        let above = flow[11 + 5];
        for direction in [0, 1, 2, 3, 4] {
            assert_eq!(mfd_weight(above, direction), 0);
        }
        assert!(mfd_weight(above, 6) > 0);
        // an interior channel cell drains along the channel toward the
        // nearer end, here due west
        let channel = flow[5 * 11 + 2];
        assert_eq!(mfd_weight(channel, 4), 15);
        // the channel's west end falls off the raster edge
        let west_end = flow[5 * 11];
        assert!(mfd_weight(west_end, 4) > 0);
    }
}
