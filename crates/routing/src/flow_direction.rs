//! D8 flow direction
//!
//! Each pixel drains to the neighbor with the steepest downhill slope.
//! Flat regions are resolved by a shortest-drain-distance breadth-first
//! pass so every plateau cell points along the shortest path to a drain,
//! with ties broken by the fixed neighbor scan order. Direction codes are
//! 0=E through 7=SE; 128 is nodata.
//!
//! The DEM must be pit-filled: cells of an undrained depression keep the
//! nodata direction.

use crate::support::{scratch_dir, ProgressLog};
use gdal::raster::GdalDataType;
use std::collections::VecDeque;
use std::path::Path;
use terraflow_core::io::{
    copy_to_compatible_raster, iter_blocks, new_raster_from_template, open_read,
    read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{
    slope_scale, step_cost, D8_NODATA, NEIGHBOR_OFFSETS, REVERSE_DIRECTION,
};
use terraflow_core::{ManagedRaster, RasterMode, Result};
use tracing::warn;

/// Compute the D8 flow direction of a filled DEM, writing a uint8 raster
/// with nodata 128 to `target_flow_dir_path`.
///
/// A DEM whose block dimensions are not powers of two is transparently
/// rewritten to a tiled copy in the scratch directory first.
pub fn flow_dir_d8(
    dem: (&Path, usize),
    target_flow_dir_path: &Path,
    working_dir: Option<&Path>,
) -> Result<()> {
    let (path, band) = dem;
    let mut dem_info = RasterInfo::read(path, band)?;
    let scratch = scratch_dir(working_dir, "flow_dir_d8_")?;

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
        GdalDataType::UInt8,
        Some(D8_NODATA as f64),
        Some(D8_NODATA as f64),
    )?;
    let distance_path = scratch.path().join("plateau_distance.tif");
    let flat_mask_path = scratch.path().join("flat_region_mask.tif");
    new_raster_from_template(
        &dem_info,
        &distance_path,
        GdalDataType::Float64,
        None,
        Some(dem_info.pixel_count()),
    )?;
    new_raster_from_template(
        &dem_info,
        &flat_mask_path,
        GdalDataType::UInt8,
        None,
        Some(0.0),
    )?;

    let mut dem_raster = ManagedRaster::open(&dem_path, dem_band, RasterMode::Read)?;
    let mut flow = ManagedRaster::open(target_flow_dir_path, 1, RasterMode::ReadWrite)?;
    let mut distance = ManagedRaster::open(&distance_path, 1, RasterMode::ReadWrite)?;
    let mut flat_mask = ManagedRaster::open(&flat_mask_path, 1, RasterMode::ReadWrite)?;

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
                "flow_dir_d8: {:.1}% of {} complete",
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

                // steepest downhill neighbor wins; first scanned wins ties
                let mut best_slope = 0.0;
                let mut best_direction = None;
                let mut has_level_neighbor = false;
                for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                    let neighbor = halo[(
                        (local_y as i64 + 1 + dy) as usize,
                        (local_x as i64 + 1 + dx) as usize,
                    )];
                    if is_invalid(neighbor) {
                        continue;
                    }
                    let slope = (value - neighbor) * slope_scale(direction);
                    if slope > best_slope {
                        best_slope = slope;
                        best_direction = Some(direction);
                    } else if neighbor == value {
                        has_level_neighbor = true;
                    }
                }
                if let Some(direction) = best_direction {
                    flow.set(x, y, direction as f64)?;
                    continue;
                }
                // a strict local pit with no level neighbor stays nodata;
                // a filled DEM never produces one
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
                    &is_invalid,
                )?;
            }
        }
    }

    dem_raster.close()?;
    flow.close()?;
    distance.close()?;
    flat_mask.close()?;
    Ok(())
}

/// Assign directions across one flat region by shortest drain distance.
fn drain_plateau(
    seed_x: i64,
    seed_y: i64,
    dem: &mut ManagedRaster,
    flow: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    flat_mask: &mut ManagedRaster,
    is_invalid: &dyn Fn(f64) -> bool,
) -> Result<()> {
    let height = dem.get(seed_x, seed_y)?;

    // discover the connected same-height region
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

    // classify every region cell: downhill drains seed the distance BFS,
    // cells that can only fall off the raster or into nodata are buffered
    let mut drain_queue = VecDeque::new();
    let mut nodata_drains = Vec::new();
    for &(x, y) in &region {
        let mut best_slope = 0.0;
        let mut best_direction = None;
        let mut fall_off_direction = None;
        for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
            let (nx, ny) = (x + dx, y + dy);
            if !dem.contains(nx, ny) {
                fall_off_direction.get_or_insert(direction);
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if is_invalid(neighbor) {
                fall_off_direction.get_or_insert(direction);
                continue;
            }
            let slope = (height - neighbor) * slope_scale(direction);
            if slope > best_slope {
                best_slope = slope;
                best_direction = Some(direction);
            }
        }
        if let Some(direction) = best_direction {
            flow.set(x, y, direction as f64)?;
            distance.set(x, y, 0.0)?;
            drain_queue.push_back((x, y));
        } else if let Some(direction) = fall_off_direction {
            nodata_drains.push((x, y, direction));
        }
    }

    // a region with real drains ignores the fall-off-edge candidates;
    // otherwise those become the drains
    if drain_queue.is_empty() {
        for (x, y, direction) in nodata_drains {
            flow.set(x, y, direction as f64)?;
            distance.set(x, y, 0.0)?;
            drain_queue.push_back((x, y));
        }
    }

    // label-correcting BFS: relax same-height neighbors, pointing each
    // relaxed cell back toward its shorter-path neighbor
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
                flow.set(nx, ny, REVERSE_DIRECTION[direction] as f64)?;
                drain_queue.push_back((nx, ny));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_test_raster, read_raster, workspace};

    #[test]
    fn test_flow_dir_d8_ramp_east() {
        // 3 -> 2 -> 1, rightmost cell is a raster-edge sink
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 3, 1, &[3.0, 2.0, 1.0], None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_d8((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        assert_eq!(read_raster(&flow_path), vec![0.0, 0.0, 128.0]);
    }

    #[test]
    fn test_flow_dir_d8_slope_south() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let dem: Vec<f64> = (0..25).map(|i| (5 - i / 5) as f64 * 10.0).collect();
        new_test_raster(&dem_path, 5, 5, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_d8((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster(&flow_path);
        assert_eq!(flow[2 * 5 + 2], 6.0, "interior should drain south");
    }

    #[test]
    fn test_flow_dir_d8_diagonal_beats_cardinal() {
        // elevation 10 - (x + y): SE drop is 2 over sqrt(2), steeper than
        // the cardinal drop of 1
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let dem: Vec<f64> = (0..25).map(|i| (10 - (i % 5) - (i / 5)) as f64).collect();
        new_test_raster(&dem_path, 5, 5, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_d8((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster(&flow_path);
        assert_eq!(flow[2 * 5 + 2], 7.0, "interior should drain southeast");
    }

    #[test]
    fn test_flow_dir_d8_plateau_drains_by_shortest_path() {
        // a 5-plateau with one real drain (the 0 on the east edge of row 0)
        #[rustfmt::skip]
        let dem = vec![
            5.0, 5.0, 5.0, 5.0, 0.0,
            5.0, 5.0, 5.0, 5.0, 5.0,
            5.0, 5.0, 5.0, 5.0, 5.0,
        ];
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 5, 3, &dem, None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_d8((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster(&flow_path);
        // row 0 marches east toward the drain
        assert_eq!(&flow[0..4], &[0.0, 0.0, 0.0, 0.0]);
        // the cells below the drain point north to reach the drain row
        assert_eq!(flow[1 * 5 + 4], 2.0);
        assert_eq!(flow[2 * 5 + 4], 2.0);
        // the cell diagonally below the drain takes the diagonal
        assert_eq!(flow[1 * 5 + 3], 1.0);
        // every plateau cell is assigned; the drain cell itself is a
        // raster-edge sink
        for (index, &direction) in flow.iter().enumerate() {
            if index == 4 {
                assert_eq!(direction, 128.0);
            } else {
                assert_ne!(direction, 128.0, "cell {index} should be assigned");
            }
        }
    }

    #[test]
    fn test_flow_dir_d8_flat_raster_drains_off_edges() {
        // with no real drain anywhere, fall-off-the-edge drains are
        // promoted and every cell gets a direction
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 11, 11, &vec![0.0; 121], None);

        let flow_path = workspace.path().join("flow.tif");
        flow_dir_d8((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let flow = read_raster(&flow_path);
        assert!(flow.iter().all(|&direction| direction != 128.0));
        // the corner cell falls off toward its first off-raster neighbor
        // in scan order: northeast
        assert_eq!(flow[0], 1.0);
    }

    #[test]
    fn test_flow_dir_d8_deterministic() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let mut dem = vec![0.0; 121];
        dem[5 * 11 + 5] = -1.0;
        new_test_raster(&dem_path, 11, 11, &dem, None);

        let first_path = workspace.path().join("flow_a.tif");
        let second_path = workspace.path().join("flow_b.tif");
        flow_dir_d8((&dem_path, 1), &first_path, Some(workspace.path())).unwrap();
        flow_dir_d8((&dem_path, 1), &second_path, Some(workspace.path())).unwrap();
        assert_eq!(read_raster(&first_path), read_raster(&second_path));
    }
}
