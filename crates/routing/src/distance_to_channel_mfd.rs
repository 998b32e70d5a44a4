//! MFD distance to channel
//!
//! A pixel's distance is the outflow-fraction-weighted mean of
//! `step + distance` over its downstream neighbors, with channel pixels at
//! 0. Computed by a demand-driven downstream walk with the same
//! explicit-stack preemption as flow accumulation; flow fractions aimed
//! off-raster or at nodata contribute nothing.

use crate::distance_to_channel::DISTANCE_NODATA;
use crate::support::{FlowFrame, ProgressLog};
use gdal::raster::GdalDataType;
use std::path::Path;
use terraflow_core::error::Error;
use terraflow_core::io::{
    iter_blocks, new_raster_from_template, open_read, read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{mfd_weight, mfd_weight_sum, step_cost, MFD_NODATA, NEIGHBOR_OFFSETS};
use terraflow_core::{ManagedRaster, RasterMode, Result};

/// Compute the MFD downstream distance to the channel mask, writing a
/// float64 raster (nodata -1) to `target_distance_path`.
pub fn distance_to_channel_mfd(
    flow_dir: (&Path, usize),
    channel: (&Path, usize),
    target_distance_path: &Path,
    weight: Option<(&Path, usize)>,
) -> Result<()> {
    let (flow_path, flow_band) = flow_dir;
    let (channel_path, channel_band) = channel;
    let flow_info = RasterInfo::read(flow_path, flow_band)?;
    let channel_info = RasterInfo::read(channel_path, channel_band)?;
    if (flow_info.width, flow_info.height) != (channel_info.width, channel_info.height) {
        return Err(Error::InvalidArgument(format!(
            "channel raster is {}x{} but the flow direction raster is {}x{}",
            channel_info.width, channel_info.height, flow_info.width, flow_info.height
        )));
    }
    if let Some((weight_path, weight_band)) = weight {
        RasterInfo::read(weight_path, weight_band)?;
    }

    new_raster_from_template(
        &flow_info,
        target_distance_path,
        GdalDataType::Float64,
        Some(DISTANCE_NODATA),
        Some(DISTANCE_NODATA),
    )?;

    let mut flow = ManagedRaster::open(flow_path, flow_band, RasterMode::Read)?;
    let mut channel_raster = ManagedRaster::open(channel_path, channel_band, RasterMode::Read)?;
    let mut distance = ManagedRaster::open(target_distance_path, 1, RasterMode::ReadWrite)?;
    let mut weight_raster = match weight {
        Some((weight_path, weight_band)) => Some(ManagedRaster::open(
            weight_path,
            weight_band,
            RasterMode::Read,
        )?),
        None => None,
    };

    let source = open_read(flow_path)?;
    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&flow_info).collect();
    let total_windows = windows.len();

    // channel pixels are the recursion base, set before any walk starts
    for window in iter_blocks(&channel_info) {
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;
                if channel_raster.get(x, y)? == 1.0 {
                    distance.set(x, y, 0.0)?;
                }
            }
        }
    }

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "distance_to_channel_mfd: {:.1}% of {} complete",
                100.0 * window_index as f64 / total_windows as f64,
                flow_path.display()
            )
        });
        let halo = read_halo_window(&source, flow_band, window, MFD_NODATA as f64)?;
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                let packed = halo[(local_y + 1, local_x + 1)] as i32;
                if packed == MFD_NODATA {
                    continue;
                }
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;
                if distance.get(x, y)? != DISTANCE_NODATA {
                    continue;
                }
                walk_downstream(
                    x,
                    y,
                    &mut flow,
                    &mut distance,
                    &mut weight_raster,
                )?;
            }
        }
    }

    flow.close()?;
    channel_raster.close()?;
    distance.close()?;
    if let Some(mut weight_raster) = weight_raster {
        weight_raster.close()?;
    }
    Ok(())
}

/// Resolve the distance of `(start_x, start_y)` and every pixel its walk
/// depends on.
fn walk_downstream(
    start_x: i64,
    start_y: i64,
    flow: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    weight_raster: &mut Option<ManagedRaster>,
) -> Result<()> {
    let mut stack = vec![FlowFrame::new(start_x, start_y, 0.0)];
    while let Some(mut frame) = stack.pop() {
        let packed = flow.get(frame.x, frame.y)? as i32;
        let total = mfd_weight_sum(packed) as f64;
        let step_weight = match weight_raster.as_mut() {
            Some(raster) => {
                let value = raster.get(frame.x, frame.y)?;
                Some(if raster.is_nodata(value) { 0.0 } else { value })
            }
            None => None,
        };
        let mut preempted = false;
        while frame.next_neighbor < 8 {
            let direction = frame.next_neighbor;
            let outflow = mfd_weight(packed, direction);
            if outflow > 0 {
                let (dx, dy) = NEIGHBOR_OFFSETS[direction];
                let (nx, ny) = (frame.x + dx, frame.y + dy);
                if flow.contains(nx, ny) {
                    let downstream = distance.get(nx, ny)?;
                    if downstream == DISTANCE_NODATA {
                        let neighbor_packed = flow.get(nx, ny)? as i32;
                        if neighbor_packed != MFD_NODATA {
                            // resolve the downstream pixel first, then
                            // resume this frame at the same direction
                            stack.push(frame);
                            stack.push(FlowFrame::new(nx, ny, 0.0));
                            preempted = true;
                            break;
                        }
                        // flow into undefined terrain contributes nothing
                    } else {
                        let cost = step_weight.unwrap_or_else(|| step_cost(direction));
                        frame.running += outflow as f64 / total * (cost + downstream);
                    }
                }
            }
            frame.next_neighbor += 1;
        }
        if !preempted {
            distance.set(frame.x, frame.y, frame.running)?;
        }
    }
    Ok(())
}
