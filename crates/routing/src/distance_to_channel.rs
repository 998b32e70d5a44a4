//! D8 distance to channel
//!
//! Walks the reverse D8 graph outward from every channel pixel, assigning
//! each upstream pixel the along-flow distance to the channel it drains
//! into. Steps cost 1 (cardinal) or sqrt(2) (diagonal), or the weight
//! raster's value at the stepped-onto pixel when one is provided.

use crate::support::ProgressLog;
use gdal::raster::GdalDataType;
use std::path::Path;
use terraflow_core::error::Error;
use terraflow_core::io::{
    iter_blocks, new_raster_from_template, open_read, read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{step_cost, NEIGHBOR_OFFSETS, REVERSE_DIRECTION};
use terraflow_core::{ManagedRaster, RasterMode, Result};

pub(crate) const DISTANCE_NODATA: f64 = -1.0;

/// Compute the D8 downstream distance to the nearest channel pixel,
/// writing a float64 raster (nodata -1) to `target_distance_path`.
/// Channel pixels have distance 0; pixels with no path to a channel keep
/// nodata.
pub fn distance_to_channel_d8(
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

    let source = open_read(channel_path)?;
    let is_invalid_dir = |value: f64| {
        value.is_nan()
            || flow_info.nodata.is_some_and(|nodata| value == nodata)
            || !(0.0..8.0).contains(&value)
    };

    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&channel_info).collect();
    let total_windows = windows.len();

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "distance_to_channel_d8: {:.1}% of {} complete",
                100.0 * window_index as f64 / total_windows as f64,
                channel_path.display()
            )
        });
        let halo = read_halo_window(&source, channel_band, window, 0.0)?;
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                if halo[(local_y + 1, local_x + 1)] != 1.0 {
                    continue;
                }
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;
                distance.set(x, y, 0.0)?;

                // chase the reverse flow graph away from this channel cell
                let mut stack = vec![(x, y)];
                while let Some((cx, cy)) = stack.pop() {
                    let current = distance.get(cx, cy)?;
                    for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                        let (nx, ny) = (cx + dx, cy + dy);
                        if !flow.contains(nx, ny) {
                            continue;
                        }
                        if channel_raster.get(nx, ny)? == 1.0 {
                            continue;
                        }
                        let neighbor_dir = flow.get(nx, ny)?;
                        if is_invalid_dir(neighbor_dir)
                            || neighbor_dir != REVERSE_DIRECTION[direction] as f64
                        {
                            continue;
                        }
                        if distance.get(nx, ny)? != DISTANCE_NODATA {
                            continue;
                        }
                        let cost = match weight_raster.as_mut() {
                            Some(raster) => {
                                let value = raster.get(nx, ny)?;
                                if raster.is_nodata(value) {
                                    0.0
                                } else {
                                    value
                                }
                            }
                            None => step_cost(direction),
                        };
                        distance.set(nx, ny, current + cost)?;
                        stack.push((nx, ny));
                    }
                }
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
