//! D8 flow accumulation
//!
//! `accum(p) = w(p) + sum of accum(q)` over every neighbor `q` draining
//! into `p`. The weight raster defaults to 1 per pixel. The upstream
//! traversal runs on an explicit frame stack so its depth is bounded by
//! heap memory, not thread stack size; watersheds of millions of cells
//! routinely exceed default call-stack limits.

use crate::support::{FlowFrame, ProgressLog};
use gdal::raster::GdalDataType;
use std::path::Path;
use terraflow_core::io::{
    iter_blocks, new_raster_from_template, open_read, read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{NEIGHBOR_OFFSETS, REVERSE_DIRECTION};
use terraflow_core::{ManagedRaster, RasterMode, Result};

pub(crate) const ACCUM_NODATA: f64 = -1.0;

/// Accumulate weighted upstream flow over a D8 flow-direction raster,
/// writing a float64 raster (nodata -1) to `target_accum_path`.
pub fn flow_accumulation_d8(
    flow_dir: (&Path, usize),
    target_accum_path: &Path,
    weight: Option<(&Path, usize)>,
) -> Result<()> {
    let (flow_path, flow_band) = flow_dir;
    let flow_info = RasterInfo::read(flow_path, flow_band)?;
    if let Some((weight_path, weight_band)) = weight {
        RasterInfo::read(weight_path, weight_band)?;
    }

    new_raster_from_template(
        &flow_info,
        target_accum_path,
        GdalDataType::Float64,
        Some(ACCUM_NODATA),
        Some(ACCUM_NODATA),
    )?;

    let mut flow = ManagedRaster::open(flow_path, flow_band, RasterMode::Read)?;
    let mut accum = ManagedRaster::open(target_accum_path, 1, RasterMode::ReadWrite)?;
    let mut weight_raster = match weight {
        Some((weight_path, weight_band)) => Some(ManagedRaster::open(
            weight_path,
            weight_band,
            RasterMode::Read,
        )?),
        None => None,
    };

    let source = open_read(flow_path)?;
    let halo_fill = flow_info.nodata.unwrap_or(f64::NAN);
    let is_invalid_dir = |value: f64| {
        value.is_nan()
            || flow_info.nodata.is_some_and(|nodata| value == nodata)
            || !(0.0..8.0).contains(&value)
    };

    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&flow_info).collect();
    let total_windows = windows.len();

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "flow_accumulation_d8: {:.1}% of {} complete",
                100.0 * window_index as f64 / total_windows as f64,
                flow_path.display()
            )
        });
        let halo = read_halo_window(&source, flow_band, window, halo_fill)?;
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                let direction = halo[(local_y + 1, local_x + 1)];
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;

                // roots drain out of the problem: either their outflow
                // neighbor is off-raster or nodata, or they have no
                // direction themselves but receive flow (an outlet pixel)
                let is_root = if is_invalid_dir(direction) {
                    NEIGHBOR_OFFSETS.iter().enumerate().any(|(i, &(dx, dy))| {
                        let neighbor = halo[(
                            (local_y as i64 + 1 + dy) as usize,
                            (local_x as i64 + 1 + dx) as usize,
                        )];
                        !is_invalid_dir(neighbor)
                            && neighbor == REVERSE_DIRECTION[i] as f64
                    })
                } else {
                    let (dx, dy) = NEIGHBOR_OFFSETS[direction as usize];
                    let downstream = halo[(
                        (local_y as i64 + 1 + dy) as usize,
                        (local_x as i64 + 1 + dx) as usize,
                    )];
                    is_invalid_dir(downstream)
                };
                if is_root && accum.get(x, y)? == ACCUM_NODATA {
                    accumulate_upstream(
                        x,
                        y,
                        &mut flow,
                        &mut accum,
                        &mut weight_raster,
                        &is_invalid_dir,
                    )?;
                }
            }
        }
    }

    flow.close()?;
    accum.close()?;
    if let Some(mut weight_raster) = weight_raster {
        weight_raster.close()?;
    }
    Ok(())
}

fn weight_at(
    weight_raster: &mut Option<ManagedRaster>,
    x: i64,
    y: i64,
) -> Result<f64> {
    match weight_raster {
        Some(raster) => {
            let value = raster.get(x, y)?;
            if raster.is_nodata(value) {
                Ok(0.0)
            } else {
                Ok(value)
            }
        }
        None => Ok(1.0),
    }
}

/// Walk the upstream tree of a root with an explicit stack, committing
/// each pixel's accumulation once all of its contributors are known.
fn accumulate_upstream(
    root_x: i64,
    root_y: i64,
    flow: &mut ManagedRaster,
    accum: &mut ManagedRaster,
    weight_raster: &mut Option<ManagedRaster>,
    is_invalid_dir: &dyn Fn(f64) -> bool,
) -> Result<()> {
    let mut stack = vec![FlowFrame::new(
        root_x,
        root_y,
        weight_at(weight_raster, root_x, root_y)?,
    )];
    while let Some(mut frame) = stack.pop() {
        let mut preempted = false;
        while frame.next_neighbor < 8 {
            let direction = frame.next_neighbor;
            let (dx, dy) = NEIGHBOR_OFFSETS[direction];
            let (nx, ny) = (frame.x + dx, frame.y + dy);
            if flow.contains(nx, ny) {
                let neighbor_dir = flow.get(nx, ny)?;
                if !is_invalid_dir(neighbor_dir)
                    && neighbor_dir == REVERSE_DIRECTION[direction] as f64
                {
                    let upstream = accum.get(nx, ny)?;
                    if upstream == ACCUM_NODATA {
                        // suspend here; the neighbor's own frame resolves
                        // first, then this frame resumes at the same slot
                        stack.push(frame);
                        stack.push(FlowFrame::new(nx, ny, weight_at(weight_raster, nx, ny)?));
                        preempted = true;
                        break;
                    }
                    frame.running += upstream;
                }
            }
            frame.next_neighbor += 1;
        }
        if !preempted {
            accum.set(frame.x, frame.y, frame.running)?;
        }
    }
    Ok(())
}
