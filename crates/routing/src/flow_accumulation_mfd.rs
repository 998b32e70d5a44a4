//! MFD flow accumulation
//!
//! Like the D8 accumulator, but each upstream neighbor contributes only
//! the fraction of its flow aimed at the current pixel:
//! `accum(p) = w(p) + sum of accum(q) * w(q->p) / sum(w(q))`. The same
//! explicit-stack preemption scheme bounds traversal depth by heap memory.

use crate::flow_accumulation::ACCUM_NODATA;
use crate::support::{FlowFrame, ProgressLog};
use gdal::raster::GdalDataType;
use std::path::Path;
use terraflow_core::io::{
    iter_blocks, new_raster_from_template, open_read, read_halo_window, RasterInfo,
};
use terraflow_core::kernel::{
    mfd_weight, mfd_weight_sum, MFD_NODATA, NEIGHBOR_OFFSETS, REVERSE_DIRECTION,
};
use terraflow_core::{ManagedRaster, RasterMode, Result};

/// Accumulate weighted upstream flow over an MFD flow-direction raster,
/// writing a float64 raster (nodata -1) to `target_accum_path`.
pub fn flow_accumulation_mfd(
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
    let mut progress = ProgressLog::new();
    let windows: Vec<_> = iter_blocks(&flow_info).collect();
    let total_windows = windows.len();

    for (window_index, window) in windows.into_iter().enumerate() {
        progress.tick(|| {
            format!(
                "flow_accumulation_mfd: {:.1}% of {} complete",
                100.0 * window_index as f64 / total_windows as f64,
                flow_path.display()
            )
        });
        // no outflow (0) doubles as the off-raster halo fill
        let halo = read_halo_window(&source, flow_band, window, MFD_NODATA as f64)?;
        for local_y in 0..window.height {
            for local_x in 0..window.width {
                let packed = halo[(local_y + 1, local_x + 1)] as i32;
                let x = window.xoff + local_x as i64;
                let y = window.yoff + local_y as i64;

                let is_root = if packed == MFD_NODATA {
                    // an outlet: no outflow of its own, but fed by a
                    // neighbor
                    NEIGHBOR_OFFSETS.iter().enumerate().any(|(i, &(dx, dy))| {
                        let neighbor = halo[(
                            (local_y as i64 + 1 + dy) as usize,
                            (local_x as i64 + 1 + dx) as usize,
                        )] as i32;
                        neighbor != MFD_NODATA
                            && mfd_weight(neighbor, REVERSE_DIRECTION[i] as usize) > 0
                    })
                } else {
                    // some outflow lands off-raster or on nodata
                    NEIGHBOR_OFFSETS.iter().enumerate().any(|(i, &(dx, dy))| {
                        mfd_weight(packed, i) > 0
                            && halo[(
                                (local_y as i64 + 1 + dy) as usize,
                                (local_x as i64 + 1 + dx) as usize,
                            )] as i32
                                == MFD_NODATA
                    })
                };
                if is_root && accum.get(x, y)? == ACCUM_NODATA {
                    accumulate_upstream(x, y, &mut flow, &mut accum, &mut weight_raster)?;
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

fn accumulate_upstream(
    root_x: i64,
    root_y: i64,
    flow: &mut ManagedRaster,
    accum: &mut ManagedRaster,
    weight_raster: &mut Option<ManagedRaster>,
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
                let neighbor_packed = flow.get(nx, ny)? as i32;
                let weight_toward_here = if neighbor_packed == MFD_NODATA {
                    0
                } else {
                    mfd_weight(neighbor_packed, REVERSE_DIRECTION[direction] as usize)
                };
                if weight_toward_here > 0 {
                    let upstream = accum.get(nx, ny)?;
                    if upstream == ACCUM_NODATA {
                        stack.push(frame);
                        stack.push(FlowFrame::new(nx, ny, weight_at(weight_raster, nx, ny)?));
                        preempted = true;
                        break;
                    }
                    let fraction =
                        weight_toward_here as f64 / mfd_weight_sum(neighbor_packed) as f64;
                    frame.running += upstream * fraction;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_direction_mfd::flow_dir_mfd;
    use crate::test_util::{new_test_raster, read_raster, read_raster_i32, workspace};

    #[test]
    fn test_flow_accumulation_mfd_ramp() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        new_test_raster(&dem_path, 3, 1, &[3.0, 2.0, 1.0], None);
        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let accum_path = workspace.path().join("accum.tif");
        flow_accumulation_mfd((&flow_path, 1), &accum_path, None).unwrap();

        assert_eq!(read_raster(&accum_path), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_flow_accumulation_mfd_consistency() {
        // accum(p) = 1 + sum of fractional upstream contributions, checked
        // cell by cell on a plain with a central channel
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let mut dem = vec![0.0; 121];
        for x in 0..11 {
            dem[5 * 11 + x] = -1.0;
        }
        new_test_raster(&dem_path, 11, 11, &dem, None);
        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let accum_path = workspace.path().join("accum.tif");
        flow_accumulation_mfd((&flow_path, 1), &accum_path, None).unwrap();

        let flow = read_raster_i32(&flow_path);
        let accum = read_raster(&accum_path);
        let at = |x: i64, y: i64| (y * 11 + x) as usize;
        for y in 0..11i64 {
            for x in 0..11i64 {
                let mut expected = 1.0;
                for (i, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                    let (nx, ny) = (x + dx, y + dy);
                    if !(0..11).contains(&nx) || !(0..11).contains(&ny) {
                        continue;
                    }
                    let neighbor = flow[at(nx, ny)];
                    if neighbor == 0 {
                        continue;
                    }
                    let toward = mfd_weight(neighbor, REVERSE_DIRECTION[i] as usize);
                    if toward > 0 {
                        expected += accum[at(nx, ny)] * toward as f64
                            / mfd_weight_sum(neighbor) as f64;
                    }
                }
                assert!(
                    (accum[at(x, y)] - expected).abs() < 1e-9,
                    "accumulation at ({x}, {y}) is {} but upstream sums to {expected}",
                    accum[at(x, y)]
                );
            }
        }
        // headwater cells carry exactly their own weight
        assert_eq!(accum[at(0, 0)], 1.0);
        assert_eq!(accum[at(10, 0)], 1.0);
    }

    #[test]
    fn test_flow_accumulation_mfd_weighted_scales_linearly() {
        let workspace = workspace();
        let dem_path = workspace.path().join("dem.tif");
        let mut dem = vec![0.0; 121];
        for x in 0..11 {
            dem[5 * 11 + x] = -1.0;
        }
        new_test_raster(&dem_path, 11, 11, &dem, None);
        let flow_path = workspace.path().join("flow.tif");
        flow_dir_mfd((&dem_path, 1), &flow_path, Some(workspace.path())).unwrap();

        let weight_path = workspace.path().join("weight.tif");
        new_test_raster(&weight_path, 11, 11, &[2.5; 121], None);

        let plain_path = workspace.path().join("accum.tif");
        let weighted_path = workspace.path().join("accum_weighted.tif");
        flow_accumulation_mfd((&flow_path, 1), &plain_path, None).unwrap();
        flow_accumulation_mfd((&flow_path, 1), &weighted_path, Some((&weight_path, 1)))
            .unwrap();

        for (plain, weighted) in read_raster(&plain_path)
            .iter()
            .zip(read_raster(&weighted_path).iter())
        {
            assert!(
                (weighted - 2.5 * plain).abs() < 1e-9,
                "constant weights must scale accumulation linearly"
            );
        }
    }
}
