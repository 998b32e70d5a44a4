//! Watershed delineation
//!
//! Floods the reverse D8 graph backwards from each outflow point, labels
//! the claimed pixels in a scratch raster, and polygonizes the result into
//! a fragments vector. A fragment stops where it meets pixels claimed by
//! another outflow; the blocked ids are recorded in `upstream_fragments`
//! so callers can assemble complete watersheds as lazy set unions instead
//! of re-running the raster flood.

use crate::support::{scratch_dir, ProgressLog};
use gdal::cpl::CslStringList;
use gdal::raster::GdalDataType;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{Feature, FieldValue, LayerAccess, LayerOptions, OGRFieldType};
use gdal::{Dataset, DriverManager};
use gdal_sys::{CPLErr, OGRwkbGeometryType};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use terraflow_core::error::Error;
use terraflow_core::io::{new_raster_from_template, open_read, RasterInfo};
use terraflow_core::kernel::{NEIGHBOR_OFFSETS, REVERSE_DIRECTION};
use terraflow_core::{ManagedRaster, RasterMode, Result};
use tracing::info;

const NO_WATERSHED: f64 = -1.0;

/// One outflow point clipped to the raster, with its source attributes
struct Outflow {
    x: i64,
    y: i64,
    fields: Vec<(String, Option<FieldValue>)>,
}

/// Delineate the watershed fragment upstream of every outflow point,
/// writing a polygon layer to `target_fragments_path` (GeoPackage).
///
/// Each fragment feature carries the fields of its outflow point, a dense
/// `ws_id`, and `upstream_fragments`: the comma-joined, ascending ids of
/// fragments nested inside its watershed.
pub fn delineate_watersheds(
    d8_flow_dir: (&Path, usize),
    outflow_vector_path: &Path,
    target_fragments_path: &Path,
    working_dir: Option<&Path>,
) -> Result<()> {
    let (flow_path, flow_band) = d8_flow_dir;
    let flow_info = RasterInfo::read(flow_path, flow_band)?;
    let scratch = scratch_dir(working_dir, "delineate_watersheds_")?;

    let outflows = read_clipped_outflows(outflow_vector_path, &flow_info)?;
    info!(
        "delineate_watersheds: {} outflow point(s) within {}",
        outflows.len(),
        flow_path.display()
    );

    let ws_raster_path = scratch.path().join("watersheds.tif");
    let visited_path = scratch.path().join("visited_mask.tif");
    new_raster_from_template(
        &flow_info,
        &ws_raster_path,
        GdalDataType::Int32,
        Some(NO_WATERSHED),
        Some(NO_WATERSHED),
    )?;
    new_raster_from_template(&flow_info, &visited_path, GdalDataType::UInt8, None, Some(0.0))?;

    let mut flow = ManagedRaster::open(flow_path, flow_band, RasterMode::Read)?;
    let mut ws_raster = ManagedRaster::open(&ws_raster_path, 1, RasterMode::ReadWrite)?;
    let mut visited = ManagedRaster::open(&visited_path, 1, RasterMode::ReadWrite)?;

    // burn every outflow pixel up front so each flood can tell the seed
    // clusters of the others apart from unclaimed terrain
    for (index, outflow) in outflows.iter().enumerate() {
        ws_raster.set(outflow.x, outflow.y, (index + 1) as f64)?;
    }

    let is_invalid_dir = |value: f64| {
        value.is_nan()
            || flow_info.nodata.is_some_and(|nodata| value == nodata)
            || !(0.0..8.0).contains(&value)
    };

    let mut nested_sets: Vec<BTreeSet<i64>> = Vec::with_capacity(outflows.len());
    let mut progress = ProgressLog::new();
    for (index, outflow) in outflows.iter().enumerate() {
        let ws_id = (index + 1) as i64;
        progress.tick(|| format!("delineate_watersheds: flooding watershed {ws_id}"));
        let mut nested = BTreeSet::new();

        let mut queue = VecDeque::new();
        let mut queued = HashSet::new();
        if visited.get(outflow.x, outflow.y)? == 0.0 {
            queued.insert((outflow.x, outflow.y));
            queue.push_back((outflow.x, outflow.y));
        }
        while let Some((x, y)) = queue.pop_front() {
            ws_raster.set(x, y, ws_id as f64)?;
            visited.set(x, y, 1.0)?;
            for (direction, &(dx, dy)) in NEIGHBOR_OFFSETS.iter().enumerate() {
                let (nx, ny) = (x + dx, y + dy);
                if !flow.contains(nx, ny) {
                    continue;
                }
                let neighbor_dir = flow.get(nx, ny)?;
                let flows_in = !is_invalid_dir(neighbor_dir)
                    && neighbor_dir == REVERSE_DIRECTION[direction] as f64;
                let claim = ws_raster.get(nx, ny)? as i64;
                // claim == ws_id propagates the rasterized seed cluster
                if !(flows_in || claim == ws_id) {
                    continue;
                }
                // an upstream pixel already claimed by another outflow
                // marks a nested watershed and is not crossed
                if claim != NO_WATERSHED as i64 && claim != ws_id {
                    nested.insert(claim);
                    continue;
                }
                if visited.get(nx, ny)? == 1.0 || queued.contains(&(nx, ny)) {
                    continue;
                }
                queued.insert((nx, ny));
                queue.push_back((nx, ny));
            }
        }
        nested_sets.push(nested);
    }

    flow.close()?;
    ws_raster.close()?;
    visited.close()?;

    let work_vector_path = scratch.path().join("polygonized.gpkg");
    polygonize_fragments(&ws_raster_path, &visited_path, &work_vector_path, &flow_info)?;
    write_fragments_vector(
        &work_vector_path,
        target_fragments_path,
        &flow_info,
        &outflows,
        &nested_sets,
    )?;
    Ok(())
}

/// Read the outflow layer, keeping the points that fall inside the
/// flow-direction raster, in feature order.
fn read_clipped_outflows(vector_path: &Path, flow_info: &RasterInfo) -> Result<Vec<Outflow>> {
    if !vector_path.exists() {
        return Err(Error::InvalidArgument(format!(
            "outflow vector {} does not exist",
            vector_path.display()
        )));
    }
    let dataset = Dataset::open(vector_path)?;
    let mut layer = dataset.layer(0)?;

    let field_names: Vec<String> = layer
        .defn()
        .fields()
        .map(|field| field.name())
        .filter(|name| name != "__ws_id__")
        .collect();

    let mut outflows = Vec::new();
    for feature in layer.features() {
        let Some(geometry) = feature.geometry() else {
            continue;
        };
        let (geo_x, geo_y, _) = geometry.get_point(0);
        let (col, row) = flow_info.geotransform.geo_to_pixel(geo_x, geo_y);
        let (x, y) = (col.floor() as i64, row.floor() as i64);
        if x < 0 || x >= flow_info.width || y < 0 || y >= flow_info.height {
            continue;
        }
        let mut fields = Vec::with_capacity(field_names.len());
        for name in &field_names {
            fields.push((name.clone(), feature.field(name)?));
        }
        outflows.push(Outflow { x, y, fields });
    }
    Ok(outflows)
}

/// Polygonize the labelled watershed raster, masked by the visited mask,
/// into a scratch layer with a single `ws_id` field.
fn polygonize_fragments(
    ws_raster_path: &Path,
    visited_path: &Path,
    work_vector_path: &Path,
    flow_info: &RasterInfo,
) -> Result<()> {
    let ws_dataset = open_read(ws_raster_path)?;
    let ws_band = ws_dataset.rasterband(1)?;
    let visited_dataset = open_read(visited_path)?;
    let visited_band = visited_dataset.rasterband(1)?;

    let driver = DriverManager::get_driver_by_name("GPKG")?;
    let mut vector = driver.create_vector_only(work_vector_path)?;
    let srs = spatial_ref(flow_info)?;
    let layer = vector.create_layer(LayerOptions {
        name: "polygonized",
        srs: srs.as_ref(),
        ty: OGRwkbGeometryType::wkbPolygon,
        options: None,
    })?;
    layer.create_defn_fields(&[("ws_id", OGRFieldType::OFTInteger)])?;

    let mut options = CslStringList::new();
    options.set_name_value("8CONNECTED", "8")?;
    let rv = unsafe {
        gdal_sys::GDALPolygonize(
            ws_band.c_rasterband(),
            visited_band.c_rasterband(),
            layer.c_layer(),
            0,
            options.as_ptr(),
            None,
            std::ptr::null_mut(),
        )
    };
    if rv != CPLErr::CE_None {
        return Err(Error::Algorithm(
            "polygonizing the watershed raster failed".to_string(),
        ));
    }
    Ok(())
}

/// Join the polygonized fragments back to their outflow attributes and
/// write the target fragments layer.
fn write_fragments_vector(
    work_vector_path: &Path,
    target_fragments_path: &Path,
    flow_info: &RasterInfo,
    outflows: &[Outflow],
    nested_sets: &[BTreeSet<i64>],
) -> Result<()> {
    let work = Dataset::open(work_vector_path)?;
    let mut work_layer = work.layer(0)?;

    let driver = DriverManager::get_driver_by_name("GPKG")?;
    let mut target = driver.create_vector_only(target_fragments_path)?;
    let srs = spatial_ref(flow_info)?;
    let layer = target.create_layer(LayerOptions {
        name: "watershed_fragments",
        srs: srs.as_ref(),
        ty: OGRwkbGeometryType::wkbPolygon,
        options: None,
    })?;

    let mut field_defs: Vec<(&str, u32)> = Vec::new();
    if let Some(first) = outflows.first() {
        for (name, value) in &first.fields {
            let field_type = match value {
                Some(FieldValue::IntegerValue(_)) => OGRFieldType::OFTInteger,
                Some(FieldValue::Integer64Value(_)) => OGRFieldType::OFTInteger64,
                Some(FieldValue::RealValue(_)) => OGRFieldType::OFTReal,
                _ => OGRFieldType::OFTString,
            };
            field_defs.push((name.as_str(), field_type));
        }
    }
    field_defs.push(("ws_id", OGRFieldType::OFTInteger));
    field_defs.push(("upstream_fragments", OGRFieldType::OFTString));
    layer.create_defn_fields(&field_defs)?;

    for work_feature in work_layer.features() {
        let Some(FieldValue::IntegerValue(ws_id)) = work_feature.field("ws_id")? else {
            continue;
        };
        let index = ws_id as usize - 1;
        let Some(outflow) = outflows.get(index) else {
            continue;
        };
        let Some(geometry) = work_feature.geometry() else {
            continue;
        };

        let mut fragment = Feature::new(layer.defn())?;
        fragment.set_geometry(geometry.clone())?;
        for (name, value) in &outflow.fields {
            if let Some(value) = value {
                fragment.set_field(name, value)?;
            }
        }
        fragment.set_field_integer("ws_id", ws_id)?;
        let upstream = nested_sets[index]
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        fragment.set_field_string("upstream_fragments", &upstream)?;
        fragment.create(&layer)?;
    }
    Ok(())
}

fn spatial_ref(flow_info: &RasterInfo) -> Result<Option<SpatialRef>> {
    if flow_info.projection.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SpatialRef::from_wkt(&flow_info.projection)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_test_raster_typed, workspace};
    use gdal::vector::Geometry;

    /// Write a point GPKG with a `name` attribute per point.
    fn write_points(path: &Path, points: &[(f64, f64, &str)]) {
        let driver = DriverManager::get_driver_by_name("GPKG").unwrap();
        let mut dataset = driver.create_vector_only(path).unwrap();
        let layer = dataset
            .create_layer(LayerOptions {
                name: "outflows",
                srs: None,
                ty: OGRwkbGeometryType::wkbPoint,
                options: None,
            })
            .unwrap();
        layer
            .create_defn_fields(&[("name", OGRFieldType::OFTString)])
            .unwrap();
        for &(x, y, name) in points {
            let mut feature = Feature::new(layer.defn()).unwrap();
            let geometry = Geometry::from_wkt(&format!("POINT ({x} {y})")).unwrap();
            feature.set_geometry(geometry).unwrap();
            feature.set_field_string("name", name).unwrap();
            feature.create(&layer).unwrap();
        }
    }

    fn read_fragments(path: &Path) -> Vec<(i32, String, String, f64)> {
        let dataset = Dataset::open(path).unwrap();
        let mut layer = dataset.layer(0).unwrap();
        let mut fragments = Vec::new();
        for feature in layer.features() {
            let ws_id = match feature.field("ws_id").unwrap() {
                Some(FieldValue::IntegerValue(id)) => id,
                other => panic!("unexpected ws_id {other:?}"),
            };
            let name = match feature.field("name").unwrap() {
                Some(FieldValue::StringValue(name)) => name,
                other => panic!("unexpected name {other:?}"),
            };
            let upstream = match feature.field("upstream_fragments").unwrap() {
                Some(FieldValue::StringValue(upstream)) => upstream,
                None => String::new(),
                other => panic!("unexpected upstream_fragments {other:?}"),
            };
            let area = feature.geometry().unwrap().area();
            fragments.push((ws_id, name, upstream, area));
        }
        fragments.sort_by_key(|fragment| fragment.0);
        fragments
    }

    #[test]
    fn test_delineate_watersheds_nested_on_a_river() {
        // a 5x5 east-flowing grid; two outflows sit on the same river,
        // B upstream of A; the pixel grid is 2x2 meters per cell with
        // origin (2, -2)
        let workspace = workspace();
        let flow_path = workspace.path().join("flow.tif");
        new_test_raster_typed(
            &flow_path,
            5,
            5,
            &[0.0; 25],
            Some(128.0),
            GdalDataType::UInt8,
        );

        let outflow_path = workspace.path().join("outflows.gpkg");
        // pixel centers: A at pixel (4, 2), B at pixel (1, 2)
        write_points(&outflow_path, &[(11.0, -7.0, "A"), (5.0, -7.0, "B")]);

        let fragments_path = workspace.path().join("fragments.gpkg");
        delineate_watersheds(
            (&flow_path, 1),
            &outflow_path,
            &fragments_path,
            Some(workspace.path()),
        )
        .unwrap();

        let fragments = read_fragments(&fragments_path);
        assert_eq!(fragments.len(), 2);

        let (ws_id_a, name_a, upstream_a, area_a) = &fragments[0];
        assert_eq!(*ws_id_a, 1);
        assert_eq!(name_a, "A");
        assert_eq!(upstream_a, "2", "A's flood stops at B's fragment");
        // A claims pixels x=2..4 of the river row: 3 cells of 4 m^2
        assert_eq!(*area_a, 12.0);

        let (ws_id_b, name_b, upstream_b, area_b) = &fragments[1];
        assert_eq!(*ws_id_b, 2);
        assert_eq!(name_b, "B");
        assert_eq!(upstream_b, "");
        // B claims pixels x=0..1 of the river row
        assert_eq!(*area_b, 8.0);
    }

    #[test]
    fn test_delineate_watersheds_clips_outside_points() {
        let workspace = workspace();
        let flow_path = workspace.path().join("flow.tif");
        new_test_raster_typed(
            &flow_path,
            5,
            5,
            &[0.0; 25],
            Some(128.0),
            GdalDataType::UInt8,
        );

        let outflow_path = workspace.path().join("outflows.gpkg");
        // one point inside, one far outside the 10x10 meter raster
        write_points(&outflow_path, &[(11.0, -7.0, "in"), (500.0, -500.0, "out")]);

        let fragments_path = workspace.path().join("fragments.gpkg");
        delineate_watersheds(
            (&flow_path, 1),
            &outflow_path,
            &fragments_path,
            Some(workspace.path()),
        )
        .unwrap();

        let fragments = read_fragments(&fragments_path);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].1, "in");
    }

    #[test]
    fn test_delineate_watersheds_whole_grid_single_outflow() {
        // south-flowing grid, one outflow at the bottom center: the
        // watershed is the full column plus everything that drains in;
        // with pure-south flow that is exactly one column
        let workspace = workspace();
        let flow_path = workspace.path().join("flow.tif");
        new_test_raster_typed(
            &flow_path,
            3,
            3,
            &[6.0; 9],
            Some(128.0),
            GdalDataType::UInt8,
        );

        let outflow_path = workspace.path().join("outflows.gpkg");
        // pixel (1, 2) center: x = 2 + 2*1 + 1 = 5, y = -2 - 2*2 - 1 = -7
        write_points(&outflow_path, &[(5.0, -7.0, "only")]);

        let fragments_path = workspace.path().join("fragments.gpkg");
        delineate_watersheds(
            (&flow_path, 1),
            &outflow_path,
            &fragments_path,
            Some(workspace.path()),
        )
        .unwrap();

        let fragments = read_fragments(&fragments_path);
        assert_eq!(fragments.len(), 1);
        let (ws_id, _, upstream, area) = &fragments[0];
        assert_eq!(*ws_id, 1);
        assert_eq!(upstream, "");
        // the middle column: 3 cells of 4 m^2
        assert_eq!(*area, 12.0);
    }
}
