//! Worker-side raster operations.
//!
//! Each operation receives the worker's dataset cache and a `cancelled`
//! probe it checks between chunks of work, so an abandoned request stops
//! burning CPU as soon as the current GDAL call returns.

use gdal::raster::GdalDataType;
use serde_json::Value;
use tracing::debug;

use crate::coord::Size2;
use crate::geo::{srs_to_wkt, widened_type, GeoDataset, GeoResult};
use crate::raster::{PixelType, TileBuffer};

use super::cache::DatasetCache;
use super::{
    DemRequest, DemWindowRequest, HeightcodeRequest, ImageRequest, MaskRequest, WarpRequest,
    WarpResponse,
};

/// Executes one request, observing the cancel probe between chunks.
pub fn execute(
    cache: &mut DatasetCache,
    request: &WarpRequest,
    cancelled: &dyn Fn() -> bool,
) -> WarpResponse {
    let result = match request {
        WarpRequest::Image(r) => image(cache, r, cancelled),
        WarpRequest::Mask(r) => mask(cache, r, cancelled),
        WarpRequest::Dem(r) => dem(cache, r, cancelled),
        WarpRequest::DemWindow(r) => dem_window(cache, r, cancelled),
        WarpRequest::Heightcode(r) => heightcode(cache, r, cancelled),
    };
    match result {
        Ok(Some(response)) => response,
        Ok(None) => WarpResponse::Cancelled,
        Err(e) => WarpResponse::Error(e.to_string()),
    }
}

type OpResult = GeoResult<Option<WarpResponse>>;

fn image(cache: &mut DatasetCache, req: &ImageRequest, cancelled: &dyn Fn() -> bool) -> OpResult {
    if cancelled() {
        return Ok(None);
    }
    let srs = srs_to_wkt(&req.srs)?;

    let (bands, data) = {
        let src = cache.get(&req.dataset)?;
        let bands = src.descriptor().bands.min(3);
        let mut target = GeoDataset::create_mem(
            req.size,
            bands,
            GdalDataType::UInt8,
            req.extents,
            &srs,
            None,
        )?;
        src.warp_into(&mut target, req.resampling)?;
        if cancelled() {
            return Ok(None);
        }

        let mut planes = Vec::with_capacity(bands);
        for band in 1..=bands {
            planes.push(target.read_band_u8(band)?);
        }
        (bands, interleave(&planes, req.size))
    };

    let mut buffer = if bands == 1 && !req.no_expand {
        // expand grayscale to RGB
        let mut rgb = Vec::with_capacity(data.len() * 3);
        for value in &data {
            rgb.extend_from_slice(&[*value, *value, *value]);
        }
        TileBuffer::new(req.size, 3, PixelType::U8, rgb)
    } else {
        TileBuffer::new(req.size, bands as u8, PixelType::U8, data)
    };

    // companion mask zeroes out void pixels
    if let Some(mask_dataset) = &req.mask {
        if cancelled() {
            return Ok(None);
        }
        let mask = warp_mask(cache, mask_dataset, &srs, req.extents, req.size, req.resampling)?;
        let channels = buffer.channels as usize;
        for (pixel, valid) in mask.data.iter().enumerate() {
            if *valid == 0 {
                let offset = pixel * channels;
                buffer.data[offset..offset + channels].fill(0);
            }
        }
    }

    Ok(Some(WarpResponse::Raster(buffer)))
}

fn mask(cache: &mut DatasetCache, req: &MaskRequest, cancelled: &dyn Fn() -> bool) -> OpResult {
    if cancelled() {
        return Ok(None);
    }
    let srs = srs_to_wkt(&req.srs)?;
    let buffer = warp_mask(cache, &req.dataset, &srs, req.extents, req.size, req.resampling)?;
    if cancelled() {
        return Ok(None);
    }
    Ok(Some(WarpResponse::Raster(buffer)))
}

/// Warps a dataset and derives its validity mask.
///
/// Uses the widened-type trick for band-masked sources so real data can
/// never collide with the synthetic nodata value.
fn warp_mask(
    cache: &mut DatasetCache,
    dataset: &str,
    srs_wkt: &str,
    extents: crate::coord::Extents2,
    size: Size2,
    resampling: crate::raster::Resampling,
) -> GeoResult<TileBuffer> {
    let src = cache.get(dataset)?;
    let (dtype, nodata) = widened_type(src.descriptor());
    let mut target = GeoDataset::create_mem(size, 1, dtype, extents, srs_wkt, nodata)?;
    src.warp_into(&mut target, resampling)?;
    let mask = target.read_mask(1)?;
    Ok(TileBuffer::new(size, 1, PixelType::U8, mask))
}

fn dem(cache: &mut DatasetCache, req: &DemRequest, cancelled: &dyn Fn() -> bool) -> OpResult {
    if cancelled() {
        return Ok(None);
    }
    let srs = srs_to_wkt(&req.srs)?;

    let src = cache.get(&req.dataset)?;
    let nodata = src.descriptor().nodata.or(Some(-32768.0));
    let mut window = GeoDataset::create_mem(
        req.size,
        1,
        GdalDataType::Float32,
        req.extents,
        &srs,
        nodata,
    )?;
    src.warp_into(&mut window, req.resampling)?;
    if cancelled() {
        return Ok(None);
    }

    let mut options = req.options.clone();
    if !options.iter().any(|o| o == "-compute_edges") {
        options.push("-compute_edges".to_string());
    }
    let processed = crate::geo::dem_processing(
        &window,
        req.algorithm.gdal_name(),
        &options,
        req.color_file.as_deref(),
    )?;
    if cancelled() {
        return Ok(None);
    }

    let bands = processed.descriptor().bands.min(3);
    let mut planes = Vec::with_capacity(bands);
    for band in 1..=bands {
        planes.push(processed.read_band_u8(band)?);
    }
    let data = interleave(&planes, req.size);
    Ok(Some(WarpResponse::Raster(TileBuffer::new(
        req.size,
        bands as u8,
        PixelType::U8,
        data,
    ))))
}

fn dem_window(
    cache: &mut DatasetCache,
    req: &DemWindowRequest,
    cancelled: &dyn Fn() -> bool,
) -> OpResult {
    if cancelled() {
        return Ok(None);
    }
    let srs = srs_to_wkt(&req.srs)?;

    let src = cache.get(&req.dataset)?;
    let (dtype, nodata) = widened_type(src.descriptor());
    let dtype = match dtype {
        GdalDataType::Float64 => GdalDataType::Float64,
        _ => GdalDataType::Float32,
    };
    let mut target = GeoDataset::create_mem(req.size, 1, dtype, req.extents, &srs, nodata)?;
    src.warp_into(&mut target, req.resampling)?;
    if cancelled() {
        return Ok(None);
    }

    let mut heights = target.read_band_f32(1)?;
    let mask = target.read_mask(1)?;
    for (height, valid) in heights.iter_mut().zip(&mask) {
        if *valid == 0 {
            *height = f32::NAN;
        }
    }

    let data: Vec<u8> = heights.iter().flat_map(|h| h.to_le_bytes()).collect();
    Ok(Some(WarpResponse::Raster(TileBuffer::new(
        req.size,
        1,
        PixelType::F32,
        data,
    ))))
}

fn heightcode(
    cache: &mut DatasetCache,
    req: &HeightcodeRequest,
    cancelled: &dyn Fn() -> bool,
) -> OpResult {
    use gdal::vector::LayerAccess;

    if cancelled() {
        return Ok(None);
    }

    let vector = gdal::Dataset::open(std::path::Path::new(&req.vector))?;
    let mut features = Vec::new();

    for mut layer in vector.layers() {
        let name = layer.name();
        if !req.layers.is_empty() && !req.layers.iter().any(|l| l == &name) {
            continue;
        }
        for feature in layer.features() {
            if cancelled() {
                return Ok(None);
            }
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            let mut geojson: Value =
                serde_json::from_str(&geometry.json()?).unwrap_or(Value::Null);
            if let Some(coordinates) = geojson.get_mut("coordinates") {
                drape(coordinates, cache, &req.rasters)?;
            }

            let mut properties = serde_json::Map::new();
            for (field, value) in feature.fields() {
                properties.insert(field, field_to_json(value));
            }

            features.push(serde_json::json!({
                "type": "Feature",
                "layer": name,
                "properties": properties,
                "geometry": geojson,
            }));
        }
    }

    let collection = serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
    });
    Ok(Some(WarpResponse::Vector(collection.to_string())))
}

/// Recursively assigns a Z to every `[x, y(, z)]` position.
fn drape(value: &mut Value, cache: &mut DatasetCache, rasters: &[String]) -> GeoResult<()> {
    match value {
        Value::Array(items) => {
            let is_position = items.len() >= 2 && items.iter().all(Value::is_number);
            if is_position {
                let x = items[0].as_f64().unwrap_or(0.0);
                let y = items[1].as_f64().unwrap_or(0.0);
                let z = sample_stack(cache, rasters, x, y)?;
                let z_value = serde_json::Number::from_f64(z)
                    .unwrap_or_else(|| serde_json::Number::from(0));
                if items.len() >= 3 {
                    items[2] = Value::Number(z_value);
                } else {
                    items.push(Value::Number(z_value));
                }
            } else {
                for item in items {
                    drape(item, cache, rasters)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// First valid value in the DEM stack; 0 when every dataset misses.
fn sample_stack(cache: &mut DatasetCache, rasters: &[String], x: f64, y: f64) -> GeoResult<f64> {
    for raster in rasters {
        let dataset = cache.get(raster)?;
        if let Some(value) = dataset.sample(x, y)? {
            return Ok(value);
        }
    }
    debug!(x, y, "No DEM in stack covers point; using zero");
    Ok(0.0)
}

fn field_to_json(value: Option<gdal::vector::FieldValue>) -> Value {
    use gdal::vector::FieldValue;
    match value {
        Some(FieldValue::IntegerValue(v)) => v.into(),
        Some(FieldValue::Integer64Value(v)) => v.into(),
        Some(FieldValue::RealValue(v)) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(FieldValue::StringValue(v)) => v.into(),
        _ => Value::Null,
    }
}

/// Interleaves per-band planes into packed pixels.
fn interleave(planes: &[Vec<u8>], size: Size2) -> Vec<u8> {
    let bands = planes.len();
    let mut out = vec![0u8; size.area() * bands];
    for (band, plane) in planes.iter().enumerate() {
        for (pixel, value) in plane.iter().enumerate() {
            out[pixel * bands + band] = *value;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave() {
        let planes = vec![vec![1u8, 2], vec![10u8, 20], vec![100u8, 200]];
        let out = interleave(&planes, Size2::new(2, 1));
        assert_eq!(out, vec![1, 10, 100, 2, 20, 200]);
    }

    #[test]
    fn test_drape_adds_z() {
        let mut cache = DatasetCache::new(2);
        // no rasters -> z = 0 for every vertex
        let mut coords: Value = serde_json::json!([[0.5, 0.5], [1.5, 1.5, 7.0]]);
        drape(&mut coords, &mut cache, &[]).unwrap();
        assert_eq!(coords[0][2], 0.0);
        // existing z is overwritten by the stack sample
        assert_eq!(coords[1][2], 0.0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut cache = DatasetCache::new(2);
        let response = execute(
            &mut cache,
            &WarpRequest::Heightcode(HeightcodeRequest {
                vector: "/nonexistent".to_string(),
                rasters: vec![],
                geoid_grid: None,
                layers: vec![],
            }),
            &|| true,
        );
        assert!(matches!(response, WarpResponse::Cancelled));
    }

    #[test]
    fn test_error_surfaces_as_string() {
        let mut cache = DatasetCache::new(2);
        let response = execute(
            &mut cache,
            &WarpRequest::Mask(MaskRequest {
                dataset: "/nonexistent/data.tif".to_string(),
                srs: "EPSG:3857".to_string(),
                extents: crate::coord::Extents2::new(0.0, 0.0, 1.0, 1.0),
                size: Size2::new(8, 8),
                resampling: crate::raster::Resampling::Nearest,
            }),
            &|| false,
        );
        assert!(matches!(response, WarpResponse::Error(_)));
    }
}
