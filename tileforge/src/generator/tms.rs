//! Common TMS behaviour plus the `tms-raster` and `tms-gdaldem`
//! producers.
//!
//! TMS resources serve straight from their source dataset; preparation
//! only validates the dataset and snapshots the tileset properties.

use std::sync::Arc;

use crate::coord::{in_ranges, Size2};
use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileArtifact;
use crate::frame::NodeInfo;
use crate::raster::{encode_tile, PixelType, RasterFormat, Resampling, TileBuffer};
use crate::resource::{FileClass, Resource, TmsGdaldemDef, TmsRasterDef};
use crate::sink::TileResponse;
use crate::warper::{DemRequest, ImageRequest, MaskRequest, WarpRequest, WarpResponse};

use super::{Generator, Prepared, TileRequest, TilesetProperties};

/// Every raster tile is 256×256.
pub(super) const TILE_SIZE: Size2 = Size2 {
    width: 256,
    height: 256,
};

/// Preparation shared by the TMS drivers: the source dataset must exist
/// and the properties snapshot is taken from the resource itself.
pub(super) async fn prepare(
    generator: &Arc<Generator>,
    resource: &Resource,
) -> GenerateResult<Prepared> {
    let dataset = match &resource.definition {
        crate::resource::Definition::TmsRaster(def) => def.dataset.clone(),
        crate::resource::Definition::TmsGdaldem(def) => def.dataset.clone(),
        crate::resource::Definition::TmsNormalMap(def) => def.dataset.clone(),
        crate::resource::Definition::TmsSpecularMap(def) => def.dataset.clone(),
        other => {
            return Err(GenerateError::Internal(format!(
                "tms preparation on non-tms definition {other:?}"
            )))
        }
    };
    if !std::path::Path::new(&dataset).exists() {
        return Err(GenerateError::NotFound(format!(
            "source dataset <{dataset}> does not exist"
        )));
    }

    let root = generator.root();
    std::fs::create_dir_all(&root)
        .map_err(|e| GenerateError::io(format!("creating {}", root.display()), e))?;

    Ok(Prepared {
        index: None,
        properties: properties_of(resource),
        dataset: None,
    })
}

pub(super) fn properties_of(resource: &Resource) -> TilesetProperties {
    TilesetProperties {
        id: resource.id.full_id(),
        reference_frame: resource.id.reference_frame.clone(),
        lod_range: resource.lod_range,
        tile_range: resource.tile_range,
        revision: resource.revision,
        credits: resource.credits.iter().map(|c| c.id.clone()).collect(),
        nominal_texel_size: 0.0,
        merge_bottom_lod: None,
    }
}

/// Gate sequence common to every producer: abort check, node validity,
/// productivity (with the delivery index when one exists), range check.
pub(super) fn gate(request: &TileRequest<'_>) -> GenerateResult<NodeInfo> {
    request.sink.check_aborted()?;

    let node = NodeInfo::new(Arc::clone(&request.frame), request.info.tile);
    if !node.productive() {
        // TMS callers get the canonical empty body for holes in the tree
        return Err(GenerateError::EmptyImage);
    }

    if let Some(prepared) = &request.prepared {
        if let Some(index) = &prepared.index {
            if !index.is_real(request.info.tile) {
                return Err(GenerateError::NotFound(
                    "no data for this tile".to_string(),
                ));
            }
        }
    }

    let resource = request.resource;
    if !resource.lod_range.is_empty()
        && !in_ranges(resource.lod_range, resource.tile_range, request.info.tile)
    {
        return Err(GenerateError::NotFound(
            "tile out of configured range".to_string(),
        ));
    }

    Ok(node)
}

/// Ships a warp request and maps the response onto the error taxonomy.
pub(super) async fn warp_raster(
    request: &TileRequest<'_>,
    warp: WarpRequest,
) -> GenerateResult<TileBuffer> {
    match request.warper.warp(warp, request.sink).await {
        Ok(WarpResponse::Raster(buffer)) => Ok(buffer),
        Ok(WarpResponse::Cancelled) => Err(GenerateError::Cancelled),
        Ok(other) => Err(GenerateError::Internal(format!(
            "unexpected warper response {other:?}"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Encodes a mask buffer as the canonical PNG mask tile.
pub(super) fn mask_response(mask: TileBuffer) -> GenerateResult<TileResponse> {
    if !mask.any_valid() {
        return Err(GenerateError::EmptyImage);
    }
    let body = encode_tile(&mask, RasterFormat::Png)?;
    Ok(TileResponse::new(body, "image/png", FileClass::Data))
}

/// One-pixel morphological erosion of a mask in place.
///
/// The mask is warped at tile size, so border pixels erode against the
/// tile edge instead of the neighbouring tile's data; warping with a
/// 257×257 margin and cropping would remove that imperfection.
pub(super) fn erode_mask(mask: &mut TileBuffer) {
    let (width, height) = (mask.size.width, mask.size.height);
    let source = mask.data.clone();
    for y in 0..height {
        for x in 0..width {
            let mut keep = source[y * width + x] != 0;
            if keep {
                'probe: for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        if source[ny as usize * width + nx as usize] == 0 {
                            keep = false;
                            break 'probe;
                        }
                    }
                }
            }
            mask.data[y * width + x] = if keep { 255 } else { 0 };
        }
    }
}

/// `tms-raster`: warp the source into the tile extent and encode.
pub(super) async fn generate_raster(
    request: &TileRequest<'_>,
    def: &TmsRasterDef,
) -> GenerateResult<TileResponse> {
    let node = gate(request)?;

    match request.info.artifact {
        TileArtifact::Image(format) => {
            let buffer = warp_raster(
                request,
                WarpRequest::Image(ImageRequest {
                    dataset: def.dataset.clone(),
                    mask: def.mask.clone(),
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: def.resampling.unwrap_or(Resampling::Cubic),
                    no_expand: false,
                }),
            )
            .await?;
            request.sink.check_aborted()?;

            let body = encode_tile(&buffer, format)?;
            Ok(TileResponse::new(body, format.content_type(), FileClass::Data))
        }
        TileArtifact::Mask => {
            let mask = warp_raster(
                request,
                WarpRequest::Mask(MaskRequest {
                    dataset: def.mask.clone().unwrap_or_else(|| def.dataset.clone()),
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: Resampling::Nearest,
                }),
            )
            .await?;
            request.sink.check_aborted()?;
            mask_response(mask)
        }
        _ => Err(GenerateError::NotFound(
            "artifact not served by tms-raster".to_string(),
        )),
    }
}

/// `tms-gdaldem`: DEM derivation tiles.
pub(super) async fn generate_gdaldem(
    request: &TileRequest<'_>,
    def: &TmsGdaldemDef,
) -> GenerateResult<TileResponse> {
    let node = gate(request)?;

    match request.info.artifact {
        TileArtifact::Image(format) => {
            let buffer = warp_raster(
                request,
                WarpRequest::Dem(DemRequest {
                    dataset: def.dataset.clone(),
                    algorithm: def.processing,
                    options: def.options.clone(),
                    color_file: None,
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: Resampling::Cubic,
                }),
            )
            .await?;
            request.sink.check_aborted()?;

            let buffer = if buffer.channels == 1 {
                expand_gray(&buffer)
            } else {
                buffer
            };
            let body = encode_tile(&buffer, format)?;
            Ok(TileResponse::new(body, format.content_type(), FileClass::Data))
        }
        TileArtifact::Mask => {
            let mut mask = warp_raster(
                request,
                WarpRequest::Mask(MaskRequest {
                    dataset: def.dataset.clone(),
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: Resampling::Nearest,
                }),
            )
            .await?;
            request.sink.check_aborted()?;
            erode_mask(&mut mask);
            mask_response(mask)
        }
        _ => Err(GenerateError::NotFound(
            "artifact not served by tms-gdaldem".to_string(),
        )),
    }
}

fn expand_gray(buffer: &TileBuffer) -> TileBuffer {
    let mut rgb = Vec::with_capacity(buffer.data.len() * 3);
    for value in &buffer.data {
        rgb.extend_from_slice(&[*value, *value, *value]);
    }
    TileBuffer::new(buffer.size, 3, PixelType::U8, rgb)
}

/// `boundlayer.json` for a TMS resource.
pub(super) fn bound_layer(
    generator: &Generator,
    resource: &Resource,
) -> GenerateResult<TileResponse> {
    let format = match &resource.definition {
        crate::resource::Definition::TmsRaster(def) => def.format,
        crate::resource::Definition::TmsNormalMap(_) => RasterFormat::Webp,
        _ => RasterFormat::Jpg,
    };
    let url = format!(
        "{}/{}",
        generator.url(),
        crate::fileinfo::tile_url_template(
            format.extension(),
            generator.generator_revision(),
            resource.revision
        )
    );
    let mask_url = format!(
        "{}/{}",
        generator.url(),
        crate::fileinfo::tile_url_template(
            "mask",
            generator.generator_revision(),
            resource.revision
        )
    );

    let body = serde_json::json!({
        "id": resource.id.full_id(),
        "type": "raster",
        "url": url,
        "maskUrl": mask_url,
        "lodRange": [resource.lod_range.min, resource.lod_range.max],
        "tileRange": [
            [resource.tile_range.ll.0, resource.tile_range.ll.1],
            [resource.tile_range.ur.0, resource.tile_range.ur.1]
        ],
        "credits": resource.credits.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
    });

    Ok(TileResponse::new(
        serde_json::to_vec_pretty(&body).map_err(|e| GenerateError::Internal(e.to_string()))?,
        "application/json; charset=utf-8",
        FileClass::Config,
    ))
}
