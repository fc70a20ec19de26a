//! Behaviour shared by the surface producers.
//!
//! Both surface drivers serve the same artifact set (mesh, navtile,
//! structured and 2D metatiles, coverage mask, terrain); they differ
//! only in where heights come from: the prepared DEM pyramid or the
//! constant-zero spheroid.

use std::sync::Arc;

use crate::coord::{Extents2, Lod, Size2, TileId};
use crate::error::{GenerateError, GenerateResult};
use crate::frame::NodeInfo;
use crate::mesh::{
    add_skirt, encode_mesh, encode_navtile, encode_terrain, mesh_from_grid, HeightRange, Metatile,
    MetatileNode, Navtile, META_FLAG_GEOMETRY, META_FLAG_NAVTILE,
};
use crate::raster::{encode_tile, PixelType, RasterFormat, Resampling, TileBuffer};
use crate::resource::{FileClass, Resource};
use crate::sink::TileResponse;
use crate::tileindex::{flags, MmappedTileIndex};
use crate::warper::{DemWindowRequest, WarpRequest};

use super::tms::warp_raster;
use super::{Generator, TileRequest};

/// Structured metatiles accumulate an 8×8 block of children.
pub(super) const META_ORDER: u8 = 3;

/// Skirt depth as a fraction of the tile's extent height.
const SKIRT_FRACTION: f64 = 1.0 / 32.0;

/// Where a surface's heights come from.
#[derive(Clone, Copy, Debug)]
pub(super) enum HeightSource<'a> {
    /// Prepared DEM pyramid (`dataset.vrt`).
    Dataset(&'a str),
    /// Constant zero surface.
    Zero,
}

/// Samples a `samples × samples` height grid over `extents`.
pub(super) async fn sample_heights(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
    srs: &str,
    extents: Extents2,
    samples: usize,
) -> GenerateResult<Vec<f32>> {
    match source {
        HeightSource::Zero => Ok(vec![0.0; samples * samples]),
        HeightSource::Dataset(dataset) => {
            let buffer = warp_raster(
                request,
                WarpRequest::DemWindow(DemWindowRequest {
                    dataset: dataset.to_string(),
                    srs: srs.to_string(),
                    extents,
                    size: Size2::new(samples, samples),
                    resampling: Resampling::Cubic,
                }),
            )
            .await?;
            buffer.as_f32()
        }
    }
}

/// Gate for surface artifacts: abort, validity, index presence.
///
/// Surfaces answer `NotFound` (not an empty image) outside the tree.
pub(super) fn surface_gate(request: &TileRequest<'_>) -> GenerateResult<(NodeInfo, u8)> {
    request.sink.check_aborted()?;

    let node = NodeInfo::new(Arc::clone(&request.frame), request.info.tile);
    if !node.productive() {
        return Err(GenerateError::NotFound(
            "tile outside the valid reference frame tree".to_string(),
        ));
    }

    let index = index_of(request)?;
    let tile_flags = index.get(request.info.tile);
    if !flags::is_real(tile_flags) {
        return Err(GenerateError::NotFound("no mesh for this tile".to_string()));
    }

    Ok((node, tile_flags))
}

pub(super) fn index_of<'a>(request: &'a TileRequest<'_>) -> GenerateResult<&'a MmappedTileIndex> {
    request
        .prepared
        .as_ref()
        .and_then(|p| p.index.as_ref())
        .ok_or(GenerateError::Unavailable)
}

/// Mesh artifact: grid mesh plus skirt, gzipped unless raw.
pub(super) async fn generate_mesh(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
    samples: usize,
) -> GenerateResult<TileResponse> {
    let (node, _) = surface_gate(request)?;

    let heights = sample_heights(request, source, node.srs(), node.extents(), samples).await?;
    request.sink.check_aborted()?;

    let mut mesh = mesh_from_grid(node.extents(), &heights, samples, None);
    if mesh.is_empty() {
        return Err(GenerateError::NotFound("tile mesh is empty".to_string()));
    }
    add_skirt(&mut mesh, node.extents().height() * SKIRT_FRACTION);

    let raw = matches!(request.info.flavor, crate::fileinfo::Flavor::Raw);
    let body = encode_mesh(&mesh);
    if raw {
        return Ok(TileResponse::new(
            body,
            "application/octet-stream",
            FileClass::Data,
        ));
    }

    let gzipped = gzip(&body)?;
    Ok(
        TileResponse::new(gzipped, "application/octet-stream", FileClass::Data)
            .with_header("Content-Encoding", "gzip"),
    )
}

/// Navtile artifact: coarse height grid with its range.
pub(super) async fn generate_navtile(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
    samples: usize,
) -> GenerateResult<TileResponse> {
    let (node, tile_flags) = surface_gate(request)?;
    if !flags::has_navtile(tile_flags) {
        return Err(GenerateError::NotFound(
            "no navtile for this tile".to_string(),
        ));
    }

    let heights = sample_heights(request, source, node.srs(), node.extents(), samples).await?;
    request.sink.check_aborted()?;

    let navtile = Navtile::from_heights(heights, samples);
    Ok(TileResponse::new(
        encode_navtile(&navtile),
        "application/octet-stream",
        FileClass::Data,
    ))
}

/// Structured metatile: per-child flags, height range, texel size,
/// surrogate height and children bitmask.
pub(super) async fn generate_metatile(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
) -> GenerateResult<TileResponse> {
    request.sink.check_aborted()?;
    let tile = request.info.tile;
    let origin = Metatile::block_origin(tile, META_ORDER);
    if origin != tile {
        return Err(GenerateError::NotFound(
            "metatile id is not block-aligned".to_string(),
        ));
    }
    let index = index_of(request)?;

    // block geometry: an aligned block is exactly one ancestor tile
    let side = 1usize << META_ORDER;
    let (block_extents, block_side) = if tile.lod >= META_ORDER {
        let parent = NodeInfo::new(Arc::clone(&request.frame), tile.parent(META_ORDER));
        (parent.extents(), side)
    } else {
        (request.frame.extents, 1usize << tile.lod)
    };

    // one shared height grid over the whole block, a few samples per tile
    const SAMPLES_PER_TILE: usize = 4;
    let grid_side = block_side * SAMPLES_PER_TILE + 1;
    let heights = sample_heights(
        request,
        source,
        &request.frame.division_srs,
        block_extents,
        grid_side,
    )
    .await?;
    request.sink.check_aborted()?;

    let mut meta = Metatile::new(origin, META_ORDER);
    for j in 0..block_side {
        for i in 0..block_side {
            request.sink.check_aborted()?;
            let child = TileId::new(tile.lod, origin.x + i as u32, origin.y + j as u32);
            let child_flags = index.get(child);
            if !flags::is_real(child_flags) && !index.subtree_present(child) {
                continue;
            }

            // carve this tile's sub-grid out of the shared samples
            let mut tile_heights =
                Vec::with_capacity((SAMPLES_PER_TILE + 1) * (SAMPLES_PER_TILE + 1));
            for sj in 0..=SAMPLES_PER_TILE {
                for si in 0..=SAMPLES_PER_TILE {
                    let gx = i * SAMPLES_PER_TILE + si;
                    let gy = j * SAMPLES_PER_TILE + sj;
                    tile_heights.push(heights[gy * grid_side + gx]);
                }
            }
            let range = HeightRange::of(&tile_heights);
            let valid: Vec<f64> = tile_heights
                .iter()
                .filter(|h| !h.is_nan())
                .map(|&h| f64::from(h))
                .collect();
            let surrogate = if valid.is_empty() {
                0.0
            } else {
                valid.iter().sum::<f64>() / valid.len() as f64
            };

            let node = NodeInfo::new(Arc::clone(&request.frame), child);
            let texel_size = node.extents().width() / 256.0;

            let mut children = 0u8;
            for (bit, (dx, dy)) in [(0u32, 0u32), (1, 0), (0, 1), (1, 1)].iter().enumerate() {
                let grandchild = TileId::new(child.lod + 1, child.x * 2 + dx, child.y * 2 + dy);
                if index.subtree_present(grandchild) {
                    children |= 1 << bit;
                }
            }

            let mut node_flags = 0u8;
            if flags::is_real(child_flags) {
                node_flags |= META_FLAG_GEOMETRY;
            }
            if flags::has_navtile(child_flags) {
                node_flags |= META_FLAG_NAVTILE;
            }

            meta.set(
                i,
                j,
                MetatileNode {
                    flags: node_flags,
                    height_min: range.min as f32,
                    height_max: range.max as f32,
                    texel_size: texel_size as f32,
                    surrogate_height: surrogate as f32,
                    children,
                },
            );
        }
    }

    Ok(TileResponse::new(
        meta.encode(),
        "application/octet-stream",
        FileClass::Data,
    ))
}

/// 2D metatile raster: one grayscale pixel per tile in the block,
/// `0x80` for mesh plus `0x40` for watertight.
pub(super) fn generate_2d_metatile(request: &TileRequest<'_>) -> GenerateResult<TileResponse> {
    request.sink.check_aborted()?;
    let tile = request.info.tile;
    let order = request.frame.meta_binary_order;
    let origin = Metatile::block_origin(tile, order);
    if origin != tile {
        return Err(GenerateError::NotFound(
            "metatile id is not block-aligned".to_string(),
        ));
    }
    let index = index_of(request)?;

    let reduce = |tile_flags: u8| -> u8 {
        if !flags::is_real(tile_flags) {
            return 0;
        }
        let mut value = 0x80;
        if flags::is_watertight(tile_flags) {
            value |= 0x40;
        }
        value
    };

    let side = 1usize << order;
    let bitmap = if tile.lod >= order {
        index.rasterize(tile.parent(order), order, &reduce)
    } else {
        // shallow lods cover the whole grid; pad into the full raster
        let small_order = tile.lod;
        let small = index.rasterize(TileId::new(0, 0, 0), small_order, &reduce);
        let small_side = 1usize << small_order;
        let mut padded = vec![0u8; side * side];
        for y in 0..small_side {
            padded[y * side..y * side + small_side]
                .copy_from_slice(&small[y * small_side..(y + 1) * small_side]);
        }
        padded
    };

    let buffer = TileBuffer::new(Size2::new(side, side), 1, PixelType::U8, bitmap);
    let body = encode_tile(&buffer, RasterFormat::Png)?;
    Ok(TileResponse::new(body, "image/png", FileClass::Data))
}

/// 2D coverage mask: full white for watertight tiles, else the warped
/// validity of the backing dataset.
pub(super) async fn generate_2d_mask(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
) -> GenerateResult<TileResponse> {
    let debug = matches!(request.info.flavor, crate::fileinfo::Flavor::Debug);
    let (node, tile_flags) = match surface_gate(request) {
        Ok(gated) => gated,
        Err(GenerateError::NotFound(_)) if debug => {
            return Err(GenerateError::EmptyDebugMask);
        }
        Err(e) => return Err(e),
    };

    let size = Size2::new(256, 256);
    let mask = if flags::is_watertight(tile_flags) {
        TileBuffer::new(size, 1, PixelType::U8, vec![255; size.area()])
    } else {
        match source {
            HeightSource::Zero => TileBuffer::new(size, 1, PixelType::U8, vec![255; size.area()]),
            HeightSource::Dataset(dataset) => {
                warp_raster(
                    request,
                    WarpRequest::Mask(crate::warper::MaskRequest {
                        dataset: dataset.to_string(),
                        srs: node.srs().to_string(),
                        extents: node.extents(),
                        size,
                        resampling: Resampling::Nearest,
                    }),
                )
                .await?
            }
        }
    };

    let body = encode_tile(&mask, RasterFormat::Png)?;
    Ok(TileResponse::new(body, "image/png", FileClass::Data))
}

/// Cesium-style terrain tile, with the zero-tile fallback above the
/// data range.
pub(super) async fn generate_terrain(
    request: &TileRequest<'_>,
    source: HeightSource<'_>,
    samples: usize,
) -> GenerateResult<TileResponse> {
    request.sink.check_aborted()?;
    let tms = request
        .frame
        .tms
        .as_ref()
        .ok_or_else(|| {
            GenerateError::NotFound(format!(
                "terrain interface disabled, no tms extension in reference frame <{}>",
                request.frame.id
            ))
        })?;

    let tile = tms_to_frame(request.info.tile, tms.root_lod, tms.flip_y);
    let node = NodeInfo::new(Arc::clone(&request.frame), tile);
    if !node.productive() {
        return Err(GenerateError::NotFound(
            "tile outside the valid reference frame tree".to_string(),
        ));
    }

    let index = index_of(request)?;
    if !index.is_real(tile) {
        // zero tile: level 0 always, deeper levels only over the data
        let resource = request.resource;
        let covered = tile.lod == 0
            || (!resource.lod_range.is_empty()
                && resource
                    .tile_range
                    .shifted(resource.lod_range.min, tile.lod)
                    .contains(tile.x, tile.y));
        if !covered {
            return Err(GenerateError::NotFound(
                "no terrain for this tile".to_string(),
            ));
        }

        let zeros = vec![0.0f32; samples * samples];
        let mesh = mesh_from_grid(node.extents(), &zeros, samples, Some(0.0));
        let body = encode_terrain(&mesh, node.extents())
            .map_err(|e| GenerateError::io("gzipping terrain tile", e))?;
        return Ok(TileResponse::new(
            body,
            "application/octet-stream",
            FileClass::Data,
        )
        .with_header("Content-Encoding", "gzip"));
    }

    let heights = sample_heights(request, source, node.srs(), node.extents(), samples).await?;
    request.sink.check_aborted()?;

    // terrain wants a watertight surface; voids collapse to zero
    let mesh = mesh_from_grid(node.extents(), &heights, samples, Some(0.0));
    let body = encode_terrain(&mesh, node.extents())
        .map_err(|e| GenerateError::io("gzipping terrain tile", e))?;
    Ok(
        TileResponse::new(body, "application/octet-stream", FileClass::Data)
            .with_header("Content-Encoding", "gzip"),
    )
}

/// Remaps a TMS tile address into the frame's tree.
pub(super) fn tms_to_frame(tile: TileId, root_lod: Lod, flip_y: bool) -> TileId {
    let y = if flip_y {
        let grid = 1u32 << tile.lod;
        grid - 1 - tile.y
    } else {
        tile.y
    };
    TileId::new(tile.lod + root_lod, tile.x, y)
}

/// `layer.json` for the terrain interface.
pub(super) fn layer_json(
    generator: &Generator,
    resource: &Resource,
) -> GenerateResult<TileResponse> {
    let frame = generator.frame();
    let tms = frame.tms.as_ref().ok_or_else(|| {
        GenerateError::NotFound("terrain interface disabled for this frame".to_string())
    })?;

    let max_zoom = resource.lod_range.max.saturating_sub(tms.root_lod);
    let mut available: Vec<Vec<serde_json::Value>> = Vec::new();
    for lod in 0..=max_zoom {
        let frame_lod = lod + tms.root_lod;
        if resource.lod_range.is_empty()
            || frame_lod < resource.lod_range.min && lod != 0
        {
            available.push(vec![]);
            continue;
        }
        let range = if frame_lod < resource.lod_range.min {
            // level 0 advertises the whole root
            crate::coord::TileRange::new((0, 0), (0, 0))
        } else {
            resource.tile_range.shifted(resource.lod_range.min, frame_lod)
        };
        let grid = 1u32 << lod;
        let (start_y, end_y) = if tms.flip_y {
            (grid - 1 - range.ur.1, grid - 1 - range.ll.1)
        } else {
            (range.ll.1, range.ur.1)
        };
        available.push(vec![serde_json::json!({
            "startX": range.ll.0,
            "startY": start_y,
            "endX": range.ur.0,
            "endY": end_y,
        })]);
    }

    let attribution = resource
        .credits
        .iter()
        .map(|c| c.id.clone())
        .collect::<Vec<_>>()
        .join("<br/>");

    let body = serde_json::json!({
        "tilejson": "2.1.0",
        "name": resource.id.full_id(),
        "description": resource.comment,
        "version": format!("{}.0.0", resource.revision + 1),
        "format": "quantized-mesh-1.0",
        "scheme": "tms",
        "tiles": [format!("{{z}}-{{x}}-{{y}}.terrain?r={}", resource.revision)],
        "projection": tms.projection,
        "minzoom": 0,
        "maxzoom": max_zoom,
        "available": available,
        "attribution": attribution,
    });

    Ok(TileResponse::new(
        serde_json::to_vec_pretty(&body).map_err(|e| GenerateError::Internal(e.to_string()))?,
        "application/json; charset=utf-8",
        FileClass::Config,
    ))
}

/// Credits artifact: the resource's inline credits as JSON.
pub(super) fn credits_tile(request: &TileRequest<'_>) -> GenerateResult<TileResponse> {
    request.sink.check_aborted()?;
    let credits: Vec<serde_json::Value> = request
        .resource
        .credits
        .iter()
        .map(|c| serde_json::json!({"id": c.id, "numericId": c.numeric_id}))
        .collect();
    let body = serde_json::json!({ "credits": credits });
    Ok(TileResponse::new(
        serde_json::to_vec_pretty(&body).map_err(|e| GenerateError::Internal(e.to_string()))?,
        "application/json; charset=utf-8",
        FileClass::Data,
    ))
}

fn gzip(data: &[u8]) -> GenerateResult<Vec<u8>> {
    use std::io::Write;
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| GenerateError::io("gzipping mesh", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tms_remap_flip() {
        // lod 2 grid has 4 rows; row 0 maps to row 3
        assert_eq!(
            tms_to_frame(TileId::new(2, 1, 0), 0, true),
            TileId::new(2, 1, 3)
        );
        assert_eq!(
            tms_to_frame(TileId::new(2, 1, 0), 0, false),
            TileId::new(2, 1, 0)
        );
        // root lod shifts the depth
        assert_eq!(
            tms_to_frame(TileId::new(1, 0, 0), 2, false),
            TileId::new(3, 0, 0)
        );
    }

    #[test]
    fn test_gzip_round_trip() {
        use std::io::Read;
        let body = gzip(b"terrain payload").unwrap();
        assert_eq!(&body[0..2], &[0x1f, 0x8b]);
        let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"terrain payload");
    }
}
