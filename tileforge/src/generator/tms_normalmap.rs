//! `tms-normalmap`: per-pixel terrain normals from a DEM.
//!
//! Normals are computed with the Zevenbergen–Thorne kernel in the tile's
//! spatial division SRS, then rotated into the reference frame's
//! physical SRS. For lod > 3 a tile covers a small angular extent and a
//! single linear transform taken at the tile centre is accurate enough;
//! coarser tiles rotate per pixel.

use gdal::spatial_ref::{CoordTransform, SpatialRef};

use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileArtifact;
use crate::frame::NodeInfo;
use crate::raster::{encode_tile, PixelType, RasterFormat, Resampling, TileBuffer};
use crate::resource::{FileClass, TmsNormalMapDef};
use crate::sink::TileResponse;
use crate::warper::{DemWindowRequest, ImageRequest, MaskRequest, WarpRequest};

use super::tms::{gate, mask_response, warp_raster, TILE_SIZE};
use super::TileRequest;

/// Lods above this use the per-tile linear transform.
const LINEARIZE_ABOVE_LOD: u8 = 3;

pub(super) async fn generate(
    request: &TileRequest<'_>,
    def: &TmsNormalMapDef,
) -> GenerateResult<TileResponse> {
    let node = gate(request)?;

    match request.info.artifact {
        TileArtifact::Image(RasterFormat::Webp) | TileArtifact::Normals => {
            generate_normals(request, def, &node).await
        }
        TileArtifact::Mask => {
            let mask = warp_raster(
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
            mask_response(mask)
        }
        _ => Err(GenerateError::NotFound(
            "normal maps are served as lossless webp".to_string(),
        )),
    }
}

async fn generate_normals(
    request: &TileRequest<'_>,
    def: &TmsNormalMapDef,
    node: &NodeInfo,
) -> GenerateResult<TileResponse> {
    let heights = warp_raster(
        request,
        WarpRequest::DemWindow(DemWindowRequest {
            dataset: def.dataset.clone(),
            srs: node.srs().to_string(),
            extents: node.extents(),
            size: TILE_SIZE,
            resampling: Resampling::Cubic,
        }),
    )
    .await?
    .as_f32()?;
    request.sink.check_aborted()?;

    // landcover classes marked flat force an up normal
    let flat = match &def.landcover {
        Some(landcover) => {
            let classes = warp_raster(
                request,
                WarpRequest::Image(ImageRequest {
                    dataset: landcover.dataset.clone(),
                    mask: None,
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: Resampling::Nearest,
                    no_expand: true,
                }),
            )
            .await?;
            request.sink.check_aborted()?;

            let flat_values: Vec<u8> = landcover
                .classes
                .iter()
                .filter(|c| c.flat)
                .map(|c| c.value)
                .collect();
            let stride = classes.channels as usize;
            Some(
                classes
                    .data
                    .chunks(stride)
                    .map(|pixel| flat_values.contains(&pixel[0]))
                    .collect::<Vec<bool>>(),
            )
        }
        None => None,
    };

    let mut normals = zevenbergen_thorne(
        &heights,
        TILE_SIZE.width,
        node.extents().width() / TILE_SIZE.width as f64,
        node.extents().height() / TILE_SIZE.height as f64,
        def.z_factor,
        def.invert_relief,
    );
    if let Some(flat) = &flat {
        for (normal, is_flat) in normals.iter_mut().zip(flat) {
            if *is_flat {
                *normal = [0.0, 0.0, 1.0];
            }
        }
    }

    convert_to_physical(&mut normals, node, request.info.tile.lod > LINEARIZE_ABOVE_LOD)?;
    request.sink.check_aborted()?;

    // lossless webp, blue channel first
    let mut data = Vec::with_capacity(normals.len() * 3);
    for normal in &normals {
        data.push(quantize(normal[2]));
        data.push(quantize(normal[1]));
        data.push(quantize(normal[0]));
    }
    let buffer = TileBuffer::new(TILE_SIZE, 3, PixelType::U8, data);
    let body = encode_tile(&buffer, RasterFormat::Webp)?;
    Ok(TileResponse::new(body, "image/webp", FileClass::Data))
}

fn quantize(component: f64) -> u8 {
    ((component.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8
}

/// Zevenbergen–Thorne surface normals over a height grid.
///
/// Void heights (NaN) yield an up normal.
fn zevenbergen_thorne(
    heights: &[f32],
    side: usize,
    pixel_width: f64,
    pixel_height: f64,
    z_factor: f64,
    invert_relief: bool,
) -> Vec<[f64; 3]> {
    let sign = if invert_relief { -1.0 } else { 1.0 };
    let at = |x: usize, y: usize| -> f64 {
        let v = heights[y * side + x];
        if v.is_nan() {
            0.0
        } else {
            f64::from(v)
        }
    };

    let mut out = Vec::with_capacity(side * side);
    for y in 0..side {
        for x in 0..side {
            if heights[y * side + x].is_nan() {
                out.push([0.0, 0.0, 1.0]);
                continue;
            }
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(side - 1);
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(side - 1);

            let zx = (at(x1, y) - at(x0, y)) / ((x1 - x0).max(1) as f64 * pixel_width);
            // grid rows run north to south, so the y derivative flips
            let zy = (at(x, y0) - at(x, y1)) / ((y1 - y0).max(1) as f64 * pixel_height);

            let mut normal = [
                -sign * zx * z_factor,
                -sign * zy * z_factor,
                1.0,
            ];
            normalize(&mut normal);
            out.push(normal);
        }
    }
    out
}

/// Rotates normals from the division SRS into the physical SRS.
fn convert_to_physical(
    normals: &mut [[f64; 3]],
    node: &NodeInfo,
    linearize: bool,
) -> GenerateResult<()> {
    let division = SpatialRef::from_definition(node.srs())
        .map_err(|e| GenerateError::Internal(format!("division srs: {e}")))?;
    let physical = SpatialRef::from_definition(&node.frame().physical_srs)
        .map_err(|e| GenerateError::Internal(format!("physical srs: {e}")))?;
    let transform = CoordTransform::new(&division, &physical)
        .map_err(|e| GenerateError::Internal(format!("srs transform: {e}")))?;

    let extents = node.extents();
    let side = (normals.len() as f64).sqrt() as usize;

    if linearize {
        let (cx, cy) = extents.center();
        let basis = local_basis(&transform, cx, cy, extents.width() / side as f64)?;
        for normal in normals.iter_mut() {
            *normal = apply_basis(&basis, *normal);
            normalize(normal);
        }
        return Ok(());
    }

    for (index, normal) in normals.iter_mut().enumerate() {
        let x = extents.ll.0 + (index % side) as f64 / side as f64 * extents.width();
        let y = extents.ur.1 - (index / side) as f64 / side as f64 * extents.height();
        let basis = local_basis(&transform, x, y, extents.width() / side as f64)?;
        *normal = apply_basis(&basis, *normal);
        normalize(normal);
    }
    Ok(())
}

/// Local direction basis of the SRS transform at `(x, y)`.
///
/// Columns are the images of the east, north and up unit vectors,
/// estimated by finite differences at step `epsilon`.
fn local_basis(
    transform: &CoordTransform,
    x: f64,
    y: f64,
    epsilon: f64,
) -> GenerateResult<[[f64; 3]; 3]> {
    let eps = epsilon.max(1e-6);
    let mut xs = [x, x + eps, x, x];
    let mut ys = [y, y, y + eps, y];
    let mut zs = [0.0, 0.0, 0.0, eps];
    transform
        .transform_coords(&mut xs, &mut ys, &mut zs)
        .map_err(|e| GenerateError::Internal(format!("coordinate transform: {e}")))?;

    let column = |i: usize| -> [f64; 3] {
        let mut v = [xs[i] - xs[0], ys[i] - ys[0], zs[i] - zs[0]];
        normalize(&mut v);
        v
    };
    Ok([column(1), column(2), column(3)])
}

fn apply_basis(basis: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        basis[0][0] * v[0] + basis[1][0] * v[1] + basis[2][0] * v[2],
        basis[0][1] * v[0] + basis[1][1] * v[1] + basis[2][1] * v[2],
        basis[0][2] * v[0] + basis[1][2] * v[1] + basis[2][2] * v[2],
    ]
}

fn normalize(v: &mut [f64; 3]) {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len > 1e-12 {
        v[0] /= len;
        v[1] /= len;
        v[2] /= len;
    } else {
        *v = [0.0, 0.0, 1.0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_grid_yields_up_normals() {
        let heights = vec![10.0f32; 16];
        let normals = zevenbergen_thorne(&heights, 4, 1.0, 1.0, 1.0, false);
        for normal in normals {
            assert!((normal[2] - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_east_slope_tilts_west() {
        // heights rise to the east -> normals lean west (negative x)
        let side = 4;
        let mut heights = vec![0.0f32; side * side];
        for y in 0..side {
            for x in 0..side {
                heights[y * side + x] = x as f32;
            }
        }
        let normals = zevenbergen_thorne(&heights, side, 1.0, 1.0, 1.0, false);
        let center = normals[side + 1];
        assert!(center[0] < -0.1);
        assert!(center[2] > 0.0);
    }

    #[test]
    fn test_invert_relief_flips_slope() {
        let side = 4;
        let mut heights = vec![0.0f32; side * side];
        for y in 0..side {
            for x in 0..side {
                heights[y * side + x] = x as f32;
            }
        }
        let plain = zevenbergen_thorne(&heights, side, 1.0, 1.0, 1.0, false);
        let inverted = zevenbergen_thorne(&heights, side, 1.0, 1.0, 1.0, true);
        assert!((plain[5][0] + inverted[5][0]).abs() < 1e-9);
    }

    #[test]
    fn test_z_factor_steepens() {
        let side = 4;
        let mut heights = vec![0.0f32; side * side];
        for y in 0..side {
            for x in 0..side {
                heights[y * side + x] = x as f32;
            }
        }
        let shallow = zevenbergen_thorne(&heights, side, 1.0, 1.0, 1.0, false);
        let steep = zevenbergen_thorne(&heights, side, 1.0, 1.0, 4.0, false);
        assert!(steep[5][0] < shallow[5][0]);
    }

    #[test]
    fn test_void_pixel_is_up() {
        let mut heights = vec![3.0f32; 16];
        heights[5] = f32::NAN;
        let normals = zevenbergen_thorne(&heights, 4, 1.0, 1.0, 1.0, false);
        assert_eq!(normals[5], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_quantize_range() {
        assert_eq!(quantize(-1.0), 0);
        assert_eq!(quantize(0.0), 128);
        assert_eq!(quantize(1.0), 255);
    }

    #[test]
    fn test_apply_identity_basis() {
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(apply_basis(&identity, [0.5, -0.25, 1.0]), [0.5, -0.25, 1.0]);
    }
}
