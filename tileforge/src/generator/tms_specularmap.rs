//! `tms-specularmap`: specular reflectance tiles.
//!
//! The orthophoto supplies the base intensity; landcover classes carry a
//! per-class shininess that is quantised to `shininessBits` and packed
//! into the output tile. Water and other glossy classes light up,
//! everything else stays matte.

use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileArtifact;
use crate::raster::{encode_tile, PixelType, RasterFormat, Resampling, TileBuffer};
use crate::resource::{FileClass, TmsSpecularMapDef};
use crate::sink::TileResponse;
use crate::warper::{ImageRequest, MaskRequest, WarpRequest};

use super::tms::{gate, mask_response, warp_raster, TILE_SIZE};
use super::TileRequest;

pub(super) async fn generate(
    request: &TileRequest<'_>,
    def: &TmsSpecularMapDef,
) -> GenerateResult<TileResponse> {
    let node = gate(request)?;

    match request.info.artifact {
        TileArtifact::Image(format) => {
            let ortho = warp_raster(
                request,
                WarpRequest::Image(ImageRequest {
                    dataset: def.dataset.clone(),
                    mask: None,
                    srs: node.srs().to_string(),
                    extents: node.extents(),
                    size: TILE_SIZE,
                    resampling: Resampling::Cubic,
                    no_expand: false,
                }),
            )
            .await?;
            request.sink.check_aborted()?;

            let landcover = warp_raster(
                request,
                WarpRequest::Image(ImageRequest {
                    dataset: def.landcover.dataset.clone(),
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

            let buffer = specular_tile(&ortho, &landcover, def)?;
            let body = encode_tile(&buffer, format)?;
            Ok(TileResponse::new(body, format.content_type(), FileClass::Data))
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
            "artifact not served by tms-specularmap".to_string(),
        )),
    }
}

/// Combines orthophoto luminance with per-class shininess.
///
/// The output is a single-channel tile: the high `shininessBits` carry
/// the quantised class shininess, the remaining low bits the luminance.
fn specular_tile(
    ortho: &TileBuffer,
    landcover: &TileBuffer,
    def: &TmsSpecularMapDef,
) -> GenerateResult<TileBuffer> {
    if def.shininess_bits == 0 || def.shininess_bits > 8 {
        return Err(GenerateError::Internal(format!(
            "shininessBits must be in 1..=8, got {}",
            def.shininess_bits
        )));
    }
    let ortho_stride = ortho.channels as usize;
    let class_stride = landcover.channels as usize;
    let shininess_levels = 1u16 << def.shininess_bits;
    let luminance_bits = 8 - def.shininess_bits;

    let mut data = Vec::with_capacity(ortho.size.area());
    for pixel in 0..ortho.size.area() {
        let offset = pixel * ortho_stride;
        let luminance = if ortho_stride >= 3 {
            // ITU-R BT.601 luma
            (0.299 * f64::from(ortho.data[offset])
                + 0.587 * f64::from(ortho.data[offset + 1])
                + 0.114 * f64::from(ortho.data[offset + 2])) as u16
        } else {
            u16::from(ortho.data[offset])
        };

        let class_value = landcover.data[pixel * class_stride];
        let shininess = def
            .landcover
            .classes
            .iter()
            .find(|c| c.value == class_value)
            .and_then(|c| c.shininess)
            .unwrap_or(0);
        let quantised =
            (u16::from(shininess) * (shininess_levels - 1) / 255).min(shininess_levels - 1);

        let packed = (quantised << luminance_bits) | (luminance >> def.shininess_bits);
        data.push(packed as u8);
    }

    Ok(TileBuffer::new(ortho.size, 1, PixelType::U8, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Size2;
    use crate::resource::{LandcoverClass, LandcoverDef};

    fn definition(bits: u8) -> TmsSpecularMapDef {
        TmsSpecularMapDef {
            dataset: "/data/ortho.tif".to_string(),
            landcover: LandcoverDef {
                dataset: "/data/landcover.tif".to_string(),
                classes: vec![
                    LandcoverClass {
                        value: 1,
                        flat: false,
                        shininess: Some(255),
                    },
                    LandcoverClass {
                        value: 2,
                        flat: false,
                        shininess: Some(0),
                    },
                ],
            },
            shininess_bits: bits,
        }
    }

    fn buffers() -> (TileBuffer, TileBuffer) {
        // 2x1: first pixel water (class 1), second pixel rock (class 2)
        let ortho = TileBuffer::new(
            Size2::new(2, 1),
            3,
            PixelType::U8,
            vec![200, 200, 200, 100, 100, 100],
        );
        let landcover = TileBuffer::new(Size2::new(2, 1), 1, PixelType::U8, vec![1, 2]);
        (ortho, landcover)
    }

    #[test]
    fn test_shiny_class_sets_high_bits() {
        let (ortho, landcover) = buffers();
        let out = specular_tile(&ortho, &landcover, &definition(2)).unwrap();
        assert_eq!(out.channels, 1);

        // class 1 has max shininess: top 2 bits set
        assert_eq!(out.data[0] >> 6, 0b11);
        // class 2 is matte: top 2 bits clear
        assert_eq!(out.data[1] >> 6, 0b00);
        // luminance survives in the low bits
        assert!(out.data[1] & 0b0011_1111 > 0);
    }

    #[test]
    fn test_unknown_class_is_matte() {
        let (ortho, mut landcover) = buffers();
        landcover.data = vec![9, 9];
        let out = specular_tile(&ortho, &landcover, &definition(4)).unwrap();
        assert_eq!(out.data[0] >> 4, 0);
    }

    #[test]
    fn test_bad_bits_rejected() {
        let (ortho, landcover) = buffers();
        assert!(specular_tile(&ortho, &landcover, &definition(0)).is_err());
        assert!(specular_tile(&ortho, &landcover, &definition(9)).is_err());
    }
}
