//! Shared raster primitives: pixel buffers, formats and tile encoding.
//!
//! Everything that crosses the warper wire or leaves a producer as image
//! bytes goes through the types here. Encoding parameters are fixed:
//! JPEG quality 75, PNG compression "best", WebP lossless (BGR channel
//! order for normal maps).

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::coord::Size2;
use crate::error::{GenerateError, GenerateResult};

/// Raster resampling algorithm, following GDAL naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resampling {
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
}

impl Resampling {
    /// GDAL warp algorithm name.
    pub fn gdal_name(&self) -> &'static str {
        match self {
            Self::Nearest => "near",
            Self::Bilinear => "bilinear",
            Self::Cubic => "cubic",
            Self::CubicSpline => "cubicspline",
            Self::Lanczos => "lanczos",
            Self::Average => "average",
        }
    }
}

/// DEM derivation algorithm executed by the warper farm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemAlgorithm {
    Hillshade,
    ColorRelief,
    Slope,
    Aspect,
    Tri,
    Tpi,
    Roughness,
}

impl DemAlgorithm {
    /// Processing name understood by `GDALDEMProcessing`.
    pub fn gdal_name(&self) -> &'static str {
        match self {
            Self::Hillshade => "hillshade",
            Self::ColorRelief => "color-relief",
            Self::Slope => "slope",
            Self::Aspect => "aspect",
            Self::Tri => "TRI",
            Self::Tpi => "TPI",
            Self::Roughness => "roughness",
        }
    }
}

/// Output raster format of a TMS tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    Jpg,
    Png,
    Webp,
}

impl RasterFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpg" | "jpeg" => Some(Self::Jpg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

/// Element type of a [`TileBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    F32,
}

impl PixelType {
    pub fn byte_size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 => 4,
        }
    }
}

/// An interleaved pixel buffer as produced by the warper farm.
///
/// Channels are interleaved row-major; `F32` buffers are little-endian on
/// the wire. A single-channel `U8` buffer doubles as a mask (0 = void).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileBuffer {
    pub size: Size2,
    pub channels: u8,
    pub pixel_type: PixelType,
    pub data: Vec<u8>,
}

impl TileBuffer {
    pub fn new(size: Size2, channels: u8, pixel_type: PixelType, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            size.area() * channels as usize * pixel_type.byte_size()
        );
        Self {
            size,
            channels,
            pixel_type,
            data,
        }
    }

    /// An all-zero buffer (black image / empty mask).
    pub fn zeroed(size: Size2, channels: u8, pixel_type: PixelType) -> Self {
        let len = size.area() * channels as usize * pixel_type.byte_size();
        Self {
            size,
            channels,
            pixel_type,
            data: vec![0; len],
        }
    }

    /// Reinterprets an `F32` buffer as a typed slice.
    pub fn as_f32(&self) -> GenerateResult<Vec<f32>> {
        if self.pixel_type != PixelType::F32 {
            return Err(GenerateError::Internal(
                "expected float pixel buffer".to_string(),
            ));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Whether a single-channel mask buffer has any valid pixel.
    pub fn any_valid(&self) -> bool {
        self.data.iter().any(|&b| b != 0)
    }

    /// Whether every pixel of a mask buffer is valid.
    pub fn all_valid(&self) -> bool {
        self.data.iter().all(|&b| b != 0)
    }
}

/// JPEG quality used for all lossy tile output.
pub const JPEG_QUALITY: u8 = 75;

/// Encodes an 8-bit interleaved buffer into the requested tile format.
///
/// 1 channel encodes as grayscale, 3 as RGB. WebP output is always
/// lossless; callers that need BGR order (normal maps) swap channels
/// before encoding.
pub fn encode_tile(buffer: &TileBuffer, format: RasterFormat) -> GenerateResult<Vec<u8>> {
    if buffer.pixel_type != PixelType::U8 {
        return Err(GenerateError::Internal(
            "cannot encode float buffer as image".to_string(),
        ));
    }
    let (width, height) = (buffer.size.width as u32, buffer.size.height as u32);
    let color = match buffer.channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        n => {
            return Err(GenerateError::Internal(format!(
                "unsupported channel count {n}"
            )))
        }
    };

    let mut out = Vec::new();
    match format {
        RasterFormat::Jpg => {
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .write_image(&buffer.data, width, height, color)
                .map_err(|e| GenerateError::Internal(format!("jpeg encode: {e}")))?;
        }
        RasterFormat::Png => {
            PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilterType::Adaptive)
                .write_image(&buffer.data, width, height, color)
                .map_err(|e| GenerateError::Internal(format!("png encode: {e}")))?;
        }
        RasterFormat::Webp => {
            WebPEncoder::new_lossless(&mut out)
                .write_image(&buffer.data, width, height, color)
                .map_err(|e| GenerateError::Internal(format!("webp encode: {e}")))?;
        }
    }
    Ok(out)
}

/// Content type sniffed from the first bytes of an encoded tile.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(&[0x1f, 0x8b]) {
        Some("application/octet-stream")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(size: Size2, channels: u8) -> TileBuffer {
        let mut data = Vec::with_capacity(size.area() * channels as usize);
        for y in 0..size.height {
            for x in 0..size.width {
                for c in 0..channels {
                    data.push(((x + y) % 256) as u8 ^ (c * 31));
                }
            }
        }
        TileBuffer::new(size, channels, PixelType::U8, data)
    }

    #[test]
    fn test_encode_matches_magic_bytes() {
        let buf = gradient(Size2::new(16, 16), 3);

        let jpg = encode_tile(&buf, RasterFormat::Jpg).unwrap();
        assert_eq!(sniff_content_type(&jpg), Some("image/jpeg"));

        let png = encode_tile(&buf, RasterFormat::Png).unwrap();
        assert_eq!(sniff_content_type(&png), Some("image/png"));

        let webp = encode_tile(&buf, RasterFormat::Webp).unwrap();
        assert_eq!(sniff_content_type(&webp), Some("image/webp"));
    }

    #[test]
    fn test_content_type_matches_format() {
        for (format, expected) in [
            (RasterFormat::Jpg, "image/jpeg"),
            (RasterFormat::Png, "image/png"),
            (RasterFormat::Webp, "image/webp"),
        ] {
            let encoded = encode_tile(&gradient(Size2::new(8, 8), 3), format).unwrap();
            assert_eq!(sniff_content_type(&encoded), Some(format.content_type()));
            assert_eq!(format.content_type(), expected);
        }
    }

    #[test]
    fn test_grayscale_encoding() {
        let buf = gradient(Size2::new(8, 8), 1);
        let png = encode_tile(&buf, RasterFormat::Png).unwrap();
        assert_eq!(sniff_content_type(&png), Some("image/png"));
    }

    #[test]
    fn test_float_buffer_rejected() {
        let buf = TileBuffer::zeroed(Size2::new(4, 4), 1, PixelType::F32);
        assert!(encode_tile(&buf, RasterFormat::Png).is_err());
    }

    #[test]
    fn test_f32_round_trip() {
        let values = [0.0f32, -12.5, 8848.0, f32::MIN];
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let buf = TileBuffer::new(Size2::new(2, 2), 1, PixelType::F32, data);
        assert_eq!(buf.as_f32().unwrap(), values);
    }

    #[test]
    fn test_mask_validity() {
        let mut mask = TileBuffer::zeroed(Size2::new(4, 4), 1, PixelType::U8);
        assert!(!mask.any_valid());
        mask.data[5] = 255;
        assert!(mask.any_valid());
        assert!(!mask.all_valid());
    }

    #[test]
    fn test_format_extension_parse() {
        assert_eq!(RasterFormat::from_extension("jpg"), Some(RasterFormat::Jpg));
        assert_eq!(RasterFormat::from_extension("webp"), Some(RasterFormat::Webp));
        assert_eq!(RasterFormat::from_extension("tif"), None);
    }
}
