//! VRT overview pyramid builder.
//!
//! Used during preparation of DEM-backed surface resources: produces a
//! pyramid of tiled VRT datasets where each level halves the previous
//! one until both dimensions drop below the configured minimum. An
//! optional `wrapx` halo physically duplicates strips from the opposite
//! side of the dataset so filter kernels never convolve over nodata at
//! the antimeridian.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::coord::{Extents2, Size2};
use crate::raster::Resampling;

mod builder;
pub mod xml;

pub use builder::{generate, BuildError};

/// How the original dataset is referenced from the prepared directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathToOriginalDataset {
    RelativeSymlink,
    AbsoluteSymlink,
    Copy,
}

/// Builder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Overview generation stops when both dimensions drop below this.
    pub min_ovr_size: Size2,
    /// Tile grid cell size for every level.
    pub tile_size: Size2,
    /// Pixel overlap for x-wrapping; `Some(0)` wraps with no overlap.
    pub wrapx: Option<usize>,
    /// Background colour, one value per band; empty tiles matching it
    /// are eliminated.
    pub background: Option<Vec<f64>>,
    pub resampling: Resampling,
    /// Nodata override for the virtual dataset.
    pub nodata: Option<f64>,
    pub path_mode: PathToOriginalDataset,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_ovr_size: Size2::new(256, 256),
            tile_size: Size2::new(1024, 1024),
            wrapx: None,
            background: None,
            resampling: Resampling::Lanczos,
            nodata: None,
            path_mode: PathToOriginalDataset::RelativeSymlink,
        }
    }
}

/// Per-side halo at the bottom level, the worst-case Lanczos kernel
/// footprint.
pub const BOTTOM_HALO: usize = 3;

/// Derived pyramid geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Setup {
    /// Base dataset size, including the halo when wrapping.
    pub size: Size2,
    /// Base extents, widened by the halo when wrapping.
    pub extents: Extents2,
    /// Overview level sizes, top of the list is the first halving.
    pub ovr_sizes: Vec<Size2>,
    /// Tile-grid dimensions per overview level.
    pub ovr_tiled: Vec<Size2>,
    /// Per-side halo of the base dataset in pixels; 0 without wrapping.
    pub x_plus: usize,
    pub output_dataset: PathBuf,
}

/// Computes the pyramid geometry for a source dataset.
///
/// Halving rounds to nearest; the pyramid stops at the first level where
/// either dimension reaches the minimum. With wrapping, every level is
/// widened by `6·2^depthFromBottom` pixels in x (3 per side at the
/// bottom, doubling on the way up) and the base extents grow by the
/// resulting halo expressed in source pixel widths.
pub fn make_setup(source_size: Size2, source_extents: Extents2, config: &Config) -> Setup {
    let mut setup = Setup {
        size: source_size,
        extents: source_extents,
        ovr_sizes: Vec::new(),
        ovr_tiled: Vec::new(),
        x_plus: 0,
        output_dataset: PathBuf::new(),
    };

    let halve = |size: &mut Size2| {
        size.width = (size.width as f64 / 2.0).round() as usize;
        size.height = (size.height as f64 / 2.0).round() as usize;
    };

    let mut size = source_size;
    halve(&mut size);
    while size.width >= config.min_ovr_size.width || size.height >= config.min_ovr_size.height {
        setup.ovr_sizes.push(size);
        if size.width == config.min_ovr_size.width || size.height == config.min_ovr_size.height {
            break;
        }
        halve(&mut size);
    }

    if config.wrapx.is_some() {
        // 3 px per side at the bottom level, doubled at every level up
        let mut add = 2 * BOTTOM_HALO;
        for level in setup.ovr_sizes.iter_mut().rev() {
            level.width += add;
            add *= 2;
        }
        setup.x_plus = add / 2;

        let pixel_width = source_extents.width() / source_size.width as f64;
        let widening = setup.x_plus as f64 * pixel_width;
        setup.extents.ll.0 -= widening;
        setup.extents.ur.0 += widening;
        setup.size.width += add;
    }

    let ts = config.tile_size;
    for size in &setup.ovr_sizes {
        setup.ovr_tiled.push(Size2::new(
            (size.width + ts.width - 1) / ts.width,
            (size.height + ts.height - 1) / ts.height,
        ));
    }

    setup
}

/// PREDICTOR creation option matched to the band type: 3 for floating
/// point, 2 for integer.
pub fn predictor_for(data_type: gdal::raster::GdalDataType) -> &'static str {
    use gdal::raster::GdalDataType;
    match data_type {
        GdalDataType::Float32 | GdalDataType::Float64 => "3",
        _ => "2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(width: f64, height: f64) -> Extents2 {
        Extents2::new(0.0, 0.0, width, height)
    }

    #[test]
    fn test_halving_until_minimum() {
        let config = Config {
            min_ovr_size: Size2::new(256, 256),
            ..Config::default()
        };
        let setup = make_setup(Size2::new(4096, 2048), extents(4096.0, 2048.0), &config);

        assert_eq!(
            setup.ovr_sizes,
            vec![
                Size2::new(2048, 1024),
                Size2::new(1024, 512),
                Size2::new(512, 256),
            ]
        );
    }

    #[test]
    fn test_halving_rounds_to_nearest() {
        let config = Config {
            min_ovr_size: Size2::new(100, 100),
            ..Config::default()
        };
        let setup = make_setup(Size2::new(1001, 667), extents(1001.0, 667.0), &config);
        assert_eq!(setup.ovr_sizes[0], Size2::new(501, 334));
        assert_eq!(setup.ovr_sizes[1], Size2::new(251, 167));
    }

    #[test]
    fn test_tiling_is_ceil() {
        let config = Config {
            min_ovr_size: Size2::new(256, 256),
            tile_size: Size2::new(1024, 1024),
            ..Config::default()
        };
        let setup = make_setup(Size2::new(4096, 2048), extents(4096.0, 2048.0), &config);
        assert_eq!(setup.ovr_tiled[0], Size2::new(2, 1));
        assert_eq!(setup.ovr_tiled[1], Size2::new(1, 1));
    }

    #[test]
    fn test_wrapx_halo_doubles_upward() {
        let config = Config {
            min_ovr_size: Size2::new(256, 256),
            wrapx: Some(0),
            ..Config::default()
        };
        let setup = make_setup(Size2::new(4096, 2048), extents(4096.0, 2048.0), &config);

        // bottom level gains 6 px (3 per side), each level above doubles
        assert_eq!(setup.ovr_sizes[0].width, 2048 + 6);
        assert_eq!(setup.ovr_sizes[1].width, 1024 + 12);
        assert_eq!(setup.ovr_sizes[2].width, 512 + 24);
        // base gains one more doubling: 48 total, 24 per side
        assert_eq!(setup.x_plus, 24);
        assert_eq!(setup.size.width, 4096 + 48);

        // extents widen by x_plus source pixels on each side (pixel = 1.0)
        assert_eq!(setup.extents.ll.0, -24.0);
        assert_eq!(setup.extents.ur.0, 4096.0 + 24.0);
    }

    #[test]
    fn test_no_wrap_keeps_extents() {
        let config = Config::default();
        let setup = make_setup(Size2::new(4096, 2048), extents(4096.0, 2048.0), &config);
        assert_eq!(setup.x_plus, 0);
        assert_eq!(setup.extents, extents(4096.0, 2048.0));
        assert_eq!(setup.size, Size2::new(4096, 2048));
    }

    #[test]
    fn test_predictor_pick() {
        use gdal::raster::GdalDataType;
        assert_eq!(predictor_for(GdalDataType::Float32), "3");
        assert_eq!(predictor_for(GdalDataType::Int16), "2");
        assert_eq!(predictor_for(GdalDataType::UInt8), "2");
    }
}
