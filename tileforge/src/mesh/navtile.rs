//! Navigation tiles: coarse height rasters for client-side queries.

/// Height range carried by a navtile: `[floor(min), ceil(max)]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeightRange {
    pub min: f64,
    pub max: f64,
}

impl HeightRange {
    /// Range over a sample grid; voids (NaN) are ignored, an all-void
    /// grid yields `[0, 0]`.
    pub fn of(heights: &[f32]) -> Self {
        let mut range: Option<(f64, f64)> = None;
        for &height in heights {
            if height.is_nan() {
                continue;
            }
            let h = f64::from(height);
            range = Some(match range {
                None => (h, h),
                Some((min, max)) => (min.min(h), max.max(h)),
            });
        }
        let (min, max) = range.unwrap_or((0.0, 0.0));
        Self {
            min: min.floor(),
            max: max.ceil(),
        }
    }
}

/// A coarse height grid sampled from the DEM.
#[derive(Clone, Debug, PartialEq)]
pub struct Navtile {
    /// Samples per side.
    pub samples: usize,
    /// Row-major heights, voids already replaced by the range minimum.
    pub heights: Vec<f32>,
    pub range: HeightRange,
}

impl Navtile {
    pub fn from_heights(mut heights: Vec<f32>, samples: usize) -> Self {
        assert_eq!(heights.len(), samples * samples);
        let range = HeightRange::of(&heights);
        for height in &mut heights {
            if height.is_nan() {
                *height = range.min as f32;
            }
        }
        Self {
            samples,
            heights,
            range,
        }
    }

    /// Mean of the sampled heights; the metatile's surrogate height.
    pub fn mean_height(&self) -> f64 {
        if self.heights.is_empty() {
            return 0.0;
        }
        self.heights.iter().map(|&h| f64::from(h)).sum::<f64>() / self.heights.len() as f64
    }
}

const NAVTILE_MAGIC: &[u8; 4] = b"TFN1";

/// Serialises a navtile: heights quantised to u16 within the range.
pub fn encode_navtile(navtile: &Navtile) -> Vec<u8> {
    let spread = (navtile.range.max - navtile.range.min).max(1e-9);
    let mut out = Vec::with_capacity(16 + navtile.heights.len() * 2);
    out.extend_from_slice(NAVTILE_MAGIC);
    out.extend_from_slice(&(navtile.samples as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&(navtile.range.min as f32).to_le_bytes());
    out.extend_from_slice(&(navtile.range.max as f32).to_le_bytes());
    for &height in &navtile.heights {
        let q = (((f64::from(height) - navtile.range.min) / spread).clamp(0.0, 1.0)
            * f64::from(u16::MAX))
        .round() as u16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_range_floor_ceil() {
        let range = HeightRange::of(&[1.2, 8.7, -3.4]);
        assert_eq!(range.min, -4.0);
        assert_eq!(range.max, 9.0);
    }

    #[test]
    fn test_height_range_ignores_voids() {
        let range = HeightRange::of(&[f32::NAN, 5.0, f32::NAN]);
        assert_eq!(range.min, 5.0);
        assert_eq!(range.max, 5.0);
    }

    #[test]
    fn test_all_void_grid() {
        let range = HeightRange::of(&[f32::NAN; 4]);
        assert_eq!(range.min, 0.0);
        assert_eq!(range.max, 0.0);
    }

    #[test]
    fn test_navtile_replaces_voids() {
        let navtile = Navtile::from_heights(vec![10.0, f32::NAN, 20.0, 30.0], 2);
        assert_eq!(navtile.range.min, 10.0);
        assert_eq!(navtile.heights[1], 10.0);
    }

    #[test]
    fn test_mean_height() {
        let navtile = Navtile::from_heights(vec![0.0, 10.0, 20.0, 30.0], 2);
        assert_eq!(navtile.mean_height(), 15.0);
    }

    #[test]
    fn test_encode_framing() {
        let navtile = Navtile::from_heights(vec![0.0; 4], 2);
        let bytes = encode_navtile(&navtile);
        assert_eq!(&bytes[0..4], NAVTILE_MAGIC);
        assert_eq!(bytes.len(), 16 + 8);
    }
}
