//! Prepared tileset properties (`tileset.conf`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coord::{LodRange, TileRange};
use crate::error::{GenerateError, GenerateResult};

/// Properties of a prepared tileset, persisted as `tileset.conf`.
///
/// Written atomically next to the delivery index; survives restarts and
/// carries the revision used in tile URLs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TilesetProperties {
    pub id: String,
    #[serde(rename = "referenceFrame")]
    pub reference_frame: String,
    #[serde(rename = "lodRange")]
    pub lod_range: LodRange,
    #[serde(rename = "tileRange")]
    pub tile_range: TileRange,
    pub revision: u32,
    #[serde(default)]
    pub credits: Vec<String>,
    #[serde(rename = "nominalTexelSize")]
    pub nominal_texel_size: f64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "mergeBottomLod"
    )]
    pub merge_bottom_lod: Option<u8>,
}

impl TilesetProperties {
    pub fn load(path: &Path) -> GenerateResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GenerateError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| GenerateError::Format {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Atomic save: sibling `.tmp`, fsync, rename.
    pub fn save(&self, path: &Path) -> GenerateResult<()> {
        use std::io::Write;

        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)
                .map_err(|e| GenerateError::io(format!("creating {}", tmp.display()), e))?;
            let body = serde_json::to_vec_pretty(self)
                .map_err(|e| GenerateError::Internal(e.to_string()))?;
            file.write_all(&body)
                .map_err(|e| GenerateError::io(format!("writing {}", tmp.display()), e))?;
            file.sync_all()
                .map_err(|e| GenerateError::io(format!("syncing {}", tmp.display()), e))?;
        }
        std::fs::rename(&tmp, path)
            .map_err(|e| GenerateError::io(format!("publishing {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn properties() -> TilesetProperties {
        TilesetProperties {
            id: "test-dem".to_string(),
            reference_frame: "webmercator".to_string(),
            lod_range: LodRange::new(6, 14),
            tile_range: TileRange::new((10, 20), (30, 40)),
            revision: 2,
            credits: vec!["acme".to_string()],
            nominal_texel_size: 25.0,
            merge_bottom_lod: Some(12),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tileset.conf");

        let original = properties();
        original.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = TilesetProperties::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_missing_is_io_error() {
        let err = TilesetProperties::load(Path::new("/nonexistent/tileset.conf")).unwrap_err();
        assert!(matches!(err, GenerateError::Io { .. }));
    }
}
