//! Reference frames, credits and the shared registry.
//!
//! A reference frame names the tile grid a resource is served in: the
//! spatial division SRS, the root extents, the physical SRS meshes are
//! expressed in, and the metatile binary order. The registry resolves
//! frame and credit lookups; resources may carry inline overrides that
//! shadow the system registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::coord::{Extents2, Lod, LodRange, TileId};

mod nodeinfo;

pub use nodeinfo::NodeInfo;

/// Attribution record resolvable by string or numeric id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub id: String,
    #[serde(rename = "numericId")]
    pub numeric_id: u16,
    #[serde(default)]
    pub notice: String,
}

/// The `(stringId, numericId)` pair stored on a resource.
///
/// Ordered by string id so credit sets compare deterministically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DualId {
    pub id: String,
    pub numeric_id: u16,
}

impl DualId {
    pub fn new(id: impl Into<String>, numeric_id: u16) -> Self {
        Self {
            id: id.into(),
            numeric_id,
        }
    }
}

/// Terrain-interface extension of a reference frame.
///
/// Present only on frames that can serve Cesium-style terrain tiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmsExtension {
    #[serde(rename = "rootLod", default)]
    pub root_lod: Lod,
    #[serde(rename = "flipY", default)]
    pub flip_y: bool,
    pub projection: String,
    #[serde(rename = "physicalSrs", default, skip_serializing_if = "Option::is_none")]
    pub physical_srs: Option<String>,
}

/// A named tiled-globe description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFrame {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Tiles per metatile along one axis = `2^metaBinaryOrder`.
    #[serde(rename = "metaBinaryOrder")]
    pub meta_binary_order: u8,
    /// SRS of the tile grid (spatial division).
    #[serde(rename = "divisionSrs")]
    pub division_srs: String,
    /// SRS meshes and normals are expressed in.
    #[serde(rename = "physicalSrs")]
    pub physical_srs: String,
    /// Extents of the single lod-0 root tile in the division SRS.
    pub extents: Extents2,
    /// Lods at which the frame produces tiles.
    #[serde(rename = "validLods")]
    pub valid_lods: LodRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tms: Option<TmsExtension>,
}

impl ReferenceFrame {
    /// Number of tiles along one axis at `lod`.
    pub fn grid_size(&self, lod: Lod) -> u64 {
        1u64 << lod
    }

    /// Whether the tile address exists in this frame's tree at all.
    pub fn contains(&self, tile: TileId) -> bool {
        self.valid_lods.contains(tile.lod)
            && u64::from(tile.x) < self.grid_size(tile.lod)
            && u64::from(tile.y) < self.grid_size(tile.lod)
    }
}

/// Registry of reference frames and credits.
///
/// One system-wide instance is built at startup; resources can carry a
/// smaller inline instance whose entries take precedence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default, rename = "referenceFrames")]
    pub frames: BTreeMap<String, ReferenceFrame>,
    #[serde(default)]
    pub credits: BTreeMap<String, Credit>,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.credits.is_empty()
    }

    pub fn frame(&self, id: &str) -> Option<&ReferenceFrame> {
        self.frames.get(id)
    }

    pub fn credit(&self, id: &str) -> Option<&Credit> {
        self.credits.get(id)
    }

    pub fn credit_by_number(&self, numeric_id: u16) -> Option<&Credit> {
        self.credits.values().find(|c| c.numeric_id == numeric_id)
    }

    /// The built-in system registry.
    pub fn system() -> Arc<Registry> {
        let mut registry = Registry::default();

        const WEBMERCATOR_BOUND: f64 = 20037508.342789244;
        registry.frames.insert(
            "webmercator".to_string(),
            ReferenceFrame {
                id: "webmercator".to_string(),
                description: "Pseudo-mercator tiled globe (EPSG:3857)".to_string(),
                meta_binary_order: 8,
                division_srs: "EPSG:3857".to_string(),
                physical_srs: "EPSG:4978".to_string(),
                extents: Extents2::new(
                    -WEBMERCATOR_BOUND,
                    -WEBMERCATOR_BOUND,
                    WEBMERCATOR_BOUND,
                    WEBMERCATOR_BOUND,
                ),
                valid_lods: LodRange::new(0, 24),
                tms: Some(TmsExtension {
                    root_lod: 0,
                    flip_y: true,
                    projection: "EPSG:3857".to_string(),
                    physical_srs: None,
                }),
            },
        );

        registry.frames.insert(
            "wgs84".to_string(),
            ReferenceFrame {
                id: "wgs84".to_string(),
                description: "Geographic tiled globe (EPSG:4326)".to_string(),
                meta_binary_order: 8,
                division_srs: "EPSG:4326".to_string(),
                physical_srs: "EPSG:4978".to_string(),
                extents: Extents2::new(-180.0, -90.0, 180.0, 90.0),
                valid_lods: LodRange::new(0, 22),
                tms: None,
            },
        );

        Arc::new(registry)
    }
}

/// A resource's view of the registry: inline overrides first, then the
/// shared system registry.
#[derive(Clone, Debug)]
pub struct RegistryView {
    pub inline: Arc<Registry>,
    pub system: Arc<Registry>,
}

impl RegistryView {
    pub fn new(inline: Registry, system: Arc<Registry>) -> Self {
        Self {
            inline: Arc::new(inline),
            system,
        }
    }

    pub fn frame(&self, id: &str) -> Option<ReferenceFrame> {
        self.inline
            .frame(id)
            .or_else(|| self.system.frame(id))
            .cloned()
    }

    pub fn credit(&self, id: &str) -> Option<Credit> {
        self.inline
            .credit(id)
            .or_else(|| self.system.credit(id))
            .cloned()
    }

    pub fn credit_by_number(&self, numeric_id: u16) -> Option<Credit> {
        self.inline
            .credit_by_number(numeric_id)
            .or_else(|| self.system.credit_by_number(numeric_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_registry_has_frames() {
        let system = Registry::system();
        assert!(system.frame("webmercator").is_some());
        assert!(system.frame("wgs84").is_some());
        assert!(system.frame("mars").is_none());
    }

    #[test]
    fn test_frame_contains() {
        let system = Registry::system();
        let frame = system.frame("webmercator").unwrap();

        assert!(frame.contains(TileId::new(0, 0, 0)));
        assert!(frame.contains(TileId::new(3, 7, 7)));
        assert!(!frame.contains(TileId::new(3, 8, 0)));
    }

    #[test]
    fn test_inline_overrides_win() {
        let mut inline = Registry::default();
        inline.credits.insert(
            "acme".to_string(),
            Credit {
                id: "acme".to_string(),
                numeric_id: 77,
                notice: "override".to_string(),
            },
        );

        let view = RegistryView::new(inline, Registry::system());
        assert_eq!(view.credit("acme").unwrap().numeric_id, 77);
        assert_eq!(view.credit_by_number(77).unwrap().id, "acme");
        assert!(view.credit("nonexistent").is_none());
    }

    #[test]
    fn test_dual_id_ordering_is_by_string() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(DualId::new("zulu", 1));
        set.insert(DualId::new("alpha", 9));
        let ids: Vec<_> = set.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zulu"]);
    }

    #[test]
    fn test_registry_round_trip() {
        let system = Registry::system();
        let json = serde_json::to_string(&*system).unwrap();
        let back: Registry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, *system);
    }
}
