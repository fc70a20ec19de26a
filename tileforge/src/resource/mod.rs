//! Resource records and their change semantics.
//!
//! A resource is one immutable per-revision record tying a generator
//! `(kind, driver)` pair to a reference frame, tile ranges, credits and a
//! driver-specific definition. The catalogue loader produces them; the
//! reconciler diffs them with [`Resource::changed`].

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::coord::{LodRange, TileRange};
use crate::frame::{DualId, Registry};

mod definition;
mod loader;

pub use definition::{
    Definition, GeodataDef, LandcoverClass, LandcoverDef, SurfaceDemDef, SurfaceSpheroidDef,
    TmsGdaldemDef, TmsNormalMapDef, TmsRasterDef, TmsSpecularMapDef,
};
pub use loader::{load_catalogue, save_resource, LoadError};

/// Globally unique resource identifier.
///
/// Total order is the lexicographic compare of the three components.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub reference_frame: String,
    pub group: String,
    pub id: String,
}

impl ResourceId {
    pub fn new(
        reference_frame: impl Into<String>,
        group: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            reference_frame: reference_frame.into(),
            group: group.into(),
            id: id.into(),
        }
    }

    /// The externally visible name: `group-id`.
    pub fn full_id(&self) -> String {
        format!("{}-{}", self.group, self.id)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.reference_frame, self.group, self.id)
    }
}

/// Top-level generator kind; `driver` refines it to a concrete producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Tms,
    Surface,
    Geodata,
}

impl std::fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tms => write!(f, "tms"),
            Self::Surface => write!(f, "surface"),
            Self::Geodata => write!(f, "geodata"),
        }
    }
}

impl std::str::FromStr for GeneratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tms" => Ok(Self::Tms),
            "surface" => Ok(Self::Surface),
            "geodata" => Ok(Self::Geodata),
            other => Err(format!("unknown generator type <{other}>")),
        }
    }
}

/// The `(kind, driver)` pair that selects a producer factory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneratorId {
    pub kind: GeneratorKind,
    pub driver: String,
}

impl GeneratorId {
    pub fn new(kind: GeneratorKind, driver: impl Into<String>) -> Self {
        Self {
            kind,
            driver: driver.into(),
        }
    }
}

impl std::fmt::Display for GeneratorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.driver)
    }
}

/// Result of diffing two revisions of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Changed {
    /// Nothing changed.
    No,
    /// Only items that do not affect generated bytes changed.
    Safe,
    /// Cached output is invalidated but the resource stays compatible.
    RevisionBump,
    /// Incompatible change; the resource must be rebuilt from scratch.
    Yes,
}

/// Cache classes a served file can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileClass {
    Config,
    Support,
    Registry,
    Data,
    Unknown,
}

impl std::str::FromStr for FileClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "support" => Ok(Self::Support),
            "registry" => Ok(Self::Registry),
            "data" => Ok(Self::Data),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown file class <{other}>")),
        }
    }
}

/// Per-file-class `max-age` values in seconds. Negative means no-cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClassSettings {
    pub config: i64,
    pub support: i64,
    pub registry: i64,
    pub data: i64,
    pub unknown: i64,
}

impl Default for FileClassSettings {
    fn default() -> Self {
        Self {
            config: 60,
            support: 3600,
            registry: 3600,
            data: 604800,
            unknown: -1,
        }
    }
}

impl FileClassSettings {
    pub fn max_age(&self, class: FileClass) -> i64 {
        match class {
            FileClass::Config => self.config,
            FileClass::Support => self.support,
            FileClass::Registry => self.registry,
            FileClass::Data => self.data,
            FileClass::Unknown => self.unknown,
        }
    }

    pub fn set_max_age(&mut self, class: FileClass, max_age: i64) {
        match class {
            FileClass::Config => self.config = max_age,
            FileClass::Support => self.support = max_age,
            FileClass::Registry => self.registry = max_age,
            FileClass::Data => self.data = max_age,
            FileClass::Unknown => self.unknown = max_age,
        }
    }

    /// `Cache-Control` header value for the class.
    pub fn cache_control(&self, class: FileClass) -> String {
        let age = self.max_age(class);
        if age < 0 {
            "no-cache".to_string()
        } else {
            format!("max-age={age}")
        }
    }
}

/// One immutable per-revision resource record.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub generator: GeneratorId,
    pub comment: String,
    /// Monotonically non-decreasing across reloads.
    pub revision: u32,
    pub credits: BTreeSet<DualId>,
    /// Inline overrides for the shared registry.
    pub registry: Registry,
    pub lod_range: LodRange,
    pub tile_range: TileRange,
    pub file_classes: FileClassSettings,
    pub definition: Definition,
}

impl Resource {
    /// Classifies the difference of `self` (the incoming revision)
    /// against `old` (the currently served one).
    ///
    /// Mandatory identity first, ranges only when the driver needs them,
    /// credits only when the definition freezes them, then the
    /// definition's own diff; a forced revision change alone is safe.
    pub fn changed(&self, old: &Resource) -> Changed {
        if self.id != old.id {
            return Changed::Yes;
        }
        if self.generator != old.generator {
            return Changed::Yes;
        }

        if self.definition.needs_ranges() {
            if self.lod_range != old.lod_range {
                return Changed::Yes;
            }
            if self.tile_range != old.tile_range {
                return Changed::Yes;
            }
        }

        let changed_credits = self.credits != old.credits;
        if self.definition.frozen_credits() && changed_credits {
            return Changed::Yes;
        }

        let def = self.definition.changed(&old.definition);
        if def != Changed::No {
            return def;
        }

        if self.revision != old.revision {
            return Changed::Safe;
        }

        if changed_credits {
            return Changed::Safe;
        }

        if self.registry != old.registry {
            return Changed::Safe;
        }

        if self.comment != old.comment {
            return Changed::Safe;
        }

        Changed::No
    }

    /// Dependencies on other resources, with this resource's reference
    /// frame injected.
    pub fn needs_resources(&self) -> Vec<ResourceId> {
        self.definition
            .needs_resources()
            .into_iter()
            .map(|(group, id)| ResourceId::new(self.id.reference_frame.clone(), group, id))
            .collect()
    }
}

/// How much of the resource path a composed URL/path must climb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceRoot {
    None,
    Id,
    Group,
    Interface,
    ReferenceFrame,
}

impl ResourceRoot {
    fn depth(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Id => 1,
            Self::Group => 2,
            Self::Interface => 3,
            Self::ReferenceFrame => 4,
        }
    }
}

/// Prepends the resource-tree components selected by `root` to `path`.
///
/// Mirrors the on-disk/URL layout
/// `<referenceFrame>/<iface>/<group>/<id>/...`.
pub fn prepend_root(
    path: &str,
    resource: &ResourceId,
    interface: &str,
    root: ResourceRoot,
) -> String {
    let mut out = PathBuf::new();
    if root >= ResourceRoot::ReferenceFrame {
        out.push(&resource.reference_frame);
    }
    if root >= ResourceRoot::Interface {
        out.push(interface);
    }
    if root >= ResourceRoot::Group {
        out.push(&resource.group);
    }
    if root >= ResourceRoot::Id {
        out.push(&resource.id);
    }
    out.push(path);
    out.to_string_lossy().into_owned()
}

/// Resolves how deep a cross-resource reference must reach.
pub fn resolve_root(
    this: &ResourceId,
    this_interface: &str,
    that: &ResourceId,
    that_interface: &str,
) -> ResourceRoot {
    if this.reference_frame != that.reference_frame {
        ResourceRoot::ReferenceFrame
    } else if this_interface != that_interface {
        ResourceRoot::Interface
    } else if this.group != that.group {
        ResourceRoot::Group
    } else if this.id != that.id {
        ResourceRoot::Id
    } else {
        ResourceRoot::None
    }
}

/// Relative climb (`../` per level) from a resource to the resolved root.
pub fn backup_prefix(root: ResourceRoot) -> String {
    "../".repeat(root.depth() as usize)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::raster::RasterFormat;

    pub(crate) fn test_resource(id: &str) -> Resource {
        Resource {
            id: ResourceId::new("webmercator", "test", id),
            generator: GeneratorId::new(GeneratorKind::Tms, "tms-raster"),
            comment: String::new(),
            revision: 0,
            credits: BTreeSet::new(),
            registry: Registry::default(),
            lod_range: LodRange::new(4, 18),
            tile_range: TileRange::new((0, 0), (15, 15)),
            file_classes: FileClassSettings::default(),
            definition: Definition::TmsRaster(TmsRasterDef {
                dataset: "/data/ortho.tif".to_string(),
                mask: None,
                format: RasterFormat::Jpg,
                resampling: None,
                transparent: false,
            }),
        }
    }

    #[test]
    fn test_full_id() {
        assert_eq!(
            ResourceId::new("webmercator", "g", "a").full_id(),
            "g-a"
        );
    }

    #[test]
    fn test_changed_no_for_identical() {
        let a = test_resource("a");
        let b = a.clone();
        assert_eq!(b.changed(&a), Changed::No);
    }

    #[test]
    fn test_changed_yes_for_generator_swap() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.generator = GeneratorId::new(GeneratorKind::Tms, "tms-gdaldem");
        assert_eq!(b.changed(&a), Changed::Yes);
    }

    #[test]
    fn test_changed_yes_for_range_change() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.lod_range = LodRange::new(4, 19);
        assert_eq!(b.changed(&a), Changed::Yes);
    }

    #[test]
    fn test_changed_safe_for_comment() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.comment = "new comment".to_string();
        assert_eq!(b.changed(&a), Changed::Safe);
    }

    #[test]
    fn test_changed_safe_for_unfrozen_credits() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.credits.insert(DualId::new("acme", 42));
        // tms-raster does not freeze credits
        assert_eq!(b.changed(&a), Changed::Safe);
    }

    #[test]
    fn test_changed_safe_for_forced_revision() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.revision = 3;
        assert_eq!(b.changed(&a), Changed::Safe);
    }

    #[test]
    fn test_changed_yes_for_dataset_swap() {
        let a = test_resource("a");
        let mut b = a.clone();
        b.definition = Definition::TmsRaster(TmsRasterDef {
            dataset: "/data/other.tif".to_string(),
            mask: None,
            format: RasterFormat::Jpg,
            resampling: None,
            transparent: false,
        });
        assert_eq!(b.changed(&a), Changed::Yes);
    }

    #[test]
    fn test_file_class_cache_control() {
        let fcs = FileClassSettings::default();
        assert_eq!(fcs.cache_control(FileClass::Data), "max-age=604800");
        assert_eq!(fcs.cache_control(FileClass::Unknown), "no-cache");
    }

    #[test]
    fn test_prepend_root_depths() {
        let id = ResourceId::new("rf", "g", "a");
        assert_eq!(prepend_root("x.bin", &id, "tms", ResourceRoot::None), "x.bin");
        assert_eq!(
            prepend_root("x.bin", &id, "tms", ResourceRoot::ReferenceFrame),
            "rf/tms/g/a/x.bin"
        );
        assert_eq!(
            prepend_root("x.bin", &id, "tms", ResourceRoot::Group),
            "g/a/x.bin"
        );
    }

    #[test]
    fn test_resolve_root() {
        let a = ResourceId::new("rf", "g", "a");
        let b = ResourceId::new("rf", "g", "b");
        let c = ResourceId::new("rf2", "g", "a");

        assert_eq!(resolve_root(&a, "tms", &b, "tms"), ResourceRoot::Id);
        assert_eq!(
            resolve_root(&a, "tms", &c, "tms"),
            ResourceRoot::ReferenceFrame
        );
        assert_eq!(resolve_root(&a, "tms", &a, "tms"), ResourceRoot::None);
        assert_eq!(
            resolve_root(&a, "surface", &a, "terrain"),
            ResourceRoot::Interface
        );
        assert_eq!(backup_prefix(ResourceRoot::Group), "../../");
    }
}
