//! Generators: the per-resource tile producers and their lifecycle.
//!
//! A generator ties a [`Resource`] to its producer, its prepared on-disk
//! state and a state machine
//! `configured → preparing → ready | failed`. Factories are registered
//! explicitly at startup ([`known_drivers`]) instead of before `main`,
//! and producer dispatch is a plain enum, one variant per driver.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileFileInfo;
use crate::frame::{ReferenceFrame, Registry};
use crate::resource::{
    prepend_root, Definition, GeneratorId, GeneratorKind, Resource, ResourceId, ResourceRoot,
};
use crate::sink::{Sink, TileResponse};
use crate::tileindex::MmappedTileIndex;
use crate::warper::Warper;

mod geodata;
mod properties;
mod registry;
mod surface;
mod surface_dem;
mod surface_spheroid;
mod tms;
mod tms_normalmap;
mod tms_specularmap;

pub use properties::TilesetProperties;
pub use registry::{Generators, GeneratorsConfig, UpdateObserver};

/// Lifecycle state of a resource's generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    NotReady,
    Preparing,
    Ready,
    Failed(String),
    /// Kept serving an old definition after a rejected change.
    Frozen,
}

/// Shared services handed to every generator at construction.
pub struct GeneratorContext {
    pub warper: Warper,
    pub system_registry: Arc<Registry>,
    /// Root of the prepared-state store.
    pub store_root: PathBuf,
    pub external_url: String,
}

/// Prepared on-disk state of a ready resource.
pub struct Prepared {
    /// Delivery index; TMS drivers have none.
    pub index: Option<MmappedTileIndex>,
    pub properties: TilesetProperties,
    /// Prepared dataset the producer warps from (`dataset.vrt`).
    pub dataset: Option<PathBuf>,
}

/// Every driver the server knows, keyed by `(kind, driver)`.
///
/// Called once at startup; the loader and the reconciler both validate
/// against this list, so a typo in a catalogue fails the resource
/// instead of panicking a worker later.
pub fn known_drivers() -> &'static [(GeneratorKind, &'static str)] {
    &[
        (GeneratorKind::Tms, "tms-raster"),
        (GeneratorKind::Tms, "tms-raster-patchwork"),
        (GeneratorKind::Tms, "tms-gdaldem"),
        (GeneratorKind::Tms, "tms-normalmap"),
        (GeneratorKind::Tms, "tms-specularmap"),
        (GeneratorKind::Surface, "surface-dem"),
        (GeneratorKind::Surface, "surface-spheroid"),
        (GeneratorKind::Geodata, "geodata-vector"),
    ]
}

/// The generator interface a resource is served under.
pub fn interface_of(kind: GeneratorKind) -> &'static str {
    match kind {
        GeneratorKind::Tms => "tms",
        GeneratorKind::Surface => "surface",
        GeneratorKind::Geodata => "geodata",
    }
}

/// One resource bound to its producer and lifecycle state.
pub struct Generator {
    resource: RwLock<Arc<Resource>>,
    frame: Arc<ReferenceFrame>,
    state: RwLock<GeneratorState>,
    prepared: RwLock<Option<Arc<Prepared>>>,
    /// Serialises concurrent `prepare()` calls.
    prepare_gate: tokio::sync::Mutex<()>,
    context: Arc<GeneratorContext>,
    /// Bumped when generator logic changes; part of tile URLs.
    generator_revision: u32,
    /// μs-since-epoch stamp of the last reconcile that touched this
    /// generator.
    updated: std::sync::atomic::AtomicU64,
}

impl Generator {
    /// Instantiates the generator for a resource.
    ///
    /// Fails when `(kind, driver)` is not registered or the reference
    /// frame cannot be resolved.
    pub fn new(resource: Resource, context: Arc<GeneratorContext>) -> GenerateResult<Self> {
        if !driver_registered(&resource.generator) {
            return Err(GenerateError::NotFound(format!(
                "no factory for <{}>",
                resource.generator
            )));
        }

        let view = crate::frame::RegistryView::new(
            resource.registry.clone(),
            Arc::clone(&context.system_registry),
        );
        let frame = view
            .frame(&resource.id.reference_frame)
            .ok_or_else(|| {
                GenerateError::NotFound(format!(
                    "unknown reference frame <{}>",
                    resource.id.reference_frame
                ))
            })?;

        Ok(Self {
            resource: RwLock::new(Arc::new(resource)),
            frame: Arc::new(frame),
            state: RwLock::new(GeneratorState::NotReady),
            prepared: RwLock::new(None),
            prepare_gate: tokio::sync::Mutex::new(()),
            context,
            generator_revision: 0,
            updated: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Stamp of the last reconcile that touched this generator.
    pub fn updated_us(&self) -> u64 {
        self.updated.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn touch(&self, stamp: u64) {
        self.updated
            .store(stamp, std::sync::atomic::Ordering::Release);
    }

    pub fn resource(&self) -> Arc<Resource> {
        Arc::clone(&self.resource.read())
    }

    pub fn id(&self) -> ResourceId {
        self.resource.read().id.clone()
    }

    pub fn frame(&self) -> Arc<ReferenceFrame> {
        Arc::clone(&self.frame)
    }

    pub fn state(&self) -> GeneratorState {
        self.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), GeneratorState::Ready)
    }

    pub fn generator_revision(&self) -> u32 {
        self.generator_revision
    }

    /// Root of this resource's prepared state on disk.
    pub fn root(&self) -> PathBuf {
        let resource = self.resource.read();
        self.context.store_root.join(prepend_root(
            "",
            &resource.id,
            interface_of(resource.generator.kind),
            ResourceRoot::ReferenceFrame,
        ))
    }

    /// Externally visible URL of this resource.
    pub fn url(&self) -> String {
        let resource = self.resource.read();
        format!(
            "{}/{}",
            self.context.external_url.trim_end_matches('/'),
            prepend_root(
                "",
                &resource.id,
                interface_of(resource.generator.kind),
                ResourceRoot::ReferenceFrame,
            )
            .trim_end_matches('/')
        )
    }

    /// Swaps the resource record without invalidation (safe changes).
    pub fn swap_resource(&self, resource: Resource) {
        *self.resource.write() = Arc::new(resource);
    }

    /// Marks a rejected change; the generator keeps serving.
    pub fn freeze(&self) {
        let mut state = self.state.write();
        if *state == GeneratorState::Ready {
            *state = GeneratorState::Frozen;
        }
    }

    /// Whether the generator serves requests (ready or frozen).
    pub fn serving(&self) -> bool {
        matches!(
            *self.state.read(),
            GeneratorState::Ready | GeneratorState::Frozen
        )
    }

    /// Drives preparation to `ready` or `failed`. Idempotent; concurrent
    /// calls collapse onto the same pass.
    pub async fn prepare(self: &Arc<Self>) {
        if self.serving() {
            return;
        }
        let _gate = self.prepare_gate.lock().await;
        if self.serving() {
            return;
        }

        *self.state.write() = GeneratorState::Preparing;
        let resource = self.resource();
        debug!(resource = %resource.id, "Preparing resource");

        let result = match &resource.definition {
            Definition::SurfaceDem(def) => {
                surface_dem::prepare(self, &resource, def.clone()).await
            }
            Definition::SurfaceSpheroid(def) => {
                surface_spheroid::prepare(self, &resource, def.clone()).await
            }
            Definition::Geodata(def) => geodata::prepare(self, &resource, def).await,
            // TMS drivers serve straight from the source dataset
            _ => tms::prepare(self, &resource).await,
        };

        match result {
            Ok(prepared) => {
                *self.prepared.write() = Some(Arc::new(prepared));
                self.make_ready();
                info!(resource = %resource.id, "Resource ready");
            }
            Err(e) => {
                warn!(resource = %resource.id, error = %e, "Resource preparation failed");
                *self.state.write() = GeneratorState::Failed(e.to_string());
            }
        }
    }

    fn make_ready(&self) {
        *self.state.write() = GeneratorState::Ready;
    }

    /// Installs prepared state directly, bypassing the preparer.
    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&self, prepared: Prepared) {
        *self.prepared.write() = Some(Arc::new(prepared));
        self.make_ready();
    }

    pub fn prepared(&self) -> Option<Arc<Prepared>> {
        self.prepared.read().clone()
    }

    /// Produces one tile artifact. Valid only when serving.
    pub async fn generate_tile(
        &self,
        info: TileFileInfo,
        sink: &Sink,
    ) -> GenerateResult<TileResponse> {
        if !self.serving() {
            return Err(GenerateError::Unavailable);
        }
        let resource = self.resource();
        let prepared = self.prepared();

        let request = TileRequest {
            resource: &resource,
            frame: self.frame(),
            prepared,
            warper: &self.context.warper,
            info,
            sink,
        };

        match &resource.definition {
            Definition::TmsRaster(def) => tms::generate_raster(&request, def).await,
            Definition::TmsGdaldem(def) => tms::generate_gdaldem(&request, def).await,
            Definition::TmsNormalMap(def) => tms_normalmap::generate(&request, def).await,
            Definition::TmsSpecularMap(def) => tms_specularmap::generate(&request, def).await,
            Definition::SurfaceDem(def) => surface_dem::generate(&request, def).await,
            Definition::SurfaceSpheroid(def) => surface_spheroid::generate(&request, def).await,
            Definition::Geodata(_) => Err(GenerateError::NotFound(
                "geodata resources serve no tiles".to_string(),
            )),
        }
    }

    /// Produces a resource-level file (`boundlayer.json`, `layer.json`,
    /// `tileset.conf`, `geodata.json`).
    pub async fn generate_file(&self, name: &str, sink: &Sink) -> GenerateResult<TileResponse> {
        if !self.serving() {
            return Err(GenerateError::Unavailable);
        }
        let resource = self.resource();
        match (name, &resource.definition) {
            ("mapconfig.json", _) => self.map_config(&resource),
            ("boundlayer.json", _) if resource.generator.kind == GeneratorKind::Tms => {
                tms::bound_layer(self, &resource)
            }
            ("layer.json", Definition::SurfaceDem(_) | Definition::SurfaceSpheroid(_)) => {
                surface::layer_json(self, &resource)
            }
            ("tileset.conf", _) => {
                let prepared = self
                    .prepared()
                    .ok_or(GenerateError::Unavailable)?;
                let body = serde_json::to_vec_pretty(&prepared.properties)
                    .map_err(|e| GenerateError::Internal(e.to_string()))?;
                Ok(TileResponse::new(
                    body,
                    "application/json; charset=utf-8",
                    crate::resource::FileClass::Config,
                ))
            }
            ("geodata.json", Definition::Geodata(def)) => {
                geodata::generate_file(self, &resource, def, sink).await
            }
            _ => Err(GenerateError::NotFound(format!(
                "unrecognized file <{name}>"
            ))),
        }
    }

    pub(crate) fn context(&self) -> &GeneratorContext {
        &self.context
    }

    /// `mapconfig.json`: the single-resource map configuration handed to
    /// browser clients.
    fn map_config(&self, resource: &Resource) -> GenerateResult<TileResponse> {
        let kind = resource.generator.kind;
        let role = match kind {
            GeneratorKind::Tms => "boundLayers",
            GeneratorKind::Surface => "surfaces",
            GeneratorKind::Geodata => "freeLayers",
        };
        let body = serde_json::json!({
            "referenceFrame": resource.id.reference_frame,
            role: [resource.id.full_id()],
            "url": self.url(),
            "revision": resource.revision,
        });
        Ok(TileResponse::new(
            serde_json::to_vec_pretty(&body)
                .map_err(|e| GenerateError::Internal(e.to_string()))?,
            "application/json; charset=utf-8",
            crate::resource::FileClass::Config,
        ))
    }
}

/// Everything a producer body needs for one tile.
pub struct TileRequest<'a> {
    pub resource: &'a Resource,
    pub frame: Arc<ReferenceFrame>,
    pub prepared: Option<Arc<Prepared>>,
    pub warper: &'a Warper,
    pub info: TileFileInfo,
    pub sink: &'a Sink,
}

/// Whether a `(kind, driver)` pair maps to a factory.
pub fn driver_registered(generator: &GeneratorId) -> bool {
    known_drivers()
        .iter()
        .any(|(kind, driver)| *kind == generator.kind && *driver == generator.driver)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::warper::WarperConfig;

    /// Context with a warper farm that is never started; producer tests
    /// that reach the farm must not use it.
    pub async fn context(store_root: std::path::PathBuf) -> Arc<GeneratorContext> {
        let warper = Warper::start(WarperConfig {
            process_count: 1,
            worker_program: Some(std::path::PathBuf::from("/bin/cat")),
            ..WarperConfig::default()
        })
        .await
        .expect("spawn placeholder worker");
        Arc::new(GeneratorContext {
            warper,
            system_registry: Registry::system(),
            store_root,
            external_url: "http://localhost:3070".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_drivers_unique() {
        let drivers = known_drivers();
        for (i, a) in drivers.iter().enumerate() {
            for b in &drivers[i + 1..] {
                assert_ne!(a, b, "duplicate driver registration");
            }
        }
    }

    #[test]
    fn test_driver_registered() {
        assert!(driver_registered(&GeneratorId::new(
            GeneratorKind::Tms,
            "tms-raster"
        )));
        assert!(!driver_registered(&GeneratorId::new(
            GeneratorKind::Tms,
            "tms-unheard-of"
        )));
    }

    #[tokio::test]
    async fn test_generator_rejects_unknown_driver() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = test_support::context(dir.path().to_path_buf()).await;
        let mut resource = crate::resource::tests::test_resource("a");
        resource.generator = GeneratorId::new(GeneratorKind::Tms, "tms-unheard-of");
        assert!(Generator::new(resource, context).is_err());
    }

    #[tokio::test]
    async fn test_generator_paths_and_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = test_support::context(dir.path().to_path_buf()).await;
        let resource = crate::resource::tests::test_resource("a");
        let generator = Generator::new(resource, Arc::clone(&context)).unwrap();

        assert!(generator
            .root()
            .ends_with("webmercator/tms/test/a"));
        assert_eq!(
            generator.url(),
            "http://localhost:3070/webmercator/tms/test/a"
        );
        assert_eq!(generator.state(), GeneratorState::NotReady);
        assert!(!generator.is_ready());
    }
}
