//! The generator registry and reconciler.
//!
//! The registry is a copy-on-write map: readers take an `Arc` snapshot
//! without blocking the reconciler, which builds a new map and swaps it.
//! Reconciliation classifies every incoming resource against the
//! running set and applies the freeze, revision-bump and purge policies.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::resource::{Changed, GeneratorKind, Resource, ResourceId};

use super::{Generator, GeneratorContext, GeneratorState};

/// Reconciler policy knobs.
#[derive(Clone, Debug, Default)]
pub struct GeneratorsConfig {
    /// Kinds whose ready resources reject incompatible changes.
    pub freeze: HashSet<GeneratorKind>,
    /// Delete prepared artifacts of removed resources.
    pub purge_removed: bool,
}

/// Observer invoked after every completed reconcile; used by the poll
/// loop for logging and by tests for synchronisation.
pub type UpdateObserver = Box<dyn Fn(u64) + Send + Sync>;

type Snapshot = Arc<BTreeMap<ResourceId, Arc<Generator>>>;

/// Registry of all generators, keyed by resource id.
pub struct Generators {
    context: Arc<GeneratorContext>,
    config: GeneratorsConfig,
    current: RwLock<Snapshot>,
    /// Stamp of the last completed reconcile, μs since epoch.
    last_update: AtomicU64,
    /// Poked by `update()` to force an immediate poll.
    update_requested: Notify,
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Generators {
    pub fn new(context: Arc<GeneratorContext>, config: GeneratorsConfig) -> Self {
        Self {
            context,
            config,
            current: RwLock::new(Arc::new(BTreeMap::new())),
            last_update: AtomicU64::new(0),
            update_requested: Notify::new(),
        }
    }

    /// Lock-free read of the current generator set.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<Generator>> {
        self.snapshot().get(id).cloned()
    }

    pub fn has(&self, id: &ResourceId) -> bool {
        self.snapshot().contains_key(id)
    }

    pub fn is_ready(&self, id: &ResourceId) -> bool {
        self.get(id).map(|g| g.is_ready()).unwrap_or(false)
    }

    pub fn url(&self, id: &ResourceId) -> Option<String> {
        self.get(id).map(|g| g.url())
    }

    /// `(id, generator id, state)` rows for `list-resources`.
    pub fn list(&self) -> Vec<(ResourceId, String, GeneratorState)> {
        self.snapshot()
            .iter()
            .map(|(id, generator)| {
                (
                    id.clone(),
                    generator.resource().generator.to_string(),
                    generator.state(),
                )
            })
            .collect()
    }

    /// Requests an immediate poll; returns the update token.
    pub fn update(&self) -> u64 {
        let token = now_us();
        self.update_requested.notify_one();
        token
    }

    /// Awaits the next forced-update request (poll loop side).
    pub async fn update_requested(&self) {
        self.update_requested.notified().await;
    }

    /// Whether a reload has completed at or after `token`.
    pub fn updated_since(&self, token: u64) -> bool {
        self.last_update.load(Ordering::Acquire) >= token
    }

    /// Per-resource variant; `require_ready` additionally demands the
    /// resource be serving.
    pub fn updated_since_resource(
        &self,
        id: &ResourceId,
        token: u64,
        require_ready: bool,
    ) -> bool {
        match self.get(id) {
            Some(generator) => {
                generator.updated_us() >= token && (!require_ready || generator.is_ready())
            }
            None => false,
        }
    }

    /// Reconciles the wanted set against the running one.
    ///
    /// Never aborts on a per-resource failure; the offending resource
    /// keeps its previous definition. Returns the completion stamp.
    pub async fn reconcile(&self, wanted: BTreeMap<ResourceId, Resource>) -> u64 {
        let stamp = now_us();
        let previous = self.snapshot();
        let mut next: BTreeMap<ResourceId, Arc<Generator>> = BTreeMap::new();
        let mut to_prepare: Vec<Arc<Generator>> = Vec::new();
        let mut added = 0usize;
        let mut changed = 0usize;

        for (id, incoming) in wanted {
            match previous.get(&id) {
                None => {
                    match Generator::new(incoming, Arc::clone(&self.context)) {
                        Ok(generator) => {
                            let generator = Arc::new(generator);
                            generator.touch(stamp);
                            to_prepare.push(Arc::clone(&generator));
                            next.insert(id, generator);
                            added += 1;
                        }
                        Err(e) => {
                            error!(resource = %id, error = %e, "Cannot instantiate resource");
                        }
                    }
                }
                Some(existing) => {
                    let old = existing.resource();
                    match incoming.changed(&old) {
                        Changed::No => {
                            existing.touch(stamp);
                            next.insert(id, Arc::clone(existing));
                        }
                        Changed::Safe => {
                            let mut updated = incoming;
                            updated.revision = updated.revision.max(old.revision);
                            existing.swap_resource(updated);
                            existing.touch(stamp);
                            next.insert(id, Arc::clone(existing));
                            changed += 1;
                        }
                        Changed::RevisionBump => {
                            let mut updated = incoming;
                            updated.revision = updated.revision.max(old.revision + 1);
                            info!(
                                resource = %id,
                                revision = updated.revision,
                                "Definition change bumps revision"
                            );
                            self.replace(&mut next, &mut to_prepare, id, updated, stamp);
                            changed += 1;
                        }
                        Changed::Yes => {
                            let frozen = self.config.freeze.contains(&old.generator.kind);
                            if frozen && existing.serving() {
                                warn!(
                                    resource = %id,
                                    "Incompatible change rejected by freeze policy; \
                                     keeping previous definition"
                                );
                                existing.freeze();
                                existing.touch(stamp);
                                next.insert(id, Arc::clone(existing));
                            } else {
                                let mut updated = incoming;
                                updated.revision = updated.revision.max(old.revision);
                                self.replace(&mut next, &mut to_prepare, id, updated, stamp);
                                changed += 1;
                            }
                        }
                    }
                }
            }
        }

        // anything left in the previous snapshot was removed
        let mut removed = 0usize;
        for (id, generator) in previous.iter() {
            if next.contains_key(id) {
                continue;
            }
            removed += 1;
            info!(resource = %id, "Resource removed from catalogue");
            if self.config.purge_removed {
                let root = generator.root();
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    warn!(
                        resource = %id,
                        path = %root.display(),
                        error = %e,
                        "Cannot purge prepared artifacts"
                    );
                }
            }
        }

        *self.current.write() = Arc::new(next);

        // dependencies first: a geodata resource draping over a surface
        // wants that surface's preparation under way before its own
        let needed: std::collections::HashSet<ResourceId> = to_prepare
            .iter()
            .flat_map(|g| g.resource().needs_resources())
            .collect();
        to_prepare.sort_by_key(|g| !needed.contains(&g.id()));

        for generator in to_prepare {
            tokio::spawn(async move { generator.prepare().await });
        }

        let done = now_us();
        self.last_update.store(done, Ordering::Release);
        info!(added, changed, removed, "Resource reconcile complete");
        done
    }

    fn replace(
        &self,
        next: &mut BTreeMap<ResourceId, Arc<Generator>>,
        to_prepare: &mut Vec<Arc<Generator>>,
        id: ResourceId,
        resource: Resource,
        stamp: u64,
    ) {
        match Generator::new(resource, Arc::clone(&self.context)) {
            Ok(generator) => {
                let generator = Arc::new(generator);
                generator.touch(stamp);
                to_prepare.push(Arc::clone(&generator));
                next.insert(id, generator);
            }
            Err(e) => {
                error!(resource = %id, error = %e, "Cannot re-instantiate changed resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::test_support;
    use crate::resource::tests::test_resource;
    use crate::resource::{Definition, TmsGdaldemDef};
    use crate::raster::{DemAlgorithm, RasterFormat};

    fn wanted(resources: Vec<Resource>) -> BTreeMap<ResourceId, Resource> {
        resources.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    async fn generators(dir: &tempfile::TempDir, config: GeneratorsConfig) -> Generators {
        let context = test_support::context(dir.path().to_path_buf()).await;
        Generators::new(context, config)
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let generators = generators(&dir, GeneratorsConfig::default()).await;

        generators
            .reconcile(wanted(vec![test_resource("a"), test_resource("b")]))
            .await;
        assert!(generators.has(&ResourceId::new("webmercator", "test", "a")));
        assert!(generators.has(&ResourceId::new("webmercator", "test", "b")));
        assert!(!generators.has(&ResourceId::new("webmercator", "test", "c")));

        generators.reconcile(wanted(vec![test_resource("a")])).await;
        assert!(!generators.has(&ResourceId::new("webmercator", "test", "b")));
    }

    #[tokio::test]
    async fn test_revision_bump_increments() {
        let dir = tempfile::TempDir::new().unwrap();
        let generators = generators(&dir, GeneratorsConfig::default()).await;

        let mut hillshade = test_resource("dem");
        hillshade.generator =
            crate::resource::GeneratorId::new(GeneratorKind::Tms, "tms-gdaldem");
        hillshade.definition = Definition::TmsGdaldem(TmsGdaldemDef {
            dataset: "/data/dem.vrt".to_string(),
            processing: DemAlgorithm::Hillshade,
            options: vec![],
            geoid_grid: None,
            format: RasterFormat::Jpg,
        });

        generators.reconcile(wanted(vec![hillshade.clone()])).await;
        let id = hillshade.id.clone();
        assert_eq!(generators.get(&id).unwrap().resource().revision, 0);

        let mut slope = hillshade.clone();
        slope.definition = Definition::TmsGdaldem(TmsGdaldemDef {
            dataset: "/data/dem.vrt".to_string(),
            processing: DemAlgorithm::Slope,
            options: vec![],
            geoid_grid: None,
            format: RasterFormat::Jpg,
        });
        generators.reconcile(wanted(vec![slope])).await;

        assert_eq!(generators.get(&id).unwrap().resource().revision, 1);
    }

    #[tokio::test]
    async fn test_safe_change_swaps_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let generators = generators(&dir, GeneratorsConfig::default()).await;

        let resource = test_resource("a");
        generators.reconcile(wanted(vec![resource.clone()])).await;
        let id = resource.id.clone();
        let before = generators.get(&id).unwrap();

        let mut commented = resource.clone();
        commented.comment = "updated".to_string();
        generators.reconcile(wanted(vec![commented])).await;

        let after = generators.get(&id).unwrap();
        // same generator object, new resource record
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.resource().comment, "updated");
        assert_eq!(after.resource().revision, 0);
    }

    #[tokio::test]
    async fn test_update_token_semantics() {
        let dir = tempfile::TempDir::new().unwrap();
        let generators = generators(&dir, GeneratorsConfig::default()).await;

        let token = generators.update();
        assert!(!generators.updated_since(token));

        generators.reconcile(wanted(vec![test_resource("a")])).await;
        assert!(generators.updated_since(token));
        // tokens issued later are not yet satisfied
        assert!(!generators.updated_since(now_us() + 1_000_000));
    }

    #[tokio::test]
    async fn test_per_resource_updated_since() {
        let dir = tempfile::TempDir::new().unwrap();
        let generators = generators(&dir, GeneratorsConfig::default()).await;

        let token = now_us();
        generators.reconcile(wanted(vec![test_resource("a")])).await;

        let id = ResourceId::new("webmercator", "test", "a");
        assert!(generators.updated_since_resource(&id, token, false));
        assert!(!generators.updated_since_resource(
            &ResourceId::new("webmercator", "test", "zzz"),
            token,
            false
        ));
    }

    #[tokio::test]
    async fn test_freeze_policy_keeps_old_definition() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = GeneratorsConfig::default();
        config.freeze.insert(GeneratorKind::Tms);
        let generators = generators(&dir, config).await;

        let resource = test_resource("a");
        let id = resource.id.clone();
        generators.reconcile(wanted(vec![resource.clone()])).await;

        // force the generator into a serving state to arm the freeze
        {
            let generator = generators.get(&id).unwrap();
            let prepared = crate::generator::Prepared {
                index: None,
                properties: crate::generator::tms::properties_of(&resource),
                dataset: None,
            };
            generator.force_ready_for_tests(prepared);
            assert!(generator.is_ready());
        }

        // incompatible change: different dataset
        let mut incompatible = resource.clone();
        incompatible.definition = Definition::TmsRaster(crate::resource::TmsRasterDef {
            dataset: "/data/other.tif".to_string(),
            mask: None,
            format: RasterFormat::Jpg,
            resampling: None,
            transparent: false,
        });
        let token = now_us();
        generators.reconcile(wanted(vec![incompatible])).await;

        let generator = generators.get(&id).unwrap();
        // old definition survives, resource still serves
        match &generator.resource().definition {
            Definition::TmsRaster(def) => assert_eq!(def.dataset, "/data/ortho.tif"),
            other => panic!("wrong definition: {other:?}"),
        }
        assert!(generator.serving());
        // the poll token still reports completion
        assert!(generators.updated_since(token));
    }
}
