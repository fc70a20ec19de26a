//! Daemon assembly: warper farm, generator registry, catalogue poll
//! loop, control socket and the request entry point.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admission::{await_joined, Admission, RequestFingerprint, TileAdmission};
use crate::config::Settings;
use crate::control::Ctrl;
use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileFileInfo;
use crate::frame::Registry;
use crate::generator::{interface_of, GeneratorContext, Generators, GeneratorsConfig};
use crate::resource::{load_catalogue, ResourceId};
use crate::sink::{Sink, TileResponse};
use crate::warper::{Warper, WarperConfig};

/// A running tile server, minus the HTTP front-end.
pub struct Service {
    settings: Settings,
    generators: Arc<Generators>,
    admission: Arc<TileAdmission>,
    warper: Warper,
    system_registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl Service {
    /// Boots the farm and the registry and runs the first catalogue
    /// load.
    pub async fn start(settings: Settings) -> GenerateResult<Arc<Self>> {
        let system_registry = Registry::system();

        let warper = Warper::start(WarperConfig {
            process_count: settings.gdal_process_count,
            rss_limit: settings.rss_limit_bytes(),
            rss_check_period: std::time::Duration::from_secs(settings.gdal_rss_check_period),
            tmp_root: settings.gdal_tmp_root.clone(),
            ..WarperConfig::default()
        })
        .await
        .map_err(GenerateError::from)?;

        let context = Arc::new(GeneratorContext {
            warper: warper.clone(),
            system_registry: Arc::clone(&system_registry),
            store_root: settings.store_path.clone(),
            external_url: settings.http_external_url.clone(),
        });
        let generators = Arc::new(Generators::new(
            context,
            GeneratorsConfig {
                freeze: settings.resource_backend_freeze.clone(),
                purge_removed: settings.resource_backend_purge_removed,
            },
        ));

        let service = Arc::new(Self {
            settings,
            generators,
            admission: Arc::new(TileAdmission::new()),
            warper,
            system_registry,
            shutdown: CancellationToken::new(),
        });

        service.reload().await;
        {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.poll_loop().await });
        }

        Ok(service)
    }

    pub fn generators(&self) -> &Arc<Generators> {
        &self.generators
    }

    pub fn ctrl(&self) -> Ctrl {
        Ctrl::new(
            Arc::clone(&self.generators),
            Arc::clone(&self.system_registry),
        )
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Re-reads the catalogue and reconciles. Loader failures keep the
    /// running set untouched.
    pub async fn reload(&self) {
        let wanted = match load_catalogue(
            &self.settings.resource_backend_root,
            &self.system_registry,
            &self.settings.max_age,
        ) {
            Ok(wanted) => wanted,
            Err(e) => {
                error!(error = %e, "Catalogue reload failed; keeping running set");
                return;
            }
        };
        let count = wanted.len();
        self.generators.reconcile(wanted).await;
        info!(resources = count, "Catalogue reloaded");
    }

    /// Periodic poll plus forced updates from `update-resources`.
    async fn poll_loop(self: Arc<Self>) {
        let period = self.settings.update_period();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.generators.update_requested() => {}
                _ = self.shutdown.cancelled() => break,
            }
            self.reload().await;
        }
    }

    /// Request entry point: admission, production, caching headers.
    ///
    /// At most one build runs per fingerprint; concurrent callers
    /// receive the identical bytes.
    pub async fn handle_tile(
        &self,
        resource: &ResourceId,
        info: TileFileInfo,
        sink: &Sink,
    ) -> GenerateResult<Arc<TileResponse>> {
        let generator = self
            .generators
            .get(resource)
            .ok_or_else(|| GenerateError::NotFound(format!("no resource <{resource}>")))?;
        if !generator.serving() {
            return Err(GenerateError::Unavailable);
        }

        let record = generator.resource();
        let fingerprint = RequestFingerprint {
            resource: resource.clone(),
            interface: interface_of(record.generator.kind).to_string(),
            tile: info.tile,
            artifact: info.artifact.extension().to_string(),
            format: info.artifact.extension().to_string(),
            flavor: info.flavor.as_str().to_string(),
        };

        match self.admission.register(fingerprint) {
            Admission::Build(ticket) => {
                let result = generator.generate_tile(info, sink).await.map(|mut r| {
                    r.headers.push((
                        "Cache-Control".to_string(),
                        record.file_classes.cache_control(r.file_class),
                    ));
                    r
                });
                match result {
                    Ok(response) => {
                        let shared = Arc::new(response);
                        self.admission.complete(ticket, Ok((*shared).clone()));
                        Ok(shared)
                    }
                    Err(GenerateError::Cancelled) => {
                        // do not poison waiters with a cancellation that
                        // was this client's alone
                        self.admission.cancel(ticket);
                        Err(GenerateError::Cancelled)
                    }
                    Err(e) => {
                        self.admission
                            .complete(ticket, Err(GenerateError::Internal(e.to_string())));
                        Err(e)
                    }
                }
            }
            Admission::Join(waiter) => await_joined(waiter).await,
        }
    }

    /// Clean shutdown: stop polling, control clients and the farm.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.warper.stop().await;
        info!("Service stopped");
    }
}
