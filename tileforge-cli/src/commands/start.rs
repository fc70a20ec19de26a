//! The `start` subcommand: run the daemon until interrupted.

use std::path::PathBuf;

use clap::Args;
use tokio::net::UnixListener;
use tracing::{error, info};

use tileforge::config::{parse_freeze, Settings};
use tileforge::service::Service;

#[derive(Args)]
pub struct StartArgs {
    /// Root of the prepared-state store (`store.path`).
    #[arg(long = "store.path", env = "store_path")]
    store_path: Option<PathBuf>,

    /// Catalogue file (`resource-backend.root`).
    #[arg(long = "resource-backend.root", env = "resource-backend_root")]
    resource_root: Option<PathBuf>,

    /// Catalogue poll period in seconds (`resource-backend.updatePeriod`).
    #[arg(long = "resource-backend.updatePeriod")]
    update_period: Option<u64>,

    /// Comma list of frozen kinds (`resource-backend.freeze`).
    #[arg(long = "resource-backend.freeze")]
    freeze: Option<String>,

    /// Purge prepared artifacts of removed resources.
    #[arg(long = "resource-backend.purgeRemoved")]
    purge_removed: bool,

    /// Warper worker process count (`gdal.processCount`).
    #[arg(long = "gdal.processCount")]
    process_count: Option<usize>,

    /// Aggregate warper RSS budget in megabytes (`gdal.rssLimit`).
    #[arg(long = "gdal.rssLimit")]
    rss_limit: Option<u64>,

    /// Externally visible URL prefix (`http.externalUrl`).
    #[arg(long = "http.externalUrl")]
    external_url: Option<String>,

    /// Core worker thread count (`core.threadCount`).
    #[arg(long = "core.threadCount")]
    core_threads: Option<usize>,

    /// Control socket path; defaults to `<store>/tileforge.ctrl`.
    #[arg(long)]
    ctrl_socket: Option<PathBuf>,
}

impl StartArgs {
    pub fn core_threads(&self) -> usize {
        self.core_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        })
    }

    fn settings(&self) -> Result<Settings, String> {
        let mut settings = Settings::default();
        settings.apply_env();

        if let Some(path) = &self.store_path {
            settings.store_path = path.clone();
        }
        if let Some(path) = &self.resource_root {
            settings.resource_backend_root = path.clone();
        }
        if let Some(period) = self.update_period {
            settings.resource_backend_update_period = period;
        }
        if let Some(freeze) = &self.freeze {
            settings.resource_backend_freeze = parse_freeze(freeze)?;
        }
        if self.purge_removed {
            settings.resource_backend_purge_removed = true;
        }
        if let Some(count) = self.process_count {
            settings.gdal_process_count = count;
        }
        if let Some(limit) = self.rss_limit {
            settings.gdal_rss_limit = Some(limit);
        }
        if let Some(url) = &self.external_url {
            settings.http_external_url = url.clone();
        }
        if let Some(count) = self.core_threads {
            settings.core_thread_count = count;
        }
        Ok(settings)
    }
}

pub async fn run(args: StartArgs) -> i32 {
    let settings = match args.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return 2;
        }
    };

    let socket_path = args
        .ctrl_socket
        .clone()
        .unwrap_or_else(|| crate::default_ctrl_socket(&settings.store_path));

    if let Err(e) = std::fs::create_dir_all(&settings.store_path) {
        error!(path = %settings.store_path.display(), error = %e, "Cannot create store");
        return 2;
    }

    let service = match Service::start(settings).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Cannot start service");
            return 1;
        }
    };

    // control socket
    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "Cannot bind control socket");
            service.stop().await;
            return 1;
        }
    };
    let ctrl = std::sync::Arc::new(service.ctrl());
    tokio::spawn(ctrl.serve(listener, service.shutdown_token()));

    info!(
        version = tileforge::VERSION,
        ctrl = %socket_path.display(),
        "Tileforge running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received; shutting down"),
        Err(e) => {
            error!(error = %e, "Signal handler failed; shutting down");
            service.stop().await;
            return 1;
        }
    }

    service.stop().await;
    let _ = std::fs::remove_file(&socket_path);
    0
}
