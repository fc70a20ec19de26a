//! Server configuration.
//!
//! Every key accepts an environment override of the same name with dots
//! mapped to underscores (`store.path` → `store_path`). The CLI layers
//! command-line flags on top of these settings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::resource::{FileClassSettings, GeneratorKind};

/// Default catalogue poll period in seconds.
pub const DEFAULT_UPDATE_PERIOD: u64 = 300;

/// All server settings, defaulted and env-overridable.
#[derive(Clone, Debug)]
pub struct Settings {
    /// `store.path`: root of the prepared-state store.
    pub store_path: PathBuf,
    /// `http.listen`
    pub http_listen: String,
    /// `http.threadCount`
    pub http_thread_count: usize,
    /// `http.client.threadCount`
    pub http_client_thread_count: usize,
    /// `http.enableBrowser`
    pub http_enable_browser: bool,
    /// `http.externalUrl`
    pub http_external_url: String,
    /// `core.threadCount`
    pub core_thread_count: usize,
    /// `gdal.processCount`
    pub gdal_process_count: usize,
    /// `gdal.tmpRoot`
    pub gdal_tmp_root: Option<PathBuf>,
    /// `gdal.rssLimit` in megabytes; unset disables the budget.
    pub gdal_rss_limit: Option<u64>,
    /// `gdal.rssCheckPeriod` in seconds.
    pub gdal_rss_check_period: u64,
    /// `resource-backend.type`
    pub resource_backend_type: String,
    /// `resource-backend.updatePeriod` in seconds.
    pub resource_backend_update_period: u64,
    /// `resource-backend.root`: the catalogue file.
    pub resource_backend_root: PathBuf,
    /// `resource-backend.freeze`: kinds rejecting incompatible changes.
    pub resource_backend_freeze: HashSet<GeneratorKind>,
    /// `resource-backend.purgeRemoved`
    pub resource_backend_purge_removed: bool,
    /// `introspection.defaultFov` in degrees.
    pub introspection_default_fov: f64,
    /// Per-file-class `max-age` overrides.
    pub max_age: FileClassSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            store_path: PathBuf::from("store"),
            http_listen: "0.0.0.0:3070".to_string(),
            http_thread_count: cpus,
            http_client_thread_count: 1,
            http_enable_browser: false,
            http_external_url: "http://localhost:3070".to_string(),
            core_thread_count: cpus,
            gdal_process_count: cpus,
            gdal_tmp_root: None,
            gdal_rss_limit: None,
            gdal_rss_check_period: 10,
            resource_backend_type: "conffile".to_string(),
            resource_backend_update_period: DEFAULT_UPDATE_PERIOD,
            resource_backend_root: PathBuf::from("resources.json"),
            resource_backend_freeze: HashSet::new(),
            resource_backend_purge_removed: false,
            introspection_default_fov: 45.0,
            max_age: FileClassSettings::default(),
        }
    }
}

impl Settings {
    /// Applies environment overrides (`store.path` → `store_path`).
    pub fn apply_env(&mut self) {
        fn env(key: &str) -> Option<String> {
            std::env::var(key.replace('.', "_")).ok()
        }
        fn parse<T: std::str::FromStr>(key: &str, target: &mut T) {
            if let Some(value) = env(key) {
                match value.parse() {
                    Ok(parsed) => *target = parsed,
                    Err(_) => warn!(key, value, "Ignoring unparsable environment override"),
                }
            }
        }

        parse("store.path", &mut self.store_path);
        parse("http.listen", &mut self.http_listen);
        parse("http.threadCount", &mut self.http_thread_count);
        parse("http.client.threadCount", &mut self.http_client_thread_count);
        parse("http.enableBrowser", &mut self.http_enable_browser);
        parse("http.externalUrl", &mut self.http_external_url);
        parse("core.threadCount", &mut self.core_thread_count);
        parse("gdal.processCount", &mut self.gdal_process_count);
        if let Some(value) = env("gdal.tmpRoot") {
            self.gdal_tmp_root = Some(PathBuf::from(value));
        }
        if let Some(value) = env("gdal.rssLimit") {
            match value.parse() {
                Ok(limit) => self.gdal_rss_limit = Some(limit),
                Err(_) => warn!(value, "Ignoring unparsable gdal.rssLimit override"),
            }
        }
        parse("gdal.rssCheckPeriod", &mut self.gdal_rss_check_period);
        parse("resource-backend.type", &mut self.resource_backend_type);
        parse(
            "resource-backend.updatePeriod",
            &mut self.resource_backend_update_period,
        );
        parse("resource-backend.root", &mut self.resource_backend_root);
        if let Some(value) = env("resource-backend.freeze") {
            match parse_freeze(&value) {
                Ok(freeze) => self.resource_backend_freeze = freeze,
                Err(e) => warn!(value, error = %e, "Ignoring bad freeze override"),
            }
        }
        parse(
            "resource-backend.purgeRemoved",
            &mut self.resource_backend_purge_removed,
        );
        parse(
            "introspection.defaultFov",
            &mut self.introspection_default_fov,
        );

        for class in ["config", "support", "registry", "data", "unknown"] {
            if let Some(value) = env(&format!("max-age.{class}")) {
                match value.parse::<i64>() {
                    Ok(age) => {
                        let class = class.parse().expect("static class name");
                        self.max_age.set_max_age(class, age);
                    }
                    Err(_) => warn!(class, value, "Ignoring unparsable max-age override"),
                }
            }
        }
    }

    pub fn rss_limit_bytes(&self) -> Option<u64> {
        self.gdal_rss_limit.map(|mb| mb * 1024 * 1024)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.resource_backend_update_period)
    }
}

/// Parses the `resource-backend.freeze` comma list.
pub fn parse_freeze(value: &str) -> Result<HashSet<GeneratorKind>, String> {
    let mut out = HashSet::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.insert(part.parse()?);
    }
    Ok(out)
}
