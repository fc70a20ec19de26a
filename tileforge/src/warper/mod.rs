//! Warper farm: a pool of worker subprocesses for blocking GDAL work.
//!
//! Every raster operation a producer needs (warp, mask, DEM processing,
//! heightcoding) is shipped to a single-threaded worker process over a
//! length-prefixed bincode channel. The parent enforces an aggregate RSS
//! budget, recycles long-lived workers and detects crashes; a crashed
//! worker fails the in-flight request with `WorkerLost` and the farm
//! retries once on a replacement.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coord::{Extents2, Size2};
use crate::raster::{DemAlgorithm, Resampling, TileBuffer};

mod cache;
mod farm;
mod ops;
pub mod protocol;
mod rss;
mod worker;

pub use cache::DatasetCache;
pub use farm::{Warper, WarperError};
pub use worker::serve_worker;

/// Warp to an extent/size, producing a pixel buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRequest {
    pub dataset: String,
    /// Optional companion mask dataset warped alongside.
    pub mask: Option<String>,
    /// Target SRS as a user definition (EPSG code, proj4 or WKT).
    pub srs: String,
    pub extents: Extents2,
    pub size: Size2,
    pub resampling: Resampling,
    /// Keep the native channel count instead of expanding to RGB.
    pub no_expand: bool,
}

/// Warp only the coverage mask of a dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskRequest {
    pub dataset: String,
    pub srs: String,
    pub extents: Extents2,
    pub size: Size2,
    pub resampling: Resampling,
}

/// Run a `gdaldem`-equivalent derivation on a warped DEM window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemRequest {
    pub dataset: String,
    pub algorithm: DemAlgorithm,
    /// Extra gdaldem switches, e.g. `-z 2`.
    pub options: Vec<String>,
    /// Colour file for `color-relief`.
    pub color_file: Option<PathBuf>,
    pub srs: String,
    pub extents: Extents2,
    pub size: Size2,
    pub resampling: Resampling,
}

/// Warp a DEM window as raw heights.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemWindowRequest {
    pub dataset: String,
    pub srs: String,
    pub extents: Extents2,
    pub size: Size2,
    pub resampling: Resampling,
}

/// Heightcode a vector dataset against a DEM stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeightcodeRequest {
    pub vector: String,
    /// DEM datasets, first valid value wins.
    pub rasters: Vec<String>,
    pub geoid_grid: Option<String>,
    /// Restrict to these layers; empty = all.
    pub layers: Vec<String>,
}

/// A request shipped to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WarpRequest {
    Image(ImageRequest),
    Mask(MaskRequest),
    Dem(DemRequest),
    /// Raw float heights, used by the surface producers.
    DemWindow(DemWindowRequest),
    Heightcode(HeightcodeRequest),
}

impl WarpRequest {
    /// Primary dataset, for logging.
    pub fn dataset(&self) -> &str {
        match self {
            Self::Image(r) => &r.dataset,
            Self::Mask(r) => &r.dataset,
            Self::Dem(r) => &r.dataset,
            Self::DemWindow(r) => &r.dataset,
            Self::Heightcode(r) => &r.vector,
        }
    }
}

/// Worker-side result of a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WarpResponse {
    Raster(TileBuffer),
    /// Heightcoded vector payload (GeoJSON).
    Vector(String),
    /// The request's cancel flag was observed mid-operation.
    Cancelled,
    Error(String),
}

/// Farm configuration.
#[derive(Clone, Debug)]
pub struct WarperConfig {
    /// Worker process count; defaults to hardware concurrency.
    pub process_count: usize,
    /// Aggregate RSS budget in bytes; `None` disables the check.
    pub rss_limit: Option<u64>,
    /// Housekeeping period for the RSS check.
    pub rss_check_period: Duration,
    /// Recycle a worker after this many requests.
    pub max_requests_per_worker: u32,
    /// Executable spawned as a worker; defaults to the current binary.
    pub worker_program: Option<PathBuf>,
    /// Scratch directory handed to workers via `GDAL_TMPDIR`.
    pub tmp_root: Option<PathBuf>,
}

impl Default for WarperConfig {
    fn default() -> Self {
        Self {
            process_count: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            rss_limit: None,
            rss_check_period: Duration::from_secs(10),
            max_requests_per_worker: 512,
            worker_program: None,
            tmp_root: None,
        }
    }
}

/// Argument that selects the worker entry point in the spawned binary.
pub const WORKER_SUBCOMMAND: &str = "warp-worker";
