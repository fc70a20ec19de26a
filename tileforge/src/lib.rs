//! Tileforge - on-the-fly 3D geospatial tile generation
//!
//! This library implements the core of a tile server: given a catalogue
//! of raster and vector datasets plus reference-frame definitions, it
//! materialises map, terrain, normal-map and metadata tiles on demand,
//! re-projecting and resampling through a pool of GDAL worker processes.
//!
//! # High-Level API
//!
//! The [`service`] module assembles the whole daemon:
//!
//! ```ignore
//! use tileforge::config::Settings;
//! use tileforge::service::Service;
//!
//! let mut settings = Settings::default();
//! settings.apply_env();
//! let service = Service::start(settings).await?;
//!
//! // hand parsed requests to the entry point
//! let response = service.handle_tile(&resource_id, file_info, &sink).await?;
//! ```
//!
//! The HTTP front-end, the browser UI and the downstream tile formats
//! are external collaborators; this crate owns the production pipeline
//! and its control plane.

pub mod admission;
pub mod config;
pub mod control;
pub mod coord;
pub mod error;
pub mod fileinfo;
pub mod frame;
pub mod generator;
pub mod geo;
pub mod mesh;
pub mod raster;
pub mod resource;
pub mod service;
pub mod sink;
pub mod tileindex;
pub mod vrt;
pub mod warper;

/// Version of the tileforge library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
