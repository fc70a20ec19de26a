//! `surface-dem`: terrain surface backed by a DEM.
//!
//! First preparation builds the VRT overview pyramid (with an x-wrap
//! halo for whole-globe frames) and derives the delivery index from the
//! dataset's coverage mask. Later preparations find the published
//! artifacts on disk and only reopen them, so re-preparing a ready
//! resource touches no files.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::coord::Size2;
use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileArtifact;
use crate::raster::Resampling;
use crate::resource::{Resource, SurfaceDemDef};
use crate::sink::{Sink, TileResponse};
use crate::tileindex::{flags, MmappedTileIndex, TileIndexBuilder};
use crate::vrt;
use crate::warper::{MaskRequest, WarpRequest, WarpResponse};

use super::surface::{self, HeightSource};
use super::{Generator, Prepared, TileRequest, TilesetProperties};

/// Navtile flags go on every real tile up to this lod.
const NAVTILE_MAX_LOD: u8 = 10;

/// Coverage probe resolution per tile during index construction.
const COVERAGE_SAMPLES: usize = 16;

pub(super) async fn prepare(
    generator: &Arc<Generator>,
    resource: &Resource,
    def: SurfaceDemDef,
) -> GenerateResult<Prepared> {
    let root = generator.root();
    std::fs::create_dir_all(&root)
        .map_err(|e| GenerateError::io(format!("creating {}", root.display()), e))?;

    let conf_path = root.join("tileset.conf");
    let index_path = root.join("delivery.index");
    let dataset_path = root.join("dataset.vrt");

    if conf_path.exists() && index_path.exists() {
        // already prepared; reuse the published artifacts untouched
        let mut properties = TilesetProperties::load(&conf_path)?;
        if resource.revision > properties.revision {
            properties.revision = resource.revision;
            properties.save(&conf_path)?;
        }
        let index = MmappedTileIndex::open(&index_path)?;
        debug!(resource = %resource.id, "Reusing prepared surface artifacts");
        return Ok(Prepared {
            index: Some(index),
            properties,
            dataset: Some(dataset_path),
        });
    }

    info!(resource = %resource.id, dataset = %def.dataset, "Building DEM overview pyramid");

    // the pyramid build is pure blocking GDAL work
    let frame = generator.frame();
    let input = PathBuf::from(&def.dataset);
    let output = root.clone();
    let wrapx = spans_whole_globe(&frame);
    let setup = tokio::task::spawn_blocking(move || {
        let config = vrt::Config {
            min_ovr_size: Size2::new(256, 256),
            tile_size: Size2::new(1024, 1024),
            wrapx: if wrapx { Some(0) } else { None },
            background: None,
            resampling: Resampling::Lanczos,
            nodata: None,
            path_mode: vrt::PathToOriginalDataset::RelativeSymlink,
        };
        vrt::generate(&input, &output, &config)
    })
    .await
    .map_err(|e| GenerateError::Internal(format!("pyramid build task: {e}")))?
    .map_err(|e| GenerateError::Internal(format!("pyramid build: {e}")))?;
    debug!(levels = setup.ovr_sizes.len(), "Pyramid built");

    // derive the delivery index from per-tile coverage
    let index = build_index(generator, resource, &dataset_path).await?;
    index
        .write(&index_path)
        .map_err(|e| GenerateError::io(format!("publishing {}", index_path.display()), e))?;

    let mut properties = super::tms::properties_of(resource);
    properties.nominal_texel_size = def.nominal_texel_size;
    properties.merge_bottom_lod = def.merge_bottom_lod;
    properties.save(&conf_path)?;

    Ok(Prepared {
        index: Some(MmappedTileIndex::open(&index_path)?),
        properties,
        dataset: Some(dataset_path),
    })
}

/// Probes the dataset's mask per tile and flags real / watertight /
/// navtile entries.
async fn build_index(
    generator: &Arc<Generator>,
    resource: &Resource,
    dataset: &std::path::Path,
) -> GenerateResult<TileIndexBuilder> {
    let frame = generator.frame();
    let mut builder = TileIndexBuilder::new(frame.meta_binary_order);
    let sink = Sink::new();
    let dataset = dataset.to_string_lossy().into_owned();

    for lod in resource.lod_range.min..=resource.lod_range.max {
        let range = resource.tile_range.shifted(resource.lod_range.min, lod);
        for y in range.ll.1..=range.ur.1 {
            for x in range.ll.0..=range.ur.0 {
                let tile = crate::coord::TileId::new(lod, x, y);
                let node = crate::frame::NodeInfo::new(Arc::clone(&frame), tile);
                if !node.productive() {
                    continue;
                }

                let response = generator
                    .context()
                    .warper
                    .warp(
                        WarpRequest::Mask(MaskRequest {
                            dataset: dataset.clone(),
                            srs: node.srs().to_string(),
                            extents: node.extents(),
                            size: Size2::new(COVERAGE_SAMPLES, COVERAGE_SAMPLES),
                            resampling: Resampling::Nearest,
                        }),
                        &sink,
                    )
                    .await
                    .map_err(GenerateError::from)?;

                let mask = match response {
                    WarpResponse::Raster(buffer) => buffer,
                    other => {
                        return Err(GenerateError::Internal(format!(
                            "unexpected coverage response {other:?}"
                        )))
                    }
                };
                if !mask.any_valid() {
                    continue;
                }

                let mut tile_flags = flags::MESH;
                if mask.all_valid() {
                    tile_flags |= flags::WATERTIGHT;
                }
                if lod <= NAVTILE_MAX_LOD || lod == resource.lod_range.min {
                    tile_flags |= flags::NAVTILE;
                }
                builder.set(tile, tile_flags);
            }
        }
    }

    Ok(builder)
}

/// Whether the frame's division extents wrap in x (whole-globe frames
/// need the antimeridian halo).
fn spans_whole_globe(frame: &crate::frame::ReferenceFrame) -> bool {
    matches!(frame.division_srs.as_str(), "EPSG:3857" | "EPSG:4326")
}

pub(super) async fn generate(
    request: &TileRequest<'_>,
    def: &SurfaceDemDef,
) -> GenerateResult<TileResponse> {
    let dataset = request
        .prepared
        .as_ref()
        .and_then(|p| p.dataset.clone())
        .ok_or(GenerateError::Unavailable)?;
    let dataset = dataset.to_string_lossy().into_owned();
    let source = HeightSource::Dataset(&dataset);

    match request.info.artifact {
        TileArtifact::Mesh => {
            surface::generate_mesh(request, source, def.samples_per_side as usize).await
        }
        TileArtifact::Navtile => {
            surface::generate_navtile(request, source, def.navtile_samples as usize).await
        }
        TileArtifact::Meta => surface::generate_metatile(request, source).await,
        TileArtifact::Meta2d => surface::generate_2d_metatile(request),
        TileArtifact::Mask => surface::generate_2d_mask(request, source).await,
        TileArtifact::Terrain => {
            surface::generate_terrain(request, source, def.samples_per_side as usize).await
        }
        TileArtifact::Normals => Err(GenerateError::NotFound(
            "normal maps not provided by this generator".to_string(),
        )),
        TileArtifact::Image(_) => Err(GenerateError::NotFound(
            "no internal texture present".to_string(),
        )),
        TileArtifact::Credits => surface::credits_tile(request),
    }
}
