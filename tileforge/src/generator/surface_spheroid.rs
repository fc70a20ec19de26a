//! `surface-spheroid`: a constant-zero surface over the whole frame.
//!
//! Preparation warps nothing; it only materialises the delivery index
//! with `mesh | watertight` on every productive tile (plus `navtile`
//! for lod ≤ 10) down to a fixed bottom lod, and publishes it the same
//! way the DEM surface does.

use std::sync::Arc;

use tracing::info;

use crate::coord::{LodRange, TileId, TileRange};
use crate::error::{GenerateError, GenerateResult};
use crate::fileinfo::TileArtifact;
use crate::resource::{Resource, SurfaceSpheroidDef};
use crate::sink::TileResponse;
use crate::tileindex::{flags, MmappedTileIndex, TileIndexBuilder};

use super::surface::{self, HeightSource};
use super::{Generator, Prepared, TileRequest, TilesetProperties};

/// Materialised tree depth; deeper requests fall outside the index.
const SPHEROID_BOTTOM_LOD: u8 = 9;

/// Navtile flags stop below this lod.
const NAVTILE_MAX_LOD: u8 = 10;

/// Mesh sampling density of the zero surface.
const SPHEROID_SAMPLES: usize = 10;

pub(super) async fn prepare(
    generator: &Arc<Generator>,
    resource: &Resource,
    def: SurfaceSpheroidDef,
) -> GenerateResult<Prepared> {
    let root = generator.root();
    std::fs::create_dir_all(&root)
        .map_err(|e| GenerateError::io(format!("creating {}", root.display()), e))?;

    let conf_path = root.join("tileset.conf");
    let index_path = root.join("delivery.index");

    if conf_path.exists() && index_path.exists() {
        let mut properties = TilesetProperties::load(&conf_path)?;
        if resource.revision > properties.revision {
            properties.revision = resource.revision;
            properties.save(&conf_path)?;
        }
        return Ok(Prepared {
            index: Some(MmappedTileIndex::open(&index_path)?),
            properties,
            dataset: None,
        });
    }

    let frame = generator.frame();
    let bottom = SPHEROID_BOTTOM_LOD.min(frame.valid_lods.max);
    info!(resource = %resource.id, bottom_lod = bottom, "Materialising spheroid index");

    let mut builder = TileIndexBuilder::new(frame.meta_binary_order);
    for lod in 0..=bottom {
        let grid = 1u32 << lod;
        for y in 0..grid {
            for x in 0..grid {
                let tile = TileId::new(lod, x, y);
                if !frame.contains(tile) {
                    continue;
                }
                let mut tile_flags = flags::MESH | flags::WATERTIGHT;
                if lod <= NAVTILE_MAX_LOD {
                    tile_flags |= flags::NAVTILE;
                }
                builder.set(tile, tile_flags);
            }
        }
    }
    builder
        .write(&index_path)
        .map_err(|e| GenerateError::io(format!("publishing {}", index_path.display()), e))?;

    let mut properties = super::tms::properties_of(resource);
    properties.lod_range = LodRange::new(0, bottom);
    properties.tile_range = TileRange::new((0, 0), ((1 << bottom) - 1, (1 << bottom) - 1));
    properties.nominal_texel_size = def.nominal_texel_size;
    properties.merge_bottom_lod = def.merge_bottom_lod;
    properties.save(&conf_path)?;

    Ok(Prepared {
        index: Some(MmappedTileIndex::open(&index_path)?),
        properties,
        dataset: None,
    })
}

pub(super) async fn generate(
    request: &TileRequest<'_>,
    _def: &SurfaceSpheroidDef,
) -> GenerateResult<TileResponse> {
    let source = HeightSource::Zero;

    match request.info.artifact {
        TileArtifact::Mesh => surface::generate_mesh(request, source, SPHEROID_SAMPLES).await,
        TileArtifact::Navtile => {
            surface::generate_navtile(request, source, SPHEROID_SAMPLES).await
        }
        TileArtifact::Meta => surface::generate_metatile(request, source).await,
        TileArtifact::Meta2d => surface::generate_2d_metatile(request),
        TileArtifact::Mask => surface::generate_2d_mask(request, source).await,
        TileArtifact::Terrain => {
            surface::generate_terrain(request, source, SPHEROID_SAMPLES).await
        }
        TileArtifact::Credits => surface::credits_tile(request),
        TileArtifact::Normals => Err(GenerateError::NotFound(
            "normal maps not provided by this generator".to_string(),
        )),
        TileArtifact::Image(_) => Err(GenerateError::NotFound(
            "no internal texture present".to_string(),
        )),
    }
}
