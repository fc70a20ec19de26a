//! `geodata-vector`: vector layers draped over a DEM.
//!
//! The resource is monolithic: one heightcoded GeoJSON payload per
//! revision, produced by the warper farm's heightcode operation. It
//! serves no tile artifacts.

use std::sync::Arc;

use crate::error::{GenerateError, GenerateResult};
use crate::resource::{FileClass, GeodataDef, Resource};
use crate::sink::{Sink, TileResponse};
use crate::warper::{HeightcodeRequest, WarpRequest, WarpResponse};

use super::{Generator, Prepared};

pub(super) async fn prepare(
    generator: &Arc<Generator>,
    resource: &Resource,
    def: &GeodataDef,
) -> GenerateResult<Prepared> {
    for dataset in [&def.dataset, &def.dem.dataset] {
        if !std::path::Path::new(dataset).exists() {
            return Err(GenerateError::NotFound(format!(
                "source dataset <{dataset}> does not exist"
            )));
        }
    }

    let root = generator.root();
    std::fs::create_dir_all(&root)
        .map_err(|e| GenerateError::io(format!("creating {}", root.display()), e))?;

    Ok(Prepared {
        index: None,
        properties: super::tms::properties_of(resource),
        dataset: None,
    })
}

pub(super) async fn generate_file(
    generator: &Generator,
    _resource: &Resource,
    def: &GeodataDef,
    sink: &Sink,
) -> GenerateResult<TileResponse> {
    sink.check_aborted()?;

    let response = generator
        .context()
        .warper
        .warp(
            WarpRequest::Heightcode(HeightcodeRequest {
                vector: def.dataset.clone(),
                rasters: vec![def.dem.dataset.clone()],
                geoid_grid: def.dem.geoid_grid.clone(),
                layers: def.layers.clone().unwrap_or_default(),
            }),
            sink,
        )
        .await
        .map_err(GenerateError::from)?;

    match response {
        WarpResponse::Vector(geojson) => Ok(TileResponse::new(
            geojson.into_bytes(),
            "application/json; charset=utf-8",
            FileClass::Data,
        )),
        WarpResponse::Cancelled => Err(GenerateError::Cancelled),
        other => Err(GenerateError::Internal(format!(
            "unexpected heightcode response {other:?}"
        ))),
    }
}
