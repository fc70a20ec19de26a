//! Pyramid generation.
//!
//! Builds the on-disk layout of a prepared dataset: `dataset.vrt` (the
//! base, referencing the symlinked original, with wrap strips when
//! configured) plus numbered overview directories `0/`, `1/`, ... each
//! holding `ovr.vrt` and its non-empty tile GeoTIFFs. After a level is
//! written, the parent VRT gains `<Overview>` cross-links to it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::coord::{Extents2, Size2};
use crate::geo::{geo_transform, widened_type, GeoDataset, GeoError, MaskType};

use super::xml::{self, Rect, SimpleSource, SourceProperties, VrtBand, VrtDocument};
use super::{make_setup, predictor_for, Config, PathToOriginalDataset, Setup};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("{0}")]
    Unsupported(String),
}

impl BuildError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Generates the whole overview pyramid for `input` under `output`.
///
/// Any failure aborts the build; partial output stays on disk and is
/// recovered by re-running the preparation.
pub fn generate(input: &Path, output: &Path, config: &Config) -> Result<Setup, BuildError> {
    std::fs::create_dir_all(output).map_err(|e| BuildError::io(output, e))?;

    let setup = build_dataset_base(input, output, config)?;

    let total: usize = setup.ovr_tiled.iter().map(Size2::area).sum();
    info!(
        levels = setup.ovr_sizes.len(),
        tiles = total,
        tile_size = %config.tile_size,
        "About to generate overview pyramid"
    );

    let progress = AtomicUsize::new(0);
    let mut input_path = setup.output_dataset.clone();
    for (index, (&size, &tiled)) in setup.ovr_sizes.iter().zip(&setup.ovr_tiled).enumerate() {
        let dir = PathBuf::from(format!("{index}"));
        std::fs::create_dir_all(output.join(&dir))
            .map_err(|e| BuildError::io(&output.join(&dir), e))?;

        let level_vrt = create_overview(
            config, output, index, &input_path, &dir, size, tiled, &progress, total,
        )?;

        xml::add_overview(&input_path, &level_vrt)
            .map_err(|e| BuildError::io(&input_path, e))?;

        input_path = output.join(&level_vrt);
    }

    Ok(setup)
}

/// Creates `dataset.vrt` plus the symlinks to the original dataset.
fn build_dataset_base(
    input: &Path,
    output: &Path,
    config: &Config,
) -> Result<Setup, BuildError> {
    if config.path_mode == PathToOriginalDataset::Copy {
        return Err(BuildError::Unsupported(
            "dataset copy not implemented".to_string(),
        ));
    }

    let source = GeoDataset::open(input)?;
    let descriptor = source.descriptor().clone();

    // datasets that insist on their original file name keep it
    let link_name = if descriptor.driver == "SRTMHGT" {
        PathBuf::from(input.file_name().expect("input has a file name"))
    } else {
        PathBuf::from("original")
    };
    let link_path = output.join(&link_name);

    let link_target = match config.path_mode {
        PathToOriginalDataset::AbsoluteSymlink => {
            input.canonicalize().map_err(|e| BuildError::io(input, e))?
        }
        _ => relative_to(input, output),
    };
    relink(&link_target, &link_path)?;

    // sidecar files travel with the dataset
    let base_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{base_name}.");
    for file in source.files() {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(ext) = name.strip_prefix(&prefix) {
            let sidecar_link = output.join(format!(
                "{}.{ext}",
                link_name.to_string_lossy()
            ));
            let target = match config.path_mode {
                PathToOriginalDataset::AbsoluteSymlink => {
                    file.canonicalize().map_err(|e| BuildError::io(&file, e))?
                }
                _ => relative_to(&file, output),
            };
            relink(&target, &sidecar_link)?;
        }
    }

    let mut setup = make_setup(descriptor.size, descriptor.extents, config);
    setup.output_dataset = output.join("dataset.vrt");

    info!(
        dataset = %setup.output_dataset.display(),
        original = %link_path.display(),
        "Creating dataset base"
    );

    let nodata = config.nodata.or(descriptor.nodata);
    let mut doc = VrtDocument::new(
        setup.size,
        descriptor.srs_wkt.clone(),
        geo_transform(setup.extents, setup.size),
    );

    let properties = SourceProperties {
        size: descriptor.size,
        data_type: xml::data_type_name(descriptor.data_type).to_string(),
        block_size: descriptor.block_size,
    };
    let filename = link_name.to_string_lossy().into_owned();

    for band in 1..=descriptor.bands {
        let mut sources = Vec::new();
        let mut mask_sources = Vec::new();
        let mut push = |src_rect: Rect, dst_rect: Rect| {
            let source = SimpleSource {
                filename: filename.clone(),
                relative: true,
                shared: true,
                band,
                mask_source: false,
                src_rect,
                dst_rect,
                properties: properties.clone(),
            };
            if band == 1 && descriptor.mask == MaskType::Band {
                mask_sources.push(SimpleSource {
                    mask_source: true,
                    ..source.clone()
                });
            }
            sources.push(source);
        };

        if let Some(shift) = config.wrapx {
            let in_size = descriptor.size;
            let x_plus = setup.x_plus;

            // center section
            push(
                Rect::whole(in_size),
                Rect::new(x_plus, 0, in_size.width, in_size.height),
            );
            // right strip duplicated into the left halo
            push(
                Rect::new(in_size.width - x_plus - shift, 0, x_plus, in_size.height),
                Rect::new(0, 0, x_plus, in_size.height),
            );
            // left strip duplicated into the right halo
            push(
                Rect::new(shift, 0, x_plus, in_size.height),
                Rect::new(in_size.width + x_plus, 0, x_plus, in_size.height),
            );
        } else {
            push(Rect::whole(descriptor.size), Rect::whole(descriptor.size));
        }

        doc.bands.push(VrtBand {
            data_type: xml::data_type_name(descriptor.data_type).to_string(),
            color_interp: if descriptor.bands == 1 { "Gray" } else { "Undefined" }.to_string(),
            nodata,
            sources,
        });
        doc.mask_sources.extend(mask_sources);
    }

    doc.write(&setup.output_dataset)
        .map_err(|e| BuildError::io(&setup.output_dataset, e))?;

    Ok(setup)
}

/// Builds one overview level; returns its VRT path relative to `output`.
#[allow(clippy::too_many_arguments)]
fn create_overview(
    config: &Config,
    output: &Path,
    ovr_index: usize,
    src_path: &Path,
    dir: &Path,
    size: Size2,
    tiled: Size2,
    progress: &AtomicUsize,
    total: usize,
) -> Result<PathBuf, BuildError> {
    let ovr_name = dir.join("ovr.vrt");
    let ovr_path = output.join(&ovr_name);
    let ts = config.tile_size;

    info!(
        level = ovr_index,
        tiles = tiled.area(),
        path = %ovr_path.display(),
        source = %src_path.display(),
        "Creating overview level"
    );

    let src = GeoDataset::open(src_path)?;
    let descriptor = src.descriptor().clone();
    let extents = descriptor.extents;
    drop(src);

    let (tmp_type, tmp_nodata) = widened_type(&descriptor);
    let predictor = predictor_for(descriptor.data_type);

    let mut doc = VrtDocument::new(
        size,
        descriptor.srs_wkt.clone(),
        geo_transform(extents, size),
    );
    for _ in 0..descriptor.bands {
        doc.bands.push(VrtBand {
            data_type: xml::data_type_name(descriptor.data_type).to_string(),
            color_interp: if descriptor.bands == 1 { "Gray" } else { "Undefined" }.to_string(),
            nodata: config.nodata.or(descriptor.nodata),
            sources: Vec::new(),
        });
    }

    // solid background, drawn under every tile
    if let Some(background) = &config.background {
        write_background(output, dir, &descriptor, extents, background)?;
        for (band, doc_band) in doc.bands.iter_mut().enumerate() {
            doc_band.sources.push(SimpleSource {
                filename: dir.join("bg.tif").to_string_lossy().into_owned(),
                relative: true,
                shared: true,
                band: band + 1,
                mask_source: false,
                src_rect: Rect::new(0, 0, 16, 16),
                dst_rect: Rect::new(0, 0, size.width, size.height),
                properties: SourceProperties {
                    size: Size2::new(16, 16),
                    data_type: xml::data_type_name(descriptor.data_type).to_string(),
                    block_size: Size2::new(16, 16),
                },
            });
        }
    }

    // tile size in georeferenced units
    let tile_geo = (
        extents.width() * ts.width as f64 / size.width as f64,
        extents.height() * ts.height as f64 / size.height as f64,
    );
    let origin = (extents.ll.0, extents.ur.1);

    // last row/column tiles are smaller
    let last = Size2::new(
        size.width - (tiled.width - 1) * ts.width,
        size.height - (tiled.height - 1) * ts.height,
    );

    let doc = Mutex::new(doc);
    let results: Result<Vec<()>, BuildError> = (0..tiled.area())
        .into_par_iter()
        .map(|i| {
            let tile = (i % tiled.width, i / tiled.width);
            let last_x = tile.0 == tiled.width - 1;
            let last_y = tile.1 == tiled.height - 1;
            let px_size = Size2::new(
                if last_x { last.width } else { ts.width },
                if last_y { last.height } else { ts.height },
            );

            let ul = (
                origin.0 + tile_geo.0 * tile.0 as f64,
                origin.1 - tile_geo.1 * tile.1 as f64,
            );
            let lr = (
                if last_x { extents.ur.0 } else { ul.0 + tile_geo.0 },
                if last_y { extents.ll.1 } else { ul.1 - tile_geo.1 },
            );
            let tile_extents = Extents2::new(ul.0, lr.1, lr.0, ul.1);

            debug!(
                level = ovr_index,
                x = tile.0,
                y = tile.1,
                size = %px_size,
                "Processing overview tile"
            );

            // each worker opens its own handle; GDAL datasets are not
            // thread-safe
            let src = GeoDataset::open(src_path)?;
            let mut tmp = GeoDataset::create_mem(
                px_size,
                descriptor.bands,
                tmp_type,
                tile_extents,
                &descriptor.srs_wkt,
                tmp_nodata,
            )?;
            src.warp_into(&mut tmp, config.resampling)?;

            let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
            if empty_tile(config, &tmp)? {
                info!(
                    tile = format!("{ovr_index}-{}-{}", tile.0, tile.1),
                    progress = format!("{done}/{total}"),
                    "Processed tile [empty]"
                );
                return Ok(());
            }

            let tile_name = dir.join(format!("{}-{}.tif", tile.0, tile.1));
            let tile_path = output.join(&tile_name);
            let _ = std::fs::remove_file(&tile_path);
            tmp.save_geotiff(
                &tile_path,
                &[
                    ("TILED", "YES"),
                    ("COMPRESS", "DEFLATE"),
                    ("PREDICTOR", predictor),
                ],
            )?;

            let dst_rect = Rect::new(tile.0 * ts.width, tile.1 * ts.height, px_size.width, px_size.height);
            let properties = SourceProperties {
                size: px_size,
                data_type: xml::data_type_name(tmp_type).to_string(),
                block_size: px_size,
            };
            let tile_file = format!("{}-{}.tif", tile.0, tile.1);

            let mut doc = doc.lock().expect("vrt document mutex");
            for band in 0..descriptor.bands {
                doc.bands[band].sources.push(SimpleSource {
                    filename: tile_file.clone(),
                    relative: true,
                    shared: true,
                    band: band + 1,
                    mask_source: false,
                    src_rect: Rect::whole(px_size),
                    dst_rect,
                    properties: properties.clone(),
                });
            }
            if descriptor.mask != MaskType::AllValid {
                doc.mask_sources.push(SimpleSource {
                    filename: tile_file,
                    relative: true,
                    shared: true,
                    band: 1,
                    mask_source: true,
                    src_rect: Rect::whole(px_size),
                    dst_rect,
                    properties,
                });
            }
            drop(doc);

            info!(
                tile = format!("{ovr_index}-{}-{}", tile.0, tile.1),
                progress = format!("{done}/{total}"),
                "Processed tile [valid]"
            );
            Ok(())
        })
        .collect();
    results?;

    let mut doc = doc.into_inner().expect("vrt document mutex");
    // tile sources are relative to the level directory
    for band in &mut doc.bands {
        for source in &mut band.sources {
            if !source.filename.contains('/') {
                source.filename = dir.join(&source.filename).to_string_lossy().into_owned();
            }
        }
    }
    for source in &mut doc.mask_sources {
        if !source.filename.contains('/') {
            source.filename = dir.join(&source.filename).to_string_lossy().into_owned();
        }
    }
    doc.write(&ovr_path).map_err(|e| BuildError::io(&ovr_path, e))?;

    Ok(ovr_name)
}

/// A tile is empty when every pixel matches the background colour, or,
/// without a background, when its mask has no valid pixel.
fn empty_tile(config: &Config, tile: &GeoDataset) -> Result<bool, BuildError> {
    if let Some(background) = &config.background {
        let descriptor = tile.descriptor();
        for band in 1..=descriptor.bands {
            let value = background
                .get(band - 1)
                .or_else(|| background.last())
                .copied()
                .unwrap_or(0.0);
            let data = tile.read_band_f32(band)?;
            if data.iter().any(|&v| f64::from(v) != value) {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let mask = tile.read_mask(1)?;
    Ok(mask.iter().all(|&m| m == 0))
}

fn write_background(
    output: &Path,
    dir: &Path,
    descriptor: &crate::geo::Descriptor,
    extents: Extents2,
    background: &[f64],
) -> Result<(), BuildError> {
    let path = output.join(dir).join("bg.tif");
    let mut ds = GeoDataset::create_mem(
        Size2::new(16, 16),
        descriptor.bands,
        descriptor.data_type,
        extents,
        &descriptor.srs_wkt,
        None,
    )?;
    for band in 1..=descriptor.bands {
        let value = background
            .get(band - 1)
            .or_else(|| background.last())
            .copied()
            .unwrap_or(0.0);
        ds.write_band_f32(band, &vec![value as f32; 16 * 16])?;
    }
    ds.save_geotiff(&path, &[("COMPRESS", "DEFLATE")])?;
    Ok(())
}

fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());

    let path_parts: Vec<_> = path.components().collect();
    let base_parts: Vec<_> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == *b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part);
    }
    out
}

fn relink(target: &Path, link: &Path) -> Result<(), BuildError> {
    debug!(target = %target.display(), link = %link.display(), "Linking original dataset");
    let _ = std::fs::remove_file(link);
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link).map_err(|e| BuildError::io(link, e))?;
    #[cfg(not(unix))]
    std::fs::copy(target, link).map_err(|e| BuildError::io(link, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdal::raster::GdalDataType;

    #[test]
    fn test_relative_to_computes_climb() {
        let rel = relative_to(Path::new("/data/dems/world.tif"), Path::new("/store/rf/g/a"));
        assert_eq!(rel, PathBuf::from("../../../../data/dems/world.tif"));
    }

    #[test]
    fn test_copy_mode_is_rejected() {
        let config = Config {
            path_mode: PathToOriginalDataset::Copy,
            ..Config::default()
        };
        let dir = tempfile::TempDir::new().unwrap();
        let err = generate(Path::new("/nonexistent/input.tif"), dir.path(), &config).unwrap_err();
        match err {
            BuildError::Unsupported(message) => {
                assert_eq!(message, "dataset copy not implemented")
            }
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_widened_types() {
        let descriptor = crate::geo::Descriptor {
            size: Size2::new(1, 1),
            extents: Extents2::new(0.0, 0.0, 1.0, 1.0),
            srs_wkt: String::new(),
            bands: 1,
            data_type: GdalDataType::UInt8,
            nodata: None,
            mask: MaskType::Band,
            driver: "GTiff".to_string(),
            block_size: Size2::new(1, 1),
        };
        let (dtype, nodata) = widened_type(&descriptor);
        assert_eq!(dtype, GdalDataType::Int16);
        assert_eq!(nodata, Some(f64::from(i16::MIN)));

        let descriptor = crate::geo::Descriptor {
            data_type: GdalDataType::Float32,
            ..descriptor
        };
        let (dtype, nodata) = widened_type(&descriptor);
        assert_eq!(dtype, GdalDataType::Float64);
        assert_eq!(nodata, Some(f64::MIN));
    }
}
