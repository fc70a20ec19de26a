//! Thin GDAL access layer.
//!
//! Everything that touches `gdal`/`gdal-sys` directly lives here so the
//! producers stay free of version skew. Warping goes through the raw
//! `GDALChunkAndWarpImage` path; dataset metadata is summarised into a
//! [`Descriptor`] once per open.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;

use gdal::raster::GdalDataType;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata as _};
use gdal_sys::{
    CPLErr, GDALChunkAndWarpImage, GDALCreateGenImgProjTransformer2, GDALCreateWarpOperation,
    GDALCreateWarpOptions, GDALDestroyGenImgProjTransformer, GDALDestroyWarpOperation,
    GDALDestroyWarpOptions, GDALGenImgProjTransform, GDALResampleAlg,
    GDALWarpInitDefaultBandMapping,
};
use thiserror::Error;

use crate::coord::{Extents2, Size2};
use crate::raster::Resampling;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("gdal: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("dataset {path}: {message}")]
    Dataset { path: PathBuf, message: String },

    #[error("warp failed: {0}")]
    Warp(String),
}

pub type GeoResult<T> = Result<T, GeoError>;

/// How a dataset expresses validity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskType {
    /// Every pixel is valid.
    AllValid,
    /// Validity encoded by the nodata value.
    Nodata,
    /// A separate mask band.
    Band,
}

/// One-shot summary of an opened dataset.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub size: Size2,
    pub extents: Extents2,
    pub srs_wkt: String,
    pub bands: usize,
    pub data_type: GdalDataType,
    pub nodata: Option<f64>,
    pub mask: MaskType,
    pub driver: String,
    pub block_size: Size2,
}

impl Descriptor {
    /// Width of one pixel in georeferenced units.
    pub fn pixel_width(&self) -> f64 {
        self.extents.width() / self.size.width as f64
    }
}

/// An opened GDAL dataset plus its descriptor.
pub struct GeoDataset {
    ds: Dataset,
    descriptor: Descriptor,
}

impl GeoDataset {
    pub fn open(path: &Path) -> GeoResult<Self> {
        let ds = Dataset::open(path).map_err(|e| GeoError::Dataset {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let descriptor = describe(&ds)?;
        Ok(Self { ds, descriptor })
    }

    /// Wraps an already-created dataset (MEM or newly written file).
    pub fn from_dataset(ds: Dataset) -> GeoResult<Self> {
        let descriptor = describe(&ds)?;
        Ok(Self { ds, descriptor })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn dataset(&self) -> &Dataset {
        &self.ds
    }

    /// Creates an in-memory dataset with the given shape.
    pub fn create_mem(
        size: Size2,
        bands: usize,
        data_type: GdalDataType,
        extents: Extents2,
        srs_wkt: &str,
        nodata: Option<f64>,
    ) -> GeoResult<Self> {
        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut ds = match data_type {
            GdalDataType::UInt8 => driver.create_with_band_type::<u8, _>("", size.width, size.height, bands)?,
            GdalDataType::UInt16 => driver.create_with_band_type::<u16, _>("", size.width, size.height, bands)?,
            GdalDataType::Int16 => driver.create_with_band_type::<i16, _>("", size.width, size.height, bands)?,
            GdalDataType::UInt32 => driver.create_with_band_type::<u32, _>("", size.width, size.height, bands)?,
            GdalDataType::Int32 => driver.create_with_band_type::<i32, _>("", size.width, size.height, bands)?,
            GdalDataType::Float32 => driver.create_with_band_type::<f32, _>("", size.width, size.height, bands)?,
            _ => driver.create_with_band_type::<f64, _>("", size.width, size.height, bands)?,
        };

        ds.set_geo_transform(&geo_transform(extents, size))?;
        ds.set_projection(srs_wkt)?;
        if let Some(nodata) = nodata {
            for band in 1..=bands {
                let mut b = ds.rasterband(band)?;
                b.set_no_data_value(Some(nodata))?;
                b.fill(nodata, None)?;
            }
        }
        Self::from_dataset(ds)
    }

    /// Warps this dataset into `dst` with the given resampling.
    ///
    /// Both datasets carry their SRS and geotransform; GDAL derives the
    /// pixel mapping from those.
    pub fn warp_into(&self, dst: &mut GeoDataset, resampling: Resampling) -> GeoResult<()> {
        let bands = self.descriptor.bands.min(dst.descriptor.bands) as i32;
        let (dst_w, dst_h) = (
            dst.descriptor.size.width as i32,
            dst.descriptor.size.height as i32,
        );

        unsafe {
            let warp_options = GDALCreateWarpOptions();
            (*warp_options).eResampleAlg = resample_alg(resampling);
            (*warp_options).hSrcDS = self.ds.c_dataset();
            (*warp_options).hDstDS = dst.ds.c_dataset();
            (*warp_options).nDstAlphaBand = 0;
            (*warp_options).nSrcAlphaBand = 0;

            let transformer = GDALCreateGenImgProjTransformer2(
                self.ds.c_dataset(),
                dst.ds.c_dataset(),
                ptr::null_mut(),
            );
            if transformer.is_null() {
                GDALDestroyWarpOptions(warp_options);
                return Err(GeoError::Warp(
                    "cannot create image projection transformer".to_string(),
                ));
            }
            (*warp_options).pTransformerArg = transformer;
            (*warp_options).pfnTransformer = Some(GDALGenImgProjTransform);

            GDALWarpInitDefaultBandMapping(warp_options, bands);

            let operation = GDALCreateWarpOperation(warp_options);
            let result = GDALChunkAndWarpImage(operation, 0, 0, dst_w, dst_h);

            GDALDestroyWarpOperation(operation);
            GDALDestroyGenImgProjTransformer(transformer);
            (*warp_options).pTransformerArg = ptr::null_mut();
            GDALDestroyWarpOptions(warp_options);

            if result != CPLErr::CE_None {
                return Err(GeoError::Warp(format!(
                    "ChunkAndWarpImage failed with error code {result:?}"
                )));
            }
        }
        Ok(())
    }

    /// Reads one band as `u8`, row-major.
    pub fn read_band_u8(&self, band: usize) -> GeoResult<Vec<u8>> {
        let size = self.descriptor.size;
        let buffer = self.ds.rasterband(band)?.read_as::<u8>(
            (0, 0),
            (size.width, size.height),
            (size.width, size.height),
            None,
        )?;
        Ok(buffer.data().to_vec())
    }

    /// Reads one band as `f32`, row-major.
    pub fn read_band_f32(&self, band: usize) -> GeoResult<Vec<f32>> {
        let size = self.descriptor.size;
        let buffer = self.ds.rasterband(band)?.read_as::<f32>(
            (0, 0),
            (size.width, size.height),
            (size.width, size.height),
            None,
        )?;
        Ok(buffer.data().to_vec())
    }

    /// Reads the validity mask of `band` (255 = valid).
    pub fn read_mask(&self, band: usize) -> GeoResult<Vec<u8>> {
        let size = self.descriptor.size;
        let band = self.ds.rasterband(band)?;
        let mask = band.open_mask_band()?;
        let buffer = mask.read_as::<u8>(
            (0, 0),
            (size.width, size.height),
            (size.width, size.height),
            None,
        )?;
        Ok(buffer.data().to_vec())
    }

    /// Writes one `u8` band, row-major.
    pub fn write_band_u8(&mut self, band: usize, data: &[u8]) -> GeoResult<()> {
        let size = self.descriptor.size;
        let mut buffer = gdal::raster::Buffer::new((size.width, size.height), data.to_vec());
        self.ds
            .rasterband(band)?
            .write((0, 0), (size.width, size.height), &mut buffer)?;
        Ok(())
    }

    /// Writes one `f32` band, row-major.
    pub fn write_band_f32(&mut self, band: usize, data: &[f32]) -> GeoResult<()> {
        let size = self.descriptor.size;
        let mut buffer = gdal::raster::Buffer::new((size.width, size.height), data.to_vec());
        self.ds
            .rasterband(band)?
            .write((0, 0), (size.width, size.height), &mut buffer)?;
        Ok(())
    }

    /// Copies this dataset into a tiled GeoTIFF at `path`.
    pub fn save_geotiff(&self, path: &Path, creation_options: &[(&str, &str)]) -> GeoResult<()> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let options: Vec<gdal::raster::RasterCreationOption<'_>> = creation_options
            .iter()
            .map(|(key, value)| gdal::raster::RasterCreationOption { key, value })
            .collect();
        self.ds.create_copy(&driver, path, &options)?;
        Ok(())
    }

    /// Samples band 1 at a georeferenced point.
    ///
    /// Returns `None` outside the dataset or on nodata.
    pub fn sample(&self, x: f64, y: f64) -> GeoResult<Option<f64>> {
        let d = &self.descriptor;
        let px = ((x - d.extents.ll.0) / d.pixel_width()).floor() as isize;
        let py = ((d.extents.ur.1 - y) / (d.extents.height() / d.size.height as f64)).floor()
            as isize;
        if px < 0 || py < 0 || px >= d.size.width as isize || py >= d.size.height as isize {
            return Ok(None);
        }
        let buffer = self
            .ds
            .rasterband(1)?
            .read_as::<f64>((px, py), (1, 1), (1, 1), None)?;
        let value = buffer.data()[0];
        if let Some(nodata) = d.nodata {
            if value == nodata {
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// List of files backing this dataset (main file plus sidecars).
    pub fn files(&self) -> Vec<PathBuf> {
        self.ds
            .metadata_domain("FILES")
            .map(|files| files.iter().map(PathBuf::from).collect())
            .unwrap_or_default()
    }
}

fn describe(ds: &Dataset) -> GeoResult<Descriptor> {
    let (width, height) = ds.raster_size();
    let transform = ds.geo_transform()?;
    let extents = Extents2::new(
        transform[0],
        transform[3] + height as f64 * transform[5],
        transform[0] + width as f64 * transform[1],
        transform[3],
    );
    let bands = ds.raster_count();
    let band = ds.rasterband(1)?;
    let (block_w, block_h) = band.block_size();
    let mask_flags = band.mask_flags()?;
    let mask = if mask_flags.is_all_valid() {
        MaskType::AllValid
    } else if mask_flags.is_nodata() {
        MaskType::Nodata
    } else {
        MaskType::Band
    };

    Ok(Descriptor {
        size: Size2::new(width, height),
        extents,
        srs_wkt: ds.projection(),
        bands,
        data_type: band.band_type(),
        nodata: band.no_data_value(),
        mask,
        driver: ds.driver().short_name(),
        block_size: Size2::new(block_w, block_h),
    })
}

/// Widened pixel type for temporary datasets warped from a source with
/// a separate mask band: 8→16, 16→32, 32→64 bits; nodata becomes the new
/// type's lowest value so real data can never collide with it.
pub fn widened_type(descriptor: &Descriptor) -> (GdalDataType, Option<f64>) {
    if descriptor.mask != MaskType::Band {
        return (descriptor.data_type, descriptor.nodata);
    }
    match descriptor.data_type {
        GdalDataType::UInt8 => (GdalDataType::Int16, Some(f64::from(i16::MIN))),
        GdalDataType::UInt16 | GdalDataType::Int16 => {
            (GdalDataType::Int32, Some(f64::from(i32::MIN)))
        }
        GdalDataType::UInt32 | GdalDataType::Int32 | GdalDataType::Float32 => {
            (GdalDataType::Float64, Some(f64::MIN))
        }
        _ => (GdalDataType::Float64, Some(f64::MIN)),
    }
}

/// Geotransform for north-up extents at the given pixel size.
pub fn geo_transform(extents: Extents2, size: Size2) -> [f64; 6] {
    [
        extents.ll.0,
        extents.width() / size.width as f64,
        0.0,
        extents.ur.1,
        0.0,
        -(extents.height() / size.height as f64),
    ]
}

/// Resolves a user SRS string ("EPSG:3857", proj4, WKT) to WKT.
pub fn srs_to_wkt(definition: &str) -> GeoResult<String> {
    let srs = SpatialRef::from_definition(definition)?;
    Ok(srs.to_wkt()?)
}

fn resample_alg(resampling: Resampling) -> GDALResampleAlg::Type {
    match resampling {
        Resampling::Nearest => GDALResampleAlg::GRA_NearestNeighbour,
        Resampling::Bilinear => GDALResampleAlg::GRA_Bilinear,
        Resampling::Cubic => GDALResampleAlg::GRA_Cubic,
        Resampling::CubicSpline => GDALResampleAlg::GRA_CubicSpline,
        Resampling::Lanczos => GDALResampleAlg::GRA_Lanczos,
        Resampling::Average => GDALResampleAlg::GRA_Average,
    }
}

/// Runs `GDALDEMProcessing` on an already-warped DEM dataset.
///
/// `alg` is the processing name (`hillshade`, `slope`, ...); `options`
/// are the usual gdaldem command-line switches.
pub fn dem_processing(
    src: &GeoDataset,
    alg: &str,
    options: &[String],
    color_file: Option<&Path>,
) -> GeoResult<GeoDataset> {
    let alg_c = CString::new(alg).expect("algorithm name has no NUL");
    let dest_c = CString::new("/vsimem/tileforge-dem-out.tif").expect("static path");
    let color_c = color_file
        .map(|p| CString::new(p.to_string_lossy().into_owned()).expect("path has no NUL"));

    let option_cstrings: Vec<CString> = options
        .iter()
        .map(|o| CString::new(o.as_str()).expect("option has no NUL"))
        .collect();
    let mut option_ptrs: Vec<*mut libc::c_char> = option_cstrings
        .iter()
        .map(|c| c.as_ptr() as *mut libc::c_char)
        .collect();
    option_ptrs.push(ptr::null_mut());

    unsafe {
        let parsed = gdal_sys::GDALDEMProcessingOptionsNew(option_ptrs.as_mut_ptr(), ptr::null_mut());
        if parsed.is_null() {
            return Err(GeoError::Warp("invalid gdaldem options".to_string()));
        }

        let mut usage_error: libc::c_int = 0;
        let out = gdal_sys::GDALDEMProcessing(
            dest_c.as_ptr(),
            src.ds.c_dataset(),
            alg_c.as_ptr(),
            color_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            parsed,
            &mut usage_error,
        );
        gdal_sys::GDALDEMProcessingOptionsFree(parsed);

        if out.is_null() || usage_error != 0 {
            return Err(GeoError::Warp(format!(
                "GDALDEMProcessing({alg}) failed (usage error {usage_error})"
            )));
        }

        let ds = Dataset::from_c_dataset(out);
        GeoDataset::from_dataset(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_transform_shape() {
        let transform = geo_transform(Extents2::new(0.0, 0.0, 100.0, 50.0), Size2::new(200, 100));
        assert_eq!(transform[0], 0.0);
        assert_eq!(transform[1], 0.5);
        assert_eq!(transform[3], 50.0);
        assert_eq!(transform[5], -0.5);
    }
}
