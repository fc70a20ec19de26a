//! Driver-specific resource definitions.
//!
//! Each driver owns an opaque payload with its own diff function. The
//! diff distinguishes incompatible changes (a different source dataset
//! needs a rebuilt prepared artifact) from revision bumps (same artifact,
//! different output bytes) and safe edits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coord::Lod;
use crate::raster::{DemAlgorithm, RasterFormat, Resampling};

use super::{Changed, GeneratorId, GeneratorKind};

fn default_format() -> RasterFormat {
    RasterFormat::Jpg
}

fn default_samples() -> u32 {
    10
}

fn default_navtile_samples() -> u32 {
    33
}

fn default_z_factor() -> f64 {
    1.0
}

/// `tms-raster`: plain warped orthophoto tiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmsRasterDef {
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default = "default_format")]
    pub format: RasterFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resampling: Option<Resampling>,
    #[serde(default)]
    pub transparent: bool,
}

impl TmsRasterDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset || self.mask != old.mask {
            return Changed::Yes;
        }
        if self.format != old.format || self.resampling != old.resampling {
            return Changed::RevisionBump;
        }
        if self.transparent != old.transparent {
            return Changed::Safe;
        }
        Changed::No
    }
}

/// `tms-gdaldem`: DEM derivation tiles (hillshade, slope, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmsGdaldemDef {
    pub dataset: String,
    pub processing: DemAlgorithm,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "geoidGrid")]
    pub geoid_grid: Option<String>,
    #[serde(default = "default_format")]
    pub format: RasterFormat,
}

impl TmsGdaldemDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset || self.geoid_grid != old.geoid_grid {
            return Changed::Yes;
        }
        if self.processing != old.processing
            || self.options != old.options
            || self.format != old.format
        {
            return Changed::RevisionBump;
        }
        Changed::No
    }
}

/// One landcover class used to flatten or shade pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandcoverClass {
    pub value: u8,
    #[serde(default)]
    pub flat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shininess: Option<u8>,
}

/// Optional landcover companion dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandcoverDef {
    pub dataset: String,
    #[serde(default)]
    pub classes: Vec<LandcoverClass>,
}

/// `tms-normalmap`: per-pixel terrain normals from a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmsNormalMapDef {
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landcover: Option<LandcoverDef>,
    #[serde(default = "default_z_factor", rename = "zFactor")]
    pub z_factor: f64,
    #[serde(default, rename = "invertRelief")]
    pub invert_relief: bool,
}

impl TmsNormalMapDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset {
            return Changed::Yes;
        }
        if self.landcover != old.landcover
            || self.z_factor != old.z_factor
            || self.invert_relief != old.invert_relief
        {
            return Changed::RevisionBump;
        }
        Changed::No
    }
}

/// `tms-specularmap`: specular reflectance from orthophoto + landcover.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmsSpecularMapDef {
    pub dataset: String,
    pub landcover: LandcoverDef,
    #[serde(rename = "shininessBits")]
    pub shininess_bits: u8,
}

impl TmsSpecularMapDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset {
            return Changed::Yes;
        }
        if self.landcover != old.landcover || self.shininess_bits != old.shininess_bits {
            return Changed::RevisionBump;
        }
        Changed::No
    }
}

/// `surface-dem`: terrain mesh surface backed by a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceDemDef {
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "geoidGrid")]
    pub geoid_grid: Option<String>,
    #[serde(rename = "nominalTexelSize")]
    pub nominal_texel_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mergeBottomLod")]
    pub merge_bottom_lod: Option<Lod>,
    #[serde(default = "default_samples", rename = "samplesPerSide")]
    pub samples_per_side: u32,
    #[serde(default = "default_navtile_samples", rename = "navtileSamples")]
    pub navtile_samples: u32,
    /// Bound layer shown by the introspection browser, `group-id` form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection: Option<String>,
}

impl SurfaceDemDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset
            || self.mask != old.mask
            || self.geoid_grid != old.geoid_grid
        {
            return Changed::Yes;
        }
        if self.samples_per_side != old.samples_per_side
            || self.navtile_samples != old.navtile_samples
        {
            return Changed::RevisionBump;
        }
        if self.nominal_texel_size != old.nominal_texel_size
            || self.merge_bottom_lod != old.merge_bottom_lod
            || self.introspection != old.introspection
        {
            return Changed::Safe;
        }
        Changed::No
    }
}

/// `surface-spheroid`: constant-zero surface over the whole frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSpheroidDef {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "geoidGrid")]
    pub geoid_grid: Option<String>,
    #[serde(rename = "nominalTexelSize")]
    pub nominal_texel_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mergeBottomLod")]
    pub merge_bottom_lod: Option<Lod>,
}

impl SurfaceSpheroidDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.geoid_grid != old.geoid_grid {
            return Changed::Yes;
        }
        if self.nominal_texel_size != old.nominal_texel_size
            || self.merge_bottom_lod != old.merge_bottom_lod
        {
            return Changed::Safe;
        }
        Changed::No
    }
}

/// DEM stack entry for heightcoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemRef {
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "geoidGrid")]
    pub geoid_grid: Option<String>,
}

/// `geodata`: vector layers draped over a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeodataDef {
    pub dataset: String,
    pub dem: DemRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Surface resource whose DEM this geodata depends on, `group/id`.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "demResource")]
    pub dem_resource: Option<String>,
}

impl GeodataDef {
    fn changed(&self, old: &Self) -> Changed {
        if self.dataset != old.dataset || self.dem != old.dem {
            return Changed::Yes;
        }
        if self.layers != old.layers || self.style != old.style {
            return Changed::RevisionBump;
        }
        if self.dem_resource != old.dem_resource {
            return Changed::Safe;
        }
        Changed::No
    }
}

/// The driver-specific payload of a resource.
#[derive(Clone, Debug, PartialEq)]
pub enum Definition {
    TmsRaster(TmsRasterDef),
    TmsGdaldem(TmsGdaldemDef),
    TmsNormalMap(TmsNormalMapDef),
    TmsSpecularMap(TmsSpecularMapDef),
    SurfaceDem(SurfaceDemDef),
    SurfaceSpheroid(SurfaceSpheroidDef),
    Geodata(GeodataDef),
}

impl Definition {
    /// Parses the payload for the driver selected by `generator`.
    pub fn parse(generator: &GeneratorId, value: &Value) -> Result<Self, String> {
        let err = |e: serde_json::Error| format!("definition for {generator}: {e}");
        match (generator.kind, generator.driver.as_str()) {
            (GeneratorKind::Tms, "tms-raster") | (GeneratorKind::Tms, "tms-raster-patchwork") => {
                Ok(Self::TmsRaster(
                    serde_json::from_value(value.clone()).map_err(err)?,
                ))
            }
            (GeneratorKind::Tms, "tms-gdaldem") => Ok(Self::TmsGdaldem(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (GeneratorKind::Tms, "tms-normalmap") => Ok(Self::TmsNormalMap(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (GeneratorKind::Tms, "tms-specularmap") => Ok(Self::TmsSpecularMap(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (GeneratorKind::Surface, "surface-dem") => Ok(Self::SurfaceDem(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (GeneratorKind::Surface, "surface-spheroid") => Ok(Self::SurfaceSpheroid(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (GeneratorKind::Geodata, "geodata-vector") => Ok(Self::Geodata(
                serde_json::from_value(value.clone()).map_err(err)?,
            )),
            (kind, driver) => Err(format!("no driver registered for <{kind}/{driver}>")),
        }
    }

    /// Serialises the payload back to the catalogue form.
    pub fn to_json(&self) -> Value {
        match self {
            Self::TmsRaster(d) => serde_json::to_value(d),
            Self::TmsGdaldem(d) => serde_json::to_value(d),
            Self::TmsNormalMap(d) => serde_json::to_value(d),
            Self::TmsSpecularMap(d) => serde_json::to_value(d),
            Self::SurfaceDem(d) => serde_json::to_value(d),
            Self::SurfaceSpheroid(d) => serde_json::to_value(d),
            Self::Geodata(d) => serde_json::to_value(d),
        }
        .expect("definition serialisation is infallible")
    }

    /// The driver's own diff; `Yes` when the variants differ.
    pub fn changed(&self, old: &Definition) -> Changed {
        match (self, old) {
            (Self::TmsRaster(a), Self::TmsRaster(b)) => a.changed(b),
            (Self::TmsGdaldem(a), Self::TmsGdaldem(b)) => a.changed(b),
            (Self::TmsNormalMap(a), Self::TmsNormalMap(b)) => a.changed(b),
            (Self::TmsSpecularMap(a), Self::TmsSpecularMap(b)) => a.changed(b),
            (Self::SurfaceDem(a), Self::SurfaceDem(b)) => a.changed(b),
            (Self::SurfaceSpheroid(a), Self::SurfaceSpheroid(b)) => a.changed(b),
            (Self::Geodata(a), Self::Geodata(b)) => a.changed(b),
            _ => Changed::Yes,
        }
    }

    /// Whether the catalogue entry must carry lod/tile ranges.
    pub fn needs_ranges(&self) -> bool {
        !matches!(self, Self::SurfaceSpheroid(_))
    }

    /// Whether credit changes invalidate the resource.
    ///
    /// Surfaces bake credits into the prepared tileset properties.
    pub fn frozen_credits(&self) -> bool {
        matches!(self, Self::SurfaceDem(_) | Self::SurfaceSpheroid(_))
    }

    /// `(group, id)` pairs of resources this definition depends on.
    pub fn needs_resources(&self) -> Vec<(String, String)> {
        match self {
            Self::Geodata(d) => d
                .dem_resource
                .iter()
                .filter_map(|s| {
                    s.split_once('/')
                        .map(|(g, i)| (g.to_string(), i.to_string()))
                })
                .collect(),
            Self::SurfaceDem(d) => d
                .introspection
                .iter()
                .filter_map(|s| {
                    s.split_once('/')
                        .map(|(g, i)| (g.to_string(), i.to_string()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gdaldem(processing: DemAlgorithm) -> Definition {
        Definition::TmsGdaldem(TmsGdaldemDef {
            dataset: "/data/dem.vrt".to_string(),
            processing,
            options: vec![],
            geoid_grid: None,
            format: RasterFormat::Jpg,
        })
    }

    #[test]
    fn test_parse_tms_raster() {
        let generator = GeneratorId::new(GeneratorKind::Tms, "tms-raster");
        let def = Definition::parse(
            &generator,
            &json!({"dataset": "/data/ortho.tif", "format": "png"}),
        )
        .unwrap();
        match def {
            Definition::TmsRaster(d) => {
                assert_eq!(d.dataset, "/data/ortho.tif");
                assert_eq!(d.format, RasterFormat::Png);
                assert!(!d.transparent);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_driver_fails() {
        let generator = GeneratorId::new(GeneratorKind::Tms, "tms-unknown");
        assert!(Definition::parse(&generator, &json!({})).is_err());
    }

    #[test]
    fn test_processing_change_is_revision_bump() {
        let before = gdaldem(DemAlgorithm::Hillshade);
        let after = gdaldem(DemAlgorithm::Slope);
        assert_eq!(after.changed(&before), Changed::RevisionBump);
    }

    #[test]
    fn test_dataset_change_is_yes() {
        let before = gdaldem(DemAlgorithm::Hillshade);
        let after = Definition::TmsGdaldem(TmsGdaldemDef {
            dataset: "/data/other.vrt".to_string(),
            processing: DemAlgorithm::Hillshade,
            options: vec![],
            geoid_grid: None,
            format: RasterFormat::Jpg,
        });
        assert_eq!(after.changed(&before), Changed::Yes);
    }

    #[test]
    fn test_variant_swap_is_yes() {
        let raster = Definition::TmsRaster(TmsRasterDef {
            dataset: "/d".to_string(),
            mask: None,
            format: RasterFormat::Jpg,
            resampling: None,
            transparent: false,
        });
        assert_eq!(raster.changed(&gdaldem(DemAlgorithm::Hillshade)), Changed::Yes);
    }

    #[test]
    fn test_spheroid_needs_no_ranges() {
        let spheroid = Definition::SurfaceSpheroid(SurfaceSpheroidDef {
            geoid_grid: None,
            nominal_texel_size: 50.0,
            merge_bottom_lod: None,
        });
        assert!(!spheroid.needs_ranges());
        assert!(spheroid.frozen_credits());
        assert!(gdaldem(DemAlgorithm::Hillshade).needs_ranges());
    }

    #[test]
    fn test_surface_texel_size_is_safe() {
        let mk = |texel: f64| {
            Definition::SurfaceDem(SurfaceDemDef {
                dataset: "/data/dem".to_string(),
                mask: None,
                geoid_grid: None,
                nominal_texel_size: texel,
                merge_bottom_lod: None,
                samples_per_side: 10,
                navtile_samples: 33,
                introspection: None,
            })
        };
        assert_eq!(mk(20.0).changed(&mk(10.0)), Changed::Safe);
    }

    #[test]
    fn test_definition_round_trip() {
        let generator = GeneratorId::new(GeneratorKind::Surface, "surface-dem");
        let payload = json!({
            "dataset": "/data/dem.tif",
            "nominalTexelSize": 25.0,
            "mergeBottomLod": 14,
            "geoidGrid": "egm96_15.gtx"
        });
        let def = Definition::parse(&generator, &payload).unwrap();
        let back = def.to_json();
        let reparsed = Definition::parse(&generator, &back).unwrap();
        assert_eq!(def, reparsed);
    }

    #[test]
    fn test_needs_resources_injects_pairs() {
        let generator = GeneratorId::new(GeneratorKind::Geodata, "geodata-vector");
        let def = Definition::parse(
            &generator,
            &json!({
                "dataset": "/data/roads.shp",
                "dem": {"dataset": "/data/dem.vrt"},
                "demResource": "terrain/alps"
            }),
        )
        .unwrap();
        assert_eq!(
            def.needs_resources(),
            vec![("terrain".to_string(), "alps".to_string())]
        );
    }
}
