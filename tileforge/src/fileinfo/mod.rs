//! Tile artifact naming.
//!
//! The HTTP collaborator parses paths; this module owns the last
//! segment: `{lod}-{x}-{y}.{ext}` plus an optional flavor suffix
//! (`.debug`, `.raw`). Producers receive the parsed [`TileFileInfo`]
//! and never see raw strings. URL composition appends the revision
//! query (`?gr=<generatorRevision>&r=<resourceRevision>`) so cached
//! bytes carry the correct version tag.

use crate::coord::TileId;
use crate::raster::RasterFormat;
use crate::resource::FileClass;

/// What artifact of a tile is requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileArtifact {
    /// Raster tile in an image format.
    Image(RasterFormat),
    /// Coverage mask.
    Mask,
    /// Structured metatile.
    Meta,
    /// 2D metatile raster.
    Meta2d,
    /// Surface mesh.
    Mesh,
    /// Navigation tile.
    Navtile,
    /// Normal-map tile.
    Normals,
    /// Cesium-style terrain tile (gzipped).
    Terrain,
    /// Credits payload.
    Credits,
}

impl TileArtifact {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image(format) => format.extension(),
            Self::Mask => "mask",
            Self::Meta => "meta",
            Self::Meta2d => "2dmeta",
            Self::Mesh => "mesh",
            Self::Navtile => "navtile",
            Self::Normals => "normals",
            Self::Terrain => "terrain",
            Self::Credits => "credits",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Image(format) => format.content_type(),
            Self::Mask | Self::Meta2d => "image/png",
            Self::Normals => "image/webp",
            Self::Meta | Self::Mesh | Self::Navtile | Self::Terrain => "application/octet-stream",
            Self::Credits => "application/json; charset=utf-8",
        }
    }

    /// Cache class this artifact belongs to.
    pub fn file_class(&self) -> FileClass {
        FileClass::Data
    }
}

/// Request flavor; `Debug` renders diagnostics, `Raw` skips wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Flavor {
    #[default]
    Regular,
    Raw,
    Debug,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Raw => "raw",
            Self::Debug => "debug",
        }
    }
}

/// A parsed tile artifact request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileFileInfo {
    pub tile: TileId,
    pub artifact: TileArtifact,
    pub flavor: Flavor,
}

/// Parses `{lod}-{x}-{y}.{ext}[.debug|.raw]`.
pub fn parse_tile_filename(name: &str) -> Option<TileFileInfo> {
    let (stem, rest) = name.split_once('.')?;

    let mut parts = stem.split('-');
    let lod: u8 = parts.next()?.parse().ok()?;
    let x: u32 = parts.next()?.parse().ok()?;
    let y: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let (ext, flavor) = match rest.rsplit_once('.') {
        Some((ext, "debug")) => (ext, Flavor::Debug),
        Some((ext, "raw")) => (ext, Flavor::Raw),
        _ => (rest, Flavor::Regular),
    };

    let artifact = match ext {
        "mask" => TileArtifact::Mask,
        "meta" => TileArtifact::Meta,
        "2dmeta" => TileArtifact::Meta2d,
        "mesh" => TileArtifact::Mesh,
        "navtile" => TileArtifact::Navtile,
        "normals" => TileArtifact::Normals,
        "terrain" => TileArtifact::Terrain,
        "credits" => TileArtifact::Credits,
        other => TileArtifact::Image(RasterFormat::from_extension(other)?),
    };

    Some(TileFileInfo {
        tile: TileId::new(lod, x, y),
        artifact,
        flavor,
    })
}

/// Bound-layer URL template with `{lod}-{x}-{y}` placeholders and the
/// revision query.
pub fn tile_url_template(
    extension: &str,
    generator_revision: u32,
    resource_revision: u32,
) -> String {
    format!("{{lod}}-{{x}}-{{y}}.{extension}?gr={generator_revision}&r={resource_revision}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_tile() {
        let info = parse_tile_filename("10-5-7.jpg").unwrap();
        assert_eq!(info.tile, TileId::new(10, 5, 7));
        assert_eq!(info.artifact, TileArtifact::Image(RasterFormat::Jpg));
        assert_eq!(info.flavor, Flavor::Regular);
    }

    #[test]
    fn test_parse_artifacts() {
        assert_eq!(
            parse_tile_filename("3-1-2.mask").unwrap().artifact,
            TileArtifact::Mask
        );
        assert_eq!(
            parse_tile_filename("3-1-2.meta").unwrap().artifact,
            TileArtifact::Meta
        );
        assert_eq!(
            parse_tile_filename("3-1-2.terrain").unwrap().artifact,
            TileArtifact::Terrain
        );
        assert_eq!(
            parse_tile_filename("3-1-2.navtile").unwrap().artifact,
            TileArtifact::Navtile
        );
    }

    #[test]
    fn test_parse_flavors() {
        assert_eq!(
            parse_tile_filename("3-1-2.meta.debug").unwrap().flavor,
            Flavor::Debug
        );
        assert_eq!(
            parse_tile_filename("3-1-2.mesh.raw").unwrap().flavor,
            Flavor::Raw
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_tile_filename("tile.jpg").is_none());
        assert!(parse_tile_filename("1-2.jpg").is_none());
        assert!(parse_tile_filename("1-2-3-4.jpg").is_none());
        assert!(parse_tile_filename("1-2-3.exe").is_none());
        assert!(parse_tile_filename("1-2-3").is_none());
    }

    #[test]
    fn test_url_template_carries_revisions() {
        assert_eq!(
            tile_url_template("jpg", 0, 1),
            "{lod}-{x}-{y}.jpg?gr=0&r=1"
        );
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            TileArtifact::Image(RasterFormat::Webp).content_type(),
            "image/webp"
        );
        assert_eq!(TileArtifact::Mask.content_type(), "image/png");
        assert_eq!(TileArtifact::Terrain.content_type(), "application/octet-stream");
    }
}
