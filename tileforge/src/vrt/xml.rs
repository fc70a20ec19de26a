//! VRT document writer.
//!
//! Emits XML conforming to GDAL's VRT schema: `<VRTDataset>` with
//! `<SRS>`, `<GeoTransform>`, per-band `<SimpleSource>` entries, an
//! optional per-dataset mask band and `<Overview>` cross-links. The
//! writer is deliberately independent of GDAL's own XML plumbing; its
//! output is plain text GDAL reads back.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use crate::coord::Size2;

/// Pixel rectangle in source/destination coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x_off: usize,
    pub y_off: usize,
    pub x_size: usize,
    pub y_size: usize,
}

impl Rect {
    pub fn new(x_off: usize, y_off: usize, x_size: usize, y_size: usize) -> Self {
        Self {
            x_off,
            y_off,
            x_size,
            y_size,
        }
    }

    pub fn whole(size: Size2) -> Self {
        Self::new(0, 0, size.width, size.height)
    }
}

/// Static properties of a referenced source file.
#[derive(Clone, Debug)]
pub struct SourceProperties {
    pub size: Size2,
    pub data_type: String,
    pub block_size: Size2,
}

/// One `<SimpleSource>` entry.
#[derive(Clone, Debug)]
pub struct SimpleSource {
    pub filename: String,
    /// Written as `relativeToVRT`; relative for symlinked originals.
    pub relative: bool,
    pub shared: bool,
    /// One-based source band.
    pub band: usize,
    /// Reference the band's mask (`mask,<band>`) instead of its data.
    pub mask_source: bool,
    pub src_rect: Rect,
    pub dst_rect: Rect,
    pub properties: SourceProperties,
}

impl SimpleSource {
    fn serialize(&self, out: &mut String) {
        out.push_str("    <SimpleSource>\n");
        let _ = writeln!(
            out,
            "      <SourceFilename relativeToVRT=\"{}\" shared=\"{}\">{}</SourceFilename>",
            self.relative as u8, self.shared as u8, self.filename
        );
        let _ = writeln!(
            out,
            "      <SourceBand>{}{}</SourceBand>",
            if self.mask_source { "mask," } else { "" },
            self.band
        );
        let _ = writeln!(
            out,
            "      <SrcRect xOff=\"{}\" yOff=\"{}\" xSize=\"{}\" ySize=\"{}\" />",
            self.src_rect.x_off, self.src_rect.y_off, self.src_rect.x_size, self.src_rect.y_size
        );
        let _ = writeln!(
            out,
            "      <DstRect xOff=\"{}\" yOff=\"{}\" xSize=\"{}\" ySize=\"{}\" />",
            self.dst_rect.x_off, self.dst_rect.y_off, self.dst_rect.x_size, self.dst_rect.y_size
        );
        let _ = writeln!(
            out,
            "      <SourceProperties RasterXSize=\"{}\" RasterYSize=\"{}\" DataType=\"{}\" BlockXSize=\"{}\" BlockYSize=\"{}\" />",
            self.properties.size.width,
            self.properties.size.height,
            self.properties.data_type,
            self.properties.block_size.width,
            self.properties.block_size.height
        );
        out.push_str("    </SimpleSource>\n");
    }
}

/// One `<VRTRasterBand>`.
#[derive(Clone, Debug)]
pub struct VrtBand {
    pub data_type: String,
    pub color_interp: String,
    pub nodata: Option<f64>,
    pub sources: Vec<SimpleSource>,
}

/// A whole VRT document.
#[derive(Clone, Debug)]
pub struct VrtDocument {
    pub size: Size2,
    pub srs_wkt: String,
    pub geo_transform: [f64; 6],
    pub bands: Vec<VrtBand>,
    /// Per-dataset mask band sources, written as a `VRTSourcedRasterBand`
    /// inside `<MaskBand>`.
    pub mask_sources: Vec<SimpleSource>,
}

impl VrtDocument {
    pub fn new(size: Size2, srs_wkt: impl Into<String>, geo_transform: [f64; 6]) -> Self {
        Self {
            size,
            srs_wkt: srs_wkt.into(),
            geo_transform,
            bands: Vec::new(),
            mask_sources: Vec::new(),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "<VRTDataset rasterXSize=\"{}\" rasterYSize=\"{}\">",
            self.size.width, self.size.height
        );
        let _ = writeln!(out, "  <SRS>{}</SRS>", xml_escape(&self.srs_wkt));
        let transform = self
            .geo_transform
            .iter()
            .map(|v| format!("{v:.16e}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  <GeoTransform>{transform}</GeoTransform>");

        for (index, band) in self.bands.iter().enumerate() {
            let _ = writeln!(
                out,
                "  <VRTRasterBand dataType=\"{}\" band=\"{}\">",
                band.data_type,
                index + 1
            );
            let _ = writeln!(out, "    <ColorInterp>{}</ColorInterp>", band.color_interp);
            if let Some(nodata) = band.nodata {
                let _ = writeln!(out, "    <NoDataValue>{nodata}</NoDataValue>");
            }
            for source in &band.sources {
                source.serialize(&mut out);
            }
            out.push_str("  </VRTRasterBand>\n");
        }

        if !self.mask_sources.is_empty() {
            out.push_str("  <MaskBand>\n");
            out.push_str("    <VRTRasterBand dataType=\"Byte\" subClass=\"VRTSourcedRasterBand\">\n");
            let mut inner = String::new();
            for source in &self.mask_sources {
                source.serialize(&mut inner);
            }
            // mask sources sit one level deeper
            for line in inner.lines() {
                let _ = writeln!(out, "  {line}");
            }
            out.push_str("    </VRTRasterBand>\n");
            out.push_str("  </MaskBand>\n");
        }

        out.push_str("</VRTDataset>\n");
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.to_xml().as_bytes())?;
        file.sync_all()
    }
}

/// Appends an `<Overview>` cross-link to every `<VRTRasterBand>` of an
/// already-written VRT file.
///
/// The overview path is stored relative when it is relative on input.
pub fn add_overview(vrt_path: &Path, overview_path: &Path) -> std::io::Result<()> {
    let text = std::fs::read_to_string(vrt_path)?;
    let relative = overview_path.is_relative();

    let mut band = 0usize;
    let mut in_mask = false;
    let mut out = String::with_capacity(text.len() + 256);
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("<MaskBand>") {
            in_mask = true;
        } else if trimmed.starts_with("</MaskBand>") {
            in_mask = false;
        }
        if trimmed.starts_with("</VRTRasterBand>") && !in_mask {
            band += 1;
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            let _ = writeln!(out, "{indent}  <Overview>");
            let _ = writeln!(
                out,
                "{indent}    <SourceFilename relativeToVRT=\"{}\">{}</SourceFilename>",
                relative as u8,
                overview_path.display()
            );
            let _ = writeln!(out, "{indent}    <SourceBand>{band}</SourceBand>");
            let _ = writeln!(out, "{indent}  </Overview>");
        }
        out.push_str(line);
        out.push('\n');
    }

    std::fs::write(vrt_path, out)
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// GDAL data type name for the VRT `dataType` attribute.
pub fn data_type_name(data_type: gdal::raster::GdalDataType) -> &'static str {
    use gdal::raster::GdalDataType;
    match data_type {
        GdalDataType::UInt8 => "Byte",
        GdalDataType::UInt16 => "UInt16",
        GdalDataType::Int16 => "Int16",
        GdalDataType::UInt32 => "UInt32",
        GdalDataType::Int32 => "Int32",
        GdalDataType::Float32 => "Float32",
        _ => "Float64",
    }
}
