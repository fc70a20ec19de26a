//! Terrain geometry: DEM-grid meshes, skirts and serialisation.
//!
//! A surface tile's mesh is a regular grid sampled from the warped DEM;
//! void samples (NaN) drop the incident faces. A skirt around the mesh
//! perimeter hides crack seams between neighbouring tiles. The binary
//! framings here are stable and versioned; the full downstream formats
//! (VTS mesh, quantized mesh) belong to external collaborators.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::coord::Extents2;

mod metatile;
mod navtile;

pub use metatile::{Metatile, MetatileNode, META_FLAG_GEOMETRY, META_FLAG_NAVTILE};
pub use navtile::{encode_navtile, HeightRange, Navtile};

/// Triangle mesh in the tile's local frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
    /// Bound-layer id attached to the submesh.
    pub texture_layer: Option<u16>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Sum of triangle areas projected to the xy plane.
    pub fn area_xy(&self) -> f64 {
        self.faces
            .iter()
            .map(|&[a, b, c]| {
                let (a, b, c) = (
                    self.vertices[a as usize],
                    self.vertices[b as usize],
                    self.vertices[c as usize],
                );
                (((b[0] - a[0]) * (c[1] - a[1])) - ((c[0] - a[0]) * (b[1] - a[1]))).abs() / 2.0
            })
            .sum()
    }

    /// Vertical range of the mesh, `None` when empty.
    pub fn height_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for v in &self.vertices {
            range = Some(match range {
                None => (v[2], v[2]),
                Some((min, max)) => (min.min(v[2]), max.max(v[2])),
            });
        }
        range
    }
}

/// Builds a grid mesh over `extents` from `samples × samples` heights.
///
/// `heights` is row-major, north row first; NaN marks void samples and
/// removes the incident faces. `void_height`, when given, replaces NaN
/// instead (terrain interface wants a watertight zero surface).
pub fn mesh_from_grid(
    extents: Extents2,
    heights: &[f32],
    samples: usize,
    void_height: Option<f64>,
) -> Mesh {
    assert!(samples >= 2, "a grid mesh needs at least 2 samples per side");
    assert_eq!(heights.len(), samples * samples);

    let mut mesh = Mesh::default();
    let mut index = vec![u32::MAX; samples * samples];

    for row in 0..samples {
        for col in 0..samples {
            let raw = heights[row * samples + col];
            let z = if raw.is_nan() {
                match void_height {
                    Some(height) => height,
                    None => continue,
                }
            } else {
                f64::from(raw)
            };
            let fx = col as f64 / (samples - 1) as f64;
            let fy = row as f64 / (samples - 1) as f64;
            let x = extents.ll.0 + fx * extents.width();
            let y = extents.ur.1 - fy * extents.height();
            index[row * samples + col] = mesh.vertices.len() as u32;
            mesh.vertices.push([x, y, z]);
        }
    }

    for row in 0..samples - 1 {
        for col in 0..samples - 1 {
            let i00 = index[row * samples + col];
            let i01 = index[row * samples + col + 1];
            let i10 = index[(row + 1) * samples + col];
            let i11 = index[(row + 1) * samples + col + 1];
            if i00 != u32::MAX && i01 != u32::MAX && i10 != u32::MAX {
                mesh.faces.push([i00, i01, i10]);
            }
            if i01 != u32::MAX && i11 != u32::MAX && i10 != u32::MAX {
                mesh.faces.push([i01, i11, i10]);
            }
        }
    }

    mesh
}

/// Adds a perimeter skirt dropped by `skirt_height`.
///
/// Boundary edges (used by exactly one face) get a vertical quad down to
/// a duplicated, lowered copy of their endpoints, hiding cracks between
/// neighbouring tiles at different lods.
pub fn add_skirt(mesh: &mut Mesh, skirt_height: f64) {
    if mesh.is_empty() || skirt_height <= 0.0 {
        return;
    }

    use std::collections::HashMap;
    let mut edge_count: HashMap<(u32, u32), u32> = HashMap::new();
    let mut ordered_edges: Vec<(u32, u32)> = Vec::new();
    for &[a, b, c] in &mesh.faces {
        for (from, to) in [(a, b), (b, c), (c, a)] {
            let key = (from.min(to), from.max(to));
            let count = edge_count.entry(key).or_insert(0);
            if *count == 0 {
                ordered_edges.push((from, to));
            }
            *count += 1;
        }
    }

    let mut dropped: HashMap<u32, u32> = HashMap::new();
    let mut drop_vertex = |mesh: &mut Mesh, v: u32| -> u32 {
        *dropped.entry(v).or_insert_with(|| {
            let mut vertex = mesh.vertices[v as usize];
            vertex[2] -= skirt_height;
            mesh.vertices.push(vertex);
            (mesh.vertices.len() - 1) as u32
        })
    };

    for (from, to) in ordered_edges {
        let key = (from.min(to), from.max(to));
        if edge_count[&key] != 1 {
            continue;
        }
        let from_low = drop_vertex(mesh, from);
        let to_low = drop_vertex(mesh, to);
        mesh.faces.push([from, to, from_low]);
        mesh.faces.push([to, to_low, from_low]);
    }
}

const MESH_MAGIC: &[u8; 4] = b"TFM1";
const TERRAIN_MAGIC: &[u8; 4] = b"TFQ1";

/// Serialises a mesh into the stable binary framing.
pub fn encode_mesh(mesh: &Mesh) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + mesh.vertices.len() * 24 + mesh.faces.len() * 12);
    out.extend_from_slice(MESH_MAGIC);
    out.extend_from_slice(&(mesh.vertices.len() as u32).to_le_bytes());
    out.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());
    out.extend_from_slice(&mesh.texture_layer.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    for vertex in &mesh.vertices {
        for value in vertex {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    for face in &mesh.faces {
        for index in face {
            out.extend_from_slice(&index.to_le_bytes());
        }
    }
    out
}

/// Serialises a terrain tile: quantised vertices, gzipped.
///
/// Positions are quantised to u16 within the tile extents and the height
/// range, the layout Cesium-style terrain readers expect from the
/// collaborator that finishes the framing.
pub fn encode_terrain(mesh: &Mesh, extents: Extents2) -> std::io::Result<Vec<u8>> {
    let (min_h, max_h) = mesh.height_range().unwrap_or((0.0, 0.0));
    let spread_h = (max_h - min_h).max(1e-9);

    let mut raw = Vec::with_capacity(24 + mesh.vertices.len() * 6 + mesh.faces.len() * 12);
    raw.extend_from_slice(TERRAIN_MAGIC);
    raw.extend_from_slice(&(mesh.vertices.len() as u32).to_le_bytes());
    raw.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());
    raw.extend_from_slice(&(min_h as f32).to_le_bytes());
    raw.extend_from_slice(&(max_h as f32).to_le_bytes());

    let quantize = |value: f64, low: f64, spread: f64| -> u16 {
        (((value - low) / spread).clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16
    };
    for vertex in &mesh.vertices {
        raw.extend_from_slice(
            &quantize(vertex[0], extents.ll.0, extents.width().max(1e-9)).to_le_bytes(),
        );
        raw.extend_from_slice(
            &quantize(vertex[1], extents.ll.1, extents.height().max(1e-9)).to_le_bytes(),
        );
        raw.extend_from_slice(&quantize(vertex[2], min_h, spread_h).to_le_bytes());
    }
    for face in &mesh.faces {
        for index in face {
            raw.extend_from_slice(&index.to_le_bytes());
        }
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents() -> Extents2 {
        Extents2::new(0.0, 0.0, 100.0, 100.0)
    }

    fn flat_heights(samples: usize, value: f32) -> Vec<f32> {
        vec![value; samples * samples]
    }

    #[test]
    fn test_full_grid_mesh() {
        let mesh = mesh_from_grid(extents(), &flat_heights(3, 5.0), 3, None);
        assert_eq!(mesh.vertices.len(), 9);
        assert_eq!(mesh.faces.len(), 8);
        // covers the whole tile in xy
        assert!((mesh.area_xy() - 100.0 * 100.0).abs() < 1e-6);
        assert_eq!(mesh.height_range(), Some((5.0, 5.0)));
    }

    #[test]
    fn test_void_samples_drop_faces() {
        let mut heights = flat_heights(3, 1.0);
        heights[0] = f32::NAN;
        let mesh = mesh_from_grid(extents(), &heights, 3, None);
        assert_eq!(mesh.vertices.len(), 8);
        // the two faces touching the void corner are gone
        assert_eq!(mesh.faces.len(), 7);
    }

    #[test]
    fn test_void_replacement_keeps_watertight() {
        let mut heights = flat_heights(3, 1.0);
        heights[4] = f32::NAN;
        let mesh = mesh_from_grid(extents(), &heights, 3, Some(0.0));
        assert_eq!(mesh.vertices.len(), 9);
        assert_eq!(mesh.faces.len(), 8);
        assert_eq!(mesh.height_range(), Some((0.0, 1.0)));
    }

    #[test]
    fn test_skirt_adds_perimeter_quads() {
        let mut mesh = mesh_from_grid(extents(), &flat_heights(3, 10.0), 3, None);
        let faces_before = mesh.faces.len();
        add_skirt(&mut mesh, 2.0);

        // 8 boundary edges -> 16 skirt faces, 8 dropped vertices
        assert_eq!(mesh.faces.len(), faces_before + 16);
        assert_eq!(mesh.vertices.len(), 9 + 8);
        assert_eq!(mesh.height_range(), Some((8.0, 10.0)));
    }

    #[test]
    fn test_skirt_on_empty_mesh_is_noop() {
        let mut mesh = Mesh::default();
        add_skirt(&mut mesh, 5.0);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_encode_mesh_framing() {
        let mesh = mesh_from_grid(extents(), &flat_heights(2, 0.0), 2, None);
        let bytes = encode_mesh(&mesh);
        assert_eq!(&bytes[0..4], MESH_MAGIC);
        let vertices = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(vertices, 4);
    }

    #[test]
    fn test_encode_terrain_is_gzipped() {
        let mesh = mesh_from_grid(extents(), &flat_heights(3, 7.0), 3, None);
        let bytes = encode_terrain(&mesh, extents()).unwrap();
        assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);
    }
}
