//! Delivery tile index: an immutable quad-tree of per-tile flags.
//!
//! The writer side builds the tree in memory during resource preparation
//! and publishes it atomically (`.tmp` + fsync + rename). The reader side
//! memory-maps the published file and answers lookups in O(lod). Once
//! renamed into place a file is never rewritten; a new revision writes a
//! new file and swaps it, and open readers keep their mapping until the
//! handle is dropped.
//!
//! On-disk layout, little-endian:
//!
//! ```text
//! magic "TFTI" | version u16 | metaBinaryOrder u8 | pad u8 | nodeCount u32
//! node[0..nodeCount]: flags u8, child[4] u32 (0xFFFF_FFFF = absent)
//! ```
//!
//! Node 0 is the root tile `0-0-0`; children are ordered upper-left,
//! upper-right, lower-left, lower-right.

use crate::coord::TileId;

mod mmapped;

pub use mmapped::MmappedTileIndex;

/// Per-tile flag bits.
pub mod flags {
    /// Tile has real geometry; a tile is *real* iff this is set.
    pub const MESH: u8 = 0x01;
    /// Tile coverage has no holes.
    pub const WATERTIGHT: u8 = 0x02;
    /// Tile carries a navigation tile.
    pub const NAVTILE: u8 = 0x04;
    /// Tile carries an internal texture atlas.
    pub const ATLAS: u8 = 0x08;

    pub fn is_real(flags: u8) -> bool {
        flags & MESH != 0
    }

    pub fn is_watertight(flags: u8) -> bool {
        flags & WATERTIGHT != 0
    }

    pub fn has_navtile(flags: u8) -> bool {
        flags & NAVTILE != 0
    }
}

pub(crate) const MAGIC: &[u8; 4] = b"TFTI";
pub(crate) const VERSION: u16 = 1;
pub(crate) const HEADER_LEN: usize = 12;
pub(crate) const NODE_LEN: usize = 17;
pub(crate) const NO_CHILD: u32 = u32::MAX;

#[derive(Default)]
struct Node {
    flags: u8,
    children: [Option<Box<Node>>; 4],
}

/// Mutable quad-tree used while preparing a resource.
#[derive(Default)]
pub struct TileIndexBuilder {
    root: Node,
    meta_binary_order: u8,
}

impl TileIndexBuilder {
    pub fn new(meta_binary_order: u8) -> Self {
        Self {
            root: Node::default(),
            meta_binary_order,
        }
    }

    /// ORs `flags` into the node for `tile`, creating the path to it.
    pub fn set(&mut self, tile: TileId, flags: u8) {
        let mut node = &mut self.root;
        for level in (0..tile.lod).rev() {
            let quadrant = quadrant_at(tile, level);
            node = node.children[quadrant]
                .get_or_insert_with(|| Box::new(Node::default()));
        }
        node.flags |= flags;
    }

    /// Flags stored for `tile`; 0 when the path does not exist.
    pub fn get(&self, tile: TileId) -> u8 {
        let mut node = &self.root;
        for level in (0..tile.lod).rev() {
            match &node.children[quadrant_at(tile, level)] {
                Some(child) => node = child,
                None => return 0,
            }
        }
        node.flags
    }

    /// Serialises the tree breadth-first into the on-disk layout.
    pub fn serialize(&self) -> Vec<u8> {
        // assign indices breadth-first so the root lands at node 0
        let mut order: Vec<&Node> = vec![&self.root];
        let mut cursor = 0;
        while cursor < order.len() {
            let node = order[cursor];
            cursor += 1;
            for child in node.children.iter().flatten() {
                order.push(child);
            }
        }

        let mut out = Vec::with_capacity(HEADER_LEN + order.len() * NODE_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push(self.meta_binary_order);
        out.push(0);
        out.extend_from_slice(&(order.len() as u32).to_le_bytes());

        // second pass needs child indices; recompute by walking in the
        // same breadth-first order with a running counter
        let mut next_index = 1u32;
        let mut child_indices: Vec<[u32; 4]> = Vec::with_capacity(order.len());
        for node in &order {
            let mut indices = [NO_CHILD; 4];
            for (slot, child) in node.children.iter().enumerate() {
                if child.is_some() {
                    indices[slot] = next_index;
                    next_index += 1;
                }
            }
            child_indices.push(indices);
        }

        for (node, indices) in order.iter().zip(child_indices) {
            out.push(node.flags);
            for index in indices {
                out.extend_from_slice(&index.to_le_bytes());
            }
        }
        out
    }

    /// Publishes the index atomically at `path`.
    ///
    /// Writes a sibling `.tmp`, fsyncs it and renames over the target so
    /// readers observe either the old file or the new one, never a mix.
    pub fn write(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::io::Write;

        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&self.serialize())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            if let Ok(d) = std::fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

/// Quadrant slot of `tile`'s ancestor path at the given remaining level.
#[inline]
pub(crate) fn quadrant_at(tile: TileId, level: u8) -> usize {
    let qx = (tile.x >> level) & 1;
    let qy = (tile.y >> level) & 1;
    ((qy << 1) | qx) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get() {
        let mut builder = TileIndexBuilder::new(8);
        let tile = TileId::new(5, 17, 9);
        builder.set(tile, flags::MESH | flags::NAVTILE);

        assert_eq!(builder.get(tile), flags::MESH | flags::NAVTILE);
        assert_eq!(builder.get(TileId::new(5, 17, 10)), 0);
        // path nodes exist but carry no flags
        assert_eq!(builder.get(tile.parent(1)), 0);
    }

    #[test]
    fn test_set_is_or() {
        let mut builder = TileIndexBuilder::new(8);
        let tile = TileId::new(3, 1, 2);
        builder.set(tile, flags::MESH);
        builder.set(tile, flags::WATERTIGHT);
        assert_eq!(builder.get(tile), flags::MESH | flags::WATERTIGHT);
    }

    #[test]
    fn test_serialize_header() {
        let builder = TileIndexBuilder::new(8);
        let bytes = builder.serialize();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(bytes.len(), HEADER_LEN + NODE_LEN);
    }

    #[test]
    fn test_write_is_atomic_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("delivery.index");

        let mut builder = TileIndexBuilder::new(8);
        builder.set(TileId::new(2, 1, 1), flags::MESH);
        builder.write(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
