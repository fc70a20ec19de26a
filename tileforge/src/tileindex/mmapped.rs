//! Memory-mapped reader side of the delivery index.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::coord::TileId;
use crate::error::{GenerateError, GenerateResult};

use super::{flags, quadrant_at, HEADER_LEN, MAGIC, NODE_LEN, NO_CHILD, VERSION};

/// Read-only view of a published delivery index.
///
/// All queries are pure; the mapping stays valid even if the file is
/// replaced underneath (the rename swaps the directory entry, not the
/// pages this handle maps). Reopen on the next request to pick up a new
/// revision.
pub struct MmappedTileIndex {
    map: Mmap,
    node_count: u32,
    meta_binary_order: u8,
}

impl MmappedTileIndex {
    pub fn open(path: &Path) -> GenerateResult<Self> {
        let file = File::open(path)
            .map_err(|e| GenerateError::io(format!("opening tile index {}", path.display()), e))?;
        // Safety: the published file is immutable by contract; writers
        // always create a new file and rename over this one.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| GenerateError::io(format!("mapping tile index {}", path.display()), e))?;

        if map.len() < HEADER_LEN || &map[0..4] != MAGIC {
            return Err(GenerateError::Internal(format!(
                "tile index {} has a bad header",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([map[4], map[5]]);
        if version != VERSION {
            return Err(GenerateError::Internal(format!(
                "tile index {} has unsupported version {version}",
                path.display()
            )));
        }
        let meta_binary_order = map[6];
        let node_count = u32::from_le_bytes([map[8], map[9], map[10], map[11]]);
        let expected = HEADER_LEN + node_count as usize * NODE_LEN;
        if map.len() < expected {
            return Err(GenerateError::Internal(format!(
                "tile index {} is truncated ({} < {expected})",
                path.display(),
                map.len()
            )));
        }

        Ok(Self {
            map,
            node_count,
            meta_binary_order,
        })
    }

    pub fn meta_binary_order(&self) -> u8 {
        self.meta_binary_order
    }

    #[inline]
    fn node_flags(&self, index: u32) -> u8 {
        self.map[HEADER_LEN + index as usize * NODE_LEN]
    }

    #[inline]
    fn node_child(&self, index: u32, slot: usize) -> u32 {
        let offset = HEADER_LEN + index as usize * NODE_LEN + 1 + slot * 4;
        u32::from_le_bytes([
            self.map[offset],
            self.map[offset + 1],
            self.map[offset + 2],
            self.map[offset + 3],
        ])
    }

    /// Flags for `tile`; 0 when the tile is not indexed.
    pub fn get(&self, tile: TileId) -> u8 {
        let mut node = 0u32;
        for level in (0..tile.lod).rev() {
            let child = self.node_child(node, quadrant_at(tile, level));
            if child == NO_CHILD || child >= self.node_count {
                return 0;
            }
            node = child;
        }
        self.node_flags(node)
    }

    /// Whether the tile has real geometry.
    pub fn is_real(&self, tile: TileId) -> bool {
        flags::is_real(self.get(tile))
    }

    /// Whether the tile's subtree holds any indexed tile.
    ///
    /// Path nodes only exist on the way to a set tile, so node presence
    /// is subtree presence.
    pub fn subtree_present(&self, tile: TileId) -> bool {
        let mut node = 0u32;
        for level in (0..tile.lod).rev() {
            let child = self.node_child(node, quadrant_at(tile, level));
            if child == NO_CHILD || child >= self.node_count {
                return false;
            }
            node = child;
        }
        true
    }

    /// Rasterises the subtree below `parent` into a square bitmap.
    ///
    /// The bitmap has `2^order` cells per side; cell `(i, j)` holds
    /// `reduce(flags)` of the descendant tile at
    /// `(parent.lod + order, parent.x << order | i, parent.y << order | j)`.
    /// Traversal walks the stored tree once, stamping whole blocks for
    /// subtrees that terminate early.
    pub fn rasterize(&self, parent: TileId, order: u8, reduce: &dyn Fn(u8) -> u8) -> Vec<u8> {
        let side = 1usize << order;
        let mut bitmap = vec![0u8; side * side];

        // locate the subtree root
        let mut node = 0u32;
        for level in (0..parent.lod).rev() {
            let child = self.node_child(node, quadrant_at(parent, level));
            if child == NO_CHILD || child >= self.node_count {
                return bitmap;
            }
            node = child;
        }

        self.stamp(node, order, 0, 0, side, reduce, &mut bitmap);
        bitmap
    }

    fn stamp(
        &self,
        node: u32,
        depth: u8,
        x: usize,
        y: usize,
        side: usize,
        reduce: &dyn Fn(u8) -> u8,
        bitmap: &mut [u8],
    ) {
        if depth == 0 {
            bitmap[y * side + x] = reduce(self.node_flags(node));
            return;
        }
        let half = 1usize << (depth - 1);
        for (slot, (dx, dy)) in [(0, 0), (1, 0), (0, 1), (1, 1)].iter().enumerate() {
            let child = self.node_child(node, slot);
            if child == NO_CHILD || child >= self.node_count {
                continue;
            }
            self.stamp(
                child,
                depth - 1,
                x + dx * half,
                y + dy * half,
                side,
                reduce,
                bitmap,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tileindex::TileIndexBuilder;
    use tempfile::TempDir;

    fn reduce_2d(flags: u8) -> u8 {
        let mut value = 0;
        if super::flags::is_real(flags) {
            value |= 0x80;
            if super::flags::is_watertight(flags) {
                value |= 0x40;
            }
        }
        value
    }

    fn publish(builder: &TileIndexBuilder, dir: &TempDir) -> MmappedTileIndex {
        let path = dir.path().join("delivery.index");
        builder.write(&path).unwrap();
        MmappedTileIndex::open(&path).unwrap()
    }

    #[test]
    fn test_round_trip_flags() {
        let dir = TempDir::new().unwrap();
        let mut builder = TileIndexBuilder::new(8);
        builder.set(TileId::new(4, 3, 7), flags::MESH | flags::WATERTIGHT);
        builder.set(TileId::new(6, 12, 28), flags::MESH | flags::NAVTILE);

        let index = publish(&builder, &dir);
        assert_eq!(
            index.get(TileId::new(4, 3, 7)),
            flags::MESH | flags::WATERTIGHT
        );
        assert_eq!(
            index.get(TileId::new(6, 12, 28)),
            flags::MESH | flags::NAVTILE
        );
        assert_eq!(index.get(TileId::new(4, 3, 8)), 0);
        assert!(index.is_real(TileId::new(4, 3, 7)));
        assert!(!index.is_real(TileId::new(9, 0, 0)));
        assert_eq!(index.meta_binary_order(), 8);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("delivery.index");
        std::fs::write(&path, b"NOPEnope....").unwrap();
        assert!(MmappedTileIndex::open(&path).is_err());
    }

    #[test]
    fn test_rasterize_stamps_descendants() {
        let dir = TempDir::new().unwrap();
        let mut builder = TileIndexBuilder::new(8);
        // two tiles at lod 3 under parent 1-0-0
        builder.set(TileId::new(3, 0, 0), flags::MESH | flags::WATERTIGHT);
        builder.set(TileId::new(3, 3, 1), flags::MESH);

        let index = publish(&builder, &dir);
        let bitmap = index.rasterize(TileId::new(1, 0, 0), 2, &reduce_2d);
        assert_eq!(bitmap.len(), 16);
        assert_eq!(bitmap[0], 0xc0); // (0,0): mesh + watertight
        assert_eq!(bitmap[1 * 4 + 3], 0x80); // (3,1): mesh only
        assert_eq!(bitmap.iter().filter(|&&b| b != 0).count(), 2);
    }

    #[test]
    fn test_rasterize_parent_is_union_of_children() {
        let dir = TempDir::new().unwrap();
        let mut builder = TileIndexBuilder::new(8);
        for (x, y) in [(0u32, 0u32), (1, 3), (2, 2), (3, 0), (3, 3)] {
            builder.set(TileId::new(4, x + 4, y + 8), flags::MESH);
        }
        let index = publish(&builder, &dir);

        let parent = TileId::new(2, 1, 2);
        let combined = index.rasterize(parent, 2, &reduce_2d);

        // assemble from the four child rasterisations
        let side = 4usize;
        let half = side / 2;
        let mut assembled = vec![0u8; side * side];
        for (dx, dy) in [(0u32, 0u32), (1, 0), (0, 1), (1, 1)] {
            let child = TileId::new(3, parent.x * 2 + dx, parent.y * 2 + dy);
            let sub = index.rasterize(child, 1, &reduce_2d);
            for j in 0..half {
                for i in 0..half {
                    assembled[(dy as usize * half + j) * side + dx as usize * half + i] =
                        sub[j * half + i];
                }
            }
        }
        assert_eq!(combined, assembled);
    }

    #[test]
    fn test_reader_survives_replacement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("delivery.index");

        let mut first = TileIndexBuilder::new(8);
        first.set(TileId::new(2, 1, 1), flags::MESH);
        first.write(&path).unwrap();
        let reader = MmappedTileIndex::open(&path).unwrap();

        // replace the file under the open reader
        let mut second = TileIndexBuilder::new(8);
        second.set(TileId::new(2, 2, 2), flags::MESH);
        second.write(&path).unwrap();

        // old handle still sees the old tree
        assert!(reader.is_real(TileId::new(2, 1, 1)));
        assert!(!reader.is_real(TileId::new(2, 2, 2)));

        // a fresh open sees the new one
        let fresh = MmappedTileIndex::open(&path).unwrap();
        assert!(fresh.is_real(TileId::new(2, 2, 2)));
        assert!(!fresh.is_real(TileId::new(2, 1, 1)));
    }
}
