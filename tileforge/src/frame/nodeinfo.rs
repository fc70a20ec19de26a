//! Per-tile node information within a reference frame.

use std::sync::Arc;

use crate::coord::{Extents2, TileId};

use super::ReferenceFrame;

/// A tile resolved against its reference frame.
///
/// Carries the tile's extents in the division SRS and answers whether the
/// tile can produce data at all. Construction never fails; invalid
/// addresses yield a non-productive node.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    frame: Arc<ReferenceFrame>,
    tile: TileId,
    extents: Extents2,
    valid: bool,
}

impl NodeInfo {
    pub fn new(frame: Arc<ReferenceFrame>, tile: TileId) -> Self {
        let valid = frame.contains(tile);
        let extents = if valid {
            subdivide(frame.extents, tile)
        } else {
            frame.extents
        };
        Self {
            frame,
            tile,
            extents,
            valid,
        }
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn frame(&self) -> &ReferenceFrame {
        &self.frame
    }

    /// Extents of this tile in the division SRS.
    pub fn extents(&self) -> Extents2 {
        self.extents
    }

    /// SRS the tile grid is defined in.
    pub fn srs(&self) -> &str {
        &self.frame.division_srs
    }

    /// Whether this node can produce data.
    pub fn productive(&self) -> bool {
        self.valid
    }

    /// The four children of this node that remain inside the valid tree.
    pub fn children(&self) -> Vec<NodeInfo> {
        let mut out = Vec::with_capacity(4);
        if self.tile.lod >= self.frame.valid_lods.max {
            return out;
        }
        let base = self.tile.lowest_child(1);
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let child = TileId::new(base.lod, base.x + dx, base.y + dy);
            let node = NodeInfo::new(Arc::clone(&self.frame), child);
            if node.productive() {
                out.push(node);
            }
        }
        out
    }
}

/// Walks from the root extents down to `tile`, halving at each level.
fn subdivide(root: Extents2, tile: TileId) -> Extents2 {
    let mut extents = root;
    for level in (0..tile.lod).rev() {
        let qx = (tile.x >> level) & 1;
        let qy = (tile.y >> level) & 1;
        extents = extents.quadrant(qx, qy);
    }
    extents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Registry;

    fn webmercator() -> Arc<ReferenceFrame> {
        Arc::new(Registry::system().frame("webmercator").unwrap().clone())
    }

    #[test]
    fn test_root_node_covers_frame() {
        let frame = webmercator();
        let node = NodeInfo::new(Arc::clone(&frame), TileId::new(0, 0, 0));
        assert!(node.productive());
        assert_eq!(node.extents(), frame.extents);
    }

    #[test]
    fn test_subdivision_halves_extents() {
        let frame = webmercator();
        let root = frame.extents;
        // x=0,y=0 is the upper-left quadrant: west half, north half
        let node = NodeInfo::new(Arc::clone(&frame), TileId::new(1, 0, 0));
        let e = node.extents();
        assert!((e.ll.0 - root.ll.0).abs() < 1e-6);
        assert!((e.ur.0 - 0.0).abs() < 1e-6);
        assert!((e.ll.1 - 0.0).abs() < 1e-6);
        assert!((e.ur.1 - root.ur.1).abs() < 1e-6);
    }

    #[test]
    fn test_deep_subdivision_is_consistent() {
        let frame = webmercator();
        let parent = NodeInfo::new(Arc::clone(&frame), TileId::new(4, 5, 9));
        let child = NodeInfo::new(Arc::clone(&frame), TileId::new(5, 10, 18));
        // child (even, even) is the upper-left quadrant of the parent
        assert!((child.extents().ll.0 - parent.extents().ll.0).abs() < 1e-6);
        assert!((child.extents().ur.1 - parent.extents().ur.1).abs() < 1e-6);
        assert!((child.extents().width() * 2.0 - parent.extents().width()).abs() < 1e-3);
    }

    #[test]
    fn test_out_of_grid_is_unproductive() {
        let frame = webmercator();
        let node = NodeInfo::new(frame, TileId::new(2, 4, 0));
        assert!(!node.productive());
    }

    #[test]
    fn test_children_stop_at_max_lod() {
        let frame = webmercator();
        let leaf_lod = frame.valid_lods.max;
        let node = NodeInfo::new(Arc::clone(&frame), TileId::new(leaf_lod, 0, 0));
        assert!(node.children().is_empty());

        let node = NodeInfo::new(frame, TileId::new(3, 1, 1));
        assert_eq!(node.children().len(), 4);
    }
}
