//! Tag tree decoding (ISO/IEC 15444-1 B.10.2).
//!
//! A tag tree is a quad tree over a leaf grid where each inner node holds
//! the minimum of its children. The codestream signals values incrementally:
//! a 0 bit means the node's value is larger than its current lower bound, a
//! 1 bit means the bound has been reached. State persists across packets,
//! so later layers resume where earlier ones stopped.

use crate::bitstream::BitstreamReader;
use crate::error::JpipError;

#[derive(Debug, Clone, Default)]
struct TagTreeNode {
    /// Current lower bound; equals the node's value once `known`.
    low: u32,
    known: bool,
    parent_index: Option<usize>,
}

/// Decode-only tag tree. `Clone` snapshots the full decoding state.
#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<TagTreeNode>,
    leaf_width: usize,
    leaf_height: usize,
}

impl TagTree {
    /// Create a tag tree for a grid of `width` x `height` leaves.
    pub fn new(width: usize, height: usize) -> Self {
        let mut nodes = vec![TagTreeNode::default(); width * height];

        // Build levels bottom-up, linking children to parents.
        let mut level_start = 0;
        let mut level_width = width;
        let mut level_height = height;
        while level_width > 1 || level_height > 1 {
            let next_width = level_width.div_ceil(2);
            let next_height = level_height.div_ceil(2);
            let next_start = nodes.len();
            nodes.extend(
                std::iter::repeat_with(TagTreeNode::default).take(next_width * next_height),
            );
            for y in 0..level_height {
                for x in 0..level_width {
                    let child = level_start + y * level_width + x;
                    let parent = next_start + (y / 2) * next_width + x / 2;
                    nodes[child].parent_index = Some(parent);
                }
            }
            level_start = next_start;
            level_width = next_width;
            level_height = next_height;
        }

        Self {
            nodes,
            leaf_width: width,
            leaf_height: height,
        }
    }

    /// Decode leaf (x, y) up to `threshold`: `Some(true)` when the leaf's
    /// value is known to be below the threshold, `Some(false)` when it is
    /// known to be at or above it, `None` when more data is needed.
    pub fn decode_at_threshold(
        &mut self,
        reader: &mut BitstreamReader,
        x: usize,
        y: usize,
        threshold: u32,
    ) -> Result<Option<bool>, JpipError> {
        match self.walk(reader, x, y, Some(threshold))? {
            None => Ok(None),
            Some(leaf) => {
                let node = &self.nodes[leaf];
                Ok(Some(node.known && node.low < threshold))
            }
        }
    }

    /// Decode leaf (x, y) completely and return its value.
    pub fn decode_value(
        &mut self,
        reader: &mut BitstreamReader,
        x: usize,
        y: usize,
    ) -> Result<Option<u32>, JpipError> {
        match self.walk(reader, x, y, None)? {
            None => Ok(None),
            Some(leaf) => Ok(Some(self.nodes[leaf].low)),
        }
    }

    /// Walk from the root to leaf (x, y), consuming signalling bits until
    /// every node on the path is either known or at the threshold.
    fn walk(
        &mut self,
        reader: &mut BitstreamReader,
        x: usize,
        y: usize,
        threshold: Option<u32>,
    ) -> Result<Option<usize>, JpipError> {
        debug_assert!(x < self.leaf_width && y < self.leaf_height);
        let leaf = y * self.leaf_width + x;
        let mut path = vec![leaf];
        let mut current = leaf;
        while let Some(parent) = self.nodes[current].parent_index {
            path.push(parent);
            current = parent;
        }

        let mut parent_low = 0;
        for &index in path.iter().rev() {
            let node = &mut self.nodes[index];
            if !node.known && node.low < parent_low {
                node.low = parent_low;
            }
            while !node.known && threshold.is_none_or(|t| node.low < t) {
                match reader.shift_bit()? {
                    None => return Ok(None),
                    Some(0) => node.low += 1,
                    Some(_) => node.known = true,
                }
            }
            parent_low = node.low;
        }
        Ok(Some(leaf))
    }
}
