//! Bottom-up bulk loading.

use super::{
    Fbtree, IxSpec, TreeContext,
    node::{FNodeBuilder, distinguish, write_node},
};
use crate::{
    error::{Error, Result},
    store::Offset,
};

#[derive(Default)]
struct Level {
    node: FNodeBuilder,
    /// Separator for the node being built, carried to the parent once the
    /// node is written. Stored in the node itself as an empty prefix.
    first: Vec<u8>,
}

/// Builds a tree from keys supplied in strictly increasing order.
///
/// Nodes are filled to about two thirds of the node size limit and written as
/// soon as they are full, so nothing is ever split or rewritten. Every node
/// except those on the right edge ends up equally full.
pub struct FbtreeBuilder {
    ctx: TreeContext,
    ixspec: IxSpec,
    /// Leaf level first.
    levels: Vec<Level>,
    prev: Option<Vec<u8>>,
}

impl FbtreeBuilder {
    /// Starts an empty build.
    pub fn new(ctx: TreeContext, ixspec: IxSpec) -> Self {
        Self { ctx, ixspec, levels: vec![Level::default()], prev: None }
    }

    fn threshold(&self) -> usize {
        self.ctx.config.max_node_size * 2 / 3
    }

    /// Adds the next key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOrder`] if `key` is not greater than the previous
    /// key, or a store error if writing a full node fails.
    pub fn add(&mut self, key: &[u8], off: Offset) -> Result<()> {
        let known = match &self.prev {
            Some(prev) if key == prev.as_slice() => {
                return Err(Error::KeyOrder { reason: "duplicate key".to_string() });
            },
            Some(prev) if key < prev.as_slice() => {
                return Err(Error::KeyOrder { reason: "keys must be added in order".to_string() });
            },
            Some(prev) => distinguish(prev, key),
            None => Vec::new(),
        };
        self.push(0, known, off)?;
        self.prev = Some(key.to_vec());
        Ok(())
    }

    fn push(&mut self, li: usize, known: Vec<u8>, off: Offset) -> Result<()> {
        if li >= self.levels.len() {
            self.levels.push(Level::default());
        }
        if self.levels[li].node.size() > self.threshold() {
            let full = std::mem::take(&mut self.levels[li]);
            let node_off = write_node(&self.ctx.store, &full.node.finish())?;
            self.push(li + 1, full.first, node_off)?;
        }
        let level = &mut self.levels[li];
        if level.node.count() == 0 {
            level.node.add(&[], off);
            level.first = known;
        } else {
            level.node.add(&known, off);
        }
        Ok(())
    }

    /// Writes the partially filled right edge and returns the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be written.
    pub fn finish(self) -> Result<Fbtree> {
        let mut carry: Option<(Vec<u8>, Offset)> = None;
        let tree_levels = self.levels.len() - 1;
        for mut level in self.levels {
            if let Some((sep, off)) = carry.take() {
                // The last node of a level may go slightly over the limit.
                level.node.add(&sep, off);
            }
            let off = write_node(&self.ctx.store, &level.node.finish())?;
            carry = Some((level.first, off));
        }
        let root = carry.map_or(0, |(_, off)| off);
        Ok(Fbtree::from_parts(self.ctx, self.ixspec, root, tree_levels))
    }
}
