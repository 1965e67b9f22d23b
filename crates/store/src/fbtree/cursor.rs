//! Ordered iteration over an fbtree.

use std::vec;

use super::Fbtree;
use crate::{error::Result, store::Offset};

/// Lazy in-order iterator over `(known prefix, data offset)` leaf entries.
///
/// Keeps one decoded node per level and only loads the next leaf when the
/// current one is exhausted. After an error the iterator is finished.
pub struct FbtreeIter<'a> {
    tree: &'a Fbtree,
    stack: Vec<vec::IntoIter<(Vec<u8>, Offset)>>,
    started: bool,
    done: bool,
}

impl<'a> FbtreeIter<'a> {
    pub(super) fn new(tree: &'a Fbtree) -> Self {
        Self { tree, stack: Vec::with_capacity(tree.tree_levels + 1), started: false, done: false }
    }

    fn push(&mut self, off: Offset) -> Result<()> {
        let node = self.tree.get_node(off)?;
        self.stack.push(node.entries().into_iter());
        Ok(())
    }
}

impl Iterator for FbtreeIter<'_> {
    type Item = Result<(Vec<u8>, Offset)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(e) = self.push(self.tree.root) {
                self.done = true;
                return Some(Err(e));
            }
        }
        loop {
            let depth = self.stack.len();
            let Some(level) = self.stack.last_mut() else {
                self.done = true;
                return None;
            };
            let Some((known, off)) = level.next() else {
                self.stack.pop();
                continue;
            };
            if depth > self.tree.tree_levels {
                return Some(Ok((known, off)));
            }
            if let Err(e) = self.push(off) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fbtree::{IxSpec, tests::context};

    #[test]
    fn test_iter_skips_empty_leaves() {
        let tree = Fbtree::create(context(48), IxSpec::default())
            .update(|t| {
                for i in 0..60u32 {
                    let key = format!("{i:03}");
                    let off = t.context().store.save_sized(key.as_bytes())?;
                    t.insert(key.as_bytes(), off)?;
                }
                for i in 10..30u32 {
                    t.delete(format!("{i:03}").as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        assert!(tree.tree_levels() >= 1);
        let keys: Vec<String> = tree
            .iter()
            .map(|r| String::from_utf8(tree.leaf_key(r.unwrap().1).unwrap()).unwrap())
            .collect();
        let expected: Vec<String> =
            (0..10u32).chain(30..60).map(|i| format!("{i:03}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_iter_returns_known_prefixes() {
        let tree = Fbtree::create(context(1536), IxSpec::default())
            .update(|t| {
                for key in ["apple", "apricot", "banana"] {
                    let off = t.context().store.save_sized(key.as_bytes())?;
                    t.insert(key.as_bytes(), off)?;
                }
                Ok(())
            })
            .unwrap();
        let known: Vec<Vec<u8>> = tree.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(known, vec![b"".to_vec(), b"apr".to_vec(), b"b".to_vec()]);
    }
}
