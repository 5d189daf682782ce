// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! The persistent B+Tree: an ordered map over opaque byte-string keys and
//! values, built atop a [`Provider`] that owns node storage, caching, and
//! the flush protocol.
//!
//! Routing during descent uses a right-biased bisection (`bisect_right`):
//! equal keys route to the left child, so internal keys act as non-strict
//! upper bounds on their left subtree. Leaf equality checks use a
//! left-biased bisection (`bisect_left`) instead, since a leaf holds the
//! keys themselves rather than routing boundaries.

pub mod codec;
pub mod node;
pub mod provider;

pub use codec::{BytesCodec, NodeCodec, TypedCodec};
pub use node::{Node, NodeId, NodeKind};
pub use provider::{NewNode, Provider, SackProvider, SimpleProvider};

use crate::error::{Error, Result};

pub(crate) fn bisect_right(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() <= key)
}

pub(crate) fn bisect_left(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() < key)
}

/// An ordered map from byte-string keys to byte-string values, backed by a
/// [`Provider`].
///
/// `BTree` itself holds no node storage. It only knows how to walk and
/// rearrange nodes the provider resolves for it. All mutation is expressed
/// as fetch-mutate-`mark_dirty`; persistence is a separate concern handled
/// entirely by [`Provider::flush`].
pub struct BTree<P: Provider> {
    provider: P,
}

/// One step on the path from root to leaf: the internal node visited and
/// the child index chosen to descend further.
type PathEntry = (NodeId, usize);

impl<P: Provider> BTree<P> {
    /// Wraps `provider` in a `BTree`. `order` (maximum children per internal
    /// node) must be at least 3 (below that the underflow threshold `B/2`
    /// cannot leave a non-root node with at least one key after a borrow).
    pub fn new(provider: P) -> Result<Self> {
        if provider.order() < 3 {
            return Err(Error::bad_argument("B+Tree order must be >= 3"));
        }
        Ok(Self { provider })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn into_provider(self) -> P {
        self.provider
    }

    pub fn len(&self) -> u64 {
        self.provider.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth(&self) -> u32 {
        self.provider.depth()
    }

    pub fn order(&self) -> usize {
        self.provider.order()
    }

    fn min_keys(&self) -> usize {
        self.provider.order() / 2
    }

    /// Persists every dirty node and the tree header.
    pub fn flush(&mut self) -> Result<()> {
        self.provider.flush()
    }

    /// Descends to the leaf that would contain `key`, without recording the
    /// path (used by read-only lookups).
    fn leaf_for(&mut self, key: &[u8]) -> Result<Node> {
        let mut current = self.provider.root();
        loop {
            let node = self.provider.node(current)?;
            if node.is_leaf() {
                return Ok(node);
            }
            let index = bisect_right(&node.keys, key);
            current = node.children()[index];
        }
    }

    /// Descends to the leaf that would contain `key`, recording `(node,
    /// child_index)` for every internal node visited along the way.
    fn descend_path(&mut self, key: &[u8]) -> Result<(Vec<PathEntry>, Node)> {
        let mut path = Vec::new();
        let mut current = self.provider.root();
        loop {
            let node = self.provider.node(current)?;
            if node.is_leaf() {
                return Ok((path, node));
            }
            let index = bisect_right(&node.keys, key);
            path.push((current, index));
            current = node.children()[index];
        }
    }

    /// Looks up `key`, returning [`Error::NotFound`] if absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.leaf_for(key)?;
        let index = bisect_left(&leaf.keys, key);
        if index < leaf.keys.len() && leaf.keys[index] == key {
            Ok(leaf.values()[index].clone())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Returns whether `key` is present, without allocating a value copy.
    pub fn contains_key(&mut self, key: &[u8]) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Inserts `key`/`value`, overwriting any existing value for `key`.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let (path, mut leaf) = self.descend_path(&key)?;
        let index = bisect_left(&leaf.keys, &key);

        if index < leaf.keys.len() && leaf.keys[index] == key {
            leaf.values_mut()[index] = value;
            self.provider.mark_dirty(leaf);
            return Ok(());
        }

        leaf.keys.insert(index, key);
        leaf.values_mut().insert(index, value);
        self.provider.set_size(self.provider.size() + 1);

        let order = self.provider.order();
        if leaf.keys.len() < order {
            self.provider.mark_dirty(leaf);
            return Ok(());
        }

        self.split_leaf(leaf, path)
    }

    /// Splits an overfull leaf, splices the new right sibling into the
    /// doubly-linked leaf list, and propagates the promoted key upward.
    fn split_leaf(&mut self, mut leaf: Node, path: Vec<PathEntry>) -> Result<()> {
        let mid = leaf.keys.len() / 2;
        let right_keys = leaf.keys.split_off(mid);
        let right_values = leaf.values_mut().split_off(mid);
        let promoted = right_keys[0].clone();

        let right_id = self.provider.create(NewNode::Leaf {
            keys: right_keys,
            values: right_values,
        });

        let old_next = leaf.next();
        {
            let mut right = self.provider.node(right_id)?;
            right.set_prev(Some(leaf.id));
            right.set_next(old_next);
            self.provider.mark_dirty(right);
        }
        if let Some(next_id) = old_next {
            let mut next = self.provider.node(next_id)?;
            next.set_prev(Some(right_id));
            self.provider.mark_dirty(next);
        }
        leaf.set_next(Some(right_id));
        self.provider.mark_dirty(leaf);

        self.propagate_split(promoted, right_id, path)
    }

    /// Walks `path` bottom-up, inserting the promoted key and new sibling
    /// into each ancestor, splitting further whenever an ancestor overflows,
    /// and creating a new root if the split reaches the top.
    fn propagate_split(
        &mut self,
        mut promoted: Vec<u8>,
        mut new_child: NodeId,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        loop {
            let Some((parent_id, child_index)) = path.pop() else {
                let old_root = self.provider.root();
                let new_root = self.provider.create(NewNode::Internal {
                    keys: vec![promoted],
                    children: vec![old_root, new_child],
                });
                self.provider.set_root(new_root);
                let depth = self.provider.depth();
                self.provider.set_depth(depth + 1);
                return Ok(());
            };

            let mut parent = self.provider.node(parent_id)?;
            parent.keys.insert(child_index, promoted);
            parent.children_mut().insert(child_index + 1, new_child);

            let order = self.provider.order();
            if parent.keys.len() < order {
                self.provider.mark_dirty(parent);
                return Ok(());
            }

            // `parent.children().len()` is `order + 1` here; `center` is the
            // median child index per the promoted-key convention in
            // `DESIGN.md`.
            let center = parent.children().len() / 2;
            let right_keys = parent.keys.split_off(center);
            let next_promoted = parent.keys.pop().expect("overfull node has a median key");
            let right_children = parent.children_mut().split_off(center);

            let right_id = self.provider.create(NewNode::Internal {
                keys: right_keys,
                children: right_children,
            });
            self.provider.mark_dirty(parent);

            promoted = next_promoted;
            new_child = right_id;
        }
    }

    /// Removes `key`, returning its value, or [`Error::NotFound`] if absent.
    pub fn pop(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let (path, mut leaf) = self.descend_path(key)?;
        let index = bisect_left(&leaf.keys, key);
        if index >= leaf.keys.len() || leaf.keys[index] != key {
            return Err(Error::NotFound);
        }

        let value = leaf.values_mut().remove(index);
        leaf.keys.remove(index);
        self.provider.set_size(self.provider.size() - 1);

        self.rebalance_after_removal(leaf, path)?;
        Ok(value)
    }

    /// Walks back up from a node that may have underflowed, borrowing from
    /// or merging with a sibling (left preferred) at each level, stopping as
    /// soon as a level is no longer deficient. At the root, collapses an
    /// empty internal root into its sole child, or leaves an empty leaf root
    /// as the (now empty) tree.
    fn rebalance_after_removal(&mut self, node: Node, mut path: Vec<PathEntry>) -> Result<()> {
        let mut node = node;
        loop {
            let Some((parent_id, child_index)) = path.pop() else {
                return self.finish_root(node);
            };

            if node.keys.len() >= self.min_keys() {
                self.provider.mark_dirty(node);
                return Ok(());
            }

            let mut parent = self.provider.node(parent_id)?;
            let sibling_count = parent.children().len();
            let min_keys = self.min_keys();

            if child_index > 0 {
                let left_id = parent.children()[child_index - 1];
                let mut left = self.provider.node(left_id)?;
                if left.keys.len() > min_keys {
                    if node.is_leaf() {
                        borrow_leaf_from_left(&mut node, &mut left, &mut parent, child_index);
                    } else {
                        borrow_internal_from_left(&mut node, &mut left, &mut parent, child_index);
                    }
                    self.provider.mark_dirty(left);
                    self.provider.mark_dirty(node);
                    self.provider.mark_dirty(parent);
                    return Ok(());
                }
            }

            if child_index + 1 < sibling_count {
                let right_id = parent.children()[child_index + 1];
                let mut right = self.provider.node(right_id)?;
                if right.keys.len() > min_keys {
                    if node.is_leaf() {
                        borrow_leaf_from_right(&mut node, &mut right, &mut parent, child_index);
                    } else {
                        borrow_internal_from_right(&mut node, &mut right, &mut parent, child_index);
                    }
                    self.provider.mark_dirty(right);
                    self.provider.mark_dirty(node);
                    self.provider.mark_dirty(parent);
                    return Ok(());
                }
            }

            // Neither sibling has spare keys: merge, preferring the left
            // sibling when one exists.
            if child_index > 0 {
                let left_id = parent.children()[child_index - 1];
                let mut left = self.provider.node(left_id)?;
                if node.is_leaf() {
                    self.merge_leaves(&mut left, &node)?;
                } else {
                    let separator = parent.keys[child_index - 1].clone();
                    merge_internal(&mut left, &node, separator);
                }
                self.provider.release(node.id)?;
                self.provider.mark_dirty(left);
                parent.keys.remove(child_index - 1);
                parent.children_mut().remove(child_index);
            } else {
                let right_id = parent.children()[child_index + 1];
                let right = self.provider.node(right_id)?;
                let mut merged = node;
                if merged.is_leaf() {
                    self.merge_leaves(&mut merged, &right)?;
                } else {
                    let separator = parent.keys[child_index].clone();
                    merge_internal(&mut merged, &right, separator);
                }
                self.provider.release(right.id)?;
                self.provider.mark_dirty(merged);
                parent.keys.remove(child_index);
                parent.children_mut().remove(child_index + 1);
            }

            node = parent;
        }
    }

    fn finish_root(&mut self, node: Node) -> Result<()> {
        if node.is_leaf() {
            self.provider.mark_dirty(node);
            return Ok(());
        }
        if node.keys.is_empty() {
            let sole_child = node.children()[0];
            self.provider.release(node.id)?;
            self.provider.set_root(sole_child);
            let depth = self.provider.depth();
            self.provider.set_depth(depth - 1);
        } else {
            self.provider.mark_dirty(node);
        }
        Ok(())
    }

    /// Concatenates `right` onto `left` (which keeps its identity and
    /// descriptor) and re-links `right`'s former next-sibling to point back
    /// at `left`.
    fn merge_leaves(&mut self, left: &mut Node, right: &Node) -> Result<()> {
        left.keys.extend(right.keys.iter().cloned());
        left.values_mut().extend(right.values().iter().cloned());

        let right_next = right.next();
        left.set_next(right_next);
        if let Some(next_id) = right_next {
            let mut next = self.provider.node(next_id)?;
            next.set_prev(Some(left.id));
            self.provider.mark_dirty(next);
        }
        Ok(())
    }

    /// Returns a lazy iterator over `(key, value)` pairs with `key >= low`
    /// (if given) and `key < high` (if given), in ascending order. Yields
    /// nothing if `low >= high`.
    pub fn range(&mut self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<RangeIter<'_, P>> {
        if let (Some(lo), Some(hi)) = (low, high) {
            if lo >= hi {
                return Ok(RangeIter {
                    tree: self,
                    high: None,
                    current: None,
                    pos: 0,
                    done: true,
                });
            }
        }

        let mut current = self.provider.root();
        loop {
            let node = self.provider.node(current)?;
            if node.is_leaf() {
                let pos = match low {
                    Some(lo) => bisect_left(&node.keys, lo),
                    None => 0,
                };
                return Ok(RangeIter {
                    tree: self,
                    high: high.map(|h| h.to_vec()),
                    current: Some(node),
                    pos,
                    done: false,
                });
            }
            let index = match low {
                Some(lo) => bisect_right(&node.keys, lo),
                None => 0,
            };
            current = node.children()[index];
        }
    }

    /// Positions a [`Cursor`] at `key`. The cursor starts at the first key
    /// `>= key` within the leaf `key` would route to. It does not require
    /// `key` to be present.
    pub fn cursor_at(&mut self, key: &[u8]) -> Result<Cursor<'_, P>> {
        let mut current = self.provider.root();
        loop {
            let node = self.provider.node(current)?;
            if node.is_leaf() {
                if node.keys.is_empty() {
                    return Err(Error::NotFound);
                }
                let pos = bisect_left(&node.keys, key).min(node.keys.len() - 1);
                return Ok(Cursor {
                    tree: self,
                    leaf: node,
                    pos,
                });
            }
            let index = bisect_right(&node.keys, key);
            current = node.children()[index];
        }
    }
}

fn merge_internal(left: &mut Node, right: &Node, separator: Vec<u8>) {
    left.keys.push(separator);
    left.keys.extend(right.keys.iter().cloned());
    left.children_mut().extend(right.children().iter().copied());
}

fn borrow_leaf_from_left(node: &mut Node, left: &mut Node, parent: &mut Node, child_index: usize) {
    let key = left.keys.pop().expect("left sibling has spare keys");
    let value = left.values_mut().pop().expect("left sibling has spare values");
    node.keys.insert(0, key.clone());
    node.values_mut().insert(0, value);
    parent.keys[child_index - 1] = key;
}

fn borrow_leaf_from_right(node: &mut Node, right: &mut Node, parent: &mut Node, child_index: usize) {
    let key = right.keys.remove(0);
    let value = right.values_mut().remove(0);
    node.keys.push(key);
    node.values_mut().push(value);
    parent.keys[child_index] = right.keys[0].clone();
}

fn borrow_internal_from_left(node: &mut Node, left: &mut Node, parent: &mut Node, child_index: usize) {
    let separator = parent.keys[child_index - 1].clone();
    node.keys.insert(0, separator);
    let child = left.children_mut().pop().expect("left sibling has spare children");
    node.children_mut().insert(0, child);
    parent.keys[child_index - 1] = left.keys.pop().expect("left sibling has spare keys");
}

fn borrow_internal_from_right(node: &mut Node, right: &mut Node, parent: &mut Node, child_index: usize) {
    let separator = parent.keys[child_index].clone();
    node.keys.push(separator);
    let child = right.children_mut().remove(0);
    node.children_mut().push(child);
    parent.keys[child_index] = right.keys.remove(0);
}

/// A lazy, single-pass, forward iterator over a [`BTree::range`] scan.
pub struct RangeIter<'a, P: Provider> {
    tree: &'a mut BTree<P>,
    high: Option<Vec<u8>>,
    current: Option<Node>,
    pos: usize,
    done: bool,
}

impl<'a, P: Provider> Iterator for RangeIter<'a, P> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let leaf = self.current.clone()?;
            if self.pos >= leaf.keys.len() {
                match leaf.next() {
                    Some(next_id) => match self.tree.provider.node(next_id) {
                        Ok(next_leaf) => {
                            self.current = Some(next_leaf);
                            self.pos = 0;
                            continue;
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    },
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            }

            let key = leaf.keys[self.pos].clone();
            if let Some(high) = &self.high {
                if key.as_slice() >= high.as_slice() {
                    self.done = true;
                    return None;
                }
            }
            let value = leaf.values()[self.pos].clone();
            self.pos += 1;
            return Some(Ok((key, value)));
        }
    }
}

/// A positioned, O(1)-step iterator over leaf entries.
///
/// Advancing steps within the current leaf or follows its `next` link;
/// [`Cursor::reversed`] produces a [`ReverseCursor`] that resumes from the
/// same position, stepping via `prev` instead.
pub struct Cursor<'a, P: Provider> {
    tree: &'a mut BTree<P>,
    leaf: Node,
    pos: usize,
}

impl<'a, P: Provider> Cursor<'a, P> {
    pub fn key(&self) -> &[u8] {
        &self.leaf.keys[self.pos]
    }

    pub fn value(&self) -> &[u8] {
        &self.leaf.values()[self.pos]
    }

    /// Overwrites the value at the cursor's current position, marking its
    /// leaf dirty.
    pub fn set_value(&mut self, value: Vec<u8>) {
        self.leaf.values_mut()[self.pos] = value;
        self.tree.provider.mark_dirty(self.leaf.clone());
    }

    /// Advances to the next key. Returns `false` (without moving) if this
    /// was the last key.
    pub fn next(&mut self) -> Result<bool> {
        if self.pos + 1 < self.leaf.keys.len() {
            self.pos += 1;
            return Ok(true);
        }
        match self.leaf.next() {
            Some(next_id) => {
                let next_leaf = self.tree.provider.node(next_id)?;
                if next_leaf.keys.is_empty() {
                    return Ok(false);
                }
                self.leaf = next_leaf;
                self.pos = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Steps to the previous key. Returns `false` (without moving) if this
    /// was the first key.
    pub fn prev(&mut self) -> Result<bool> {
        if self.pos > 0 {
            self.pos -= 1;
            return Ok(true);
        }
        match self.leaf.prev() {
            Some(prev_id) => {
                let prev_leaf = self.tree.provider.node(prev_id)?;
                if prev_leaf.keys.is_empty() {
                    return Ok(false);
                }
                self.pos = prev_leaf.keys.len() - 1;
                self.leaf = prev_leaf;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reverses direction, resuming from the same position.
    pub fn reversed(self) -> ReverseCursor<'a, P> {
        ReverseCursor { inner: self }
    }
}

/// A [`Cursor`] with `next`/`prev` swapped.
pub struct ReverseCursor<'a, P: Provider> {
    inner: Cursor<'a, P>,
}

impl<'a, P: Provider> ReverseCursor<'a, P> {
    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    pub fn value(&self) -> &[u8] {
        self.inner.value()
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.inner.set_value(value)
    }

    pub fn next(&mut self) -> Result<bool> {
        self.inner.prev()
    }

    pub fn prev(&mut self) -> Result<bool> {
        self.inner.next()
    }

    /// Reverses direction again, resuming from the same position.
    pub fn reversed(self) -> Cursor<'a, P> {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::BytesCodec;
    use crate::sack::{OpenMode, Sack};
    use std::collections::BTreeMap;
    use std::io::Cursor as IoCursor;

    fn key(i: u32) -> Vec<u8> {
        format!("{:06}", i).into_bytes()
    }

    fn value(i: u32) -> Vec<u8> {
        i.to_string().into_bytes()
    }

    fn simple_tree(order: usize) -> BTree<SimpleProvider> {
        BTree::new(SimpleProvider::new(order)).unwrap()
    }

    #[test]
    fn get_on_empty_tree_is_not_found() {
        let mut tree = simple_tree(4);
        assert!(matches!(tree.get(b"x"), Err(Error::NotFound)));
    }

    #[test]
    fn put_then_get_roundtrips() {
        let mut tree = simple_tree(4);
        tree.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(tree.get(b"a").unwrap(), b"1");
        assert_eq!(tree.get(b"b").unwrap(), b"2");
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let mut tree = simple_tree(4);
        tree.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(tree.get(b"a").unwrap(), b"2");
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn bulk_insert_forces_splits_and_stays_ordered() {
        let mut tree = simple_tree(4);
        for i in 0..200u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        assert_eq!(tree.len(), 200);
        assert!(tree.depth() > 1);
        for i in 0..200u32 {
            assert_eq!(tree.get(&key(i)).unwrap(), value(i));
        }
    }

    #[test]
    fn range_respects_low_and_high_bounds() {
        let mut tree = simple_tree(5);
        for i in 0..50u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        let got: Vec<_> = tree
            .range(Some(&key(10)), Some(&key(20)))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let expected: Vec<_> = (10..20).map(|i| (key(i), value(i))).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn range_with_no_bounds_yields_everything() {
        let mut tree = simple_tree(4);
        for i in 0..30u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        let got: Vec<_> = tree.range(None, None).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(got.len(), 30);
        assert_eq!(got[0].0, key(0));
        assert_eq!(got[29].0, key(29));
    }

    #[test]
    fn range_with_low_greater_than_high_is_empty() {
        let mut tree = simple_tree(4);
        for i in 0..10u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        let got: Vec<_> = tree
            .range(Some(&key(8)), Some(&key(2)))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn cursor_steps_forward_and_reverses() {
        let mut tree = simple_tree(4);
        for i in 0..40u32 {
            tree.put(key(i), value(i)).unwrap();
        }

        let mut cursor = tree.cursor_at(&key(11)).unwrap();
        assert_eq!(cursor.key(), &key(11)[..]);
        cursor.next().unwrap();
        assert_eq!(cursor.key(), &key(12)[..]);
        cursor.set_value(b"12-edited".to_vec());

        let mut reverse = cursor.reversed();
        assert_eq!(reverse.value(), b"12-edited");
        reverse.next().unwrap();
        assert_eq!(reverse.key(), &key(11)[..]);
        reverse.next().unwrap();
        assert_eq!(reverse.key(), &key(10)[..]);

        let mut forward = reverse.reversed();
        forward.next().unwrap();
        assert_eq!(forward.key(), &key(11)[..]);
    }

    #[test]
    fn delete_triggers_borrow_and_merge_and_root_collapse() {
        let mut tree = simple_tree(4);
        for i in 0..100u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        for i in 0..100u32 {
            tree.pop(&key(i)).unwrap();
        }
        assert_eq!(tree.len(), 0);
        assert!(matches!(tree.get(&key(0)), Err(Error::NotFound)));
        assert!(matches!(tree.pop(&key(0)), Err(Error::NotFound)));
    }

    #[test]
    fn random_ops_mirror_a_sorted_reference_map() {
        let mut state = 0x9E3779B97F4A7C15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut tree = simple_tree(5);
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for _ in 0..4000 {
            let k = key((next() % 300) as u32);
            match next() % 3 {
                0 | 1 => {
                    let v = key((next() % 1000) as u32);
                    tree.put(k.clone(), v.clone()).unwrap();
                    reference.insert(k, v);
                }
                _ => {
                    let tree_result = tree.pop(&k);
                    let reference_result = reference.remove(&k);
                    match reference_result {
                        Some(v) => assert_eq!(tree_result.unwrap(), v),
                        None => assert!(matches!(tree_result, Err(Error::NotFound))),
                    }
                }
            }
        }

        assert_eq!(tree.len(), reference.len() as u64);
        let got: Vec<_> = tree.range(None, None).unwrap().collect::<Result<Vec<_>>>().unwrap();
        let expected: Vec<_> = reference.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn persistence_round_trip_through_sack_provider() {
        let sack = Sack::create(IoCursor::new(Vec::new()), 20).unwrap();
        let mut tree = BTree::new(SackProvider::<_, BytesCodec>::create(sack, 0, 8, false).unwrap()).unwrap();

        for i in 0..300u32 {
            tree.put(key(i), value(i)).unwrap();
        }
        tree.flush().unwrap();

        let provider = tree.into_provider();
        let sack = provider.into_sack();
        let storage = sack.into_storage();

        let reopened_sack = Sack::open(storage, OpenMode::ReadWrite).unwrap();
        let mut reopened =
            BTree::new(SackProvider::<_, BytesCodec>::open(reopened_sack, 0).unwrap()).unwrap();

        assert_eq!(reopened.len(), 300);
        let got: Vec<_> = reopened.range(None, None).unwrap().collect::<Result<Vec<_>>>().unwrap();
        let expected: Vec<_> = (0..300).map(|i| (key(i), value(i))).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn relocation_stress_keeps_ordering_stable_across_many_flushes() {
        let sack = Sack::create(IoCursor::new(Vec::new()), 14).unwrap();
        let mut tree = BTree::new(SackProvider::<_, BytesCodec>::create(sack, 0, 6, false).unwrap()).unwrap();

        for batch in 0..20u32 {
            for i in 0..20u32 {
                let k = batch * 20 + i;
                tree.put(key(k), value(k)).unwrap();
            }
            tree.flush().unwrap();
            let got: Vec<_> = tree.range(None, None).unwrap().collect::<Result<Vec<_>>>().unwrap();
            let expected: Vec<_> = (0..=(batch * 20 + 19)).map(|i| (key(i), value(i))).collect();
            assert_eq!(got, expected);
        }
    }
}
