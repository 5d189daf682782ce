// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node providers.
//!
//! A [`Provider`] is the B+Tree's only window onto node storage: it resolves
//! node identities, tracks which nodes have been mutated since the last
//! flush, and knows how to create and release nodes. [`SimpleProvider`] is
//! an in-memory provider with no persistence (grounded in
//! `examples/original_source/providers/simple.py`); [`SackProvider`] backs
//! the tree with a [`Sack`](crate::sack::Sack), implementing the same
//! three-phase flush protocol as
//! `examples/original_source/providers/sack/sack.py`.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::marker::PhantomData;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::metrics::{Metric, MetricUnit, MetricsCollector};
use crate::sack::{Descriptor, Sack, Storage};

use super::bisect_right;
use super::codec::NodeCodec;
use super::node::{Node, NodeId, NodeKind};

/// Parameters for a node the B+Tree wants created.
pub enum NewNode {
    Leaf {
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    },
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<NodeId>,
    },
}

/// The B+Tree's view of node storage and tree-wide metadata.
pub trait Provider {
    fn root(&self) -> NodeId;
    fn set_root(&mut self, id: NodeId);

    fn depth(&self) -> u32;
    fn set_depth(&mut self, depth: u32);

    fn size(&self) -> u64;
    fn set_size(&mut self, size: u64);

    /// Maximum children per internal node (and `order - 1` keys per leaf).
    fn order(&self) -> usize;

    /// Resolves a node identity to its current contents.
    fn node(&mut self, id: NodeId) -> Result<Node>;

    /// Records a node's current contents and marks it dirty.
    fn mark_dirty(&mut self, node: Node);

    /// Destroys a node: removed from the cache and, if persisted, freed.
    fn release(&mut self, id: NodeId) -> Result<()>;

    /// Allocates a new in-memory node id for `new` and marks it dirty.
    fn create(&mut self, new: NewNode) -> NodeId;

    /// Persists every dirty node and the tree header.
    fn flush(&mut self) -> Result<()>;
}

/// An in-memory provider with no persistence.
///
/// Every node is born dirty and stays dirty forever; `flush` is a no-op.
/// Useful for tests and for callers who only need an ordered map, not
/// durability.
pub struct SimpleProvider {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    size: u64,
    depth: u32,
    order: usize,
    next_id: u64,
}

impl SimpleProvider {
    pub fn new(order: usize) -> Self {
        let root_id = NodeId::Pending(1);
        let mut nodes = HashMap::new();
        nodes.insert(root_id, Node::new_leaf(root_id, Vec::new(), Vec::new()));
        Self {
            nodes,
            root: root_id,
            size: 0,
            depth: 1,
            order,
            next_id: 2,
        }
    }
}

impl Provider for SimpleProvider {
    fn root(&self) -> NodeId {
        self.root
    }

    fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn order(&self) -> usize {
        self.order
    }

    fn node(&mut self, id: NodeId) -> Result<Node> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::corrupt("unknown in-memory node id"))
    }

    fn mark_dirty(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    fn release(&mut self, id: NodeId) -> Result<()> {
        self.nodes.remove(&id);
        Ok(())
    }

    fn create(&mut self, new: NewNode) -> NodeId {
        let id = NodeId::Pending(self.next_id);
        self.next_id += 1;
        let node = match new {
            NewNode::Leaf { keys, values } => Node::new_leaf(id, keys, values),
            NewNode::Internal { keys, children } => Node::new_internal(id, keys, children),
        };
        self.nodes.insert(id, node);
        id
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

const HEADER_LEN: usize = 2 + 1 + 4 + 4 + 8 + 8;
const FLAG_COMPRESSION: u8 = 0x01;
const LEAF_TAG: u8 = 0x01;
const INTERNAL_TAG: u8 = 0x00;
const CHECKSUM_LEN: usize = 4;

/// A sack-backed provider: nodes are records in a [`Sack`], addressed
/// through a B+Tree header stored at cell `cell_index`.
pub struct SackProvider<S: Storage, C: NodeCodec> {
    sack: Sack<S>,
    cell_index: usize,
    order: usize,
    depth: u32,
    size: u64,
    root: NodeId,
    compression: bool,
    cache: HashMap<NodeId, Node>,
    dirty: HashSet<NodeId>,
    next_id: u64,
    _codec: PhantomData<C>,
}

impl<S: Storage, C: NodeCodec> SackProvider<S, C> {
    /// Creates a brand new tree (empty leaf root) in cell `cell_index`, and
    /// flushes once so the header is immediately valid.
    pub fn create(sack: Sack<S>, cell_index: usize, order: usize, compression: bool) -> Result<Self> {
        let root_id = NodeId::Pending(1);
        let mut cache = HashMap::new();
        cache.insert(root_id, Node::new_leaf(root_id, Vec::new(), Vec::new()));
        let mut dirty = HashSet::new();
        dirty.insert(root_id);

        let mut provider = Self {
            sack,
            cell_index,
            order,
            depth: 1,
            size: 0,
            root: root_id,
            compression,
            cache,
            dirty,
            next_id: 2,
            _codec: PhantomData,
        };
        provider.flush()?;
        Ok(provider)
    }

    /// Opens a tree previously written to cell `cell_index`.
    pub fn open(sack: Sack<S>, cell_index: usize) -> Result<Self> {
        let mut provider = Self {
            sack,
            cell_index,
            order: 0,
            depth: 1,
            size: 0,
            root: NodeId::Pending(0),
            compression: false,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            next_id: 1,
            _codec: PhantomData,
        };

        let header = provider
            .sack
            .cell()
            .get(cell_index)
            .ok_or_else(|| Error::corrupt("no B+Tree header at this cell"))?
            .to_vec();
        if header.len() < HEADER_LEN {
            return Err(Error::corrupt("truncated B+Tree header"));
        }
        if &header[0..2] != &C::TAG {
            return Err(Error::bad_argument(format!(
                "codec tag mismatch: header names {:?}, requested {:?}",
                &header[0..2],
                C::TAG
            )));
        }
        let flags = header[2];
        let order = u32::from_be_bytes(header[3..7].try_into().unwrap()) as usize;
        let depth = u32::from_be_bytes(header[7..11].try_into().unwrap());
        let size = u64::from_be_bytes(header[11..19].try_into().unwrap());
        let root_desc = Descriptor::from_be_bytes(header[19..27].try_into().unwrap());

        provider.order = order;
        provider.depth = depth;
        provider.size = size;
        provider.compression = flags & FLAG_COMPRESSION != 0;
        provider.root = NodeId::Disk(root_desc);

        Ok(provider)
    }

    /// Unwraps the provider, handing back the underlying sack. Useful for
    /// reopening the same backing store under a different cell/tree.
    pub fn into_sack(self) -> Sack<S> {
        self.sack
    }

    fn fetch(&mut self, id: NodeId) -> Result<Node> {
        if let Some(node) = self.cache.get(&id) {
            record_count("node_cache_hit");
            return Ok(node.clone());
        }
        match id {
            NodeId::Pending(_) => Err(Error::corrupt("pending node missing from cache")),
            NodeId::Disk(desc) => {
                record_count("node_cache_miss");
                let node = self.load_node(desc)?;
                self.cache.insert(id, node.clone());
                Ok(node)
            }
        }
    }

    fn load_node(&mut self, desc: Descriptor) -> Result<Node> {
        let framed = self.sack.get(desc)?;
        let raw = verify_checksum(&framed)?;
        if raw.is_empty() {
            return Err(Error::corrupt("empty node record"));
        }
        let id = NodeId::Disk(desc);
        match raw[0] {
            tag if tag == LEAF_TAG => {
                if raw.len() < 17 {
                    return Err(Error::corrupt("truncated leaf header"));
                }
                let prev = Descriptor::from_be_bytes(raw[1..9].try_into().unwrap());
                let next = Descriptor::from_be_bytes(raw[9..17].try_into().unwrap());
                let body = decompress_if(&raw[17..], self.compression)?;
                let (keys, consumed) = C::decode_items(&body)?;
                let (values, _) = C::decode_items(&body[consumed..])?;

                let mut node = Node::new_leaf(id, keys, values);
                node.set_prev((!prev.is_none()).then_some(NodeId::Disk(prev)));
                node.set_next((!next.is_none()).then_some(NodeId::Disk(next)));
                Ok(node)
            }
            tag if tag == INTERNAL_TAG => {
                if raw.len() < 3 {
                    return Err(Error::corrupt("truncated internal node header"));
                }
                let count = u16::from_be_bytes(raw[1..3].try_into().unwrap()) as usize;
                let body = decompress_if(&raw[3..], self.compression)?;
                let (keys, consumed) = C::decode_items(&body)?;

                let children_bytes = &body[consumed..];
                if children_bytes.len() < count * 8 {
                    return Err(Error::corrupt("truncated internal node children"));
                }
                let mut children = Vec::with_capacity(count);
                for i in 0..count {
                    let start = i * 8;
                    let desc = Descriptor::from_be_bytes(
                        children_bytes[start..start + 8].try_into().unwrap(),
                    );
                    children.push(NodeId::Disk(desc));
                }
                Ok(Node::new_internal(id, keys, children))
            }
            other => Err(Error::corrupt(format!("unknown node tag {other}"))),
        }
    }

    fn locate_parent(&mut self, key: &[u8], target: NodeId) -> Result<NodeId> {
        let mut current = self.root;
        loop {
            let node = self.fetch(current)?;
            if node.is_leaf() {
                return Err(Error::corrupt("locate_parent descended into a leaf"));
            }
            let index = bisect_right(&node.keys, key);
            let child = node.children()[index];
            if child == target {
                return Ok(current);
            }
            current = child;
        }
    }

    fn encode_leaf_body(&self, node: &Node) -> Vec<u8> {
        let mut body = C::encode_items(&node.keys);
        body.extend_from_slice(&C::encode_items(node.values()));
        if self.compression {
            compress(&body)
        } else {
            body
        }
    }

    fn encode_internal_body(&self, keys: &[Vec<u8>], children: &[Descriptor]) -> Vec<u8> {
        let mut body = C::encode_items(keys);
        for child in children {
            body.extend_from_slice(&child.to_be_bytes());
        }
        if self.compression {
            compress(&body)
        } else {
            body
        }
    }

    /// Second pass of leaf flushing: resolves `id`'s current identity (it
    /// may have been relocated by the first pass) and its prev/next
    /// descriptors, then writes the final framed record.
    fn write_leaf(
        &mut self,
        old_id: NodeId,
        body: Vec<u8>,
        reloc: &HashMap<NodeId, NodeId>,
    ) -> Result<()> {
        let current_id = reloc.get(&old_id).copied().unwrap_or(old_id);
        let mut node = self.fetch(current_id)?;

        if let Some(prev) = node.prev() {
            if let Some(&new_prev) = reloc.get(&prev) {
                node.set_prev(Some(new_prev));
            }
        }
        if let Some(next) = node.next() {
            if let Some(&new_next) = reloc.get(&next) {
                node.set_next(Some(new_next));
            }
        }

        let prev_desc = match node.prev() {
            Some(NodeId::Disk(d)) => d,
            Some(NodeId::Pending(_)) => return Err(Error::corrupt("unresolved prev sibling")),
            None => Descriptor::NONE,
        };
        let next_desc = match node.next() {
            Some(NodeId::Disk(d)) => d,
            Some(NodeId::Pending(_)) => return Err(Error::corrupt("unresolved next sibling")),
            None => Descriptor::NONE,
        };

        let mut framed = Vec::with_capacity(1 + 16 + body.len() + 4);
        framed.push(LEAF_TAG);
        framed.extend_from_slice(&prev_desc.to_be_bytes());
        framed.extend_from_slice(&next_desc.to_be_bytes());
        framed.extend_from_slice(&body);
        append_checksum(&mut framed);

        let target_desc = match current_id {
            NodeId::Disk(d) => d,
            NodeId::Pending(_) => return Err(Error::corrupt("leaf was not assigned a descriptor")),
        };
        let written = self.sack.push(&framed, Some(target_desc))?;
        debug_assert_eq!(written, target_desc);

        self.cache.insert(current_id, node);
        Ok(())
    }

    fn node_flush(
        &mut self,
        id: NodeId,
        reloc: &mut HashMap<NodeId, NodeId>,
        node_queue: &mut HashSet<NodeId>,
    ) -> Result<Descriptor> {
        let node = self.fetch(id)?;
        let children: Vec<NodeId> = node.children().to_vec();

        let mut resolved = Vec::with_capacity(children.len());
        for child in children {
            let desc = if let Some(&new_id) = reloc.get(&child) {
                match new_id {
                    NodeId::Disk(d) => d,
                    NodeId::Pending(_) => return Err(Error::corrupt("child relocated to a pending id")),
                }
            } else if node_queue.contains(&child) {
                self.node_flush(child, reloc, node_queue)?
            } else {
                match child {
                    NodeId::Disk(d) => d,
                    NodeId::Pending(_) => {
                        return Err(Error::corrupt("child was never flushed"))
                    }
                }
            };
            resolved.push(desc);
        }

        let body = self.encode_internal_body(&node.keys, &resolved);
        let mut framed = Vec::with_capacity(3 + body.len() + 4);
        framed.push(INTERNAL_TAG);
        framed.extend_from_slice(&(resolved.len() as u16).to_be_bytes());
        framed.extend_from_slice(&body);
        append_checksum(&mut framed);

        let previous = match id {
            NodeId::Disk(d) => Some(d),
            NodeId::Pending(_) => None,
        };
        let new_desc = self.sack.push(&framed, previous)?;
        let new_id = NodeId::Disk(new_desc);

        let mut stored = node;
        stored.kind = NodeKind::Internal {
            children: resolved.into_iter().map(NodeId::Disk).collect(),
        };

        if previous != Some(new_desc) {
            if id != self.root {
                let first_key = stored
                    .keys
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::corrupt("relocated non-root node has no keys"))?;
                let parent_id = self.locate_parent(&first_key, id)?;
                if !self.dirty.contains(&parent_id) {
                    node_queue.insert(parent_id);
                }
            }
            reloc.insert(id, new_id);
            self.cache.remove(&id);
            stored.id = new_id;
            self.cache.insert(new_id, stored);
            if self.root == id {
                self.root = new_id;
            }
        } else {
            self.cache.insert(id, stored);
        }

        node_queue.remove(&id);
        Ok(new_desc)
    }
}

impl<S: Storage, C: NodeCodec> Provider for SackProvider<S, C> {
    fn root(&self) -> NodeId {
        self.root
    }

    fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn order(&self) -> usize {
        self.order
    }

    fn node(&mut self, id: NodeId) -> Result<Node> {
        self.fetch(id)
    }

    fn mark_dirty(&mut self, node: Node) {
        let id = node.id;
        self.cache.insert(id, node);
        self.dirty.insert(id);
    }

    fn release(&mut self, id: NodeId) -> Result<()> {
        self.cache.remove(&id);
        self.dirty.remove(&id);
        if let NodeId::Disk(desc) = id {
            self.sack.pop(desc)?;
        }
        Ok(())
    }

    fn create(&mut self, new: NewNode) -> NodeId {
        let id = NodeId::Pending(self.next_id);
        self.next_id += 1;
        let node = match new {
            NewNode::Leaf { keys, values } => Node::new_leaf(id, keys, values),
            NewNode::Internal { keys, children } => Node::new_internal(id, keys, children),
        };
        self.cache.insert(id, node);
        self.dirty.insert(id);
        id
    }

    /// Three-phase flush: leaves (with two-phase prev/next resolution via a
    /// relocation table), then internal nodes bottom-up, then the tree
    /// header and the underlying sack.
    fn flush(&mut self) -> Result<()> {
        let started = std::time::Instant::now();
        let result = self.flush_inner();
        record_duration("flush_duration", started.elapsed());
        result
    }
}

impl<S: Storage, C: NodeCodec> SackProvider<S, C> {
    fn flush_inner(&mut self) -> Result<()> {
        let mut reloc: HashMap<NodeId, NodeId> = HashMap::new();
        let mut node_queue: HashSet<NodeId> = HashSet::new();
        let mut leaf_order: Vec<NodeId> = Vec::new();
        let mut leaf_bodies: HashMap<NodeId, Vec<u8>> = HashMap::new();
        let mut to_enqueue: Vec<NodeId> = Vec::new();

        for id in self.dirty.iter().copied() {
            let node = self
                .cache
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::corrupt("dirty node missing from cache"))?;
            if node.is_leaf() {
                to_enqueue.push(id);
            } else {
                node_queue.insert(id);
            }
        }

        while let Some(id) = to_enqueue.pop() {
            if leaf_bodies.contains_key(&id) {
                continue;
            }
            let node = self.fetch(id)?;

            let body = self.encode_leaf_body(&node);
            let total_len = body.len() + 1 + 16 + CHECKSUM_LEN;
            let previous = match id {
                NodeId::Disk(d) => Some(d),
                NodeId::Pending(_) => None,
            };
            let new_desc = self.sack.reserve(total_len, previous)?;
            let relocated = previous != Some(new_desc);
            let new_id = NodeId::Disk(new_desc);

            leaf_bodies.insert(id, body);
            leaf_order.push(id);

            if relocated {
                if id != self.root {
                    let first_key = node
                        .keys
                        .first()
                        .cloned()
                        .ok_or_else(|| Error::corrupt("relocated leaf has no keys"))?;
                    let parent_id = self.locate_parent(&first_key, id)?;
                    if !self.dirty.contains(&parent_id) {
                        node_queue.insert(parent_id);
                    }
                }

                for sibling in [node.prev(), node.next()].into_iter().flatten() {
                    if matches!(sibling, NodeId::Disk(_))
                        && !reloc.contains_key(&sibling)
                        && !self.dirty.contains(&sibling)
                        && !leaf_bodies.contains_key(&sibling)
                    {
                        self.fetch(sibling)?;
                        to_enqueue.push(sibling);
                    }
                }

                reloc.insert(id, new_id);
                self.cache.remove(&id);
                let mut moved = node;
                moved.id = new_id;
                self.cache.insert(new_id, moved);
                if self.root == id {
                    self.root = new_id;
                }
            }
        }

        for old_id in leaf_order {
            let body = leaf_bodies.remove(&old_id).expect("body recorded above");
            self.write_leaf(old_id, body, &reloc)?;
        }

        while let Some(id) = node_queue.iter().next().copied() {
            self.node_flush(id, &mut reloc, &mut node_queue)?;
        }

        self.dirty.clear();

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&C::TAG);
        header.push(if self.compression { FLAG_COMPRESSION } else { 0 });
        header.extend_from_slice(&(self.order as u32).to_be_bytes());
        header.extend_from_slice(&(self.depth).to_be_bytes());
        header.extend_from_slice(&self.size.to_be_bytes());
        let root_desc = match self.root {
            NodeId::Disk(d) => d,
            NodeId::Pending(_) => return Err(Error::corrupt("root was never flushed")),
        };
        header.extend_from_slice(&root_desc.to_be_bytes());
        self.sack.cell_mut().set(self.cell_index, header);

        record_value("flush_relocations", reloc.len() as f64, MetricUnit::Count);

        self.sack.flush()
    }
}

fn record_count(name: &str) {
    record_value(name, 1.0, MetricUnit::Count);
}

fn record_value(name: &str, value: f64, unit: MetricUnit) {
    MetricsCollector::global().record(Metric::new(name, value, unit));
}

fn record_duration(name: &str, duration: std::time::Duration) {
    record_value(name, duration.as_micros() as f64, MetricUnit::Microseconds);
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory compression cannot fail");
    encoder.finish().expect("in-memory compression cannot fail")
}

/// Appends a big-endian CRC32 of everything written so far to `framed`,
/// guarding a node record against silent corruption on the backing stream.
fn append_checksum(framed: &mut Vec<u8>) {
    let crc = crc32fast::hash(framed);
    framed.extend_from_slice(&crc.to_be_bytes());
}

/// Splits off and verifies the trailing CRC32 written by [`append_checksum`],
/// returning the record body (tag, headers, payload) with the checksum
/// stripped.
fn verify_checksum(framed: &[u8]) -> Result<&[u8]> {
    if framed.len() < CHECKSUM_LEN {
        return Err(Error::corrupt("node record too short to hold a checksum"));
    }
    let (body, trailer) = framed.split_at(framed.len() - CHECKSUM_LEN);
    let expected = u32::from_be_bytes(trailer.try_into().unwrap());
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::corrupt("node record checksum mismatch"));
    }
    Ok(body)
}

fn decompress_if(data: &[u8], compression: bool) -> Result<Vec<u8>> {
    if !compression {
        return Ok(data.to_vec());
    }
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupt(format!("node body decompression failed: {e}")))?;
    Ok(out)
}
