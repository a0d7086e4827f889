//! In-memory node cache and reference counting.
//!
//! Nodes live in a slab indexed by [`NodeRef`]. A node id maps to at most
//! one slot, so a node is never loaded twice. Each cached node holds a
//! counted reference on its parent; releasing the last reference of a node
//! releases (and so flushes) the parent before the node itself is written
//! and dropped.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use super::rtree_constants::{MAX_DEPTH, MAX_PARENT_HOPS, ROOT_NODE_ID};
use super::rtree_impl::TreeCore;
use super::rtree_types::{Cell, NodeId, RTreeError, RTreeResult};

/// Handle to a cached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeRef(usize);

#[derive(Debug)]
pub(crate) struct CachedNode {
    /// 0 until the node is first written
    pub id: NodeId,
    pub parent: Option<NodeRef>,
    pub n_ref: u32,
    pub dirty: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct NodeCache {
    slots: Vec<Option<CachedNode>>,
    free: Vec<usize>,
    by_id: HashMap<NodeId, NodeRef>,
    live: usize,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: NodeId) -> Option<NodeRef> {
        self.by_id.get(&id).copied()
    }

    /// Stores a node, indexing it by id unless the id is still unassigned.
    pub fn insert(&mut self, node: CachedNode) -> NodeRef {
        let id = node.id;
        let r = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeRef(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeRef(self.slots.len() - 1)
            }
        };
        if id != 0 {
            self.by_id.insert(id, r);
        }
        self.live += 1;
        r
    }

    /// Indexes a node under its current id.
    pub fn hash(&mut self, r: NodeRef) {
        let id = self[r].id;
        self.by_id.insert(id, r);
    }

    /// Drops the id index entry of a node; the node itself stays allocated.
    pub fn unhash(&mut self, r: NodeRef) {
        let id = self[r].id;
        if self.by_id.get(&id) == Some(&r) {
            self.by_id.remove(&id);
        }
    }

    pub fn remove(&mut self, r: NodeRef) -> Option<CachedNode> {
        let node = self.slots.get_mut(r.0)?.take()?;
        if self.by_id.get(&node.id) == Some(&r) {
            self.by_id.remove(&node.id);
        }
        self.free.push(r.0);
        self.live -= 1;
        Some(node)
    }

    /// Clears every parent link pointing at `r`.
    pub fn detach_children(&mut self, r: NodeRef) {
        for node in self.slots.iter_mut().flatten() {
            if node.parent == Some(r) {
                node.parent = None;
            }
        }
    }

    /// Number of nodes held in memory.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Returns true if `node` is `start` or one of its ancestors.
    /// An overlong chain counts as a match.
    pub fn in_parent_chain(&self, node: NodeRef, start: NodeRef) -> bool {
        let mut cursor = Some(start);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == node || hops > MAX_PARENT_HOPS {
                return true;
            }
            cursor = self[current].parent;
            hops += 1;
        }
        false
    }
}

impl Index<NodeRef> for NodeCache {
    type Output = CachedNode;

    fn index(&self, r: NodeRef) -> &CachedNode {
        match self.slots.get(r.0) {
            Some(Some(node)) => node,
            _ => panic!("stale node handle {:?}", r),
        }
    }
}

impl IndexMut<NodeRef> for NodeCache {
    fn index_mut(&mut self, r: NodeRef) -> &mut CachedNode {
        match self.slots.get_mut(r.0) {
            Some(Some(node)) => node,
            _ => panic!("stale node handle {:?}", r),
        }
    }
}

// ============================================================================
// Reference counting
// ============================================================================

impl TreeCore {
    /// Latches the corrupt flag and builds the error.
    pub(crate) fn corruption(&mut self, msg: impl Into<String>) -> RTreeError {
        let msg = msg.into();
        log::warn!("R-tree corruption detected: {}", msg);
        self.corrupt = true;
        RTreeError::Corrupt(msg)
    }

    fn latch<T>(&mut self, result: RTreeResult<T>) -> RTreeResult<T> {
        if let Err(e) = &result {
            if e.is_corrupt() {
                log::warn!("R-tree corruption detected: {}", e);
                self.corrupt = true;
            }
        }
        result
    }

    /// Returns a counted reference to node `id`, loading it from the store
    /// if needed. A `parent` hint is attached to a cached node that has no
    /// parent yet.
    pub(crate) fn acquire(&mut self, id: NodeId, parent: Option<NodeRef>) -> RTreeResult<NodeRef> {
        if let Some(r) = self.nodes.lookup(id) {
            if let Some(p) = parent {
                match self.nodes[r].parent {
                    None => {
                        if self.nodes.in_parent_chain(r, p) {
                            return Err(self.corruption(format!(
                                "node {} would become its own ancestor",
                                id
                            )));
                        }
                        self.nodes[p].n_ref += 1;
                        self.nodes[r].parent = Some(p);
                    }
                    Some(existing) if existing != p => {
                        return Err(self.corruption(format!(
                            "node {} is attached to two parents",
                            id
                        )));
                    }
                    Some(_) => {}
                }
            }
            self.nodes[r].n_ref += 1;
            self.stats.cache_hits += 1;
            return Ok(r);
        }

        let data = match self.store.read_node(id)? {
            Some(data) => data,
            None => return Err(self.corruption(format!("node {} is missing", id))),
        };
        self.stats.node_reads += 1;
        let checked = self.layout.validate(&data);
        self.latch(checked)?;

        if id == ROOT_NODE_ID {
            let depth = self.layout.depth(&data);
            if depth > MAX_DEPTH {
                return Err(self.corruption(format!("tree depth {} out of range", depth)));
            }
            self.depth = depth;
        }

        if let Some(p) = parent {
            self.nodes[p].n_ref += 1;
        }
        Ok(self.nodes.insert(CachedNode {
            id,
            parent,
            n_ref: 1,
            dirty: false,
            data,
        }))
    }

    /// Drops one reference. The last release flushes the parent chain first,
    /// then writes this node if dirty, then frees it.
    pub(crate) fn release(&mut self, node: NodeRef) -> RTreeResult<()> {
        let entry = &mut self.nodes[node];
        debug_assert!(entry.n_ref > 0);
        entry.n_ref = entry.n_ref.saturating_sub(1);
        if entry.n_ref > 0 {
            return Ok(());
        }
        let (id, parent) = (entry.id, entry.parent);
        if id == ROOT_NODE_ID {
            self.depth = -1;
        }
        let mut rc = match parent {
            Some(p) => self.release(p),
            None => Ok(()),
        };
        if rc.is_ok() {
            rc = self.write_node(node);
        }
        self.nodes.remove(node);
        rc
    }

    /// Releases `node` if present.
    pub(crate) fn release_opt(&mut self, node: Option<NodeRef>) -> RTreeResult<()> {
        match node {
            Some(node) => self.release(node),
            None => Ok(()),
        }
    }

    /// Allocates an empty dirty node with an unassigned id.
    pub(crate) fn new_node(&mut self, parent: Option<NodeRef>) -> NodeRef {
        if let Some(p) = parent {
            self.nodes[p].n_ref += 1;
        }
        let data = self.layout.empty_node();
        self.nodes.insert(CachedNode {
            id: 0,
            parent,
            n_ref: 1,
            dirty: true,
            data,
        })
    }

    /// Takes an extra reference on a node already held.
    pub(crate) fn add_ref(&mut self, node: NodeRef) {
        self.nodes[node].n_ref += 1;
    }

    /// Writes a dirty node, assigning its id on first write.
    pub(crate) fn write_node(&mut self, node: NodeRef) -> RTreeResult<()> {
        let entry = &self.nodes[node];
        if !entry.dirty {
            return Ok(());
        }
        let id = if entry.id == 0 { None } else { Some(entry.id) };
        let assigned = self.store.write_node(id, &entry.data)?;
        self.stats.node_writes += 1;
        let entry = &mut self.nodes[node];
        entry.dirty = false;
        if entry.id == 0 {
            entry.id = assigned;
            self.nodes.hash(node);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cell access
    // ------------------------------------------------------------------------

    pub(crate) fn node_id(&self, node: NodeRef) -> NodeId {
        self.nodes[node].id
    }

    pub(crate) fn node_parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.nodes[node].parent
    }

    pub(crate) fn cell_count(&self, node: NodeRef) -> usize {
        self.layout.cell_count(&self.nodes[node].data)
    }

    pub(crate) fn read_cell(&self, node: NodeRef, index: usize) -> Cell {
        self.layout.read_cell(&self.nodes[node].data, index)
    }

    pub(crate) fn cell_id(&self, node: NodeRef, index: usize) -> i64 {
        self.layout.cell_id(&self.nodes[node].data, index)
    }

    pub(crate) fn overwrite_cell(&mut self, node: NodeRef, index: usize, cell: &Cell) {
        let layout = self.layout;
        let entry = &mut self.nodes[node];
        layout.write_cell(&mut entry.data, index, cell);
        entry.dirty = true;
    }

    /// Appends a cell. Returns `true` if the node was full.
    pub(crate) fn append_cell(&mut self, node: NodeRef, cell: &Cell) -> bool {
        let layout = self.layout;
        let entry = &mut self.nodes[node];
        let full = layout.insert_cell(&mut entry.data, cell);
        if !full {
            entry.dirty = true;
        }
        full
    }

    pub(crate) fn remove_cell(&mut self, node: NodeRef, index: usize) {
        let layout = self.layout;
        let entry = &mut self.nodes[node];
        layout.delete_cell(&mut entry.data, index);
        entry.dirty = true;
    }

    /// Clears all cells, keeping the depth header.
    pub(crate) fn zero_node(&mut self, node: NodeRef) {
        let layout = self.layout;
        let entry = &mut self.nodes[node];
        layout.zero(&mut entry.data);
        entry.dirty = true;
    }

    /// Index of the cell with id `id` in `node`.
    pub(crate) fn cell_index(&mut self, node: NodeRef, id: i64) -> RTreeResult<usize> {
        let count = self.cell_count(node);
        for i in 0..count {
            if self.cell_id(node, i) == id {
                return Ok(i);
            }
        }
        let node_id = self.node_id(node);
        Err(self.corruption(format!("node {} has no cell for id {}", node_id, id)))
    }

    /// Index of `node`'s cell inside its parent, `None` for the root.
    pub(crate) fn parent_index(&mut self, node: NodeRef) -> RTreeResult<Option<usize>> {
        match self.node_parent(node) {
            Some(parent) => {
                let id = self.node_id(node);
                self.cell_index(parent, id).map(Some)
            }
            None => Ok(None),
        }
    }
}
