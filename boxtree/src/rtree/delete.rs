//! Row deletion and condensing of underfull nodes.
//!
//! A node left with fewer than the minimum number of cells is unlinked from
//! its parent and parked on the pending list, tagged with its height. Once
//! the tree is consistent again the cells of every pending node are
//! reinserted at that height.
//!
//! Every delete starts with `reinsert_height` at -1 (see `begin_write`),
//! unlike SQLite, where condensing inherits the value left by the last
//! insert. Overflow during condensing therefore gets its own forced
//! reinsertion per level.

use super::node_cache::NodeRef;
use super::rtree_constants::{MAX_PARENT_HOPS, ROOT_NODE_ID};
use super::rtree_impl::TreeCore;
use super::rtree_types::{NodeId, RTreeResult, RowId};

impl TreeCore {
    /// Acquires the leaf holding `rowid`, returning it with its id.
    pub(crate) fn find_leaf(&mut self, rowid: RowId) -> RTreeResult<Option<(NodeRef, NodeId)>> {
        match self.store.read_rowid_node(rowid)? {
            Some(id) if id != 0 => {
                let leaf = self.acquire(id, None)?;
                Ok(Some((leaf, id)))
            }
            _ => Ok(None),
        }
    }

    /// Loads the missing parent chain of a node reached through the rowid
    /// table rather than from the root.
    fn fix_leaf_parent(&mut self, leaf: NodeRef) -> RTreeResult<()> {
        let mut child = leaf;
        let mut hops = 0;
        while self.node_id(child) != ROOT_NODE_ID && self.node_parent(child).is_none() {
            hops += 1;
            if hops > MAX_PARENT_HOPS {
                return Err(self.corruption("parent chain is too long"));
            }
            let child_id = self.node_id(child);
            let parent_id = match self.store.read_parent(child_id)? {
                Some(id) => id,
                None => {
                    return Err(self.corruption(format!("node {} has no parent mapping", child_id)))
                }
            };

            let mut seen = Some(leaf);
            let mut cycle = false;
            while let Some(n) = seen {
                if self.node_id(n) == parent_id {
                    cycle = true;
                    break;
                }
                seen = self.node_parent(n);
            }
            if cycle {
                return Err(self.corruption(format!(
                    "node {} lists an ancestor as its parent",
                    child_id
                )));
            }

            let parent = self.acquire(parent_id, None)?;
            self.nodes[child].parent = Some(parent);
            child = parent;
        }
        Ok(())
    }

    /// Removes cell `index` from `node`, which sits `height` levels above
    /// the leaves.
    fn delete_cell(&mut self, node: NodeRef, index: usize, height: i32) -> RTreeResult<()> {
        self.fix_leaf_parent(node)?;
        self.remove_cell(node, index);
        if self.node_parent(node).is_some() {
            if self.cell_count(node) < self.layout.min_cells() {
                self.remove_node(node, height)
            } else {
                self.fix_bounding_box(node)
            }
        } else {
            Ok(())
        }
    }

    /// Unlinks `node` from the tree and queues its cells for reinsertion.
    fn remove_node(&mut self, node: NodeRef, height: i32) -> RTreeResult<()> {
        let (parent, rc) = match self.parent_index(node) {
            Ok(Some(index)) => {
                let parent = self.nodes[node].parent.take();
                let rc = match parent {
                    Some(p) => self.delete_cell(p, index, height + 1),
                    None => Ok(()),
                };
                (parent, rc)
            }
            Ok(None) => (None, Ok(())),
            Err(e) => (None, Err(e)),
        };
        let released = self.release_opt(parent);
        rc.and(released)?;

        let id = self.node_id(node);
        self.store.delete_node(id)?;
        self.store.delete_parent(id)?;
        log::trace!("Removed node {} at height {}", id, height);

        self.nodes.unhash(node);
        self.add_ref(node);
        self.pending.push_back((node, height));
        Ok(())
    }

    /// Reinserts the cells of a removed node at its former height.
    fn reinsert_node_content(&mut self, node: NodeRef, height: i32) -> RTreeResult<()> {
        for i in 0..self.cell_count(node) {
            let cell = self.read_cell(node, i);
            let target = self.choose_leaf(&cell, height)?;
            let rc = self.insert_cell(target, &cell, height);
            let released = self.release(target);
            rc.and(released)?;
        }
        Ok(())
    }

    /// Frees every pending node, reinserting its cells unless an earlier
    /// step failed.
    fn drain_pending(&mut self, mut rc: RTreeResult<()>) -> RTreeResult<()> {
        while let Some((node, height)) = self.pending.pop_front() {
            if rc.is_ok() {
                rc = self.reinsert_node_content(node, height);
            }
            self.nodes.detach_children(node);
            self.nodes.remove(node);
        }
        rc
    }

    /// Deletes `rowid` from the tree. The caller has checked that the row
    /// exists.
    pub(crate) fn delete_rowid(&mut self, rowid: RowId) -> RTreeResult<()> {
        let root = self.acquire(ROOT_NODE_ID, None)?;
        let rc = self.delete_rowid_inner(rowid, root);
        let rc = self.drain_pending(rc);
        let released = self.release(root);
        rc.and(released)
    }

    fn delete_rowid_inner(&mut self, rowid: RowId, root: NodeRef) -> RTreeResult<()> {
        if let Some((leaf, _)) = self.find_leaf(rowid)? {
            let rc = match self.cell_index(leaf, rowid) {
                Ok(index) => self.delete_cell(leaf, index, 0),
                Err(e) => Err(e),
            };
            let released = self.release(leaf);
            rc.and(released)?;
        }
        self.store.delete_rowid_node(rowid)?;

        if self.depth > 0 && self.cell_count(root) == 1 {
            let child_id = self.cell_id(root, 0);
            let child = self.acquire(child_id, Some(root))?;
            let depth = self.depth;
            let rc = self.remove_node(child, depth - 1);
            let released = self.release(child);
            rc.and(released)?;

            self.depth -= 1;
            let depth = self.depth;
            let layout = self.layout;
            let entry = &mut self.nodes[root];
            layout.set_depth(&mut entry.data, depth);
            entry.dirty = true;
            log::debug!("Root collapsed, tree depth is now {}", depth);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rtree::rtree_impl::TreeCore;
    use crate::rtree::rtree_types::{Cell, Coord, CoordType};

    fn boxed(id: i64, x: f32) -> Cell {
        let mut c = Cell::new(id, CoordType::Real32);
        c.coords[0] = Coord::Real(x);
        c.coords[1] = Coord::Real(x + 1.0);
        c.coords[2] = Coord::Real(0.0);
        c.coords[3] = Coord::Real(1.0);
        c
    }

    fn insert(core: &mut TreeCore, cell: Cell) {
        core.reinsert_height = -1;
        let leaf = core.choose_leaf(&cell, 0).unwrap();
        core.insert_cell(leaf, &cell, 0).unwrap();
        core.release(leaf).unwrap();
    }

    #[test]
    fn test_delete_from_root_leaf() {
        let (mut core, store) = TreeCore::for_tests(2, 4);
        insert(&mut core, boxed(1, 0.0));
        insert(&mut core, boxed(2, 5.0));
        core.delete_rowid(1).unwrap();
        assert_eq!(core.nodes.live(), 0);

        let tables = store.tables();
        assert!(!tables.rowids.contains_key(&1));
        let root = tables.nodes.get(&1).unwrap();
        assert_eq!(core.layout.cell_count(root), 1);
        assert_eq!(core.layout.cell_id(root, 0), 2);
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let (mut core, store) = TreeCore::for_tests(2, 3);
        for i in 1..=20 {
            insert(&mut core, boxed(i, i as f32 * 3.0));
        }
        assert!(core.current_depth().unwrap() >= 2);

        for i in 1..=20 {
            core.delete_rowid(i).unwrap();
            assert_eq!(core.nodes.live(), 0);
            assert!(core.pending.is_empty());
        }
        assert_eq!(core.current_depth().unwrap(), 0);

        let tables = store.tables();
        assert_eq!(tables.nodes.len(), 1);
        assert!(tables.parents.is_empty());
        assert!(tables.rowids.is_empty());
        assert_eq!(core.layout.cell_count(tables.nodes.get(&1).unwrap()), 0);
    }

    #[test]
    fn test_underfull_leaf_is_condensed() {
        let (mut core, store) = TreeCore::for_tests(2, 6);
        for i in 1..=14 {
            insert(&mut core, boxed(i, i as f32 * 2.0));
        }
        for i in 1..=6 {
            core.delete_rowid(i).unwrap();
        }

        let tables = store.tables();
        assert_eq!(tables.rowids.len(), 8);
        let min = core.layout.min_cells();
        for (id, blob) in &tables.nodes {
            if *id != 1 {
                assert!(core.layout.cell_count(blob) >= min);
            }
        }
        for (rowid, leaf) in &tables.rowids {
            let blob = tables.nodes.get(leaf).unwrap();
            let n = core.layout.cell_count(blob);
            assert!((0..n).any(|i| core.layout.cell_id(blob, i) == *rowid));
        }
    }

    #[test]
    fn test_missing_parent_mapping_is_corrupt() {
        let (mut core, store) = TreeCore::for_tests(2, 2);
        for i in 1..=3 {
            insert(&mut core, boxed(i, i as f32 * 10.0));
        }
        let leaf = *store.tables().rowids.get(&1).unwrap();
        store.with_tables(|t| t.parents.remove(&leaf));

        let err = core.delete_rowid(1).unwrap_err();
        assert!(err.is_corrupt());
        assert!(core.corrupt);
    }
}
