//! Store collaborator for the R-tree.
//!
//! The tree keeps three logical tables in its store:
//! - `node`: node id -> fixed-size node blob
//! - `parent`: child node id -> parent node id (every non-root node)
//! - `rowid`: row id -> id of the leaf holding the row
//!
//! plus an optional `aux` table with caller-defined columns stored alongside
//! each row id. [`MemoryStore`] keeps them in memory; [`FileStore`]
//! persists them to a single file.
//!
//! [`FileStore`]: super::file_store::FileStore

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::rtree_types::{NodeId, RTreeError, RTreeResult, RowId, Value};

/// Persistent storage used by the tree.
///
/// Every call is blocking. Absent rows are reported with `None`; the tree
/// decides whether an absent row is corruption.
pub trait NodeStore: Send {
    /// Returns the blob of node `id`.
    fn read_node(&mut self, id: NodeId) -> RTreeResult<Option<Vec<u8>>>;

    /// Stores a node blob. With `id == None` a new id is assigned and returned.
    fn write_node(&mut self, id: Option<NodeId>, data: &[u8]) -> RTreeResult<NodeId>;

    fn delete_node(&mut self, id: NodeId) -> RTreeResult<()>;

    fn read_parent(&mut self, child: NodeId) -> RTreeResult<Option<NodeId>>;

    /// Inserts or replaces the parent of `child`.
    fn write_parent(&mut self, child: NodeId, parent: NodeId) -> RTreeResult<()>;

    fn delete_parent(&mut self, child: NodeId) -> RTreeResult<()>;

    fn read_rowid_node(&mut self, rowid: RowId) -> RTreeResult<Option<NodeId>>;

    /// Inserts or updates the leaf holding `rowid`, keeping any aux columns.
    /// With `rowid == None` a fresh row id is assigned and returned; node id
    /// 0 marks a row that has been reserved but not yet placed.
    fn write_rowid_node(&mut self, rowid: Option<RowId>, node: NodeId) -> RTreeResult<RowId>;

    /// Removes the row mapping together with its aux columns.
    fn delete_rowid_node(&mut self, rowid: RowId) -> RTreeResult<()>;

    /// Aux columns stored for `rowid`.
    fn read_aux(&mut self, _rowid: RowId) -> RTreeResult<Option<Vec<Value>>> {
        Ok(None)
    }

    fn write_aux(&mut self, _rowid: RowId, _values: &[Value]) -> RTreeResult<()> {
        Err(RTreeError::Store("store does not support aux columns".into()))
    }

    /// Number of rows in the rowid table, if the store keeps statistics.
    fn row_count(&mut self) -> RTreeResult<Option<i64>> {
        Ok(None)
    }

    /// Number of rows in the parent table, if known.
    fn parent_count(&mut self) -> RTreeResult<Option<i64>> {
        Ok(None)
    }

    fn begin(&mut self) -> RTreeResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> RTreeResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> RTreeResult<()> {
        Ok(())
    }

    /// Makes completed writes durable.
    fn flush(&mut self) -> RTreeResult<()> {
        Ok(())
    }
}

/// The four tables of a tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreTables {
    pub nodes: BTreeMap<NodeId, Vec<u8>>,
    pub parents: BTreeMap<NodeId, NodeId>,
    pub rowids: BTreeMap<RowId, NodeId>,
    pub aux: BTreeMap<RowId, Vec<Value>>,
}

impl StoreTables {
    /// One past the largest key, or the lowest unused positive key once
    /// the largest key is `i64::MAX`.
    fn next_key<V>(map: &BTreeMap<i64, V>) -> RTreeResult<i64> {
        let last = match map.keys().next_back() {
            Some(&k) => k,
            None => return Ok(1),
        };
        if let Some(next) = last.checked_add(1) {
            return Ok(next);
        }
        let mut candidate: i64 = 1;
        for (&k, _) in map.range(1..) {
            if k != candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or_else(|| RTreeError::Store("key space exhausted".into()))?;
        }
        Ok(candidate)
    }

    pub fn read_node(&self, id: NodeId) -> Option<Vec<u8>> {
        self.nodes.get(&id).cloned()
    }

    pub fn write_node(&mut self, id: Option<NodeId>, data: &[u8]) -> RTreeResult<NodeId> {
        let id = match id {
            Some(id) => id,
            None => Self::next_key(&self.nodes)?,
        };
        self.nodes.insert(id, data.to_vec());
        Ok(id)
    }

    pub fn write_rowid_node(&mut self, rowid: Option<RowId>, node: NodeId) -> RTreeResult<RowId> {
        let rowid = match rowid {
            Some(rowid) => rowid,
            None => Self::next_key(&self.rowids)?,
        };
        self.rowids.insert(rowid, node);
        Ok(rowid)
    }

    pub fn delete_rowid_node(&mut self, rowid: RowId) {
        self.rowids.remove(&rowid);
        self.aux.remove(&rowid);
    }
}

struct MemoryStoreInner {
    tables: StoreTables,
    snapshot: Option<StoreTables>,
    /// Remaining successful writes before writes start failing
    write_budget: Option<usize>,
}

/// In-memory store with snapshot transactions.
///
/// Clones share the same tables, so a test can keep a handle to inspect
/// or damage the tables while a tree owns another.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_tables(StoreTables::default())
    }

    pub fn from_tables(tables: StoreTables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner {
                tables,
                snapshot: None,
                write_budget: None,
            })),
        }
    }

    /// A copy of the current tables.
    pub fn tables(&self) -> StoreTables {
        self.inner.read().tables.clone()
    }

    /// Runs `f` against the live tables.
    pub fn with_tables<R>(&self, f: impl FnOnce(&mut StoreTables) -> R) -> R {
        f(&mut self.inner.write().tables)
    }

    /// Lets `writes` more write operations succeed, then fails every write
    /// with a store error. `None` removes the limit.
    pub fn fail_writes_after(&self, writes: Option<usize>) {
        self.inner.write().write_budget = writes;
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.read().snapshot.is_some()
    }

    fn charge_write(inner: &mut MemoryStoreInner) -> RTreeResult<()> {
        match inner.write_budget {
            Some(0) => Err(RTreeError::Store("injected write failure".into())),
            Some(n) => {
                inner.write_budget = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryStore {
    fn read_node(&mut self, id: NodeId) -> RTreeResult<Option<Vec<u8>>> {
        Ok(self.inner.read().tables.read_node(id))
    }

    fn write_node(&mut self, id: Option<NodeId>, data: &[u8]) -> RTreeResult<NodeId> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.write_node(id, data)
    }

    fn delete_node(&mut self, id: NodeId) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.nodes.remove(&id);
        Ok(())
    }

    fn read_parent(&mut self, child: NodeId) -> RTreeResult<Option<NodeId>> {
        Ok(self.inner.read().tables.parents.get(&child).copied())
    }

    fn write_parent(&mut self, child: NodeId, parent: NodeId) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.parents.insert(child, parent);
        Ok(())
    }

    fn delete_parent(&mut self, child: NodeId) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.parents.remove(&child);
        Ok(())
    }

    fn read_rowid_node(&mut self, rowid: RowId) -> RTreeResult<Option<NodeId>> {
        Ok(self.inner.read().tables.rowids.get(&rowid).copied())
    }

    fn write_rowid_node(&mut self, rowid: Option<RowId>, node: NodeId) -> RTreeResult<RowId> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.write_rowid_node(rowid, node)
    }

    fn delete_rowid_node(&mut self, rowid: RowId) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.delete_rowid_node(rowid);
        Ok(())
    }

    fn read_aux(&mut self, rowid: RowId) -> RTreeResult<Option<Vec<Value>>> {
        Ok(self.inner.read().tables.aux.get(&rowid).cloned())
    }

    fn write_aux(&mut self, rowid: RowId, values: &[Value]) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        Self::charge_write(&mut inner)?;
        inner.tables.aux.insert(rowid, values.to_vec());
        Ok(())
    }

    fn row_count(&mut self) -> RTreeResult<Option<i64>> {
        Ok(Some(self.inner.read().tables.rowids.len() as i64))
    }

    fn parent_count(&mut self) -> RTreeResult<Option<i64>> {
        Ok(Some(self.inner.read().tables.parents.len() as i64))
    }

    fn begin(&mut self) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        if inner.snapshot.is_some() {
            return Err(RTreeError::Store("transaction already open".into()));
        }
        inner.snapshot = Some(inner.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> RTreeResult<()> {
        self.inner.write().snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> RTreeResult<()> {
        let mut inner = self.inner.write();
        if let Some(snapshot) = inner.snapshot.take() {
            inner.tables = snapshot;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_node_assigns_next_id() {
        let mut store = MemoryStore::new();
        assert_eq!(store.write_node(Some(1), &[0; 8]).unwrap(), 1);
        assert_eq!(store.write_node(None, &[1; 8]).unwrap(), 2);
        assert_eq!(store.write_node(None, &[2; 8]).unwrap(), 3);
        assert_eq!(store.read_node(2).unwrap(), Some(vec![1; 8]));
        store.delete_node(3).unwrap();
        assert_eq!(store.read_node(3).unwrap(), None);
    }

    #[test]
    fn test_rowid_mapping_keeps_aux() {
        let mut store = MemoryStore::new();
        let rowid = store.write_rowid_node(None, 0).unwrap();
        assert_eq!(rowid, 1);
        store.write_aux(rowid, &[Value::from("a")]).unwrap();
        store.write_rowid_node(Some(rowid), 7).unwrap();
        assert_eq!(store.read_rowid_node(rowid).unwrap(), Some(7));
        assert_eq!(store.read_aux(rowid).unwrap(), Some(vec![Value::from("a")]));

        store.delete_rowid_node(rowid).unwrap();
        assert_eq!(store.read_rowid_node(rowid).unwrap(), None);
        assert_eq!(store.read_aux(rowid).unwrap(), None);
    }

    #[test]
    fn test_rowid_after_max_takes_lowest_gap() {
        let mut store = MemoryStore::new();
        store.write_rowid_node(Some(1), 2).unwrap();
        store.write_rowid_node(Some(2), 2).unwrap();
        store.write_rowid_node(Some(i64::MAX), 2).unwrap();
        assert_eq!(store.write_rowid_node(None, 0).unwrap(), 3);
        assert_eq!(store.write_rowid_node(None, 0).unwrap(), 4);

        let mut tables = StoreTables::default();
        tables.rowids.insert(i64::MAX, 2);
        assert_eq!(tables.write_rowid_node(None, 0).unwrap(), 1);
    }

    #[test]
    fn test_parent_mapping() {
        let mut store = MemoryStore::new();
        store.write_parent(4, 1).unwrap();
        store.write_parent(4, 2).unwrap();
        assert_eq!(store.read_parent(4).unwrap(), Some(2));
        assert_eq!(store.parent_count().unwrap(), Some(1));
        store.delete_parent(4).unwrap();
        assert_eq!(store.read_parent(4).unwrap(), None);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let mut store = MemoryStore::new();
        store.write_node(Some(1), &[0; 4]).unwrap();
        store.begin().unwrap();
        assert!(store.in_transaction());
        store.write_node(None, &[9; 4]).unwrap();
        store.write_rowid_node(Some(5), 2).unwrap();
        store.rollback().unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.read_node(2).unwrap(), None);
        assert_eq!(store.read_rowid_node(5).unwrap(), None);
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        assert!(store.begin().is_err());
        store.commit().unwrap();
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_injected_write_failure() {
        let mut store = MemoryStore::new();
        store.fail_writes_after(Some(1));
        assert!(store.write_node(Some(1), &[0; 4]).is_ok());
        assert!(matches!(
            store.write_node(None, &[0; 4]),
            Err(RTreeError::Store(_))
        ));
        assert!(store.read_node(1).unwrap().is_some());
        store.fail_writes_after(None);
        assert!(store.write_node(None, &[0; 4]).is_ok());
    }

    #[test]
    fn test_clones_share_tables() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.write_parent(3, 1).unwrap();
        assert_eq!(observer.tables().parents.get(&3), Some(&1));
        observer.with_tables(|t| t.parents.clear());
        assert_eq!(store.read_parent(3).unwrap(), None);
    }
}
