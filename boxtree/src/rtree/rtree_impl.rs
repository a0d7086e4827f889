//! RTree implementation.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RTreeConfig;

use super::codec::NodeLayout;
use super::constraint::{FilterArg, GeometryCallback};
use super::geometry::cell_from_box;
use super::integrity::IntegrityReport;
use super::node_cache::{NodeCache, NodeRef};
use super::plan::{best_index, IndexConstraint, IndexOp, IndexPlan};
use super::rtree_constants::{DEFAULT_ROW_ESTIMATE, MAX_DEPTH, ROOT_NODE_ID};
use super::rtree_types::{RTreeError, RTreeResult, RTreeStats, RowId, RowResult, Value};
use super::search::{Cursor, PLAN_ROWID};
use super::store::{MemoryStore, NodeStore};

/// Counters kept by the engine while the tree is open.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CoreStats {
    pub node_reads: u64,
    pub node_writes: u64,
    pub cache_hits: u64,
    pub splits: u64,
    pub reinserts: u64,
}

/// What an insert does when the row id is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnConflict {
    Abort,
    Replace,
}

/// Engine state shared by the tree handle and its cursors.
pub(crate) struct TreeCore {
    pub(crate) config: RTreeConfig,
    pub(crate) layout: NodeLayout,
    pub(crate) store: Box<dyn NodeStore>,
    pub(crate) nodes: NodeCache,
    /// Depth from the root header, -1 while the root is not loaded
    pub(crate) depth: i32,
    /// Height at which the current operation already reinserted
    pub(crate) reinsert_height: i32,
    /// Removed nodes waiting for their cells to be reinserted
    pub(crate) pending: VecDeque<(NodeRef, i32)>,
    /// Latched once any corruption is detected
    pub(crate) corrupt: bool,
    pub(crate) stats: CoreStats,
}

impl TreeCore {
    pub(crate) fn new(config: RTreeConfig, layout: NodeLayout, store: Box<dyn NodeStore>) -> Self {
        Self {
            config,
            layout,
            store,
            nodes: NodeCache::new(),
            depth: -1,
            reinsert_height: -1,
            pending: VecDeque::new(),
            corrupt: false,
            stats: CoreStats::default(),
        }
    }

    /// A core over a fresh memory store holding an empty root.
    #[cfg(test)]
    pub(crate) fn for_tests(dimensions: usize, capacity: usize) -> (TreeCore, MemoryStore) {
        let config = RTreeConfig::new(dimensions).with_node_capacity(capacity);
        let layout = config.layout().unwrap();
        let mut store = MemoryStore::new();
        store.write_node(Some(ROOT_NODE_ID), &layout.empty_node()).unwrap();
        (TreeCore::new(config, layout, Box::new(store.clone())), store)
    }

    /// Mutations are refused while any node is referenced.
    fn begin_write(&mut self) -> RTreeResult<()> {
        if self.nodes.live() > 0 {
            return Err(RTreeError::Locked);
        }
        self.reinsert_height = -1;
        Ok(())
    }

    fn row_exists(&mut self, rowid: RowId) -> RTreeResult<bool> {
        Ok(self.store.read_rowid_node(rowid)?.is_some())
    }

    /// Deletes `old` if given, then inserts a row. Returns the row id used.
    pub(crate) fn write_row(
        &mut self,
        old: Option<RowId>,
        rowid: Option<RowId>,
        coords: &[f64],
        aux: &[Value],
        on_conflict: OnConflict,
    ) -> RTreeResult<RowId> {
        self.begin_write()?;
        let n_aux = self.config.aux_columns.len();
        if aux.len() > n_aux {
            return Err(RTreeError::Constraint(format!(
                "{} aux values given, the tree has {} aux columns",
                aux.len(),
                n_aux
            )));
        }
        let mut cell = cell_from_box(&self.layout, 0, coords)?;

        if let Some(id) = rowid {
            if old != Some(id) && self.row_exists(id)? {
                match on_conflict {
                    OnConflict::Replace => self.delete_rowid(id)?,
                    OnConflict::Abort => return Err(RTreeError::DuplicateRowid(id)),
                }
            }
        }
        if let Some(old) = old {
            if self.row_exists(old)? {
                self.delete_rowid(old)?;
            }
        }

        cell.id = match rowid {
            Some(id) => id,
            None => self.store.write_rowid_node(None, 0)?,
        };

        let leaf = self.choose_leaf(&cell, 0)?;
        self.reinsert_height = -1;
        let rc = self.insert_cell(leaf, &cell, 0);
        let released = self.release(leaf);
        rc.and(released)?;

        if n_aux > 0 {
            let mut values = aux.to_vec();
            values.resize(n_aux, Value::Null);
            self.store.write_aux(cell.id, &values)?;
        }
        Ok(cell.id)
    }

    /// Removes a row. Returns false if the row id is unknown.
    pub(crate) fn delete_row(&mut self, rowid: RowId) -> RTreeResult<bool> {
        self.begin_write()?;
        if !self.row_exists(rowid)? {
            return Ok(false);
        }
        self.delete_rowid(rowid)?;
        Ok(true)
    }

    /// Planner row estimate: configured, else the store's row count, else a
    /// default.
    pub(crate) fn row_estimate(&mut self) -> RTreeResult<i64> {
        let rows = match self.config.row_estimate {
            Some(rows) => Some(rows),
            None => self.store.row_count()?,
        };
        Ok(rows.map_or(DEFAULT_ROW_ESTIMATE, RTreeConfig::clamp_row_estimate))
    }
}

// ============================================================================
// Query constraints
// ============================================================================

/// A constraint for [`RTree::query`]: `column op arg`, where column 0 is the
/// row id and 1..=2N the coordinates.
#[derive(Debug, Clone)]
pub struct QueryConstraint {
    pub column: usize,
    pub op: IndexOp,
    pub arg: FilterArg,
}

impl QueryConstraint {
    pub fn new(column: usize, op: IndexOp, arg: impl Into<FilterArg>) -> Self {
        Self {
            column,
            op,
            arg: arg.into(),
        }
    }

    /// A MATCH against a geometry callback.
    pub fn matching(callback: GeometryCallback) -> Self {
        Self::new(1, IndexOp::Match, callback)
    }

    /// Checks a constraint the plan left for the caller to evaluate.
    fn check_residual(&self, n_coord: usize) -> RTreeResult<()> {
        let comparable = matches!(
            self.op,
            IndexOp::Eq | IndexOp::Gt | IndexOp::Ge | IndexOp::Lt | IndexOp::Le
        );
        if !comparable || self.column > n_coord || matches!(self.arg, FilterArg::Geometry(_)) {
            return Err(RTreeError::Constraint(format!(
                "cannot evaluate {:?} on column {}",
                self.op, self.column
            )));
        }
        Ok(())
    }

    /// Evaluates a residual constraint against a produced row.
    fn accepts(&self, row: &RowResult) -> bool {
        let lhs = if self.column == 0 {
            row.rowid as f64
        } else {
            row.coords[self.column - 1]
        };
        let value = match &self.arg {
            FilterArg::Value(v) => v,
            FilterArg::Geometry(_) => return false,
        };
        match value {
            Value::Null => false,
            Value::Text(_) | Value::Blob(_) => matches!(self.op, IndexOp::Lt | IndexOp::Le),
            v => {
                let rhs = v.as_f64().unwrap_or(f64::NAN);
                match self.op {
                    IndexOp::Eq => lhs == rhs,
                    IndexOp::Gt => lhs > rhs,
                    IndexOp::Ge => lhs >= rhs,
                    IndexOp::Lt => lhs < rhs,
                    IndexOp::Le => lhs <= rhs,
                    IndexOp::Match | IndexOp::Other => false,
                }
            }
        }
    }
}

// ============================================================================
// Tree handle
// ============================================================================

/// Handle to an R*-tree over a [`NodeStore`].
///
/// Clones share the same tree. All operations serialize on an internal
/// lock; a cursor positioned on a row keeps node references and makes
/// mutations fail with [`RTreeError::Locked`] until it is closed.
#[derive(Clone)]
pub struct RTree {
    inner: Arc<RTreeInner>,
}

struct RTreeInner {
    core: Mutex<TreeCore>,
    closed: AtomicBool,
}

impl RTree {
    fn from_core(core: TreeCore) -> Self {
        Self {
            inner: Arc::new(RTreeInner {
                core: Mutex::new(core),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Creates an empty tree in `store`.
    pub fn create(config: RTreeConfig, store: impl NodeStore + 'static) -> RTreeResult<Self> {
        let layout = config.layout()?;
        let mut store: Box<dyn NodeStore> = Box::new(store);
        if store.read_node(ROOT_NODE_ID)?.is_some() {
            return Err(RTreeError::Config("store already holds a tree".into()));
        }
        store.write_node(Some(ROOT_NODE_ID), &layout.empty_node())?;
        log::debug!(
            "Created {}-dimensional r-tree with {} cells per node",
            layout.dimensions,
            layout.capacity()
        );
        Ok(Self::from_core(TreeCore::new(config, layout, store)))
    }

    /// Creates an empty tree backed by a [`MemoryStore`].
    pub fn in_memory(config: RTreeConfig) -> RTreeResult<Self> {
        Self::create(config, MemoryStore::new())
    }

    /// Opens the tree held in `store`. The node size is taken from the
    /// stored root, overriding the configured one.
    pub fn open(config: RTreeConfig, store: impl NodeStore + 'static) -> RTreeResult<Self> {
        config.validate()?;
        let mut store: Box<dyn NodeStore> = Box::new(store);
        let root = match store.read_node(ROOT_NODE_ID)? {
            Some(root) => root,
            None => return Err(RTreeError::corrupt("root node is missing")),
        };
        let layout = NodeLayout::new(config.dimensions, config.coord_type, root.len())
            .map_err(|e| RTreeError::corrupt(format!("root node is unusable: {}", e)))?;
        layout.validate(&root)?;
        let depth = layout.depth(&root);
        if depth > MAX_DEPTH {
            return Err(RTreeError::corrupt(format!("tree depth {} out of range", depth)));
        }
        log::debug!(
            "Opened r-tree of depth {} with {} cells per node",
            depth,
            layout.capacity()
        );
        let config = config.with_node_size(root.len());
        Ok(Self::from_core(TreeCore::new(config, layout, store)))
    }

    /// Locks the engine, failing once the tree is closed.
    pub(crate) fn lock_core(&self) -> RTreeResult<MutexGuard<'_, TreeCore>> {
        if self.is_closed() {
            return Err(RTreeError::Closed);
        }
        Ok(self.inner.core.lock())
    }

    /// Locks the engine regardless of the closed flag.
    pub(crate) fn core_guard(&self) -> MutexGuard<'_, TreeCore> {
        self.inner.core.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> RTreeConfig {
        self.core_guard().config.clone()
    }

    pub fn layout(&self) -> NodeLayout {
        self.core_guard().layout
    }

    /// Inserts a row. Without a row id a new one is assigned. Fails with
    /// [`RTreeError::DuplicateRowid`] if the row id is taken.
    pub fn insert(&self, rowid: Option<RowId>, coords: &[f64], aux: &[Value]) -> RTreeResult<RowId> {
        let mut core = self.lock_core()?;
        core.write_row(None, rowid, coords, aux, OnConflict::Abort)
    }

    /// Inserts a row, replacing any row with the same id.
    pub fn insert_or_replace(
        &self,
        rowid: Option<RowId>,
        coords: &[f64],
        aux: &[Value],
    ) -> RTreeResult<RowId> {
        let mut core = self.lock_core()?;
        core.write_row(None, rowid, coords, aux, OnConflict::Replace)
    }

    /// Replaces row `old` with a new box, keeping its id unless `new_rowid`
    /// is given. Returns `None` if `old` does not exist.
    pub fn update(
        &self,
        old: RowId,
        new_rowid: Option<RowId>,
        coords: &[f64],
        aux: &[Value],
    ) -> RTreeResult<Option<RowId>> {
        let mut core = self.lock_core()?;
        if core.store.read_rowid_node(old)?.is_none() {
            return Ok(None);
        }
        let rowid = new_rowid.unwrap_or(old);
        core.write_row(Some(old), Some(rowid), coords, aux, OnConflict::Abort)
            .map(Some)
    }

    /// Deletes a row. Returns false, leaving the tree untouched, if the row
    /// id is unknown.
    pub fn delete(&self, rowid: RowId) -> RTreeResult<bool> {
        let mut core = self.lock_core()?;
        core.delete_row(rowid)
    }

    pub fn open_cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    /// Chooses a plan for the offered constraints.
    pub fn best_plan(&self, constraints: &[IndexConstraint]) -> RTreeResult<IndexPlan> {
        let mut core = self.lock_core()?;
        let rows = core.row_estimate()?;
        Ok(best_index(constraints, core.layout.n_coord(), rows))
    }

    /// Runs a query to completion. Constraints the plan cannot push into
    /// the tree are checked against each produced row.
    pub fn query(&self, constraints: &[QueryConstraint]) -> RTreeResult<Vec<RowResult>> {
        let offered: Vec<IndexConstraint> = constraints
            .iter()
            .map(|c| IndexConstraint::new(c.column, c.op))
            .collect();
        let plan = self.best_plan(&offered)?;
        let n_coord = self.layout().n_coord();

        let mut residual = Vec::new();
        for (c, usage) in constraints.iter().zip(&plan.usage) {
            if usage.argv_index == 0 {
                c.check_residual(n_coord)?;
                residual.push(c);
            }
        }
        let per_constraint: Vec<FilterArg> = constraints.iter().map(|c| c.arg.clone()).collect();
        let args = plan.arrange_args(&per_constraint);

        let mut cursor = self.open_cursor();
        cursor.filter_plan(&plan, &args)?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.row()? {
            if residual.iter().all(|c| c.accepts(&row)) {
                rows.push(row);
            }
            cursor.next()?;
        }
        cursor.close()?;
        Ok(rows)
    }

    /// Fetches one row by id.
    pub fn get(&self, rowid: RowId) -> RTreeResult<Option<RowResult>> {
        let mut cursor = self.open_cursor();
        cursor.filter(PLAN_ROWID, "", &[FilterArg::from(rowid)])?;
        let row = cursor.row()?;
        cursor.close()?;
        Ok(row)
    }

    pub fn stats(&self) -> RTreeResult<RTreeStats> {
        let mut core = self.lock_core()?;
        let depth = core.current_depth()?;
        let stats = core.stats;
        Ok(RTreeStats {
            depth,
            cached_nodes: core.nodes.live() as u64,
            cache_hits: stats.cache_hits,
            node_reads: stats.node_reads,
            node_writes: stats.node_writes,
            splits: stats.splits,
            reinserts: stats.reinserts,
        })
    }

    /// Depth of the tree, 0 while the root is a leaf.
    pub fn depth(&self) -> RTreeResult<i32> {
        self.lock_core()?.current_depth()
    }

    /// Returns true once any operation has detected corruption.
    pub fn is_corrupt(&self) -> bool {
        self.core_guard().corrupt
    }

    /// Walks the whole tree and reports every inconsistency found.
    pub fn check_integrity(&self) -> RTreeResult<IntegrityReport> {
        self.lock_core()?.check_integrity()
    }

    /// Runs `f` inside a store transaction, committing on success and
    /// rolling back on failure.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&RTree) -> RTreeResult<T>) -> RTreeResult<T> {
        self.lock_core()?.store.begin()?;
        let result = f(self);
        let mut core = self.core_guard();
        match result {
            Ok(value) => {
                core.store.commit()?;
                Ok(value)
            }
            Err(e) => {
                log::debug!("Rolling back r-tree transaction: {}", e);
                if core.nodes.live() > 0 {
                    log::warn!("{} nodes still referenced at rollback", core.nodes.live());
                }
                core.depth = -1;
                if let Err(re) = core.store.rollback() {
                    log::error!("Failed to roll back r-tree transaction: {}", re);
                }
                Err(e)
            }
        }
    }

    /// Makes all completed writes durable.
    pub fn flush(&self) -> RTreeResult<()> {
        self.lock_core()?.store.flush()
    }

    /// Flushes the store and closes the tree. Fails with
    /// [`RTreeError::Locked`] while a cursor holds node references.
    pub fn close(&self) -> RTreeResult<()> {
        let mut core = self.core_guard();
        if self.is_closed() {
            return Ok(());
        }
        if core.nodes.live() > 0 {
            return Err(RTreeError::Locked);
        }
        core.store.flush()?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// Drop Implementation
// ============================================================================

impl Drop for RTreeInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.nodes.live() > 0 {
            log::error!("R-tree dropped with {} node references held", core.nodes.live());
        }
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = core.store.flush() {
                log::error!("Failed to flush r-tree store on drop: {}", e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::rtree_types::CoordType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[ctor::ctor]
    fn init() {
        colog::init();
    }

    fn small_tree() -> (RTree, MemoryStore) {
        let store = MemoryStore::new();
        let config = RTreeConfig::new(2).with_node_capacity(4);
        (RTree::create(config, store.clone()).unwrap(), store)
    }

    fn unit_box(x: f64, y: f64) -> [f64; 4] {
        [x, x + 1.0, y, y + 1.0]
    }

    #[test]
    fn test_create_writes_empty_root() {
        let (tree, store) = small_tree();
        let tables = store.tables();
        assert_eq!(tables.nodes.len(), 1);
        assert!(tables.nodes.get(&ROOT_NODE_ID).unwrap().iter().all(|b| *b == 0));
        assert_eq!(tree.depth().unwrap(), 0);
    }

    #[test]
    fn test_create_refuses_existing_tree() {
        let (_tree, store) = small_tree();
        let err = RTree::create(RTreeConfig::new(2), store).err().unwrap();
        assert!(matches!(err, RTreeError::Config(_)));
    }

    #[test]
    fn test_insert_assigns_rowids() {
        let (tree, _store) = small_tree();
        assert_eq!(tree.insert(None, &unit_box(0.0, 0.0), &[]).unwrap(), 1);
        assert_eq!(tree.insert(Some(10), &unit_box(1.0, 0.0), &[]).unwrap(), 10);
        assert_eq!(tree.insert(None, &unit_box(2.0, 0.0), &[]).unwrap(), 11);
    }

    #[test]
    fn test_duplicate_rowid() {
        let (tree, _store) = small_tree();
        tree.insert(Some(5), &unit_box(0.0, 0.0), &[]).unwrap();
        let err = tree.insert(Some(5), &unit_box(3.0, 3.0), &[]).unwrap_err();
        assert!(matches!(err, RTreeError::DuplicateRowid(5)));

        tree.insert_or_replace(Some(5), &unit_box(3.0, 3.0), &[]).unwrap();
        let row = tree.get(5).unwrap().unwrap();
        assert_eq!(row.coords, vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_invalid_box_leaves_tree_unchanged() {
        let (tree, store) = small_tree();
        let before = store.tables();
        let err = tree.insert(Some(1), &[5.0, 4.0, 0.0, 1.0], &[]).unwrap_err();
        assert!(matches!(err, RTreeError::InvalidBox { dimension: 0, column: 1 }));
        assert_eq!(store.tables(), before);
    }

    #[test]
    fn test_update_moves_row() {
        let (tree, _store) = small_tree();
        tree.insert(Some(1), &unit_box(0.0, 0.0), &[]).unwrap();
        assert_eq!(tree.update(1, None, &unit_box(7.0, 7.0), &[]).unwrap(), Some(1));
        assert_eq!(tree.get(1).unwrap().unwrap().coords[0], 7.0);

        assert_eq!(tree.update(1, Some(2), &unit_box(8.0, 8.0), &[]).unwrap(), Some(2));
        assert!(tree.get(1).unwrap().is_none());
        assert_eq!(tree.update(99, None, &unit_box(0.0, 0.0), &[]).unwrap(), None);
    }

    #[test]
    fn test_delete_unknown_rowid() {
        let (tree, store) = small_tree();
        tree.insert(Some(1), &unit_box(0.0, 0.0), &[]).unwrap();
        let before = store.tables();
        assert!(!tree.delete(42).unwrap());
        assert_eq!(store.tables(), before);
        assert!(tree.delete(1).unwrap());
        assert!(!tree.delete(1).unwrap());
    }

    #[test]
    fn test_open_takes_node_size_from_root() {
        let (tree, store) = small_tree();
        for i in 0..20 {
            tree.insert(None, &unit_box(i as f64, 0.0), &[]).unwrap();
        }
        drop(tree);

        let reopened = RTree::open(RTreeConfig::new(2), store).unwrap();
        assert_eq!(reopened.layout().capacity(), 4);
        assert!(reopened.depth().unwrap() >= 1);
        assert_eq!(reopened.query(&[]).unwrap().len(), 20);
    }

    #[test]
    fn test_open_missing_root_is_corrupt() {
        let err = RTree::open(RTreeConfig::new(2), MemoryStore::new()).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_open_tiny_root_is_corrupt() {
        let store = MemoryStore::new();
        store.with_tables(|t| t.nodes.insert(ROOT_NODE_ID, vec![0; 30]));
        let err = RTree::open(RTreeConfig::new(2), store).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_cursor_locks_writes() {
        let (tree, _store) = small_tree();
        for i in 0..3 {
            tree.insert(None, &unit_box(i as f64, 0.0), &[]).unwrap();
        }
        let mut cursor = tree.open_cursor();
        cursor.filter(2, "", &[]).unwrap();
        assert!(!cursor.eof());
        assert!(matches!(
            tree.insert(None, &unit_box(9.0, 9.0), &[]).unwrap_err(),
            RTreeError::Locked
        ));
        assert!(matches!(tree.delete(1).unwrap_err(), RTreeError::Locked));
        assert!(matches!(tree.close().unwrap_err(), RTreeError::Locked));

        cursor.close().unwrap();
        tree.insert(None, &unit_box(9.0, 9.0), &[]).unwrap();
    }

    #[test]
    fn test_query_with_residual_rowid_constraint() {
        let (tree, _store) = small_tree();
        for i in 0..10 {
            tree.insert(Some(i + 1), &unit_box(i as f64, 0.0), &[]).unwrap();
        }
        let rows = tree
            .query(&[
                QueryConstraint::new(1, IndexOp::Ge, 2.0),
                QueryConstraint::new(0, IndexOp::Lt, 6i64),
            ])
            .unwrap();
        let ids: Vec<RowId> = rows.iter().map(|r| r.rowid).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, vec![3, 4, 5]);
    }

    #[test]
    fn test_query_rejects_aux_column_constraint() {
        let (tree, _store) = small_tree();
        let err = tree
            .query(&[QueryConstraint::new(5, IndexOp::Eq, 1i64)])
            .unwrap_err();
        assert!(matches!(err, RTreeError::Constraint(_)));
    }

    #[test]
    fn test_aux_columns() {
        let config = RTreeConfig::new(1).with_aux_columns(["name", "weight"]);
        let tree = RTree::in_memory(config).unwrap();
        tree.insert(Some(1), &[0.0, 1.0], &["a".into(), 2.5.into()]).unwrap();
        tree.insert(Some(2), &[0.0, 1.0], &["b".into()]).unwrap();
        assert_eq!(
            tree.get(1).unwrap().unwrap().aux,
            vec![Value::Text("a".into()), Value::Real(2.5)]
        );
        assert_eq!(
            tree.get(2).unwrap().unwrap().aux,
            vec![Value::Text("b".into()), Value::Null]
        );
        let err = tree
            .insert(None, &[0.0, 1.0], &[1i64.into(), 2i64.into(), 3i64.into()])
            .unwrap_err();
        assert!(matches!(err, RTreeError::Constraint(_)));
    }

    #[test]
    fn test_integer_tree_truncates() {
        let config = RTreeConfig::new(1).with_coord_type(CoordType::Int32);
        let tree = RTree::in_memory(config).unwrap();
        tree.insert(Some(1), &[1.9, 5.2], &[]).unwrap();
        assert_eq!(tree.get(1).unwrap().unwrap().coords, vec![1.0, 5.0]);
    }

    #[test]
    fn test_transaction_rollback_restores_store() {
        let (tree, store) = small_tree();
        tree.insert(Some(1), &unit_box(0.0, 0.0), &[]).unwrap();
        let before = store.tables();

        let result: RTreeResult<()> = tree.with_transaction(|t| {
            for i in 2..30 {
                t.insert(Some(i), &unit_box(i as f64, 1.0), &[])?;
            }
            Err(RTreeError::Store("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.tables(), before);
        assert_eq!(tree.query(&[]).unwrap().len(), 1);
        assert_eq!(tree.depth().unwrap(), 0);
    }

    #[test]
    fn test_transaction_commit() {
        let (tree, store) = small_tree();
        let n = tree
            .with_transaction(|t| {
                for i in 1..=12 {
                    t.insert(Some(i), &unit_box(i as f64, 1.0), &[])?;
                }
                Ok(12)
            })
            .unwrap();
        assert_eq!(n, 12);
        assert!(!store.in_transaction());
        assert_eq!(store.tables().rowids.len(), 12);
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let (tree, _store) = small_tree();
        tree.close().unwrap();
        assert!(tree.is_closed());
        assert!(matches!(
            tree.insert(None, &unit_box(0.0, 0.0), &[]).unwrap_err(),
            RTreeError::Closed
        ));
        tree.close().unwrap();
    }

    #[test]
    fn test_stats_track_structure() {
        let (tree, _store) = small_tree();
        for i in 0..40 {
            tree.insert(None, &unit_box((i % 7) as f64, (i / 7) as f64), &[]).unwrap();
        }
        let stats = tree.stats().unwrap();
        assert!(stats.depth >= 2);
        assert!(stats.splits > 0);
        assert!(stats.reinserts > 0);
        assert_eq!(stats.cached_nodes, 0);
        assert!(stats.node_writes > 0);
    }

    #[test]
    fn test_best_plan_uses_store_row_count() {
        let (tree, _store) = small_tree();
        for i in 0..500 {
            tree.insert(None, &unit_box(i as f64, 0.0), &[]).unwrap();
        }
        let plan = tree
            .best_plan(&[IndexConstraint::new(1, IndexOp::Ge)])
            .unwrap();
        assert_eq!(plan.estimated_rows, 250);
    }

    #[test]
    fn test_random_inserts_and_deletes_stay_valid() {
        let (tree, _store) = small_tree();
        let mut rng = StdRng::seed_from_u64(42);
        let mut live = Vec::new();
        for _ in 0..300 {
            if live.is_empty() || rng.gen_bool(0.7) {
                let x = rng.gen_range(0..200) as f64;
                let y = rng.gen_range(0..200) as f64;
                live.push(tree.insert(None, &unit_box(x, y), &[]).unwrap());
            } else {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(tree.delete(id).unwrap());
            }
        }
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "{:?}", report.errors);
        assert_eq!(tree.query(&[]).unwrap().len(), live.len());
    }
}
