//! Best-first traversal and the cursor built on it.
//!
//! Candidates are kept in a binary min-heap of search points ordered by
//! score, then by level, so equal scores finish a branch before opening a
//! new one. The lowest point is usually held outside the heap in a front
//! slot. Nodes of the front point and of the first heap entries stay loaded
//! in a small side cache that moves along with heap swaps.

use smallvec::SmallVec;
use std::cmp::Ordering;

use super::constraint::{
    decode_constraints, test_callback, test_internal, test_leaf, ConstraintOp, FilterArg,
    ParentState, Within,
};
use super::constraint::Constraint;
use super::node_cache::NodeRef;
use super::plan::IndexPlan;
use super::rtree_constants::{CURSOR_CACHE_SIZE, MAX_DEPTH, ROOT_NODE_ID};
use super::rtree_impl::{RTree, TreeCore};
use super::rtree_types::{NodeId, RTreeError, RTreeResult, RowId, RowResult, Value};

type ConstraintVec = SmallVec<[Constraint; 4]>;

/// Plan id of a direct row id lookup.
pub const PLAN_ROWID: i32 = 1;
/// Plan id of a constrained tree scan.
pub const PLAN_SCAN: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SearchPoint {
    /// Smaller is visited first
    pub score: f64,
    /// Node holding the cell to visit; for level 0 the leaf holding the row
    pub id: NodeId,
    /// 0 for a row, 1 for a leaf node, and so on up to depth + 1
    pub level: i32,
    pub within: Within,
    /// Next cell to examine, or the row's cell for level 0
    pub cell: usize,
}

impl SearchPoint {
    fn compare(&self, other: &SearchPoint) -> Ordering {
        match self.score.partial_cmp(&other.score) {
            Some(Ordering::Less) => Ordering::Less,
            Some(Ordering::Greater) => Ordering::Greater,
            _ => self.level.cmp(&other.level),
        }
    }
}

/// Traversal state of one cursor.
#[derive(Debug)]
pub(crate) struct SearchState {
    front: Option<SearchPoint>,
    heap: Vec<SearchPoint>,
    /// Slot 0 serves the front point, slot i + 1 serves heap entry i
    nodes: [Option<NodeRef>; CURSOR_CACHE_SIZE],
    /// Queued points per level
    queue: Vec<u32>,
    constraints: ConstraintVec,
    strategy: i32,
    max_level: i32,
    eof: bool,
}

impl Default for SearchState {
    fn default() -> Self {
        Self {
            front: None,
            heap: Vec::new(),
            nodes: [None; CURSOR_CACHE_SIZE],
            queue: vec![0; MAX_DEPTH as usize + 2],
            constraints: ConstraintVec::new(),
            strategy: 0,
            max_level: 0,
            eof: true,
        }
    }
}

impl SearchState {
    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn first(&self) -> Option<&SearchPoint> {
        self.front.as_ref().or_else(|| self.heap.first())
    }

    fn first_mut(&mut self) -> Option<&mut SearchPoint> {
        match self.front {
            Some(ref mut p) => Some(p),
            None => self.heap.first_mut(),
        }
    }

    /// Number of node references held by this state.
    pub fn held_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Drops every queued point and cached node.
    pub fn reset(&mut self, core: &mut TreeCore) -> RTreeResult<()> {
        let mut rc = Ok(());
        for slot in self.nodes.iter_mut() {
            let released = core.release_opt(slot.take());
            if rc.is_ok() {
                rc = released;
            }
        }
        self.front = None;
        self.heap.clear();
        self.queue.iter_mut().for_each(|q| *q = 0);
        self.constraints.clear();
        self.eof = true;
        rc
    }

    /// Node of the first point, loading it into its cache slot if needed.
    fn node_of_first(&mut self, core: &mut TreeCore) -> RTreeResult<NodeRef> {
        let slot = if self.front.is_some() { 0 } else { 1 };
        if let Some(node) = self.nodes[slot] {
            return Ok(node);
        }
        let id = match self.first() {
            Some(p) => p.id,
            None => return Err(RTreeError::Constraint("cursor is at EOF".into())),
        };
        let node = core.acquire(id, None)?;
        self.nodes[slot] = Some(node);
        Ok(node)
    }

    /// Swaps heap entries `i < j` and their cache slots.
    fn swap(&mut self, core: &mut TreeCore, i: usize, j: usize) -> RTreeResult<()> {
        self.heap.swap(i, j);
        let (i, j) = (i + 1, j + 1);
        if i < CURSOR_CACHE_SIZE {
            if j >= CURSOR_CACHE_SIZE {
                core.release_opt(self.nodes[i].take())?;
            } else {
                self.nodes.swap(i, j);
            }
        }
        Ok(())
    }

    /// Adds `point` to the heap and returns its final index.
    fn enqueue(&mut self, core: &mut TreeCore, point: SearchPoint) -> RTreeResult<usize> {
        let mut i = self.heap.len();
        self.heap.push(point);
        while i > 0 {
            let j = (i - 1) / 2;
            if point.compare(&self.heap[j]) != Ordering::Less {
                break;
            }
            self.swap(core, j, i)?;
            i = j;
        }
        Ok(i)
    }

    /// Queues a new point. A point ranking before the current first takes
    /// the front slot, pushing the old front into the heap.
    fn push(&mut self, core: &mut TreeCore, point: SearchPoint) -> RTreeResult<()> {
        self.queue[point.level as usize] += 1;
        let takes_front = match self.first() {
            None => true,
            Some(first) => {
                first.score > point.score || (first.score == point.score && first.level > point.level)
            }
        };
        if !takes_front {
            self.enqueue(core, point)?;
            return Ok(());
        }
        if let Some(old) = self.front.take() {
            let index = self.enqueue(core, point)?;
            self.heap[index] = old;
            let slot = index + 1;
            let node = self.nodes[0].take();
            if slot < CURSOR_CACHE_SIZE {
                core.release_opt(self.nodes[slot].take())?;
                self.nodes[slot] = node;
            } else {
                core.release_opt(node)?;
            }
        }
        self.front = Some(point);
        Ok(())
    }

    /// Removes the first point.
    fn pop(&mut self, core: &mut TreeCore) -> RTreeResult<()> {
        let slot = if self.front.is_some() { 0 } else { 1 };
        core.release_opt(self.nodes[slot].take())?;

        if let Some(front) = self.front.take() {
            self.queue[front.level as usize] -= 1;
            return Ok(());
        }
        if self.heap.is_empty() {
            return Ok(());
        }
        self.queue[self.heap[0].level as usize] -= 1;
        let last = self.heap.len() - 1;
        self.heap.swap_remove(0);
        let n = last;
        if n + 1 < CURSOR_CACHE_SIZE {
            self.nodes[1] = self.nodes[n + 1].take();
        }

        let mut i = 0;
        loop {
            let j = i * 2 + 1;
            if j >= n {
                break;
            }
            let k = j + 1;
            let child = if k < n && self.heap[k].compare(&self.heap[j]) == Ordering::Less {
                k
            } else {
                j
            };
            if self.heap[child].compare(&self.heap[i]) == Ordering::Less {
                self.swap(core, i, child)?;
                i = child;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Evaluates every constraint on cell `index` of `node`.
    fn classify(
        &self,
        core: &TreeCore,
        node: NodeRef,
        index: usize,
        point: &SearchPoint,
    ) -> RTreeResult<(f64, Within)> {
        let layout = &core.layout;
        let data = &core.nodes[node].data;
        let mut score = -1.0;
        let mut within = Within::FullyWithin;
        for c in &self.constraints {
            if c.op.is_callback() {
                let parent = ParentState {
                    level: point.level,
                    score: point.score,
                    within: point.within,
                };
                test_callback(
                    c,
                    layout,
                    data,
                    index,
                    parent,
                    self.max_level,
                    &self.queue,
                    &mut score,
                    &mut within,
                )?;
            } else if point.level == 1 {
                test_leaf(c, layout, data, index, &mut within);
            } else {
                test_internal(c, layout, data, index, &mut within);
            }
            if within == Within::NotWithin {
                break;
            }
        }
        Ok((score, within))
    }

    /// Advances until the first point is a row or the queue is empty.
    pub fn step_to_leaf(&mut self, core: &mut TreeCore) -> RTreeResult<()> {
        loop {
            let point = match self.first() {
                Some(p) if p.level > 0 => *p,
                _ => break,
            };
            let node = self.node_of_first(core)?;
            let n_cell = core.cell_count(node);
            let mut index = point.cell;
            let mut descended = false;

            while index < n_cell {
                let (mut score, within) = self.classify(core, node, index, &point)?;
                index += 1;
                if within == Within::NotWithin {
                    continue;
                }
                if let Some(p) = self.first_mut() {
                    p.cell = index;
                }

                let level = point.level - 1;
                let (id, cell) = if level > 0 {
                    let child = core.cell_id(node, index - 1);
                    if self.heap.iter().any(|p| p.id == child) {
                        return Err(core.corruption(format!(
                            "node {} is reachable twice during a scan",
                            child
                        )));
                    }
                    (child, 0)
                } else {
                    (point.id, index - 1)
                };
                if index >= n_cell {
                    self.pop(core)?;
                }
                if score < 0.0 {
                    score = 0.0;
                }
                self.push(
                    core,
                    SearchPoint {
                        score,
                        id,
                        level,
                        within,
                        cell,
                    },
                )?;
                descended = true;
                break;
            }

            if !descended {
                if let Some(p) = self.first_mut() {
                    p.cell = index;
                }
                self.pop(core)?;
            }
        }
        self.eof = self.first().is_none();
        Ok(())
    }

    /// Starts a new scan.
    pub fn filter(
        &mut self,
        core: &mut TreeCore,
        strategy: i32,
        encoded: &str,
        args: &[FilterArg],
    ) -> RTreeResult<()> {
        self.reset(core)?;
        self.strategy = strategy;

        if strategy == PLAN_ROWID {
            let rowid = match args.first() {
                Some(FilterArg::Value(v)) => v.as_i64(),
                _ => None,
            };
            let found = match rowid {
                Some(rowid) => core.find_leaf(rowid)?.map(|leaf| (rowid, leaf)),
                None => None,
            };
            if let Some((rowid, (leaf, leaf_id))) = found {
                self.push(
                    core,
                    SearchPoint {
                        score: 0.0,
                        id: leaf_id,
                        level: 0,
                        within: Within::PartlyWithin,
                        cell: 0,
                    },
                )?;
                self.nodes[0] = Some(leaf);
                self.eof = false;
                let cell = core.cell_index(leaf, rowid)?;
                if let Some(p) = self.first_mut() {
                    p.cell = cell;
                }
            }
            return Ok(());
        }

        let root = core.acquire(ROOT_NODE_ID, None)?;
        self.max_level = core.depth + 1;
        match decode_constraints(encoded, args, core.layout.n_coord()) {
            Ok(constraints) => {
                log::trace!("scan with constraints [{}]", describe(&constraints));
                self.constraints = SmallVec::from_vec(constraints);
            }
            Err(e) => {
                core.release(root)?;
                return Err(e);
            }
        }
        self.push(
            core,
            SearchPoint {
                score: 0.0,
                id: ROOT_NODE_ID,
                level: core.depth + 1,
                within: Within::PartlyWithin,
                cell: 0,
            },
        )?;
        self.nodes[0] = Some(root);
        self.step_to_leaf(core)
    }

    /// Moves past the current row.
    pub fn next(&mut self, core: &mut TreeCore) -> RTreeResult<()> {
        self.pop(core)?;
        self.step_to_leaf(core)
    }

    /// Row id of the current row.
    pub fn rowid(&mut self, core: &mut TreeCore) -> RTreeResult<RowId> {
        let cell = match self.first() {
            Some(p) => p.cell,
            None => return Err(RTreeError::Constraint("cursor is at EOF".into())),
        };
        let node = self.node_of_first(core)?;
        if cell >= core.cell_count(node) {
            return Err(RTreeError::Store("cursor points past the end of its node".into()));
        }
        Ok(core.cell_id(node, cell))
    }

    /// Decoded coordinates of the current row.
    pub fn coords(&mut self, core: &mut TreeCore) -> RTreeResult<Vec<f64>> {
        let cell = match self.first() {
            Some(p) => p.cell,
            None => return Err(RTreeError::Constraint("cursor is at EOF".into())),
        };
        let node = self.node_of_first(core)?;
        let layout = core.layout;
        let data = &core.nodes[node].data;
        Ok((0..layout.n_coord())
            .map(|i| layout.coord(data, cell, i).as_f64())
            .collect())
    }

    /// Coordinate `coord` of the current row as a typed value.
    pub fn coord_value(&mut self, core: &mut TreeCore, coord: usize) -> RTreeResult<Value> {
        let cell = match self.first() {
            Some(p) => p.cell,
            None => return Ok(Value::Null),
        };
        let node = self.node_of_first(core)?;
        let layout = core.layout;
        Ok(layout.coord(&core.nodes[node].data, cell, coord).to_value())
    }

    /// Plan the current scan was started with.
    pub fn strategy(&self) -> i32 {
        self.strategy
    }

    #[cfg(test)]
    pub(crate) fn queue_counts(&self) -> &[u32] {
        &self.queue
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// A read cursor over one tree.
///
/// While positioned on a row the cursor holds node references, and every
/// mutation of the tree fails with [`RTreeError::Locked`]. Run the cursor
/// to EOF, [`close`](Cursor::close) it or drop it to release them.
///
/// Geometry callbacks run while the tree is locked and must not call back
/// into the tree.
pub struct Cursor {
    tree: RTree,
    state: SearchState,
    aux: Option<Vec<Value>>,
    closed: bool,
}

impl Cursor {
    pub(crate) fn new(tree: RTree) -> Self {
        Self {
            tree,
            state: SearchState::default(),
            aux: None,
            closed: false,
        }
    }

    fn check_closed(&self) -> RTreeResult<()> {
        if self.closed {
            return Err(RTreeError::Closed);
        }
        Ok(())
    }

    /// Starts a scan. `strategy` and `encoded` come from
    /// [`RTree::best_plan`]; `args` holds one value per encoded constraint.
    pub fn filter(&mut self, strategy: i32, encoded: &str, args: &[FilterArg]) -> RTreeResult<()> {
        self.check_closed()?;
        let mut core = self.tree.lock_core()?;
        self.aux = None;
        self.state.filter(&mut core, strategy, encoded, args)
    }

    /// Starts a scan using a plan and its arguments in argument order.
    pub fn filter_plan(&mut self, plan: &IndexPlan, args: &[FilterArg]) -> RTreeResult<()> {
        self.filter(plan.strategy, &plan.encoded, args)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> RTreeResult<()> {
        self.check_closed()?;
        let mut core = self.tree.lock_core()?;
        self.aux = None;
        self.state.next(&mut core)
    }

    pub fn eof(&self) -> bool {
        self.closed || self.state.eof()
    }

    /// Plan id passed to the last [`filter`](Cursor::filter).
    pub fn strategy(&self) -> i32 {
        self.state.strategy()
    }

    pub fn rowid(&mut self) -> RTreeResult<RowId> {
        self.check_closed()?;
        let mut core = self.tree.lock_core()?;
        self.state.rowid(&mut core)
    }

    /// Column `i` of the current row: 0 is the row id, 1..=2N the
    /// coordinates, then the aux columns. NULL at EOF.
    pub fn column(&mut self, i: usize) -> RTreeResult<Value> {
        self.check_closed()?;
        let mut core = self.tree.lock_core()?;
        if self.state.eof() {
            return Ok(Value::Null);
        }
        let n_coord = core.layout.n_coord();
        let n_aux = core.config.aux_columns.len();
        if i == 0 {
            return self.state.rowid(&mut core).map(Value::Integer);
        }
        if i <= n_coord {
            return self.state.coord_value(&mut core, i - 1);
        }
        if i > n_coord + n_aux {
            return Err(RTreeError::Constraint(format!("no such column: {}", i)));
        }
        if self.aux.is_none() {
            let rowid = self.state.rowid(&mut core)?;
            self.aux = Some(core.store.read_aux(rowid)?.unwrap_or_default());
        }
        Ok(self
            .aux
            .as_ref()
            .and_then(|aux| aux.get(i - n_coord - 1).cloned())
            .unwrap_or_default())
    }

    /// The current row, or `None` at EOF.
    pub fn row(&mut self) -> RTreeResult<Option<RowResult>> {
        self.check_closed()?;
        if self.state.eof() {
            return Ok(None);
        }
        let mut core = self.tree.lock_core()?;
        let rowid = self.state.rowid(&mut core)?;
        let coords = self.state.coords(&mut core)?;
        let n_aux = core.config.aux_columns.len();
        let mut aux = Vec::new();
        if n_aux > 0 {
            if self.aux.is_none() {
                self.aux = Some(core.store.read_aux(rowid)?.unwrap_or_default());
            }
            aux = self.aux.clone().unwrap_or_default();
            aux.resize(n_aux, Value::Null);
        }
        Ok(Some(RowResult { rowid, coords, aux }))
    }

    /// Collects every remaining row.
    pub fn collect_rows(&mut self) -> RTreeResult<Vec<RowResult>> {
        let mut rows = Vec::new();
        while let Some(row) = self.row()? {
            rows.push(row);
            self.next()?;
        }
        Ok(rows)
    }

    /// Releases the cursor's node references.
    pub fn close(mut self) -> RTreeResult<()> {
        self.release()
    }

    fn release(&mut self) -> RTreeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.aux = None;
        if self.state.held_nodes() == 0 {
            return Ok(());
        }
        let mut core = self.tree.core_guard();
        self.state.reset(&mut core)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &SearchState {
        &self.state
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Failed to release cursor: {}", e);
        }
    }
}

/// Renders the op codes of a constraint list, for diagnostics.
pub(crate) fn describe(constraints: &[Constraint]) -> String {
    constraints
        .iter()
        .map(|c| match c.op {
            ConstraintOp::Match | ConstraintOp::Query => format!("{:?}", c.op),
            op => format!("{:?}[{}] {}", op, c.coord, c.value),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
