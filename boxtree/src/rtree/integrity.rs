//! Whole-tree consistency check.
//!
//! Walks every node reachable from the root straight from the store and
//! verifies:
//! - the root depth is in range and every cell count fits its node
//! - each cell has min <= max on every dimension
//! - each cell lies inside the cell that points at its node
//! - parent and rowid mappings point at the node holding the cell
//! - the mapping tables hold exactly the reachable entries

use super::codec::NodeLayout;
use super::rtree_constants::{MAX_DEPTH, NODE_HEADER_SIZE, ROOT_NODE_ID};
use super::rtree_impl::TreeCore;
use super::rtree_types::{Cell, NodeId, RTreeResult};

/// Errors recorded before the walk stops reporting
const MAX_REPORTED_ERRORS: usize = 100;

/// Outcome of [`RTree::check_integrity`](super::rtree_impl::RTree::check_integrity).
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    /// Nodes read during the walk
    pub nodes_checked: u64,
    /// Cells examined across all nodes
    pub cells_checked: u64,
    /// Detailed error messages
    pub errors: Vec<String>,
    /// True if no error was found
    pub is_valid: bool,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            nodes_checked: 0,
            cells_checked: 0,
            errors: Vec::new(),
            is_valid: true,
        }
    }

    fn error(&mut self, msg: String) {
        self.is_valid = false;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(msg);
        }
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mapping {
    Parent,
    Rowid,
}

impl Mapping {
    fn table(self) -> &'static str {
        match self {
            Mapping::Parent => "parent",
            Mapping::Rowid => "rowid",
        }
    }
}

struct Walk<'a> {
    core: &'a mut TreeCore,
    layout: NodeLayout,
    report: IntegrityReport,
    leaf_cells: i64,
    internal_cells: i64,
}

impl Walk<'_> {
    fn check_mapping(&mut self, mapping: Mapping, key: i64, node: NodeId) -> RTreeResult<()> {
        let found = match mapping {
            Mapping::Parent => self.core.store.read_parent(key)?,
            Mapping::Rowid => self.core.store.read_rowid_node(key)?,
        };
        match found {
            None => self.report.error(format!(
                "Mapping ({} -> {}) missing from {} table",
                key,
                node,
                mapping.table()
            )),
            Some(actual) if actual != node => self.report.error(format!(
                "Found ({} -> {}) in {} table, expected ({} -> {})",
                key,
                actual,
                mapping.table(),
                key,
                node
            )),
            Some(_) => {}
        }
        Ok(())
    }

    fn check_cell(&mut self, node: NodeId, index: usize, cell: &Cell, parent: Option<&Cell>) {
        for d in 0..self.layout.dimensions {
            if cell.min(d) > cell.max(d) {
                self.report.error(format!(
                    "Dimension {} of cell {} on node {} is corrupt",
                    d, index, node
                ));
            }
            if let Some(p) = parent {
                if cell.min(d) < p.min(d) || cell.max(d) > p.max(d) {
                    self.report.error(format!(
                        "Dimension {} of cell {} on node {} is corrupt relative to parent",
                        d, index, node
                    ));
                }
            }
        }
    }

    fn check_node(&mut self, depth: i32, parent: Option<&Cell>, id: NodeId) -> RTreeResult<()> {
        let data = match self.core.store.read_node(id)? {
            Some(data) => data,
            None => {
                self.report.error(format!("Node {} missing from database", id));
                return Ok(());
            }
        };
        self.report.nodes_checked += 1;

        if data.len() < NODE_HEADER_SIZE {
            self.report
                .error(format!("Node {} is too small ({} bytes)", id, data.len()));
            return Ok(());
        }
        let depth = if parent.is_none() {
            let depth = self.layout.depth(&data);
            if depth > MAX_DEPTH {
                self.report
                    .error(format!("Rtree depth out of range ({})", depth));
                return Ok(());
            }
            depth
        } else {
            depth
        };

        let count = self.layout.cell_count(&data);
        if NODE_HEADER_SIZE + count * self.layout.bytes_per_cell > data.len() {
            self.report.error(format!(
                "Node {} is too small for cell count of {} ({} bytes)",
                id,
                count,
                data.len()
            ));
            return Ok(());
        }
        if count > self.layout.capacity() {
            self.report.error(format!(
                "Node {} holds {} cells, capacity is {}",
                id,
                count,
                self.layout.capacity()
            ));
        }

        for i in 0..count {
            let cell = self.layout.read_cell(&data, i);
            self.report.cells_checked += 1;
            self.check_cell(id, i, &cell, parent);
            if depth > 0 {
                self.check_mapping(Mapping::Parent, cell.id, id)?;
                self.check_node(depth - 1, Some(&cell), cell.id)?;
                self.internal_cells += 1;
            } else {
                self.check_mapping(Mapping::Rowid, cell.id, id)?;
                self.leaf_cells += 1;
            }
        }
        Ok(())
    }

    fn check_count(&mut self, mapping: Mapping, expected: i64, actual: Option<i64>) {
        if let Some(actual) = actual {
            if actual != expected {
                self.report.error(format!(
                    "Wrong number of entries in {} table - expected {}, actual {}",
                    mapping.table(),
                    expected,
                    actual
                ));
            }
        }
    }
}

impl TreeCore {
    /// Checks the stored tree. Problems are reported, not returned as
    /// errors; only store failures abort the walk.
    pub(crate) fn check_integrity(&mut self) -> RTreeResult<IntegrityReport> {
        let layout = self.layout;
        let mut walk = Walk {
            core: self,
            layout,
            report: IntegrityReport::new(),
            leaf_cells: 0,
            internal_cells: 0,
        };
        walk.check_node(0, None, ROOT_NODE_ID)?;

        let rows = walk.core.store.row_count()?;
        let parents = walk.core.store.parent_count()?;
        let (leaf_cells, internal_cells) = (walk.leaf_cells, walk.internal_cells);
        walk.check_count(Mapping::Rowid, leaf_cells, rows);
        walk.check_count(Mapping::Parent, internal_cells, parents);

        let report = walk.report;
        if !report.is_valid {
            log::warn!(
                "Integrity check found {} problems, first: {}",
                report.errors.len(),
                report.errors.first().map(String::as_str).unwrap_or("")
            );
        }
        Ok(report)
    }
}
