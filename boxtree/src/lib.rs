//! # Boxtree - R*-tree spatial index engine
//!
//! This crate provides a persistent R*-tree over axis-aligned boxes of one
//! to five dimensions, stored as fixed-size node blobs in a pluggable
//! [`NodeStore`].
//!
//! ## Features
//!
//! - **Pluggable Storage**: nodes, parent links and row locations live in a
//!   store; [`MemoryStore`] and the single-file [`FileStore`] are provided
//! - **R\* Heuristics**: forced reinsertion and margin/overlap driven splits
//! - **Best-First Search**: coordinate constraints plus geometry callbacks
//!   that can prune, rank and reorder the traversal
//! - **Query Planning**: a row id lookup or a constrained scan, with cost
//!   estimates for a host query planner
//! - **Integrity Check**: a full walk reporting every broken invariant
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use boxtree::{IndexOp, QueryConstraint, RTree, RTreeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = RTree::in_memory(RTreeConfig::new(2))?;
//! tree.insert(Some(1), &[0.0, 10.0, 0.0, 10.0], &[])?;
//! tree.insert(Some(2), &[20.0, 30.0, 20.0, 30.0], &[])?;
//!
//! // Boxes whose max x is at least 5 and whose min x is at most 15
//! let rows = tree.query(&[
//!     QueryConstraint::new(2, IndexOp::Ge, 5.0),
//!     QueryConstraint::new(1, IndexOp::Le, 15.0),
//! ])?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod rtree;

pub use config::RTreeConfig;
pub use rtree::{
    best_index, value_down, value_up, Cell, ConstraintUsage, Coord, CoordType, Cursor, FileStore,
    FilterArg, GeometryCallback, GeometryPredicate, IndexConstraint, IndexOp, IndexPlan,
    IntegrityReport, MemoryStore, NodeLayout, NodeStore, QueryCallback, QueryConstraint,
    QueryRequest, QueryResponse, RTree, RTreeError, RTreeResult, RTreeStats, RowId, RowResult,
    StoreTables, Value, Within, NodeId, PLAN_ROWID, PLAN_SCAN,
};
