//! R*-tree engine over a pluggable node store.
//!
//! The tree keeps fixed-size node blobs in a [`NodeStore`] and loads them
//! on demand into a reference-counted node cache. Inserts use the R*-tree
//! heuristics (least-enlargement descent, one forced reinsertion per level
//! and operation, margin/overlap driven splits); deletes condense underfull
//! nodes by reinserting their cells. Queries run as a best-first traversal
//! driven by coordinate constraints and optional geometry callbacks.

pub mod codec;
pub mod constraint;
pub mod file_store;
pub mod integrity;
pub mod plan;
pub mod rtree_constants;
pub mod rtree_types;
pub mod search;
pub mod store;

mod delete;
mod geometry;
mod insert;
mod node_cache;
mod rtree_impl;

pub use codec::NodeLayout;
pub use constraint::{
    FilterArg, GeometryCallback, GeometryPredicate, QueryCallback, QueryRequest, QueryResponse,
    Within,
};
pub use file_store::FileStore;
pub use geometry::{value_down, value_up};
pub use integrity::IntegrityReport;
pub use plan::{best_index, ConstraintUsage, IndexConstraint, IndexOp, IndexPlan};
pub use rtree_impl::{QueryConstraint, RTree};
pub use rtree_types::{
    Cell, Coord, CoordType, NodeId, RTreeError, RTreeResult, RTreeStats, RowId, RowResult, Value,
};
pub use search::{Cursor, PLAN_ROWID, PLAN_SCAN};
pub use store::{MemoryStore, NodeStore, StoreTables};
