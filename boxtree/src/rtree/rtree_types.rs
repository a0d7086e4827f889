//! Core types for the R*-tree engine.
//!
//! This module defines the fundamental types used throughout the tree:
//! - Error types and result types
//! - Coordinates, cells and their representation
//! - Column values exchanged with the caller
//! - Statistics structures

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io;
use thiserror::Error;

use super::rtree_constants::MAX_COORDS;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in R-tree operations
#[derive(Debug, Error)]
pub enum RTreeError {
    /// A structural invariant of the stored tree does not hold
    #[error("database disk image is malformed: {0}")]
    Corrupt(String),

    /// A mutation was attempted while a cursor holds node references
    #[error("r-tree is locked by an open cursor")]
    Locked,

    #[error("UNIQUE constraint failed: rowid {0}")]
    DuplicateRowid(i64),

    /// A box whose lower bound exceeds its upper bound
    #[error("rtree constraint failed: lower bound exceeds upper bound on dimension {dimension} (column {column})")]
    InvalidBox { dimension: usize, column: usize },

    #[error("Invalid constraint: {0}")]
    Constraint(String),

    #[error("Geometry callback failed: {0}")]
    Callback(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tree is closed")]
    Closed,
}

impl RTreeError {
    /// Builds a corruption error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        RTreeError::Corrupt(msg.into())
    }

    /// Returns true for errors signalling a damaged tree.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, RTreeError::Corrupt(_))
    }
}

/// Result type for R-tree operations
pub type RTreeResult<T> = Result<T, RTreeError>;

/// Node id inside the node table
pub type NodeId = i64;

/// External row id
pub type RowId = i64;

// ============================================================================
// Coordinates
// ============================================================================

/// On-disk representation of the coordinates of a tree, fixed per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CoordType {
    /// IEEE-754 single precision
    #[default]
    Real32,
    /// Two's-complement 32-bit integer
    Int32,
}

/// A single stored coordinate.
///
/// Real and integer coordinates never mix within one tree; every
/// comparison goes through [`Coord::as_f64`], which is exact for both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coord {
    Real(f32),
    Int(i32),
}

impl Coord {
    /// The zero value of the given representation.
    pub fn zero(coord_type: CoordType) -> Self {
        match coord_type {
            CoordType::Real32 => Coord::Real(0.0),
            CoordType::Int32 => Coord::Int(0),
        }
    }

    #[inline]
    pub fn as_f64(self) -> f64 {
        match self {
            Coord::Real(f) => f as f64,
            Coord::Int(i) => i as f64,
        }
    }

    /// Raw 32-bit pattern written to disk.
    #[inline]
    pub fn to_bits(self) -> u32 {
        match self {
            Coord::Real(f) => f.to_bits(),
            Coord::Int(i) => i as u32,
        }
    }

    #[inline]
    pub fn from_bits(bits: u32, coord_type: CoordType) -> Self {
        match coord_type {
            CoordType::Real32 => Coord::Real(f32::from_bits(bits)),
            CoordType::Int32 => Coord::Int(bits as i32),
        }
    }

    /// The coordinate as a column value.
    pub fn to_value(self) -> Value {
        match self {
            Coord::Real(f) => Value::Real(f as f64),
            Coord::Int(i) => Value::Integer(i as i64),
        }
    }
}

// ============================================================================
// Cells
// ============================================================================

/// One entry of a node: a child node id (internal nodes) or a row id
/// (leaves), followed by a min/max coordinate pair per dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub id: i64,
    pub coords: [Coord; MAX_COORDS],
}

impl Cell {
    pub fn new(id: i64, coord_type: CoordType) -> Self {
        Self {
            id,
            coords: [Coord::zero(coord_type); MAX_COORDS],
        }
    }

    /// Lower bound on dimension `dim`.
    #[inline]
    pub fn min(&self, dim: usize) -> f64 {
        self.coords[dim * 2].as_f64()
    }

    /// Upper bound on dimension `dim`.
    #[inline]
    pub fn max(&self, dim: usize) -> f64 {
        self.coords[dim * 2 + 1].as_f64()
    }
}

// ============================================================================
// Column values
// ============================================================================

/// A dynamically typed value: filter arguments, column results and
/// auxiliary column contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(r) if r.fract() == 0.0 => Some(*r as i64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Blob(b) => write!(f, "x'{}'", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// A row produced by a query: its id, decoded box and auxiliary columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    pub rowid: RowId,
    /// Min/max pairs, `2 * dimensions` values
    pub coords: Vec<f64>,
    pub aux: Vec<Value>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about R-tree operations
#[derive(Debug, Clone, Default)]
pub struct RTreeStats {
    /// Depth of the tree (0 when the root is a leaf)
    pub depth: i32,
    /// Nodes currently held in memory
    pub cached_nodes: u64,
    /// Node lookups satisfied from memory
    pub cache_hits: u64,
    /// Node blobs read from the store
    pub node_reads: u64,
    /// Node blobs written to the store
    pub node_writes: u64,
    /// Nodes split since the tree was opened
    pub splits: u64,
    /// Forced reinsertions since the tree was opened
    pub reinserts: u64,
}
