//! Query constraints and their evaluation against raw cell bytes.
//!
//! A scan carries a list of constraints. Each is either a comparison of one
//! coordinate against a numeric bound or a geometry callback. Evaluation
//! classifies a cell as not, partly or fully within the query region and,
//! for ranking callbacks, produces a score.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use super::codec::NodeLayout;
use super::rtree_types::{RTreeError, RTreeResult, RowId, Value};

// ============================================================================
// Operators
// ============================================================================

/// Constraint operator. The byte codes form the encoded plan string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
    /// Boolean geometry predicate
    Match,
    /// Ranking geometry callback
    Query,
    /// Always satisfied
    True,
    /// Never satisfied
    False,
}

impl ConstraintOp {
    pub fn code(self) -> u8 {
        match self {
            ConstraintOp::Eq => b'A',
            ConstraintOp::Le => b'B',
            ConstraintOp::Lt => b'C',
            ConstraintOp::Ge => b'D',
            ConstraintOp::Gt => b'E',
            ConstraintOp::Match => b'F',
            ConstraintOp::Query => b'G',
            ConstraintOp::True => b'?',
            ConstraintOp::False => b'@',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'A' => ConstraintOp::Eq,
            b'B' => ConstraintOp::Le,
            b'C' => ConstraintOp::Lt,
            b'D' => ConstraintOp::Ge,
            b'E' => ConstraintOp::Gt,
            b'F' => ConstraintOp::Match,
            b'G' => ConstraintOp::Query,
            b'?' => ConstraintOp::True,
            b'@' => ConstraintOp::False,
            _ => return None,
        })
    }

    pub fn is_callback(self) -> bool {
        matches!(self, ConstraintOp::Match | ConstraintOp::Query)
    }
}

/// Classification of a cell against the query region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Within {
    #[default]
    NotWithin = 0,
    PartlyWithin = 1,
    FullyWithin = 2,
}

// ============================================================================
// Geometry callbacks
// ============================================================================

/// Boolean shape test. Called for internal and leaf cells alike; must
/// return true whenever the shape may intersect the box.
pub trait GeometryPredicate: Send + Sync {
    fn test(&self, coords: &[f64]) -> RTreeResult<bool>;
}

impl<F> GeometryPredicate for F
where
    F: Fn(&[f64]) -> RTreeResult<bool> + Send + Sync,
{
    fn test(&self, coords: &[f64]) -> RTreeResult<bool> {
        self(coords)
    }
}

/// What a ranking callback sees for one cell.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest<'a> {
    /// Decoded min/max pairs of the cell
    pub coords: &'a [f64],
    /// Level of the cell: 0 for rows, 1 for leaf nodes, and so on
    pub level: i32,
    /// Level of the root plus one
    pub max_level: i32,
    /// Row id, set for cells of leaf nodes
    pub rowid: Option<RowId>,
    pub parent_score: f64,
    pub parent_within: Within,
    /// Number of queued search points per level
    pub queue: &'a [u32],
}

/// A ranking callback's verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResponse {
    pub within: Within,
    /// Smaller scores are visited first
    pub score: f64,
}

impl QueryResponse {
    /// Keeps the parent's classification and score.
    pub fn inherit(request: &QueryRequest<'_>) -> Self {
        Self {
            within: request.parent_within,
            score: request.parent_score,
        }
    }
}

/// Level-aware callback that classifies and ranks cells.
pub trait QueryCallback: Send + Sync {
    fn query(&self, request: &QueryRequest<'_>) -> RTreeResult<QueryResponse>;
}

impl<F> QueryCallback for F
where
    F: Fn(&QueryRequest<'_>) -> RTreeResult<QueryResponse> + Send + Sync,
{
    fn query(&self, request: &QueryRequest<'_>) -> RTreeResult<QueryResponse> {
        self(request)
    }
}

#[derive(Clone)]
pub enum GeometryCallback {
    Predicate(Arc<dyn GeometryPredicate>),
    Query(Arc<dyn QueryCallback>),
}

impl GeometryCallback {
    pub fn predicate(p: impl GeometryPredicate + 'static) -> Self {
        GeometryCallback::Predicate(Arc::new(p))
    }

    pub fn query(q: impl QueryCallback + 'static) -> Self {
        GeometryCallback::Query(Arc::new(q))
    }
}

impl Debug for GeometryCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometryCallback::Predicate(_) => write!(f, "GeometryCallback::Predicate"),
            GeometryCallback::Query(_) => write!(f, "GeometryCallback::Query"),
        }
    }
}

/// Argument bound to one encoded constraint.
#[derive(Debug, Clone)]
pub enum FilterArg {
    Value(Value),
    Geometry(GeometryCallback),
}

impl From<Value> for FilterArg {
    fn from(v: Value) -> Self {
        FilterArg::Value(v)
    }
}

impl From<i64> for FilterArg {
    fn from(v: i64) -> Self {
        FilterArg::Value(Value::Integer(v))
    }
}

impl From<f64> for FilterArg {
    fn from(v: f64) -> Self {
        FilterArg::Value(Value::Real(v))
    }
}

impl From<GeometryCallback> for FilterArg {
    fn from(cb: GeometryCallback) -> Self {
        FilterArg::Geometry(cb)
    }
}

// ============================================================================
// Decoded constraints
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Constraint {
    pub op: ConstraintOp,
    /// Coordinate index, 0..2N
    pub coord: usize,
    pub value: f64,
    pub callback: Option<GeometryCallback>,
}

/// Decodes an encoded constraint list and binds its arguments.
///
/// The string holds one (operator, coordinate digit) byte pair per
/// argument. NULL bounds never match; text and blob bounds compare greater
/// than every number.
pub(crate) fn decode_constraints(
    encoded: &str,
    args: &[FilterArg],
    n_coord: usize,
) -> RTreeResult<Vec<Constraint>> {
    let bytes = encoded.as_bytes();
    if bytes.len() % 2 != 0 || bytes.len() / 2 != args.len() {
        return Err(RTreeError::Constraint(format!(
            "encoded constraints {:?} do not match {} arguments",
            encoded,
            args.len()
        )));
    }

    let mut constraints = Vec::with_capacity(args.len());
    for (pair, arg) in bytes.chunks(2).zip(args) {
        let mut op = ConstraintOp::from_code(pair[0]).ok_or_else(|| {
            RTreeError::Constraint(format!("unknown operator {:?}", pair[0] as char))
        })?;
        let digit = pair[1].wrapping_sub(b'0') as usize;

        if op.is_callback() {
            let callback = match arg {
                FilterArg::Geometry(cb) => cb.clone(),
                FilterArg::Value(v) => {
                    return Err(RTreeError::Constraint(format!(
                        "MATCH needs a geometry callback, got {}",
                        v
                    )))
                }
            };
            op = match callback {
                GeometryCallback::Predicate(_) => ConstraintOp::Match,
                GeometryCallback::Query(_) => ConstraintOp::Query,
            };
            constraints.push(Constraint {
                op,
                coord: digit.min(n_coord.saturating_sub(1)),
                value: 0.0,
                callback: Some(callback),
            });
            continue;
        }

        if digit >= n_coord {
            return Err(RTreeError::Constraint(format!(
                "coordinate {} out of range",
                pair[1] as char
            )));
        }
        let value = match arg {
            FilterArg::Value(Value::Null) => {
                op = ConstraintOp::False;
                0.0
            }
            FilterArg::Value(Value::Text(_)) | FilterArg::Value(Value::Blob(_)) => {
                op = if matches!(op, ConstraintOp::Lt | ConstraintOp::Le) {
                    ConstraintOp::True
                } else {
                    ConstraintOp::False
                };
                0.0
            }
            FilterArg::Value(v) => v.as_f64().unwrap_or_default(),
            FilterArg::Geometry(_) => {
                return Err(RTreeError::Constraint(
                    "geometry callback bound to a comparison".into(),
                ))
            }
        };
        constraints.push(Constraint {
            op,
            coord: digit,
            value,
            callback: None,
        });
    }
    Ok(constraints)
}

// ============================================================================
// Evaluation
// ============================================================================

/// Search-point state handed to ranking callbacks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParentState {
    /// Level of the node being scanned
    pub level: i32,
    pub score: f64,
    pub within: Within,
}

/// Checks a cell of a leaf node, comparing the single coordinate.
pub(crate) fn test_leaf(
    c: &Constraint,
    layout: &NodeLayout,
    data: &[u8],
    index: usize,
    within: &mut Within,
) {
    let x = layout.coord(data, index, c.coord).as_f64();
    let ok = match c.op {
        ConstraintOp::True => true,
        ConstraintOp::False => false,
        ConstraintOp::Le => x <= c.value,
        ConstraintOp::Lt => x < c.value,
        ConstraintOp::Ge => x >= c.value,
        ConstraintOp::Gt => x > c.value,
        _ => x == c.value,
    };
    if !ok {
        *within = Within::NotWithin;
    }
}

/// Checks a cell of an internal node. The cell is pruned only when no box
/// inside it could satisfy the comparison.
pub(crate) fn test_internal(
    c: &Constraint,
    layout: &NodeLayout,
    data: &[u8],
    index: usize,
    within: &mut Within,
) {
    let base = c.coord & !1;
    let lower = || layout.coord(data, index, base).as_f64();
    let upper = || layout.coord(data, index, base + 1).as_f64();
    let ok = match c.op {
        ConstraintOp::True => true,
        ConstraintOp::False => false,
        ConstraintOp::Eq => c.value >= lower() && c.value <= upper(),
        ConstraintOp::Le | ConstraintOp::Lt => c.value >= lower(),
        _ => c.value <= upper(),
    };
    if !ok {
        *within = Within::NotWithin;
    }
}

/// Runs a geometry callback on a cell.
#[allow(clippy::too_many_arguments)]
pub(crate) fn test_callback(
    c: &Constraint,
    layout: &NodeLayout,
    data: &[u8],
    index: usize,
    parent: ParentState,
    max_level: i32,
    queue: &[u32],
    score: &mut f64,
    within: &mut Within,
) -> RTreeResult<()> {
    let coords: Vec<f64> = (0..layout.n_coord())
        .map(|i| layout.coord(data, index, i).as_f64())
        .collect();

    match &c.callback {
        Some(GeometryCallback::Predicate(p)) => {
            if !p.test(&coords)? {
                *within = Within::NotWithin;
            }
            *score = 0.0;
        }
        Some(GeometryCallback::Query(q)) => {
            let request = QueryRequest {
                coords: &coords,
                level: parent.level - 1,
                max_level,
                rowid: (parent.level == 1).then(|| layout.cell_id(data, index)),
                parent_score: parent.score,
                parent_within: parent.within,
                queue,
            };
            let response = q.query(&request)?;
            if response.within < *within {
                *within = response.within;
            }
            if response.score < *score || *score < 0.0 {
                *score = response.score;
            }
        }
        None => {
            return Err(RTreeError::Constraint(
                "callback constraint without a callback".into(),
            ))
        }
    }
    Ok(())
}
