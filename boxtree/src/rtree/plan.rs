//! Query plan selection.
//!
//! Given the constraints a caller could push down, pick either a direct row
//! id lookup or a tree scan, and encode the usable constraints as
//! (operator, coordinate) byte pairs for [`Cursor::filter`].
//!
//! [`Cursor::filter`]: super::search::Cursor::filter

use super::constraint::ConstraintOp;
use super::rtree_constants::MAX_PLAN_CONSTRAINTS;
use super::search::{PLAN_ROWID, PLAN_SCAN};

/// Operator of a candidate constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    /// Anything the tree cannot evaluate
    Other,
}

impl IndexOp {
    fn constraint_op(self) -> Option<ConstraintOp> {
        match self {
            IndexOp::Eq => Some(ConstraintOp::Eq),
            IndexOp::Gt => Some(ConstraintOp::Gt),
            IndexOp::Le => Some(ConstraintOp::Le),
            IndexOp::Lt => Some(ConstraintOp::Lt),
            IndexOp::Ge => Some(ConstraintOp::Ge),
            IndexOp::Match => Some(ConstraintOp::Match),
            IndexOp::Other => None,
        }
    }
}

/// A constraint offered to the planner. Column 0 is the row id and columns
/// 1..=2N are the coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConstraint {
    pub column: usize,
    pub op: IndexOp,
    pub usable: bool,
}

impl IndexConstraint {
    pub fn new(column: usize, op: IndexOp) -> Self {
        Self {
            column,
            op,
            usable: true,
        }
    }
}

/// How the plan consumes one offered constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstraintUsage {
    /// 1-based position of the constraint's argument, 0 if unused
    pub argv_index: usize,
    /// The tree fully enforces the constraint
    pub omit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    /// [`PLAN_ROWID`] or [`PLAN_SCAN`]
    pub strategy: i32,
    /// Encoded (operator, coordinate) pairs
    pub encoded: String,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
    /// At most one row can match
    pub unique: bool,
    /// One entry per offered constraint
    pub usage: Vec<ConstraintUsage>,
}

impl IndexPlan {
    /// Orders arguments given per offered constraint into filter order.
    pub fn arrange_args<T: Clone>(&self, per_constraint: &[T]) -> Vec<T> {
        let mut used: Vec<(usize, &T)> = self
            .usage
            .iter()
            .zip(per_constraint)
            .filter(|(u, _)| u.argv_index > 0)
            .map(|(u, arg)| (u.argv_index, arg))
            .collect();
        used.sort_by_key(|(i, _)| *i);
        used.into_iter().map(|(_, arg)| arg.clone()).collect()
    }
}

/// Picks the plan for `constraints` on a tree with `n_coord` coordinates
/// holding about `row_estimate` rows.
pub fn best_index(constraints: &[IndexConstraint], n_coord: usize, row_estimate: i64) -> IndexPlan {
    let mut usage = vec![ConstraintUsage::default(); constraints.len()];
    let has_match = constraints.iter().any(|c| c.op == IndexOp::Match);

    if !has_match {
        if let Some(i) = constraints
            .iter()
            .position(|c| c.usable && c.column == 0 && c.op == IndexOp::Eq)
        {
            usage[i] = ConstraintUsage {
                argv_index: 1,
                omit: true,
            };
            return IndexPlan {
                strategy: PLAN_ROWID,
                encoded: String::new(),
                estimated_cost: 30.0,
                estimated_rows: 1,
                unique: true,
                usage,
            };
        }
    }

    let mut encoded = Vec::new();
    for (i, c) in constraints.iter().enumerate() {
        if encoded.len() / 2 >= MAX_PLAN_CONSTRAINTS {
            break;
        }
        let on_coord = c.column > 0 && c.column <= n_coord;
        if !c.usable || !(on_coord || c.op == IndexOp::Match) {
            continue;
        }
        if let Some(op) = c.op.constraint_op() {
            encoded.push(op.code());
            encoded.push((c.column as u8).wrapping_sub(1).wrapping_add(b'0'));
            usage[i] = ConstraintUsage {
                argv_index: encoded.len() / 2,
                omit: true,
            };
        }
    }

    let pairs = encoded.len() / 2;
    let rows = row_estimate >> pairs.min(63);
    IndexPlan {
        strategy: PLAN_SCAN,
        encoded: encoded.into_iter().map(char::from).collect(),
        estimated_cost: 6.0 * rows as f64,
        estimated_rows: rows,
        unique: false,
        usage,
    }
}
