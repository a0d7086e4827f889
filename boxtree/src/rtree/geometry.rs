//! Box arithmetic over cells.
//!
//! All measures are computed in `f64` from the decoded coordinates. Unions
//! keep the stored coordinate values, so no precision is lost when a box is
//! widened.

use super::codec::NodeLayout;
use super::rtree_types::{Cell, Coord, CoordType, RTreeError, RTreeResult};

/// Scale factors nudging a narrowed f32 one ulp-ish toward or away from zero.
const ROUND_TOWARDS: f64 = 1.0 - 1.0 / 8388608.0;
const ROUND_AWAY: f64 = 1.0 + 1.0 / 8388608.0;

/// Largest f32 not greater than `d`.
pub fn value_down(d: f64) -> f32 {
    let f = d as f32;
    if f as f64 > d {
        (d * if d < 0.0 { ROUND_AWAY } else { ROUND_TOWARDS }) as f32
    } else {
        f
    }
}

/// Smallest f32 not less than `d`.
pub fn value_up(d: f64) -> f32 {
    let f = d as f32;
    if (f as f64) < d {
        (d * if d < 0.0 { ROUND_TOWARDS } else { ROUND_AWAY }) as f32
    } else {
        f
    }
}

#[inline]
fn pick_min(a: Coord, b: Coord) -> Coord {
    if b.as_f64() < a.as_f64() {
        b
    } else {
        a
    }
}

#[inline]
fn pick_max(a: Coord, b: Coord) -> Coord {
    if b.as_f64() > a.as_f64() {
        b
    } else {
        a
    }
}

/// Product of the extents.
pub fn cell_area(dims: usize, cell: &Cell) -> f64 {
    let mut area = 1.0;
    for d in 0..dims {
        area *= cell.max(d) - cell.min(d);
    }
    area
}

/// Sum of the extents.
pub fn cell_margin(dims: usize, cell: &Cell) -> f64 {
    let mut margin = 0.0;
    for d in 0..dims {
        margin += cell.max(d) - cell.min(d);
    }
    margin
}

/// Widens `target` to cover `other`.
pub fn cell_union(dims: usize, target: &mut Cell, other: &Cell) {
    for d in 0..dims {
        let (lo, hi) = (d * 2, d * 2 + 1);
        target.coords[lo] = pick_min(target.coords[lo], other.coords[lo]);
        target.coords[hi] = pick_max(target.coords[hi], other.coords[hi]);
    }
}

/// Returns true if `outer` covers `inner` on every dimension.
pub fn cell_contains(dims: usize, outer: &Cell, inner: &Cell) -> bool {
    (0..dims).all(|d| outer.min(d) <= inner.min(d) && outer.max(d) >= inner.max(d))
}

/// Area added to `cell` by covering `added`.
pub fn cell_growth(dims: usize, cell: &Cell, added: &Cell) -> f64 {
    let before = cell_area(dims, cell);
    let mut grown = *cell;
    cell_union(dims, &mut grown, added);
    cell_area(dims, &grown) - before
}

/// Summed intersection volume of `cell` with each of `others`.
pub fn cell_overlap(dims: usize, cell: &Cell, others: &[Cell]) -> f64 {
    let mut overlap = 0.0;
    for other in others {
        let mut o = 1.0;
        for d in 0..dims {
            let x1 = cell.min(d).max(other.min(d));
            let x2 = cell.max(d).min(other.max(d));
            if x2 < x1 {
                o = 0.0;
                break;
            }
            o *= x2 - x1;
        }
        overlap += o;
    }
    overlap
}

/// Builds the cell stored for a row from caller coordinates, rounding
/// outward when narrowing to f32.
pub fn cell_from_box(layout: &NodeLayout, rowid: i64, coords: &[f64]) -> RTreeResult<Cell> {
    let n_coord = layout.n_coord();
    if coords.len() != n_coord {
        return Err(RTreeError::Constraint(format!(
            "expected {} coordinates, got {}",
            n_coord,
            coords.len()
        )));
    }
    let mut cell = Cell::new(rowid, layout.coord_type);
    for d in 0..layout.dimensions {
        let (lo, hi) = (coords[d * 2], coords[d * 2 + 1]);
        if lo.is_nan() || hi.is_nan() {
            return Err(RTreeError::Constraint(format!(
                "coordinate on dimension {} is not a number",
                d
            )));
        }
        let (min, max) = match layout.coord_type {
            CoordType::Real32 => (Coord::Real(value_down(lo)), Coord::Real(value_up(hi))),
            CoordType::Int32 => (Coord::Int(lo as i32), Coord::Int(hi as i32)),
        };
        if min.as_f64() > max.as_f64() {
            return Err(RTreeError::InvalidBox {
                dimension: d,
                column: d * 2 + 1,
            });
        }
        cell.coords[d * 2] = min;
        cell.coords[d * 2 + 1] = max;
    }
    Ok(cell)
}
