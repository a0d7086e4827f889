use boxtree::{
    FilterArg, GeometryCallback, IndexConstraint, IndexOp, QueryConstraint, QueryRequest,
    QueryResponse, RTreeError, RTreeResult, RowId, Within,
};
use boxtree_int_test::test_util::{
    cleanup, create_test_context, random_box, run_test, seeded_rng, sorted_ids, TestContext,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[ctor::ctor]
fn init() {
    colog::init();
}

/// Squared distance from a point to the nearest point of a 2-D box.
fn distance_sq(coords: &[f64], px: f64, py: f64) -> f64 {
    let dx = (coords[0] - px).max(0.0).max(px - coords[1]);
    let dy = (coords[2] - py).max(0.0).max(py - coords[3]);
    dx * dx + dy * dy
}

fn populate(ctx: &TestContext, rows: usize, seed: u64) -> RTreeResult<BTreeMap<RowId, Vec<f64>>> {
    let tree = ctx.tree();
    let mut rng = seeded_rng(seed);
    let mut model = BTreeMap::new();
    for _ in 0..rows {
        let coords = random_box(&mut rng, 2, 1000, 15);
        let rowid = tree.insert(None, &coords, &[])?;
        model.insert(rowid, coords);
    }
    Ok(model)
}

#[test]
fn test_match_circle() {
    run_test(
        create_test_context,
        |ctx| {
            let model = populate(&ctx, 400, 1)?;
            let (cx, cy, r) = (500.0, 500.0, 120.0);
            let circle = GeometryCallback::predicate(move |coords: &[f64]| -> RTreeResult<bool> {
                Ok(distance_sq(coords, cx, cy) <= r * r)
            });

            let rows = ctx.tree().query(&[QueryConstraint::matching(circle)])?;
            let expected: Vec<RowId> = model
                .iter()
                .filter(|(_, c)| distance_sq(c, cx, cy) <= r * r)
                .map(|(id, _)| *id)
                .collect();
            assert!(!expected.is_empty());
            assert_eq!(sorted_ids(&rows), expected);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_match_prunes_subtrees() {
    run_test(
        create_test_context,
        |ctx| {
            populate(&ctx, 400, 2)?;
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let nothing = GeometryCallback::predicate(move |_: &[f64]| -> RTreeResult<bool> {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            });

            let rows = ctx.tree().query(&[QueryConstraint::matching(nothing)])?;
            assert!(rows.is_empty());
            let root_cells = calls.load(Ordering::Relaxed);
            assert!(root_cells <= 8, "callback ran {} times", root_cells);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_match_with_coordinate_constraint() {
    run_test(
        create_test_context,
        |ctx| {
            let model = populate(&ctx, 300, 3)?;
            let wide = GeometryCallback::predicate(|coords: &[f64]| -> RTreeResult<bool> {
                Ok(coords[1] - coords[0] >= 10.0)
            });
            let rows = ctx.tree().query(&[
                QueryConstraint::matching(wide),
                QueryConstraint::new(1, IndexOp::Le, 500.0),
            ])?;
            for row in &rows {
                assert!(row.coords[0] <= 500.0);
            }
            let leaf_hits: Vec<RowId> = model
                .iter()
                .filter(|(_, c)| c[1] - c[0] >= 10.0 && c[0] <= 500.0)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(sorted_ids(&rows), leaf_hits);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_nearest_neighbours_in_score_order() {
    run_test(
        create_test_context,
        |ctx| {
            let model = populate(&ctx, 500, 4)?;
            let (px, py) = (321.0, 654.0);
            let nearest = GeometryCallback::query(move |req: &QueryRequest<'_>| -> RTreeResult<QueryResponse> {
                Ok(QueryResponse {
                    within: Within::PartlyWithin,
                    score: distance_sq(req.coords, px, py),
                })
            });

            let tree = ctx.tree();
            let plan = tree.best_plan(&[IndexConstraint::new(1, IndexOp::Match)])?;
            let mut cursor = tree.open_cursor();
            cursor.filter_plan(&plan, &[FilterArg::from(nearest)])?;
            let mut found = Vec::new();
            while found.len() < 10 {
                match cursor.row()? {
                    Some(row) => found.push(row),
                    None => break,
                }
                cursor.next()?;
            }
            cursor.close()?;

            let got: Vec<f64> = found.iter().map(|r| distance_sq(&r.coords, px, py)).collect();
            assert!(got.windows(2).all(|w| w[0] <= w[1]), "{:?}", got);

            let mut all: Vec<f64> = model.values().map(|c| distance_sq(c, px, py)).collect();
            all.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(got, all[..10].to_vec());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_query_callback_sees_levels_and_rowids() {
    run_test(
        create_test_context,
        |ctx| {
            populate(&ctx, 200, 5)?;
            let depth = ctx.tree().depth()?;
            let seen_rows = Arc::new(AtomicUsize::new(0));
            let rows_counter = seen_rows.clone();
            let check = GeometryCallback::query(move |req: &QueryRequest<'_>| -> RTreeResult<QueryResponse> {
                if req.max_level != depth + 1 {
                    return Err(RTreeError::Callback(format!("max level {}", req.max_level)));
                }
                if (req.level == 0) != req.rowid.is_some() {
                    return Err(RTreeError::Callback(format!("level {}", req.level)));
                }
                if req.level == 0 {
                    rows_counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(QueryResponse::inherit(req))
            });

            let rows = ctx.tree().query(&[QueryConstraint::matching(check)])?;
            assert_eq!(rows.len(), 200);
            assert_eq!(seen_rows.load(Ordering::Relaxed), 200);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_callback_error_releases_tree() {
    run_test(
        create_test_context,
        |ctx| {
            populate(&ctx, 100, 6)?;
            let failing = GeometryCallback::predicate(|_: &[f64]| -> RTreeResult<bool> {
                Err(RTreeError::Callback("shape is broken".into()))
            });
            let tree = ctx.tree();
            let err = tree.query(&[QueryConstraint::matching(failing)]).unwrap_err();
            assert!(matches!(err, RTreeError::Callback(_)));

            tree.insert(None, &[1.0, 2.0, 1.0, 2.0], &[])?;
            assert_eq!(tree.query(&[])?.len(), 101);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_match_needs_callback() {
    run_test(
        create_test_context,
        |ctx| {
            populate(&ctx, 10, 7)?;
            let err = ctx
                .tree()
                .query(&[QueryConstraint::new(1, IndexOp::Match, 3i64)])
                .unwrap_err();
            assert!(matches!(err, RTreeError::Constraint(_)));
            Ok(())
        },
        cleanup,
    )
}
