use boxtree::{
    CoordType, FilterArg, IndexConstraint, IndexOp, QueryConstraint, RTree, RTreeConfig,
    RTreeError, Value, PLAN_ROWID, PLAN_SCAN,
};
use boxtree_int_test::test_util::{cleanup, create_context_with, create_test_context, run_test, sorted_ids};

#[ctor::ctor]
fn init() {
    colog::init();
}

fn fill(tree: &RTree, rows: i64) {
    for i in 1..=rows {
        let x = i as f64 * 10.0;
        tree.insert(Some(i), &[x, x + 5.0, -x, -x + 5.0], &[]).unwrap();
    }
}

#[test]
fn test_rowid_plan_lookup() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            fill(&tree, 60);
            let plan = tree.best_plan(&[
                IndexConstraint::new(1, IndexOp::Le),
                IndexConstraint::new(0, IndexOp::Eq),
            ])?;
            assert_eq!(plan.strategy, PLAN_ROWID);

            let args = plan.arrange_args(&[FilterArg::from(1.0), FilterArg::from(42i64)]);
            let mut cursor = tree.open_cursor();
            cursor.filter_plan(&plan, &args)?;
            assert_eq!(cursor.strategy(), PLAN_ROWID);
            assert!(!cursor.eof());
            assert_eq!(cursor.rowid()?, 42);
            assert_eq!(cursor.column(1)?, Value::Real(420.0));
            assert_eq!(cursor.column(4)?, Value::Real(-415.0));
            cursor.next()?;
            assert!(cursor.eof());
            assert_eq!(cursor.column(1)?, Value::Null);
            cursor.close()?;

            let mut cursor = tree.open_cursor();
            cursor.filter(PLAN_ROWID, "", &[FilterArg::from(999i64)])?;
            assert!(cursor.eof());
            assert!(cursor.row()?.is_none());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_scan_plan_encoding() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            fill(&tree, 60);
            let plan = tree.best_plan(&[
                IndexConstraint::new(2, IndexOp::Ge),
                IndexConstraint::new(1, IndexOp::Lt),
            ])?;
            assert_eq!(plan.strategy, PLAN_SCAN);
            assert_eq!(plan.encoded, "D1C0");

            let mut cursor = tree.open_cursor();
            cursor.filter(PLAN_SCAN, "D1C0", &[FilterArg::from(100.0), FilterArg::from(200.0)])?;
            let rows = cursor.collect_rows()?;
            cursor.close()?;
            assert_eq!(sorted_ids(&rows), (10..20).collect::<Vec<_>>());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_filter_argument_coercion() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            fill(&tree, 20);
            let count = |encoded: &str, arg: Value| -> usize {
                let mut cursor = tree.open_cursor();
                cursor.filter(PLAN_SCAN, encoded, &[FilterArg::Value(arg)]).unwrap();
                let n = cursor.collect_rows().unwrap().len();
                cursor.close().unwrap();
                n
            };

            assert_eq!(count("B0", Value::Null), 0);
            assert_eq!(count("D0", Value::Null), 0);
            assert_eq!(count("B0", Value::Text("zzz".into())), 20);
            assert_eq!(count("C1", Value::Blob(vec![1, 2])), 20);
            assert_eq!(count("D0", Value::Text("zzz".into())), 0);
            assert_eq!(count("A0", Value::Integer(50)), 1);
            assert_eq!(count("E0", Value::Real(185.0)), 2);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_bad_encoding_rejected() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            fill(&tree, 5);
            let mut cursor = tree.open_cursor();
            let err = cursor.filter(PLAN_SCAN, "D9", &[FilterArg::from(1.0)]).unwrap_err();
            assert!(matches!(err, RTreeError::Constraint(_)));
            let err = cursor.filter(PLAN_SCAN, "D0", &[]).unwrap_err();
            assert!(matches!(err, RTreeError::Constraint(_)));
            let err = cursor.filter(PLAN_SCAN, "Z0", &[FilterArg::from(1.0)]).unwrap_err();
            assert!(matches!(err, RTreeError::Constraint(_)));
            cursor.close()?;

            tree.insert(None, &[0.0, 1.0, 0.0, 1.0], &[])?;
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_open_cursor_blocks_writers_until_dropped() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            fill(&tree, 30);
            {
                let mut cursor = tree.open_cursor();
                cursor.filter(PLAN_SCAN, "", &[])?;
                assert!(!cursor.eof());
                assert!(matches!(
                    tree.update(1, None, &[0.0, 1.0, 0.0, 1.0], &[]),
                    Err(RTreeError::Locked)
                ));
                assert!(matches!(
                    tree.insert_or_replace(Some(2), &[0.0, 1.0, 0.0, 1.0], &[]),
                    Err(RTreeError::Locked)
                ));
                assert_eq!(tree.query(&[])?.len(), 30);
            }
            assert!(tree.delete(1)?);

            let mut cursor = tree.open_cursor();
            cursor.filter(PLAN_SCAN, "", &[])?;
            let rows = cursor.collect_rows()?;
            assert_eq!(rows.len(), 29);
            assert!(cursor.eof());
            tree.insert(None, &[0.0, 1.0, 0.0, 1.0], &[])?;
            cursor.close()?;
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_aux_columns_through_cursor() {
    run_test(
        || create_context_with(RTreeConfig::new(1).with_aux_columns(["name", "size"])),
        |ctx| {
            let tree = ctx.tree();
            tree.insert(Some(1), &[0.0, 10.0], &[Value::from("first"), Value::from(3i64)])?;
            tree.insert(Some(2), &[20.0, 30.0], &[])?;

            let mut cursor = tree.open_cursor();
            cursor.filter(PLAN_ROWID, "", &[FilterArg::from(1i64)])?;
            assert_eq!(cursor.column(3)?, Value::Text("first".into()));
            assert_eq!(cursor.column(4)?, Value::Integer(3));
            assert!(matches!(cursor.column(5), Err(RTreeError::Constraint(_))));
            cursor.close()?;

            let row = tree.get(2)?.unwrap();
            assert_eq!(row.aux, vec![Value::Null, Value::Null]);

            let err = tree
                .query(&[QueryConstraint::new(3, IndexOp::Eq, Value::from("first"))])
                .unwrap_err();
            assert!(matches!(err, RTreeError::Constraint(_)));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_integer_columns() {
    run_test(
        || create_context_with(RTreeConfig::new(2).with_coord_type(CoordType::Int32)),
        |ctx| {
            let tree = ctx.tree();
            tree.insert(Some(1), &[-3.7, 4.2, 10.0, 12.9], &[])?;
            let mut cursor = tree.open_cursor();
            cursor.filter(PLAN_ROWID, "", &[FilterArg::from(1i64)])?;
            assert_eq!(cursor.column(1)?, Value::Integer(-3));
            assert_eq!(cursor.column(2)?, Value::Integer(4));
            assert_eq!(cursor.column(4)?, Value::Integer(12));
            cursor.close()?;

            let rows = tree.query(&[QueryConstraint::new(1, IndexOp::Eq, -3i64)])?;
            assert_eq!(rows.len(), 1);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_row_estimate_drives_plan_cost() {
    run_test(
        || create_context_with(RTreeConfig::new(2).with_row_estimate(4096)),
        |ctx| {
            let tree = ctx.tree();
            let plan = tree.best_plan(&[
                IndexConstraint::new(1, IndexOp::Le),
                IndexConstraint::new(2, IndexOp::Ge),
            ])?;
            assert_eq!(plan.estimated_rows, 1024);
            assert_eq!(plan.estimated_cost, 6.0 * 1024.0);

            let lookup = tree.best_plan(&[IndexConstraint::new(0, IndexOp::Eq)])?;
            assert!(lookup.unique);
            assert_eq!(lookup.estimated_rows, 1);
            Ok(())
        },
        cleanup,
    )
}
