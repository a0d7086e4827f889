use boxtree::{RTree, RTreeConfig, RTreeError, RowId};
use boxtree_int_test::test_util::{
    cleanup, create_context_with, create_test_context, overlap_constraints, run_test, seeded_rng,
    sorted_ids,
};
use rand::seq::SliceRandom;

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_capacity_two_root_split() {
    run_test(
        || create_context_with(RTreeConfig::new(2).with_node_capacity(2)),
        |ctx| {
            let tree = ctx.tree();
            tree.insert(Some(1), &[0.0, 10.0, 0.0, 10.0], &[])?;
            tree.insert(Some(2), &[20.0, 30.0, 20.0, 30.0], &[])?;
            assert_eq!(tree.depth()?, 0);
            tree.insert(Some(3), &[5.0, 15.0, 5.0, 15.0], &[])?;

            assert_eq!(tree.depth()?, 1);
            assert_eq!(tree.stats()?.splits, 1);
            let rows = tree.query(&overlap_constraints(&[0.0, 12.0, 0.0, 12.0]))?;
            assert_eq!(sorted_ids(&rows), vec![1, 3]);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_delete_most_of_a_grid() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            let mut rng = seeded_rng(2);
            let mut cells: Vec<(i64, i64)> = (0..10).flat_map(|x| (0..10).map(move |y| (x, y))).collect();
            cells.shuffle(&mut rng);
            cells.truncate(50);

            let unit = |(x, y): (i64, i64)| {
                let (x, y) = (x as f64 * 2.0, y as f64 * 2.0);
                [x, x + 1.0, y, y + 1.0]
            };
            for (i, cell) in cells.iter().enumerate() {
                tree.insert(Some(i as RowId + 1), &unit(*cell), &[])?;
            }

            let mut order: Vec<RowId> = (1..=50).collect();
            order.shuffle(&mut rng);
            for rowid in &order[..40] {
                assert!(tree.delete(*rowid)?);
            }

            let mut survivors = order[40..].to_vec();
            survivors.sort_unstable();
            assert_eq!(sorted_ids(&tree.query(&[])?), survivors);
            for rowid in survivors {
                let row = tree.get(rowid)?.unwrap();
                assert_eq!(row.coords, unit(cells[rowid as usize - 1]).to_vec());
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_update_moves_box() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            for i in 0..30 {
                let x = i as f64 * 3.0;
                tree.insert(None, &[x, x + 1.0, 0.0, 1.0], &[])?;
            }
            let old = [200.0, 210.0, 200.0, 210.0];
            let new = [500.0, 510.0, 500.0, 510.0];
            let rowid = tree.insert(None, &old, &[])?;

            assert_eq!(tree.update(rowid, None, &new, &[])?, Some(rowid));
            assert!(tree.query(&overlap_constraints(&old))?.is_empty());
            assert_eq!(sorted_ids(&tree.query(&overlap_constraints(&new))?), vec![rowid]);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_one_reinsert_per_level() {
    run_test(
        || create_context_with(RTreeConfig::new(2).with_node_capacity(4)),
        |ctx| {
            let tree = ctx.tree();
            let mut before = tree.stats()?;
            for i in 0..400 {
                let x = ((i * 37) % 101) as f64;
                let y = ((i * 53) % 97) as f64;
                tree.insert(None, &[x, x + 2.0, y, y + 2.0], &[])?;

                let after = tree.stats()?;
                assert!(after.reinserts - before.reinserts <= after.depth as u64);
                before = after;
            }
            assert!(before.reinserts > 0);
            assert!(before.splits > 0);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_inverted_box_rejected() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0], &[])?;
            let before = ctx.store().tables();

            match tree.insert(Some(2), &[0.0, 1.0, 9.0, 3.0], &[]) {
                Err(RTreeError::InvalidBox { dimension, column }) => {
                    assert_eq!(dimension, 1);
                    assert_eq!(column, 3);
                }
                other => panic!("expected invalid box, got {:?}", other),
            }
            assert_eq!(ctx.store().tables(), before);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_point_boxes_and_negative_coordinates() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            for i in -20..20 {
                let v = i as f64;
                tree.insert(None, &[v, v, -v, -v], &[])?;
            }
            let rows = tree.query(&overlap_constraints(&[-5.0, 5.0, -5.0, 5.0]))?;
            assert_eq!(rows.len(), 11);
            assert!(rows.iter().all(|r| r.coords[0] == r.coords[1]));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_default_config_tree() {
    let tree = RTree::in_memory(RTreeConfig::default()).unwrap();
    assert_eq!(tree.layout().capacity(), 51);
    for i in 0..1000 {
        let x = (i % 40) as f64;
        let y = (i / 40) as f64;
        tree.insert(None, &[x, x + 0.5, y, y + 0.5], &[]).unwrap();
    }
    assert!(tree.depth().unwrap() >= 1);
    assert_eq!(tree.query(&[]).unwrap().len(), 1000);
    assert!(tree.check_integrity().unwrap().is_valid);
}

#[test]
fn test_auto_rowid_after_largest_rowid() {
    run_test(
        create_test_context,
        |ctx| {
            let tree = ctx.tree();
            tree.insert(Some(RowId::MAX), &[0.0, 1.0, 0.0, 1.0], &[])?;
            let first = tree.insert(None, &[2.0, 3.0, 2.0, 3.0], &[])?;
            let second = tree.insert(None, &[4.0, 5.0, 4.0, 5.0], &[])?;
            assert_eq!((first, second), (1, 2));

            assert_eq!(tree.get(RowId::MAX)?.unwrap().coords, vec![0.0, 1.0, 0.0, 1.0]);
            assert_eq!(sorted_ids(&tree.query(&[])?), vec![1, 2, RowId::MAX]);
            Ok(())
        },
        cleanup,
    )
}
