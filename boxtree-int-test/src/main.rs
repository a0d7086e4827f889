use boxtree::{RTree, RTreeConfig, RTreeResult};
use boxtree_int_test::test_util::{overlap_constraints, random_box, seeded_rng};

fn main() -> RTreeResult<()> {
    println!("Starting stress test...");
    let tree = RTree::in_memory(RTreeConfig::new(2))?;
    let mut rng = seeded_rng(7);

    let count = 200_000;
    let start = std::time::Instant::now();
    for _ in 0..count {
        tree.insert(None, &random_box(&mut rng, 2, 100_000, 50), &[])?;
    }
    println!(
        "Inserted {} boxes in {:?}, depth {}",
        count,
        start.elapsed(),
        tree.depth()?
    );

    let start = std::time::Instant::now();
    let mut found = 0;
    for _ in 0..1000 {
        let query = random_box(&mut rng, 2, 100_000, 2000);
        found += tree.query(&overlap_constraints(&query))?.len();
    }
    println!("Ran 1000 window queries ({} hits) in {:?}", found, start.elapsed());

    let start = std::time::Instant::now();
    for rowid in (1..=count as i64).step_by(2) {
        tree.delete(rowid)?;
    }
    println!("Deleted {} boxes in {:?}", count / 2, start.elapsed());

    let start = std::time::Instant::now();
    let report = tree.check_integrity()?;
    println!(
        "Checked {} nodes in {:?}: {}",
        report.nodes_checked,
        start.elapsed(),
        if report.is_valid { "ok" } else { "CORRUPT" }
    );

    let stats = tree.stats()?;
    println!(
        "Splits: {}, reinserts: {}, node reads: {}, node writes: {}",
        stats.splits, stats.reinserts, stats.node_reads, stats.node_writes
    );
    tree.close()
}
