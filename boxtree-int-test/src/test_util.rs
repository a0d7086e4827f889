use boxtree::rtree::rtree_constants::ROOT_NODE_ID;
use boxtree::{
    Cell, IndexOp, MemoryStore, NodeLayout, QueryConstraint, RTree, RTreeConfig, RTreeResult,
    RowId, RowResult, StoreTables,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Runs a test between a setup and a teardown step. The teardown runs even
/// when the test fails.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> RTreeResult<()>,
    B: Fn() -> RTreeResult<TestContext>,
    A: Fn(TestContext) -> RTreeResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };
    let result = test(ctx.clone());
    let after_result = after(ctx);
    if let Err(e) = result {
        panic!("Test failed: {:?}", e);
    }
    if let Err(e) = after_result {
        panic!("After run failed: {:?}", e);
    }
}

/// A tree over a memory store, plus a handle on the store's tables.
#[derive(Clone)]
pub struct TestContext {
    tree: RTree,
    store: MemoryStore,
}

impl TestContext {
    pub fn new(tree: RTree, store: MemoryStore) -> Self {
        Self { tree, store }
    }

    pub fn tree(&self) -> RTree {
        self.tree.clone()
    }

    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }
}

/// Two dimensions, eight cells per node: small enough that a few hundred
/// rows build a tree several levels deep.
pub fn create_test_context() -> RTreeResult<TestContext> {
    create_context_with(RTreeConfig::new(2).with_node_capacity(8))
}

pub fn create_context_with(config: RTreeConfig) -> RTreeResult<TestContext> {
    let store = MemoryStore::new();
    let tree = RTree::create(config, store.clone())?;
    Ok(TestContext::new(tree, store))
}

/// Verifies the tree and closes it.
pub fn cleanup(ctx: TestContext) -> RTreeResult<()> {
    let report = ctx.tree.check_integrity()?;
    assert!(report.is_valid, "integrity errors: {:?}", report.errors);
    let problems = check_structure(&ctx.store.tables(), &ctx.tree.layout());
    assert!(problems.is_empty(), "structure errors: {:?}", problems);
    ctx.tree.close()
}

// ============================================================================
// Random data
// ============================================================================

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// A box with integer corners in `0..extent` and sides up to `max_side`.
pub fn random_box(rng: &mut StdRng, dimensions: usize, extent: i32, max_side: i32) -> Vec<f64> {
    let mut coords = Vec::with_capacity(dimensions * 2);
    for _ in 0..dimensions {
        let lo = rng.gen_range(0..extent);
        let side = rng.gen_range(0..=max_side);
        coords.push(lo as f64);
        coords.push((lo + side) as f64);
    }
    coords
}

/// True if the boxes share at least one point.
pub fn overlaps(a: &[f64], b: &[f64]) -> bool {
    a.chunks(2)
        .zip(b.chunks(2))
        .all(|(x, y)| x[0] <= y[1] && y[0] <= x[1])
}

/// Constraints selecting the rows that overlap `query`.
pub fn overlap_constraints(query: &[f64]) -> Vec<QueryConstraint> {
    let mut constraints = Vec::with_capacity(query.len());
    for d in 0..query.len() / 2 {
        constraints.push(QueryConstraint::new(2 * d + 2, IndexOp::Ge, query[2 * d]));
        constraints.push(QueryConstraint::new(2 * d + 1, IndexOp::Le, query[2 * d + 1]));
    }
    constraints
}

/// Row ids of `model` whose box overlaps `query`, in ascending order.
pub fn brute_force(model: &BTreeMap<RowId, Vec<f64>>, query: &[f64]) -> Vec<RowId> {
    model
        .iter()
        .filter(|(_, coords)| overlaps(coords, query))
        .map(|(id, _)| *id)
        .collect()
}

pub fn sorted_ids(rows: &[RowResult]) -> Vec<RowId> {
    let mut ids: Vec<RowId> = rows.iter().map(|r| r.rowid).collect();
    ids.sort_unstable();
    ids
}

// ============================================================================
// Structure walk
// ============================================================================

struct StructureWalk<'a> {
    tables: &'a StoreTables,
    layout: &'a NodeLayout,
    problems: Vec<String>,
    visited: usize,
    leaf_level: Option<i32>,
}

impl StructureWalk<'_> {
    fn walk(&mut self, id: i64, height: i32, level: i32, bound: Option<&Cell>) {
        let data = match self.tables.nodes.get(&id) {
            Some(data) => data,
            None => {
                self.problems.push(format!("node {} is missing", id));
                return;
            }
        };
        self.visited += 1;

        let count = self.layout.cell_count(data);
        if count > self.layout.capacity() {
            self.problems.push(format!("node {} overflows with {} cells", id, count));
            return;
        }
        if id != ROOT_NODE_ID && count < self.layout.min_cells() {
            self.problems.push(format!("node {} is underfull with {} cells", id, count));
        }

        for i in 0..count {
            let cell = self.layout.read_cell(data, i);
            if let Some(outer) = bound {
                for d in 0..self.layout.dimensions {
                    if cell.min(d) < outer.min(d) || cell.max(d) > outer.max(d) {
                        self.problems
                            .push(format!("cell {} of node {} escapes its parent", i, id));
                    }
                }
            }
            if height > 0 {
                if self.tables.parents.get(&cell.id) != Some(&id) {
                    self.problems
                        .push(format!("node {} does not map to parent {}", cell.id, id));
                }
                self.walk(cell.id, height - 1, level + 1, Some(&cell));
            } else if self.tables.rowids.get(&cell.id) != Some(&id) {
                self.problems
                    .push(format!("row {} does not map to leaf {}", cell.id, id));
            }
        }

        if height == 0 {
            match self.leaf_level {
                None => self.leaf_level = Some(level),
                Some(l) if l != level => self
                    .problems
                    .push(format!("leaf {} sits at level {}, expected {}", id, level, l)),
                Some(_) => {}
            }
        }
    }
}

/// Walks the stored tree and lists every node that breaks the fill,
/// containment, mapping or balance rules, plus unreachable nodes.
pub fn check_structure(tables: &StoreTables, layout: &NodeLayout) -> Vec<String> {
    let root = match tables.nodes.get(&ROOT_NODE_ID) {
        Some(root) => root,
        None => return vec!["root is missing".to_string()],
    };
    let depth = layout.depth(root);
    let mut walk = StructureWalk {
        tables,
        layout,
        problems: Vec::new(),
        visited: 0,
        leaf_level: None,
    };
    walk.walk(ROOT_NODE_ID, depth, 0, None);

    if walk.visited != tables.nodes.len() {
        walk.problems.push(format!(
            "{} nodes stored, {} reachable",
            tables.nodes.len(),
            walk.visited
        ));
    }
    walk.problems
}
