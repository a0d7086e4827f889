//! Insertion, forced reinsertion and node splitting.

use super::codec::read_u16;
use super::geometry::{cell_area, cell_contains, cell_growth, cell_margin, cell_overlap, cell_union};
use super::node_cache::NodeRef;
use super::rtree_constants::{MAX_PARENT_HOPS, ROOT_NODE_ID};
use super::rtree_impl::TreeCore;
use super::rtree_types::{Cell, RTreeResult, RowId};

/// Merge sort of `idx` where the left element is taken only when
/// `before(left, right)` holds, so ties favour the right half.
fn merge_sort(idx: &mut [usize], spare: &mut Vec<usize>, before: &impl Fn(usize, usize) -> bool) {
    let n = idx.len();
    if n < 2 {
        return;
    }
    let n_left = n / 2;
    {
        let (left, right) = idx.split_at_mut(n_left);
        merge_sort(left, spare, before);
        merge_sort(right, spare, before);
    }
    spare.clear();
    spare.extend_from_slice(&idx[..n_left]);
    let n_right = n - n_left;
    let (mut i_left, mut i_right) = (0, 0);
    while i_left < n_left || i_right < n_right {
        let take_left = if i_left == n_left {
            false
        } else if i_right == n_right {
            true
        } else {
            before(spare[i_left], idx[n_left + i_right])
        };
        if take_left {
            idx[i_left + i_right] = spare[i_left];
            i_left += 1;
        } else {
            idx[i_left + i_right] = idx[n_left + i_right];
            i_right += 1;
        }
    }
}

impl TreeCore {
    /// Descends from the root to the node at `height` whose box grows least
    /// when covering `cell`, breaking ties by smaller area.
    pub(crate) fn choose_leaf(&mut self, cell: &Cell, height: i32) -> RTreeResult<NodeRef> {
        let dims = self.layout.dimensions;
        let mut node = self.acquire(ROOT_NODE_ID, None)?;

        for _ in 0..(self.depth - height) {
            let mut best: Option<(i64, f64, f64)> = None;
            for i in 0..self.cell_count(node) {
                let candidate = self.read_cell(node, i);
                let growth = cell_growth(dims, &candidate, cell);
                let area = cell_area(dims, &candidate);
                let better = match best {
                    None => true,
                    Some((_, g, a)) => growth < g || (growth == g && area < a),
                };
                if better {
                    best = Some((candidate.id, growth, area));
                }
            }
            let child = match best {
                Some((id, _, _)) => self.acquire(id, Some(node)),
                None => {
                    let id = self.node_id(node);
                    Err(self.corruption(format!("internal node {} has no cells", id)))
                }
            };
            let released = self.release(node);
            node = child?;
            if let Err(e) = released {
                self.release(node)?;
                return Err(e);
            }
        }
        Ok(node)
    }

    /// Widens ancestor boxes until every one covers `cell`.
    pub(crate) fn adjust_tree(&mut self, node: NodeRef, cell: &Cell) -> RTreeResult<()> {
        let dims = self.layout.dimensions;
        let mut p = node;
        let mut hops = 0;
        while let Some(parent) = self.node_parent(p) {
            hops += 1;
            if hops > MAX_PARENT_HOPS {
                return Err(self.corruption("parent chain is too long"));
            }
            let index = match self.parent_index(p)? {
                Some(index) => index,
                None => return Err(self.corruption("node lost its parent")),
            };
            let mut parent_cell = self.read_cell(parent, index);
            if !cell_contains(dims, &parent_cell, cell) {
                cell_union(dims, &mut parent_cell, cell);
                self.overwrite_cell(parent, index, &parent_cell);
            }
            p = parent;
        }
        Ok(())
    }

    pub(crate) fn write_row_mapping(&mut self, rowid: RowId, node: NodeRef) -> RTreeResult<()> {
        let id = self.node_id(node);
        self.store.write_rowid_node(Some(rowid), id)?;
        Ok(())
    }

    pub(crate) fn write_parent_mapping(&mut self, child: i64, node: NodeRef) -> RTreeResult<()> {
        let id = self.node_id(node);
        self.store.write_parent(child, id)
    }

    fn write_mapping(&mut self, id: i64, node: NodeRef, height: i32) -> RTreeResult<()> {
        if height == 0 {
            self.write_row_mapping(id, node)
        } else {
            self.write_parent_mapping(id, node)
        }
    }

    /// Points a cached child at `node` as its parent.
    fn reparent_cached(&mut self, child_id: i64, node: NodeRef) -> RTreeResult<()> {
        if let Some(child) = self.nodes.lookup(child_id) {
            if child == node {
                return Err(self.corruption(format!("node {} contains itself", child_id)));
            }
            let old = self.node_parent(child);
            self.add_ref(node);
            self.nodes[child].parent = Some(node);
            self.release_opt(old)?;
        }
        Ok(())
    }

    /// Moves the mapping of `id` to `node` after a split, reparenting a
    /// cached child node as well.
    fn update_mapping(&mut self, id: i64, node: NodeRef, height: i32) -> RTreeResult<()> {
        if height > 0 {
            if let Some(child) = self.nodes.lookup(id) {
                if self.nodes.in_parent_chain(child, node) {
                    return Err(self.corruption(format!(
                        "node {} would become its own ancestor",
                        id
                    )));
                }
            }
            self.reparent_cached(id, node)?;
        }
        self.write_mapping(id, node, height)
    }

    /// Inserts `cell` into `node`, which sits `height` levels above the
    /// leaves. Overflow is handled by forced reinsertion once per height
    /// and by splitting otherwise.
    pub(crate) fn insert_cell(&mut self, node: NodeRef, cell: &Cell, height: i32) -> RTreeResult<()> {
        if height > 0 {
            self.reparent_cached(cell.id, node)?;
        }
        if self.append_cell(node, cell) {
            if height <= self.reinsert_height || self.node_id(node) == ROOT_NODE_ID {
                self.split_node(node, cell, height)
            } else {
                self.reinsert_height = height;
                self.reinsert(node, cell, height)
            }
        } else {
            self.adjust_tree(node, cell)?;
            self.write_mapping(cell.id, node, height)
        }
    }

    /// Rewrites the box of `node` in its parent as the union of its cells,
    /// then repeats for each ancestor.
    pub(crate) fn fix_bounding_box(&mut self, node: NodeRef) -> RTreeResult<()> {
        let dims = self.layout.dimensions;
        let mut current = node;
        while let Some(parent) = self.node_parent(current) {
            let mut bbox = self.read_cell(current, 0);
            for i in 1..self.cell_count(current) {
                let c = self.read_cell(current, i);
                cell_union(dims, &mut bbox, &c);
            }
            bbox.id = self.node_id(current);
            let index = match self.parent_index(current)? {
                Some(index) => index,
                None => return Err(self.corruption("node lost its parent")),
            };
            self.overwrite_cell(parent, index, &bbox);
            current = parent;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Forced reinsertion
    // ------------------------------------------------------------------------

    /// Keeps the cells nearest the node's centre and reinserts the rest
    /// from the root.
    fn reinsert(&mut self, node: NodeRef, cell: &Cell, height: i32) -> RTreeResult<()> {
        self.stats.reinserts += 1;
        let dims = self.layout.dimensions;
        let mut cells: Vec<Cell> = (0..self.cell_count(node))
            .map(|i| self.read_cell(node, i))
            .collect();
        cells.push(*cell);
        let n_cell = cells.len();
        log::trace!(
            "Reinserting {} of {} cells of node {} at height {}",
            self.layout.min_cells() + 1,
            n_cell,
            self.node_id(node),
            height
        );

        let mut center = [0.0f64; 5];
        for c in &cells {
            for (d, sum) in center.iter_mut().enumerate().take(dims) {
                *sum += c.min(d) + c.max(d);
            }
        }
        for sum in center.iter_mut().take(dims) {
            *sum /= n_cell as f64 * 2.0;
        }

        // Distance of each cell's extent from the mean centre coordinate
        let distance: Vec<f64> = cells
            .iter()
            .map(|c| {
                (0..dims)
                    .map(|d| {
                        let span = c.max(d) - c.min(d);
                        (span - center[d]) * (span - center[d])
                    })
                    .sum()
            })
            .collect();

        let mut order: Vec<usize> = (0..n_cell).collect();
        let mut spare = Vec::with_capacity(n_cell);
        merge_sort(&mut order, &mut spare, &|l, r| distance[l] < distance[r]);

        self.zero_node(node);
        let keep = n_cell.saturating_sub(self.layout.min_cells() + 1);
        for &i in &order[..keep] {
            let c = cells[i];
            self.append_cell(node, &c);
            if c.id == cell.id {
                self.write_mapping(c.id, node, height)?;
            }
        }
        self.fix_bounding_box(node)?;

        for &i in &order[keep..] {
            let c = cells[i];
            let target = self.choose_leaf(&c, height)?;
            let rc = self.insert_cell(target, &c, height);
            let released = self.release(target);
            rc.and(released)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Splitting
    // ------------------------------------------------------------------------

    /// Distributes `cells` over `left` and `right` along the axis with the
    /// smallest summed margin, at the split point with least overlap.
    /// Returns the boxes of both halves.
    fn split_cells(&mut self, cells: &[Cell], left: NodeRef, right: NodeRef) -> (Cell, Cell) {
        let dims = self.layout.dimensions;
        let n_cell = cells.len();
        let min = self.layout.min_cells().max(1);
        let mut spare = Vec::with_capacity(n_cell);

        let sorted: Vec<Vec<usize>> = (0..dims)
            .map(|d| {
                let mut idx: Vec<usize> = (0..n_cell).collect();
                merge_sort(&mut idx, &mut spare, &|l, r| {
                    let (l1, l2) = (cells[l].min(d), cells[l].max(d));
                    let (r1, r2) = (cells[r].min(d), cells[r].max(d));
                    l1 < r1 || (l1 == r1 && l2 < r2)
                });
                idx
            })
            .collect();

        let mut best_dim = 0;
        let mut best_split = 0;
        let mut best_margin = 0.0;
        for (d, order) in sorted.iter().enumerate() {
            let mut margin = 0.0;
            let mut best_overlap = 0.0;
            let mut best_area = 0.0;
            let mut best_left = 0;

            for n_left in min..=(n_cell - min) {
                let mut l = cells[order[0]];
                let mut r = cells[order[n_cell - 1]];
                for (k, &i) in order.iter().enumerate().take(n_cell - 1).skip(1) {
                    if k < n_left {
                        cell_union(dims, &mut l, &cells[i]);
                    } else {
                        cell_union(dims, &mut r, &cells[i]);
                    }
                }
                margin += cell_margin(dims, &l) + cell_margin(dims, &r);
                let overlap = cell_overlap(dims, &l, std::slice::from_ref(&r));
                let area = cell_area(dims, &l) + cell_area(dims, &r);
                if n_left == min || overlap < best_overlap || (overlap == best_overlap && area < best_area) {
                    best_left = n_left;
                    best_overlap = overlap;
                    best_area = area;
                }
            }

            if d == 0 || margin < best_margin {
                best_dim = d;
                best_margin = margin;
                best_split = best_left;
            }
        }

        let order = &sorted[best_dim];
        let mut left_box = cells[order[0]];
        let mut right_box = cells[order[best_split]];
        for (k, &i) in order.iter().enumerate() {
            let c = &cells[i];
            if k < best_split {
                self.append_cell(left, c);
                cell_union(dims, &mut left_box, c);
            } else {
                self.append_cell(right, c);
                cell_union(dims, &mut right_box, c);
            }
        }
        (left_box, right_box)
    }

    /// Splits a full node holding `cell` as its overflow entry. Splitting the
    /// root moves its cells into two new children and deepens the tree.
    fn split_node(&mut self, node: NodeRef, cell: &Cell, height: i32) -> RTreeResult<()> {
        self.stats.splits += 1;
        let mut cells: Vec<Cell> = (0..self.cell_count(node))
            .map(|i| self.read_cell(node, i))
            .collect();
        self.zero_node(node);
        cells.push(*cell);

        let is_root = self.node_id(node) == ROOT_NODE_ID;
        let (left, right) = if is_root {
            let right = self.new_node(Some(node));
            let left = self.new_node(Some(node));
            self.depth += 1;
            let depth = self.depth;
            let layout = self.layout;
            let root = &mut self.nodes[node];
            layout.set_depth(&mut root.data, depth);
            root.dirty = true;
            log::debug!("Root split, tree depth is now {}", depth);
            (left, right)
        } else {
            let parent = self.node_parent(node);
            let right = self.new_node(parent);
            self.add_ref(node);
            (node, right)
        };
        log::trace!(
            "Splitting node {} ({} cells) at height {}",
            self.node_id(node),
            cells.len(),
            height
        );

        let rc = self.finish_split(&cells, cell, height, is_root, left, right);
        let released_right = self.release(right);
        let released_left = self.release(left);
        rc.and(released_right).and(released_left)
    }

    fn finish_split(
        &mut self,
        cells: &[Cell],
        cell: &Cell,
        height: i32,
        is_root: bool,
        left: NodeRef,
        right: NodeRef,
    ) -> RTreeResult<()> {
        self.zero_node(left);
        self.zero_node(right);
        let (mut left_box, mut right_box) = self.split_cells(cells, left, right);

        self.write_node(right)?;
        if self.node_id(left) == 0 {
            self.write_node(left)?;
        }
        right_box.id = self.node_id(right);
        left_box.id = self.node_id(left);

        let parent = match self.node_parent(left) {
            Some(parent) => parent,
            None => return Err(self.corruption("split node has no parent")),
        };
        if is_root {
            self.insert_cell(parent, &left_box, height + 1)?;
        } else {
            let index = match self.parent_index(left)? {
                Some(index) => index,
                None => return Err(self.corruption("split node has no parent")),
            };
            self.overwrite_cell(parent, index, &left_box);
            self.adjust_tree(parent, &left_box)?;
        }

        let right_parent = match self.node_parent(right) {
            Some(parent) => parent,
            None => return Err(self.corruption("split node has no parent")),
        };
        self.insert_cell(right_parent, &right_box, height + 1)?;

        let mut new_cell_is_right = false;
        for i in 0..self.cell_count(right) {
            let id = self.cell_id(right, i);
            self.update_mapping(id, right, height)?;
            if id == cell.id {
                new_cell_is_right = true;
            }
        }
        if is_root {
            for i in 0..self.cell_count(left) {
                let id = self.cell_id(left, i);
                self.update_mapping(id, left, height)?;
            }
        } else if !new_cell_is_right {
            self.update_mapping(cell.id, left, height)?;
        }
        Ok(())
    }

    /// Depth recorded in the root header.
    pub(crate) fn current_depth(&mut self) -> RTreeResult<i32> {
        let root = self.acquire(ROOT_NODE_ID, None)?;
        let depth = read_u16(&self.nodes[root].data) as i32;
        self.release(root)?;
        Ok(depth)
    }
}
