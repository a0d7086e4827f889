//! Tree configuration.

use serde::{Deserialize, Serialize};

use crate::rtree::codec::NodeLayout;
use crate::rtree::rtree_constants::{DEFAULT_PAGE_SIZE, MAX_AUX_COLUMNS, MIN_ROW_ESTIMATE};
use crate::rtree::rtree_types::{CoordType, RTreeError, RTreeResult};

/// Shape and tuning of one tree.
///
/// The node size is derived from `page_size` unless `node_size` is set
/// explicitly. Everything here except `row_estimate` is fixed for the
/// lifetime of the stored tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RTreeConfig {
    /// Number of dimensions, 1..=5
    pub dimensions: usize,
    pub coord_type: CoordType,
    /// Names of the non-indexed columns stored with every row
    pub aux_columns: Vec<String>,
    /// Host page size the node size is derived from
    pub page_size: usize,
    /// Explicit node size in bytes, overriding `page_size`
    pub node_size: Option<usize>,
    /// Row count the planner assumes instead of asking the store
    pub row_estimate: Option<i64>,
}

impl Default for RTreeConfig {
    fn default() -> Self {
        Self {
            dimensions: 2,
            coord_type: CoordType::Real32,
            aux_columns: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            node_size: None,
            row_estimate: None,
        }
    }
}

impl RTreeConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    pub fn with_coord_type(mut self, coord_type: CoordType) -> Self {
        self.coord_type = coord_type;
        self
    }

    pub fn with_aux_columns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.aux_columns = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_node_size(mut self, node_size: usize) -> Self {
        self.node_size = Some(node_size);
        self
    }

    /// Sizes nodes to hold exactly `cells` cells.
    pub fn with_node_capacity(self, cells: usize) -> Self {
        let size = 4 + cells * NodeLayout::cell_size(self.dimensions);
        self.with_node_size(size)
    }

    pub fn with_row_estimate(mut self, rows: i64) -> Self {
        self.row_estimate = Some(rows);
        self
    }

    /// Node size in bytes implied by this configuration.
    pub fn effective_node_size(&self) -> usize {
        self.node_size
            .unwrap_or_else(|| NodeLayout::node_size_for_page(self.page_size, self.dimensions))
    }

    /// Validates the configuration and returns the node layout it implies.
    pub fn layout(&self) -> RTreeResult<NodeLayout> {
        if self.aux_columns.len() > MAX_AUX_COLUMNS {
            return Err(RTreeError::Config(format!(
                "at most {} aux columns are supported, got {}",
                MAX_AUX_COLUMNS,
                self.aux_columns.len()
            )));
        }
        if let Some(rows) = self.row_estimate {
            if rows < 0 {
                return Err(RTreeError::Config(format!(
                    "row estimate must not be negative, got {}",
                    rows
                )));
            }
        }
        NodeLayout::new(self.dimensions, self.coord_type, self.effective_node_size())
    }

    pub fn validate(&self) -> RTreeResult<()> {
        self.layout().map(|_| ())
    }

    /// Row estimate clamped to the planner's floor.
    pub(crate) fn clamp_row_estimate(rows: i64) -> i64 {
        rows.max(MIN_ROW_ESTIMATE)
    }
}
