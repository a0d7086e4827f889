//! Constants for the R*-tree engine.

/// Maximum number of dimensions a tree may index
pub const MAX_DIMENSIONS: usize = 5;

/// Maximum number of coordinates in a cell (a min/max pair per dimension)
pub const MAX_COORDS: usize = MAX_DIMENSIONS * 2;

/// Maximum number of auxiliary (non-indexed) columns
pub const MAX_AUX_COLUMNS: usize = 100;

/// Maximum tree depth. 3^40 is greater than 2^64, so no valid tree is deeper.
pub const MAX_DEPTH: i32 = 40;

/// Upper bound on the number of cells stored in a single node
pub const MAX_CELLS: usize = 51;

/// Bytes of node header preceding the packed cell array
pub const NODE_HEADER_SIZE: usize = 4;

/// Bytes used by the id of every cell
pub const CELL_ID_SIZE: usize = 8;

/// Bytes used by every stored coordinate
pub const COORD_SIZE: usize = 4;

/// Largest node blob accepted (cell counts are 16-bit)
pub const MAX_NODE_SIZE: usize = 65536;

/// Default host page size used to derive the node size
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Page bytes reserved for the host store's own bookkeeping
pub const PAGE_RESERVED: usize = 64;

/// Node id of the root. The root never moves.
pub const ROOT_NODE_ID: i64 = 1;

/// Number of search-point slots whose nodes a cursor keeps loaded
pub const CURSOR_CACHE_SIZE: usize = 5;

/// Longest parent chain walked before assuming a cycle
pub const MAX_PARENT_HOPS: usize = 1000;

/// Row estimate used by the planner when the store has no statistics
pub const DEFAULT_ROW_ESTIMATE: i64 = 1_048_576;

/// Lower bound on the planner's row estimate
pub const MIN_ROW_ESTIMATE: i64 = 100;

/// Maximum number of constraints encoded in a scan plan
pub const MAX_PLAN_CONSTRAINTS: usize = 20;

/// Magic number for file store identification ("BXTR")
pub const FILE_MAGIC: u32 = 0x4258_5452;

/// File store format version
pub const FILE_VERSION: u32 = 1;
