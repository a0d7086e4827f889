//! Binary node layout.
//!
//! Every node is a fixed-size blob:
//!
//! ```text
//! bytes 0..2   tree depth (root node only), big-endian
//! bytes 2..4   cell count, big-endian
//! bytes 4..    packed cells: 8-byte id + 2N 4-byte coordinates, big-endian
//! ```
//!
//! The encoding is independent of host byte order.

use super::rtree_constants::{
    CELL_ID_SIZE, COORD_SIZE, MAX_CELLS, MAX_DIMENSIONS, MAX_NODE_SIZE, NODE_HEADER_SIZE,
    PAGE_RESERVED,
};
use super::rtree_types::{Cell, Coord, CoordType, RTreeError, RTreeResult};

#[inline]
pub fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

#[inline]
pub fn write_u16(buf: &mut [u8], value: u16) {
    buf[..2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn read_i64(buf: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    i64::from_be_bytes(bytes)
}

#[inline]
pub fn write_i64(buf: &mut [u8], value: i64) {
    buf[..8].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn read_coord(buf: &[u8], coord_type: CoordType) -> Coord {
    let bits = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Coord::from_bits(bits, coord_type)
}

#[inline]
pub fn write_coord(buf: &mut [u8], coord: Coord) {
    buf[..4].copy_from_slice(&coord.to_bits().to_be_bytes());
}

/// Geometry of the node blobs of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub dimensions: usize,
    pub coord_type: CoordType,
    pub node_size: usize,
    pub bytes_per_cell: usize,
}

impl NodeLayout {
    pub fn new(dimensions: usize, coord_type: CoordType, node_size: usize) -> RTreeResult<Self> {
        if dimensions == 0 || dimensions > MAX_DIMENSIONS {
            return Err(RTreeError::Config(format!(
                "dimensions must be between 1 and {}, got {}",
                MAX_DIMENSIONS, dimensions
            )));
        }
        if node_size < NODE_HEADER_SIZE || node_size > MAX_NODE_SIZE {
            return Err(RTreeError::Config(format!(
                "node size {} is outside 4..={} bytes",
                node_size, MAX_NODE_SIZE
            )));
        }
        let layout = Self {
            dimensions,
            coord_type,
            node_size,
            bytes_per_cell: Self::cell_size(dimensions),
        };
        if layout.capacity() < 2 {
            return Err(RTreeError::Config(format!(
                "node size {} holds fewer than two cells of {} bytes",
                node_size, layout.bytes_per_cell
            )));
        }
        Ok(layout)
    }

    /// Bytes per cell for the given dimensionality.
    pub fn cell_size(dimensions: usize) -> usize {
        CELL_ID_SIZE + dimensions * 2 * COORD_SIZE
    }

    /// Node size derived from a host page size: the page minus the host's
    /// reserved bytes, capped so that no node holds more than [`MAX_CELLS`].
    pub fn node_size_for_page(page_size: usize, dimensions: usize) -> usize {
        let cap = NODE_HEADER_SIZE + Self::cell_size(dimensions) * MAX_CELLS;
        page_size.saturating_sub(PAGE_RESERVED).min(cap)
    }

    /// Number of coordinates per cell.
    #[inline]
    pub fn n_coord(&self) -> usize {
        self.dimensions * 2
    }

    /// Maximum number of cells a node holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.node_size - NODE_HEADER_SIZE) / self.bytes_per_cell
    }

    /// Minimum fill of a non-root node (m = M/3).
    #[inline]
    pub fn min_cells(&self) -> usize {
        self.capacity() / 3
    }

    #[inline]
    fn cell_offset(&self, index: usize) -> usize {
        NODE_HEADER_SIZE + index * self.bytes_per_cell
    }

    /// A zeroed node blob.
    pub fn empty_node(&self) -> Vec<u8> {
        vec![0u8; self.node_size]
    }

    /// Checks a blob read from the store before it is trusted.
    pub fn validate(&self, data: &[u8]) -> RTreeResult<()> {
        if data.len() != self.node_size {
            return Err(RTreeError::corrupt(format!(
                "node blob is {} bytes, expected {}",
                data.len(),
                self.node_size
            )));
        }
        let count = self.cell_count(data);
        if count > self.capacity() {
            return Err(RTreeError::corrupt(format!(
                "node claims {} cells but holds at most {}",
                count,
                self.capacity()
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn depth(&self, data: &[u8]) -> i32 {
        read_u16(data) as i32
    }

    #[inline]
    pub fn set_depth(&self, data: &mut [u8], depth: i32) {
        write_u16(data, depth as u16);
    }

    #[inline]
    pub fn cell_count(&self, data: &[u8]) -> usize {
        read_u16(&data[2..]) as usize
    }

    #[inline]
    pub fn set_cell_count(&self, data: &mut [u8], count: usize) {
        write_u16(&mut data[2..], count as u16);
    }

    /// Id stored in cell `index`.
    #[inline]
    pub fn cell_id(&self, data: &[u8], index: usize) -> i64 {
        read_i64(&data[self.cell_offset(index)..])
    }

    /// Coordinate `coord` of cell `index`.
    #[inline]
    pub fn coord(&self, data: &[u8], index: usize, coord: usize) -> Coord {
        let offset = self.cell_offset(index) + CELL_ID_SIZE + coord * COORD_SIZE;
        read_coord(&data[offset..], self.coord_type)
    }

    pub fn read_cell(&self, data: &[u8], index: usize) -> Cell {
        let mut cell = Cell::new(self.cell_id(data, index), self.coord_type);
        for i in 0..self.n_coord() {
            cell.coords[i] = self.coord(data, index, i);
        }
        cell
    }

    /// Overwrites the cell at `index` without touching the cell count.
    pub fn write_cell(&self, data: &mut [u8], index: usize, cell: &Cell) {
        let offset = self.cell_offset(index);
        write_i64(&mut data[offset..], cell.id);
        let mut p = offset + CELL_ID_SIZE;
        for coord in &cell.coords[..self.n_coord()] {
            write_coord(&mut data[p..], *coord);
            p += COORD_SIZE;
        }
    }

    /// Appends a cell. Returns `true` without modifying the blob when the
    /// node is already full.
    pub fn insert_cell(&self, data: &mut [u8], cell: &Cell) -> bool {
        let count = self.cell_count(data);
        if count >= self.capacity() {
            return true;
        }
        self.write_cell(data, count, cell);
        self.set_cell_count(data, count + 1);
        false
    }

    /// Removes the cell at `index`, shifting the trailing cells down.
    pub fn delete_cell(&self, data: &mut [u8], index: usize) {
        let count = self.cell_count(data);
        let start = self.cell_offset(index);
        let end = self.cell_offset(count);
        data.copy_within(start + self.bytes_per_cell..end, start);
        self.set_cell_count(data, count - 1);
    }

    /// Clears every byte after the depth field.
    pub fn zero(&self, data: &mut [u8]) {
        data[2..].fill(0);
    }
}
