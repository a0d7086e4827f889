//! File-backed store.
//!
//! The tables live in memory and are written to a single file as one
//! checksummed image whenever the store is flushed or a transaction
//! commits. A new image is written to a sibling file and renamed over the
//! old one, so the previous image stays intact until the new one is
//! complete. Opening a file loads and verifies the image.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::rtree_constants::{FILE_MAGIC, FILE_VERSION};
use super::rtree_types::{NodeId, RTreeError, RTreeResult, RowId, Value};
use super::store::{MemoryStore, NodeStore, StoreTables};

/// On-disk image of the store.
#[derive(Debug, Serialize, Deserialize)]
struct FileImage {
    magic: u32,
    version: u32,
    checksum: u32,
    tables: Vec<u8>,
}

/// CRC32-MPEG2 of `data`.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}

/// Store that persists its tables to a file.
pub struct FileStore {
    path: PathBuf,
    tables: MemoryStore,
    dirty: bool,
}

impl FileStore {
    /// Creates (or replaces) the file at `path` with empty tables.
    pub fn create(path: &Path) -> RTreeResult<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            tables: MemoryStore::new(),
            dirty: true,
        };
        store.flush()?;
        Ok(store)
    }

    /// Opens an existing file and loads its tables.
    pub fn open(path: &Path) -> RTreeResult<Self> {
        let buffer = fs::read(path)?;
        let tables = Self::decode(&buffer)?;
        log::debug!(
            "Loaded {} nodes and {} rows from {}",
            tables.nodes.len(),
            tables.rowids.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            tables: MemoryStore::from_tables(tables),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file the next image is written to before it replaces `path`.
    pub fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Handle sharing the in-memory tables.
    pub fn tables(&self) -> MemoryStore {
        self.tables.clone()
    }

    fn encode(tables: &StoreTables) -> RTreeResult<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(tables, bincode::config::legacy())
            .map_err(|e| RTreeError::Serialization(e.to_string()))?;
        let image = FileImage {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            checksum: crc32(&payload),
            tables: payload,
        };
        bincode::serde::encode_to_vec(&image, bincode::config::legacy())
            .map_err(|e| RTreeError::Serialization(e.to_string()))
    }

    fn decode(buffer: &[u8]) -> RTreeResult<StoreTables> {
        let image: FileImage = bincode::serde::decode_from_slice(buffer, bincode::config::legacy())
            .map(|(image, _)| image)
            .map_err(|e| RTreeError::Serialization(e.to_string()))?;
        if image.magic != FILE_MAGIC {
            return Err(RTreeError::corrupt(format!(
                "bad file magic {:#x}",
                image.magic
            )));
        }
        if image.version != FILE_VERSION {
            return Err(RTreeError::Store(format!(
                "unsupported file version {}",
                image.version
            )));
        }
        let expected = crc32(&image.tables);
        if image.checksum != expected {
            return Err(RTreeError::corrupt(format!(
                "file checksum mismatch (expected: {:x}, got: {:x})",
                expected, image.checksum
            )));
        }
        bincode::serde::decode_from_slice(&image.tables, bincode::config::legacy())
            .map(|(tables, _)| tables)
            .map_err(|e| RTreeError::Serialization(e.to_string()))
    }

    /// Writes the tables to disk if they changed since the last write.
    /// Does nothing while a transaction is open.
    pub fn flush(&mut self) -> RTreeResult<()> {
        if !self.dirty || self.tables.in_transaction() {
            return Ok(());
        }
        let bytes = Self::encode(&self.tables.tables())?;
        let staging = self.staging_path();
        let written = File::create(&staging).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }
        fs::rename(&staging, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    fn touched<T>(&mut self, result: RTreeResult<T>) -> RTreeResult<T> {
        if result.is_ok() {
            self.dirty = true;
        }
        result
    }
}

impl NodeStore for FileStore {
    fn read_node(&mut self, id: NodeId) -> RTreeResult<Option<Vec<u8>>> {
        self.tables.read_node(id)
    }

    fn write_node(&mut self, id: Option<NodeId>, data: &[u8]) -> RTreeResult<NodeId> {
        let result = self.tables.write_node(id, data);
        self.touched(result)
    }

    fn delete_node(&mut self, id: NodeId) -> RTreeResult<()> {
        let result = self.tables.delete_node(id);
        self.touched(result)
    }

    fn read_parent(&mut self, child: NodeId) -> RTreeResult<Option<NodeId>> {
        self.tables.read_parent(child)
    }

    fn write_parent(&mut self, child: NodeId, parent: NodeId) -> RTreeResult<()> {
        let result = self.tables.write_parent(child, parent);
        self.touched(result)
    }

    fn delete_parent(&mut self, child: NodeId) -> RTreeResult<()> {
        let result = self.tables.delete_parent(child);
        self.touched(result)
    }

    fn read_rowid_node(&mut self, rowid: RowId) -> RTreeResult<Option<NodeId>> {
        self.tables.read_rowid_node(rowid)
    }

    fn write_rowid_node(&mut self, rowid: Option<RowId>, node: NodeId) -> RTreeResult<RowId> {
        let result = self.tables.write_rowid_node(rowid, node);
        self.touched(result)
    }

    fn delete_rowid_node(&mut self, rowid: RowId) -> RTreeResult<()> {
        let result = self.tables.delete_rowid_node(rowid);
        self.touched(result)
    }

    fn read_aux(&mut self, rowid: RowId) -> RTreeResult<Option<Vec<Value>>> {
        self.tables.read_aux(rowid)
    }

    fn write_aux(&mut self, rowid: RowId, values: &[Value]) -> RTreeResult<()> {
        let result = self.tables.write_aux(rowid, values);
        self.touched(result)
    }

    fn row_count(&mut self) -> RTreeResult<Option<i64>> {
        self.tables.row_count()
    }

    fn parent_count(&mut self) -> RTreeResult<Option<i64>> {
        self.tables.parent_count()
    }

    fn begin(&mut self) -> RTreeResult<()> {
        self.tables.begin()
    }

    fn commit(&mut self) -> RTreeResult<()> {
        self.tables.commit()?;
        self.flush()
    }

    fn rollback(&mut self) -> RTreeResult<()> {
        self.tables.rollback()
    }

    fn flush(&mut self) -> RTreeResult<()> {
        FileStore::flush(self)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to flush {} on drop: {}", self.path.display(), e);
        }
    }
}
