// Stract is an open source web search engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>

//! Property column partitions (C3): one instance per `(SubEdgePartition,
//! ColumnDescriptor)`, in four storage variants, dispatched through a tagged enum
//! rather than the source's `IEdgeColumnPartition` hierarchy (spec.md §9).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{Error, Result};

fn open_rw<P: AsRef<Path>>(path: P, create: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if create {
        opts.create(true);
    }
    opts.open(path.as_ref()).map_err(crate::error::io_error_to_status)
}

fn check_bounds(i: usize, value_size: usize, file_len: u64) -> Result<()> {
    let end = (i as u64) * (value_size as u64) + (value_size as u64);
    if end > file_len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("row {i} (value_size {value_size}) exceeds column file length {file_len}"),
        )));
    }
    Ok(())
}

/// A single file of `N * value_size` bytes; ordinal `i` maps to offset `i * value_size`.
pub struct FileMmapColumn {
    path: PathBuf,
    file: File,
    mmap: Option<memmap2::MmapMut>,
    value_size: usize,
    dirty: bool,
}

impl FileMmapColumn {
    pub fn open<P: AsRef<Path>>(path: P, value_size: usize, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_rw(&path, create)?;
        let len = file.metadata().map_err(crate::error::io_error_to_status)?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { memmap2::MmapMut::map_mut(&file).map_err(crate::error::io_error_to_status)? })
        };
        Ok(FileMmapColumn { path, file, mmap, value_size, dirty: false })
    }

    /// Pre-sizes the file to `num_rows * value_size` bytes, used by
    /// `create_edge_attr_col` when a column is added to a non-empty partition.
    pub fn create_sized<P: AsRef<Path>>(path: P, value_size: usize, num_rows: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(crate::error::io_error_to_status)?;
        file.set_len((num_rows * value_size) as u64).map_err(crate::error::io_error_to_status)?;
        Self::open(path, value_size, false)
    }

    pub fn get(&self, i: usize, out_buf: &mut [u8]) -> Result<()> {
        let mmap = self.mmap.as_ref().ok_or_else(|| {
            Error::corruption(format!("read of row {i} on empty column {}", self.path.display()))
        })?;
        check_bounds(i, self.value_size, mmap.len() as u64)?;
        let start = i * self.value_size;
        let n = out_buf.len().min(self.value_size);
        out_buf[..n].copy_from_slice(&mmap[start..start + n]);
        Ok(())
    }

    pub fn set(&mut self, i: usize, value_bytes: &[u8]) -> Result<()> {
        let mmap = self.mmap.as_mut().ok_or_else(|| {
            Error::corruption(format!("write of row {i} on empty column"))
        })?;
        check_bounds(i, self.value_size, mmap.len() as u64)?;
        let start = i * self.value_size;
        // a short write first zeroes the row slice, then overwrites the prefix
        mmap[start..start + self.value_size].fill(0);
        let n = value_bytes.len().min(self.value_size);
        mmap[start..start + n].copy_from_slice(&value_bytes[..n]);
        self.dirty = true;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(mmap) = &self.mmap {
                mmap.flush().map_err(crate::error::io_error_to_status)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    pub fn num_rows(&self) -> usize {
        self.file.metadata().map(|m| m.len() as usize / self.value_size.max(1)).unwrap_or(0)
    }
}

/// One shared mapped file backing a column group; sub-columns view a fixed byte
/// range of each row. The parent owns the mapped bytes (spec.md §9's cyclic/back
/// reference note); views hold only their own `(offset_within_row, value_size)` plus
/// a shared handle to the parent.
pub struct ColumnGroupParent {
    path: PathBuf,
    mmap: Mutex<Option<memmap2::MmapMut>>,
    row_size: usize,
    dirty: Mutex<bool>,
}

impl ColumnGroupParent {
    pub fn open<P: AsRef<Path>>(path: P, row_size: usize, create: bool) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_rw(&path, create)?;
        let len = file.metadata().map_err(crate::error::io_error_to_status)?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { memmap2::MmapMut::map_mut(&file).map_err(crate::error::io_error_to_status)? })
        };
        Ok(Arc::new(ColumnGroupParent { path, mmap: Mutex::new(mmap), row_size, dirty: Mutex::new(false) }))
    }

    pub fn flush(&self) -> Result<()> {
        let mut dirty = self.dirty.lock().unwrap();
        if *dirty {
            if let Some(mmap) = self.mmap.lock().unwrap().as_ref() {
                mmap.flush().map_err(crate::error::io_error_to_status)?;
            }
            *dirty = false;
        }
        Ok(())
    }
}

/// A view into a `ColumnGroupParent`'s row: reads/writes `value_size` bytes at
/// `offset_within_row` of each row.
pub struct GroupMmapColumn {
    parent: Arc<ColumnGroupParent>,
    offset_within_row: usize,
    value_size: usize,
}

impl GroupMmapColumn {
    pub fn new(parent: Arc<ColumnGroupParent>, offset_within_row: usize, value_size: usize) -> Self {
        GroupMmapColumn { parent, offset_within_row, value_size }
    }

    pub fn get(&self, i: usize, out_buf: &mut [u8]) -> Result<()> {
        let guard = self.parent.mmap.lock().unwrap();
        let mmap = guard.as_ref().ok_or_else(|| {
            Error::corruption(format!("read of row {i} on empty column group {}", self.parent.path.display()))
        })?;
        let row_start = i * self.parent.row_size;
        check_bounds(i, self.parent.row_size, mmap.len() as u64)?;
        let start = row_start + self.offset_within_row;
        let n = out_buf.len().min(self.value_size);
        out_buf[..n].copy_from_slice(&mmap[start..start + n]);
        Ok(())
    }

    pub fn set(&self, i: usize, value_bytes: &[u8]) -> Result<()> {
        let mut guard = self.parent.mmap.lock().unwrap();
        let mmap = guard.as_mut().ok_or_else(|| Error::corruption("write on empty column group"))?;
        let row_start = i * self.parent.row_size;
        check_bounds(i, self.parent.row_size, mmap.len() as u64)?;
        let start = row_start + self.offset_within_row;
        mmap[start..start + self.value_size].fill(0);
        let n = value_bytes.len().min(self.value_size);
        mmap[start..start + n].copy_from_slice(&value_bytes[..n]);
        *self.parent.dirty.lock().unwrap() = true;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.parent.flush()
    }
}

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    dirty: bool,
}

/// A process-injected (not global-singleton, per spec.md §9) LRU cache of fixed-size
/// blocks, shared by every `BlocksColumn` that opts into it. Keyed by `(path,
/// block_id)`; capacity in entries = `budget_mb * 1MB / block_size`.
pub struct BlockCache {
    inner: Mutex<LruCache<(PathBuf, u64), Block>>,
    block_size: usize,
}

impl BlockCache {
    pub fn new(budget_mb: usize, block_size: usize) -> Arc<Self> {
        let capacity = ((budget_mb.max(1) * 1024 * 1024) / block_size.max(1)).max(1);
        Arc::new(BlockCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            block_size,
        })
    }

    fn read_block_from_disk(file: &mut File, block_id: u64, block_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; block_size];
        file.seek(SeekFrom::Start(block_id * block_size as u64)).map_err(crate::error::io_error_to_status)?;
        let file_len = file.metadata().map_err(crate::error::io_error_to_status)?.len();
        let start = block_id * block_size as u64;
        let readable = file_len.saturating_sub(start).min(block_size as u64) as usize;
        if readable > 0 {
            file.read_exact(&mut buf[..readable]).map_err(crate::error::io_error_to_status)?;
        }
        Ok(buf)
    }

    fn write_block_to_disk(path: &Path, block_id: u64, block_size: usize, data: &[u8]) -> Result<()> {
        let mut file = open_rw(path, true)?;
        let needed = (block_id + 1) * block_size as u64;
        if file.metadata().map_err(crate::error::io_error_to_status)?.len() < needed {
            file.set_len(needed).map_err(crate::error::io_error_to_status)?;
        }
        file.seek(SeekFrom::Start(block_id * block_size as u64)).map_err(crate::error::io_error_to_status)?;
        file.write_all(data).map_err(crate::error::io_error_to_status)
    }

    fn fault_in(&self, path: &Path, block_id: u64) -> Result<()> {
        let key = (path.to_path_buf(), block_id);
        let mut cache = self.inner.lock().unwrap();
        if cache.contains(&key) {
            return Ok(());
        }
        let mut file = open_rw(path, true)?;
        let data = Self::read_block_from_disk(&mut file, block_id, self.block_size)?;
        if let Some((evicted_key, evicted)) = cache.push(key, Block { data, dirty: false }) {
            if evicted.dirty {
                Self::write_block_to_disk(&evicted_key.0, evicted_key.1, self.block_size, &evicted.data)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &Path, block_id: u64, offset: usize, out_buf: &mut [u8]) -> Result<()> {
        self.fault_in(path, block_id)?;
        let mut cache = self.inner.lock().unwrap();
        let block = cache.get(&(path.to_path_buf(), block_id)).expect("just faulted in");
        let n = out_buf.len().min(self.block_size - offset);
        out_buf[..n].copy_from_slice(&block.data[offset..offset + n]);
        Ok(())
    }

    pub fn write(&self, path: &Path, block_id: u64, offset: usize, bytes: &[u8]) -> Result<()> {
        self.fault_in(path, block_id)?;
        let mut cache = self.inner.lock().unwrap();
        let block = cache.get_mut(&(path.to_path_buf(), block_id)).expect("just faulted in");
        let n = bytes.len().min(self.block_size - offset);
        block.data[offset..offset + n].copy_from_slice(&bytes[..n]);
        block.dirty = true;
        Ok(())
    }

    /// Walks every block recorded under `dir` (a sub-partition's directory) and
    /// writes the dirty ones back; used by `SubEdgePartition::flush_cache` to make
    /// on-disk state consistent before a rewrite.
    pub fn flush_prefix(&self, dir: &Path) -> Result<()> {
        let mut cache = self.inner.lock().unwrap();
        let keys: Vec<(PathBuf, u64)> =
            cache.iter().filter(|(k, _)| k.0.starts_with(dir)).map(|(k, _)| k.clone()).collect();
        for key in keys {
            if let Some(block) = cache.get_mut(&key) {
                if block.dirty {
                    Self::write_block_to_disk(&key.0, key.1, self.block_size, &block.data)?;
                    block.dirty = false;
                }
            }
        }
        Ok(())
    }
}

/// The same logical layout as `FileMmapColumn`, chopped into fixed-size blocks held
/// in a shared `BlockCache`.
pub struct BlocksColumn {
    path: PathBuf,
    value_size: usize,
    cache: Arc<BlockCache>,
}

impl BlocksColumn {
    pub fn new(path: PathBuf, value_size: usize, cache: Arc<BlockCache>) -> Self {
        BlocksColumn { path, value_size, cache }
    }

    fn locate(&self, i: usize) -> (u64, usize) {
        let byte_offset = i * self.value_size;
        let block_id = (byte_offset / self.cache.block_size) as u64;
        let offset_in_block = byte_offset % self.cache.block_size;
        (block_id, offset_in_block)
    }

    pub fn get(&self, i: usize, out_buf: &mut [u8]) -> Result<()> {
        let (block_id, offset) = self.locate(i);
        self.cache.get(&self.path, block_id, offset, &mut out_buf[..self.value_size.min(out_buf.len())])
    }

    pub fn set(&self, i: usize, value_bytes: &[u8]) -> Result<()> {
        let (block_id, offset) = self.locate(i);
        let mut padded = vec![0u8; self.value_size];
        let n = value_bytes.len().min(self.value_size);
        padded[..n].copy_from_slice(&value_bytes[..n]);
        self.cache.write(&self.path, block_id, offset, &padded)
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush_prefix(self.path.parent().unwrap_or(&self.path))
    }
}

/// pread/pwrite per row, no mmap.
pub struct FileRawColumn {
    path: PathBuf,
    file: File,
    value_size: usize,
}

impl FileRawColumn {
    pub fn open<P: AsRef<Path>>(path: P, value_size: usize, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_rw(&path, create)?;
        Ok(FileRawColumn { path, file, value_size })
    }

    pub fn get(&mut self, i: usize, out_buf: &mut [u8]) -> Result<()> {
        let len = self.file.metadata().map_err(crate::error::io_error_to_status)?.len();
        check_bounds(i, self.value_size, len)?;
        self.file
            .seek(SeekFrom::Start((i * self.value_size) as u64))
            .map_err(crate::error::io_error_to_status)?;
        let n = out_buf.len().min(self.value_size);
        self.file.read_exact(&mut out_buf[..n]).map_err(crate::error::io_error_to_status)
    }

    pub fn set(&mut self, i: usize, value_bytes: &[u8]) -> Result<()> {
        let len = self.file.metadata().map_err(crate::error::io_error_to_status)?.len();
        check_bounds(i, self.value_size, len)?;
        let mut padded = vec![0u8; self.value_size];
        let n = value_bytes.len().min(self.value_size);
        padded[..n].copy_from_slice(&value_bytes[..n]);
        self.file
            .seek(SeekFrom::Start((i * self.value_size) as u64))
            .map_err(crate::error::io_error_to_status)?;
        self.file.write_all(&padded).map_err(crate::error::io_error_to_status)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data().map_err(crate::error::io_error_to_status)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub enum ColumnPartition {
    FileMmap(FileMmapColumn),
    GroupMmap(GroupMmapColumn),
    Blocks(BlocksColumn),
    FileRaw(FileRawColumn),
}

impl ColumnPartition {
    pub fn get(&mut self, i: usize, out_buf: &mut [u8]) -> Result<()> {
        match self {
            ColumnPartition::FileMmap(c) => c.get(i, out_buf),
            ColumnPartition::GroupMmap(c) => c.get(i, out_buf),
            ColumnPartition::Blocks(c) => c.get(i, out_buf),
            ColumnPartition::FileRaw(c) => c.get(i, out_buf),
        }
    }

    pub fn set(&mut self, i: usize, value_bytes: &[u8]) -> Result<()> {
        match self {
            ColumnPartition::FileMmap(c) => c.set(i, value_bytes),
            ColumnPartition::GroupMmap(c) => c.set(i, value_bytes),
            ColumnPartition::Blocks(c) => c.set(i, value_bytes),
            ColumnPartition::FileRaw(c) => c.set(i, value_bytes),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            ColumnPartition::FileMmap(c) => c.flush(),
            ColumnPartition::GroupMmap(c) => c.flush(),
            ColumnPartition::Blocks(c) => c.flush(),
            ColumnPartition::FileRaw(c) => c.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_store::TempDir;

    #[test]
    fn file_mmap_column_get_set_zeroes_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_ref().join("col");
        let mut col = FileMmapColumn::create_sized(&path, 8, 4).unwrap();

        col.set(0, b"hello!!!").unwrap();
        let mut out = [0u8; 8];
        col.get(0, &mut out).unwrap();
        assert_eq!(&out, b"hello!!!");

        // a short write zeroes the row first
        col.set(0, b"ab").unwrap();
        col.get(0, &mut out).unwrap();
        assert_eq!(&out[..2], b"ab");
        assert_eq!(&out[2..], &[0u8; 6]);
    }

    #[test]
    fn blocks_column_survives_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(1, 16);
        let path_a = dir.as_ref().join("col_a");
        let path_b = dir.as_ref().join("col_b");

        let col_a = BlocksColumn::new(path_a.clone(), 4, cache.clone());
        let col_b = BlocksColumn::new(path_b.clone(), 4, cache.clone());

        col_a.set(0, b"aaaa").unwrap();
        col_b.set(0, b"bbbb").unwrap();

        let mut out = [0u8; 4];
        col_a.get(0, &mut out).unwrap();
        assert_eq!(&out, b"aaaa");
        col_b.get(0, &mut out).unwrap();
        assert_eq!(&out, b"bbbb");
    }
}
