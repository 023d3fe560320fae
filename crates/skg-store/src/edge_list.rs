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

//! `elist` (the dense adjacency array) and its two sparse indexes. Two interchangeable
//! backends, mmap and raw-pread/pwrite, dispatched through a tagged enum rather than a
//! trait-object hierarchy (spec.md §9's redesign note).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use file_store::{ConstSerializable, OwnedBytes};

use crate::error::{Error, Result};
use crate::types::{IndexEntry, PersistentEdge, ABSENT_ORDINAL};

fn open_rw<P: AsRef<Path>>(path: P, create: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if create {
        opts.create(true);
    }
    opts.open(path.as_ref()).map_err(crate::error::io_error_to_status)
}

/// mmap-backed read-write access to `elist`.
pub struct MmapEdgeList {
    path: PathBuf,
    file: File,
    mmap: Option<memmap2::MmapMut>,
    num_edges: usize,
    dirty: bool,
}

impl MmapEdgeList {
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_rw(&path, create)?;
        let len = file.metadata().map_err(crate::error::io_error_to_status)?.len() as usize;
        if len % PersistentEdge::BYTES != 0 {
            return Err(Error::corruption(format!(
                "elist file {} has size {len} which is not a multiple of the row size {}",
                path.display(),
                PersistentEdge::BYTES
            )));
        }
        let num_edges = len / PersistentEdge::BYTES;
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { memmap2::MmapMut::map_mut(&file).map_err(crate::error::io_error_to_status)? })
        };
        Ok(MmapEdgeList { path, file, mmap, num_edges, dirty: false })
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn get(&self, i: usize) -> Result<PersistentEdge> {
        let mmap = self.mmap.as_ref().ok_or_else(|| {
            Error::corruption(format!("read of ordinal {i} on an empty elist {}", self.path.display()))
        })?;
        let start = i * PersistentEdge::BYTES;
        if start + PersistentEdge::BYTES > mmap.len() {
            return Err(Error::corruption(format!(
                "ordinal {i} out of range for elist {} ({} rows)",
                self.path.display(),
                self.num_edges
            )));
        }
        Ok(PersistentEdge::deserialize(&mmap[start..start + PersistentEdge::BYTES]))
    }

    pub fn set(&mut self, i: usize, edge: &PersistentEdge) -> Result<()> {
        let mmap = self.mmap.as_mut().ok_or_else(|| {
            Error::corruption(format!("write of ordinal {i} on an empty elist"))
        })?;
        let start = i * PersistentEdge::BYTES;
        if start + PersistentEdge::BYTES > mmap.len() {
            return Err(Error::corruption(format!("ordinal {i} out of range on write")));
        }
        let mut buf = Vec::with_capacity(PersistentEdge::BYTES);
        edge.serialize(&mut buf);
        mmap[start..start + PersistentEdge::BYTES].copy_from_slice(&buf);
        self.dirty = true;
        Ok(())
    }

    pub fn update<F: FnOnce(&mut PersistentEdge)>(&mut self, i: usize, f: F) -> Result<()> {
        let mut edge = self.get(i)?;
        f(&mut edge);
        self.set(i, &edge)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(mmap) = self.mmap.as_ref() {
                mmap.flush().map_err(crate::error::io_error_to_status)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// pread/pwrite-backed access to `elist`, no mmap.
pub struct RawEdgeList {
    path: PathBuf,
    file: File,
    num_edges: usize,
}

impl RawEdgeList {
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_rw(&path, create)?;
        let len = file.metadata().map_err(crate::error::io_error_to_status)?.len() as usize;
        if len % PersistentEdge::BYTES != 0 {
            return Err(Error::corruption(format!(
                "elist file {} has size {len} which is not a multiple of the row size {}",
                path.display(),
                PersistentEdge::BYTES
            )));
        }
        Ok(RawEdgeList { path, file, num_edges: len / PersistentEdge::BYTES })
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn get(&mut self, i: usize) -> Result<PersistentEdge> {
        if i >= self.num_edges {
            return Err(Error::corruption(format!(
                "ordinal {i} out of range for elist {} ({} rows)",
                self.path.display(),
                self.num_edges
            )));
        }
        let mut buf = vec![0u8; PersistentEdge::BYTES];
        self.file
            .seek(SeekFrom::Start((i * PersistentEdge::BYTES) as u64))
            .map_err(crate::error::io_error_to_status)?;
        self.file.read_exact(&mut buf).map_err(crate::error::io_error_to_status)?;
        Ok(PersistentEdge::deserialize(&buf))
    }

    pub fn set(&mut self, i: usize, edge: &PersistentEdge) -> Result<()> {
        if i >= self.num_edges {
            return Err(Error::corruption(format!("ordinal {i} out of range on write")));
        }
        let mut buf = Vec::with_capacity(PersistentEdge::BYTES);
        edge.serialize(&mut buf);
        self.file
            .seek(SeekFrom::Start((i * PersistentEdge::BYTES) as u64))
            .map_err(crate::error::io_error_to_status)?;
        self.file.write_all(&buf).map_err(crate::error::io_error_to_status)?;
        Ok(())
    }

    pub fn update<F: FnOnce(&mut PersistentEdge)>(&mut self, i: usize, f: F) -> Result<()> {
        let mut edge = self.get(i)?;
        f(&mut edge);
        self.set(i, &edge)
    }

    /// Raw backend is pread/pwrite-through already; flush is a no-op beyond OS buffers.
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Dispatches between the two `elist` backends. Selected at partition-open time by
/// `Config::use_mmap_read`.
pub enum EdgeListReader {
    Mmap(MmapEdgeList),
    Raw(RawEdgeList),
}

impl EdgeListReader {
    pub fn open<P: AsRef<Path>>(path: P, create: bool, use_mmap: bool) -> Result<Self> {
        if use_mmap {
            Ok(EdgeListReader::Mmap(MmapEdgeList::open(path, create)?))
        } else {
            Ok(EdgeListReader::Raw(RawEdgeList::open(path, create)?))
        }
    }

    pub fn num_edges(&self) -> usize {
        match self {
            EdgeListReader::Mmap(m) => m.num_edges(),
            EdgeListReader::Raw(r) => r.num_edges(),
        }
    }

    pub fn get(&mut self, i: usize) -> Result<PersistentEdge> {
        match self {
            EdgeListReader::Mmap(m) => m.get(i),
            EdgeListReader::Raw(r) => r.get(i),
        }
    }

    pub fn set(&mut self, i: usize, edge: &PersistentEdge) -> Result<()> {
        match self {
            EdgeListReader::Mmap(m) => m.set(i, edge),
            EdgeListReader::Raw(r) => r.set(i, edge),
        }
    }

    pub fn update<F: FnOnce(&mut PersistentEdge)>(&mut self, i: usize, f: F) -> Result<()> {
        match self {
            EdgeListReader::Mmap(m) => m.update(i, f),
            EdgeListReader::Raw(r) => r.update(i, f),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            EdgeListReader::Mmap(m) => m.flush(),
            EdgeListReader::Raw(r) => r.flush(),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            EdgeListReader::Mmap(m) => m.close(),
            EdgeListReader::Raw(r) => r.close(),
        }
    }
}

/// A sparse `vid -> ordinal` map: ascending `(vid, ordinal)` pairs, read-only, opened
/// over an mmap via `file_store`'s dense `RandomLookup` (the records are dense by
/// *position*, sparse by *vid* — only vids with at least one edge appear).
pub struct VidIndex {
    data: OwnedBytes,
}

impl VidIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = OwnedBytes::mmap_from_path(path.as_ref()).map_err(crate::error::io_error_to_status)?;
        if data.len() % IndexEntry::BYTES != 0 {
            return Err(Error::corruption(format!(
                "index file {} has size {} which is not a multiple of the record size {}",
                path.as_ref().display(),
                data.len(),
                IndexEntry::BYTES
            )));
        }
        Ok(VidIndex { data })
    }

    pub fn len(&self) -> usize {
        self.data.len() / IndexEntry::BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_at(&self, pos: usize) -> IndexEntry {
        let start = pos * IndexEntry::BYTES;
        IndexEntry::deserialize(&self.data[start..start + IndexEntry::BYTES])
    }

    /// Binary search over the ascending `vid` column; returns the position of the
    /// matching entry, if any.
    fn find(&self, vid: u32) -> Option<usize> {
        let n = self.len();
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let e = self.entry_at(mid);
            match e.vid.cmp(&vid) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// `elist.src.idx` point lookup: the half-open ordinal range of outgoing edges for
    /// `src`, exact by invariant I1. `num_edges_total` closes the range of the last
    /// entry in the index.
    pub fn out_range(&self, src: u32, num_edges_total: usize) -> Option<(u32, u32)> {
        let pos = self.find(src)?;
        let first = self.entry_at(pos).ordinal;
        let past_last = if pos + 1 < self.len() {
            self.entry_at(pos + 1).ordinal
        } else {
            num_edges_total as u32
        };
        Some((first, past_last))
    }

    /// `elist.dst.idx` point lookup: ordinal of the first incoming edge for `dst`, or
    /// the absent sentinel.
    pub fn first_in(&self, dst: u32) -> u32 {
        match self.find(dst) {
            Some(pos) => self.entry_at(pos).ordinal,
            None => ABSENT_ORDINAL,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.len()).map(move |pos| self.entry_at(pos))
    }
}

/// Writer for a `VidIndex` file: appends ascending `(vid, ordinal)` records.
pub struct VidIndexWriter {
    file: std::io::BufWriter<File>,
    buf: Vec<u8>,
}

impl VidIndexWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref()).map_err(crate::error::io_error_to_status)?;
        Ok(VidIndexWriter { file: std::io::BufWriter::new(file), buf: Vec::new() })
    }

    pub fn write(&mut self, vid: u32, ordinal: u32) -> Result<()> {
        self.buf.clear();
        IndexEntry { vid, ordinal }.serialize(&mut self.buf);
        self.file.write_all(&self.buf).map_err(crate::error::io_error_to_status)
    }

    pub fn finish(mut self) -> Result<()> {
        self.file.flush().map_err(crate::error::io_error_to_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_store::TempDir;

    #[test]
    fn mmap_elist_roundtrip_and_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_ref().join("elist");

        let mut w = EdgeListReader::open(&path, true, true).unwrap();
        // an empty file is legal and presents as zero rows
        assert_eq!(w.num_edges(), 0);
        w.close().unwrap();

        // write three rows via a raw file append, then reopen to validate read/update
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            let mut buf = Vec::new();
            for i in 0..3u32 {
                PersistentEdge::new(i, i + 1, 1.0, 0).serialize(&mut buf);
            }
            f.write_all(&buf).unwrap();
        }

        let mut reader = EdgeListReader::open(&path, false, true).unwrap();
        assert_eq!(reader.num_edges(), 3);
        let e1 = reader.get(1).unwrap();
        assert_eq!(e1.src, 1);
        assert_eq!(e1.dst, 2);

        reader.update(1, |e| e.set_tombstoned(true)).unwrap();
        reader.flush().unwrap();
        assert!(reader.get(1).unwrap().is_tombstoned());
    }

    #[test]
    fn vid_index_binary_search() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_ref().join("idx");
        let mut w = VidIndexWriter::create(&path).unwrap();
        for (vid, ord) in [(2u32, 0u32), (5, 3), (9, 7)] {
            w.write(vid, ord).unwrap();
        }
        w.finish().unwrap();

        let idx = VidIndex::open(&path).unwrap();
        assert_eq!(idx.out_range(2, 10), Some((0, 3)));
        assert_eq!(idx.out_range(5, 10), Some((3, 7)));
        assert_eq!(idx.out_range(9, 10), Some((7, 10)));
        assert_eq!(idx.out_range(3, 10), None);
        assert_eq!(idx.first_in(5), 3);
        assert_eq!(idx.first_in(100), ABSENT_ORDINAL);
    }
}
