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

//! `SubEdgePartition` (C5): the smallest addressable immutable unit, combining C2
//! readers and C3 columns and, for root partitions, a C4 memtable.

use std::path::PathBuf;
use std::sync::Arc;

use crate::column::{BlockCache, ColumnPartition, FileMmapColumn, FileRawColumn};
use crate::config::{Config, ColumnBackend};
use crate::edge_list::{EdgeListReader, VidIndex};
use crate::error::{Error, Result};
use crate::layout;
use crate::memtable::{write_properties, MemTable};
use crate::request::{memory_edge_to_row, EdgeRequest, EdgeRow};
use crate::schema::{ColumnDescriptor, MetaAttributes};
use crate::types::{Interval, MemoryEdge, VertexId, ABSENT_ORDINAL};
use crate::writer;

fn open_column(
    dir: &std::path::Path,
    col: &ColumnDescriptor,
    num_edges: usize,
    config: &Config,
    block_cache: Option<&Arc<BlockCache>>,
) -> Result<ColumnPartition> {
    std::fs::create_dir_all(layout::column_dir(dir)).map_err(crate::error::io_error_to_status)?;
    let path = layout::column_path(dir, &col.name);
    match config.column_backend {
        ColumnBackend::Mmap => {
            if !path.exists() {
                Ok(ColumnPartition::FileMmap(FileMmapColumn::create_sized(&path, col.value_size, num_edges)?))
            } else {
                Ok(ColumnPartition::FileMmap(FileMmapColumn::open(&path, col.value_size, true)?))
            }
        }
        ColumnBackend::Raw => Ok(ColumnPartition::FileRaw(FileRawColumn::open(&path, col.value_size, true)?)),
        ColumnBackend::Blocks => {
            let cache = block_cache
                .cloned()
                .ok_or_else(|| Error::invalid_argument("Blocks column backend requires a BlockCache"))?;
            Ok(ColumnPartition::Blocks(crate::column::BlocksColumn::new(path, col.value_size, cache)))
        }
    }
}

struct PartitionCore {
    dir: PathBuf,
    shard_id: u32,
    partition_id: u32,
    interval: Interval,
    tag: u8,
    schema: MetaAttributes,
    elist: EdgeListReader,
    src_idx: VidIndex,
    dst_idx: VidIndex,
    columns: Vec<ColumnPartition>,
    config: Arc<Config>,
    block_cache: Option<Arc<BlockCache>>,
}

impl PartitionCore {
    fn open(
        dir: PathBuf,
        shard_id: u32,
        partition_id: u32,
        interval: Interval,
        tag: u8,
        schema: MetaAttributes,
        config: Arc<Config>,
        block_cache: Option<Arc<BlockCache>>,
        create: bool,
    ) -> Result<Self> {
        if create {
            std::fs::create_dir_all(&dir).map_err(crate::error::io_error_to_status)?;
        }
        let elist = EdgeListReader::open(layout::elist_path(&dir), create, config.use_mmap_read)?;
        let num_edges = elist.num_edges();

        if !create {
            for p in [layout::src_idx_path(&dir), layout::dst_idx_path(&dir)] {
                if !p.exists() && num_edges > 0 {
                    return Err(Error::corruption(format!("missing index file {}", p.display())));
                }
            }
        } else {
            for p in [layout::src_idx_path(&dir), layout::dst_idx_path(&dir)] {
                if !p.exists() {
                    std::fs::write(&p, []).map_err(crate::error::io_error_to_status)?;
                }
            }
        }
        let src_idx = VidIndex::open(layout::src_idx_path(&dir))?;
        let dst_idx = VidIndex::open(layout::dst_idx_path(&dir))?;

        let mut columns = Vec::with_capacity(schema.cols.len());
        for col in &schema.cols {
            columns.push(open_column(&dir, col, num_edges, &config, block_cache.as_ref())?);
        }

        Ok(PartitionCore {
            dir,
            shard_id,
            partition_id,
            interval,
            tag,
            schema,
            elist,
            src_idx,
            dst_idx,
            columns,
            config,
            block_cache,
        })
    }

    fn reopen(&mut self) -> Result<()> {
        let elist = EdgeListReader::open(layout::elist_path(&self.dir), false, self.config.use_mmap_read)?;
        let num_edges = elist.num_edges();
        self.elist = elist;
        self.src_idx = VidIndex::open(layout::src_idx_path(&self.dir))?;
        self.dst_idx = VidIndex::open(layout::dst_idx_path(&self.dir))?;
        let mut columns = Vec::with_capacity(self.schema.cols.len());
        for col in &self.schema.cols {
            columns.push(open_column(&self.dir, col, num_edges, &self.config, self.block_cache.as_ref())?);
        }
        self.columns = columns;
        Ok(())
    }

    /// Row-locate-by-`(src,dst)`: query src-idx for `src`, linear-scan the returned
    /// half-open ordinal range, return the first non-tombstoned row with matching
    /// `dst`.
    fn locate(&mut self, src: u32, dst: u32) -> Result<Option<usize>> {
        let num_edges = self.elist.num_edges();
        let Some((first, past_last)) = self.src_idx.out_range(src, num_edges) else {
            return Ok(None);
        };
        for ord in first..past_last {
            let e = self.elist.get(ord as usize)?;
            if e.dst == dst && !e.is_tombstoned() {
                return Ok(Some(ord as usize));
            }
        }
        Ok(None)
    }

    fn read_row(&mut self, ordinal: usize) -> Result<EdgeRow> {
        let e = self.elist.get(ordinal)?;
        let mut properties = Vec::new();
        for (idx, col) in self.schema.cols.iter().enumerate() {
            if e.properties_bitset.get(col.id.max(0) as usize)? {
                let mut buf = vec![0u8; col.value_size];
                self.columns[idx].get(ordinal, &mut buf)?;
                properties.push((col.name.clone(), buf));
            }
        }
        Ok(EdgeRow { src: e.src, dst: e.dst, tag: e.tag, weight: e.weight, properties })
    }

    fn out_ordinals(&mut self, src: u32) -> Result<Vec<usize>> {
        let num_edges = self.elist.num_edges();
        let Some((first, past_last)) = self.src_idx.out_range(src, num_edges) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for ord in first..past_last {
            if !self.elist.get(ord as usize)?.is_tombstoned() {
                out.push(ord as usize);
            }
        }
        Ok(out)
    }

    fn in_ordinals(&mut self, dst: u32) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        let mut ord = self.dst_idx.first_in(dst);
        while ord != ABSENT_ORDINAL {
            let e = self.elist.get(ord as usize)?;
            if !e.is_tombstoned() {
                out.push(ord as usize);
            }
            ord = e.next_ordinal();
        }
        Ok(out)
    }

    fn load_all_edges(&mut self) -> Result<Vec<MemoryEdge>> {
        let n = self.elist.num_edges();
        let mut out = Vec::with_capacity(n);
        for ord in 0..n {
            let e = self.elist.get(ord)?;
            if e.is_tombstoned() {
                continue;
            }
            let mut me = MemoryEdge::new(e.src, e.dst, e.weight, e.tag, self.schema.fixed_row_len());
            me.properties_bitset = e.properties_bitset;
            for (idx, col) in self.schema.cols.iter().enumerate() {
                if e.properties_bitset.get(col.id.max(0) as usize)? {
                    let off = col.offset_within_row as usize;
                    self.columns[idx].get(ord, &mut me.fixed_props[off..off + col.value_size])?;
                }
            }
            out.push(me);
        }
        Ok(out)
    }

    fn flush_cache(&mut self, force: bool) -> Result<()> {
        if force {
            self.elist.flush()?;
            for col in &mut self.columns {
                col.flush()?;
            }
            if let Some(bc) = &self.block_cache {
                bc.flush_prefix(&self.dir)?;
            }
        }
        Ok(())
    }

    /// Core compaction primitive: merges on-disk live rows with `buffered`, rewrites
    /// the partition's three core files plus every column file, then reopens readers.
    fn merge_edges_and_flush(&mut self, buffered: Vec<MemoryEdge>, interval: Interval) -> Result<()> {
        self.flush_cache(true)?;
        let mut edges = self.load_all_edges()?;
        edges.extend(buffered);
        self.interval.extend_to(interval.second);

        writer::write_sub_partition(&self.dir, edges, &self.schema)?;
        self.reopen()
    }

    /// Zero-lengths the three core files and every property column; used by Split.
    fn truncate_partition(&mut self) -> Result<()> {
        std::fs::File::create(layout::elist_path(&self.dir)).map_err(crate::error::io_error_to_status)?;
        std::fs::File::create(layout::src_idx_path(&self.dir)).map_err(crate::error::io_error_to_status)?;
        std::fs::File::create(layout::dst_idx_path(&self.dir)).map_err(crate::error::io_error_to_status)?;
        for col in &self.schema.cols {
            let path = layout::column_path(&self.dir, &col.name);
            std::fs::File::create(path).map_err(crate::error::io_error_to_status)?;
        }
        self.reopen()
    }

    fn create_edge_attr_col(&mut self, desc: ColumnDescriptor) -> Result<()> {
        let num_edges = self.elist.num_edges();
        let desc = self.schema.add_column(desc)?.clone();
        let col = open_column(&self.dir, &desc, num_edges, &self.config, self.block_cache.as_ref())?;
        self.columns.push(col);
        Ok(())
    }

    fn estimated_bytes(&self) -> usize {
        let row_bytes = 17 + crate::types::PropertyBitset::BYTES + self.schema.fixed_row_len();
        self.elist.num_edges() * row_bytes
    }
}

/// `SubEdgePartition::Root` additionally owns one `MemTable`; this is true only for
/// root partitions in non-empty shards (`shard_id != 0 && partition_id == 0`).
pub enum SubEdgePartition {
    Leaf(PartitionCore),
    Root { core: PartitionCore, memtable: MemTable },
}

impl SubEdgePartition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        dir: PathBuf,
        shard_id: u32,
        partition_id: u32,
        interval: Interval,
        tag: u8,
        schema: MetaAttributes,
        config: Arc<Config>,
        block_cache: Option<Arc<BlockCache>>,
        with_memtable: bool,
        create: bool,
    ) -> Result<Self> {
        let core =
            PartitionCore::open(dir, shard_id, partition_id, interval, tag, schema, config, block_cache, create)?;
        if with_memtable {
            let memtable = match core.config.mem_table_type {
                crate::config::MemTableType::Vec => MemTable::new_vec(interval),
                crate::config::MemTableType::Hash => MemTable::new_hash(interval),
            };
            Ok(SubEdgePartition::Root { core, memtable })
        } else {
            Ok(SubEdgePartition::Leaf(core))
        }
    }

    fn core(&self) -> &PartitionCore {
        match self {
            SubEdgePartition::Leaf(c) => c,
            SubEdgePartition::Root { core, .. } => core,
        }
    }

    fn core_mut(&mut self) -> &mut PartitionCore {
        match self {
            SubEdgePartition::Leaf(c) => c,
            SubEdgePartition::Root { core, .. } => core,
        }
    }

    pub fn interval(&self) -> Interval {
        self.core().interval
    }

    pub fn shard_id(&self) -> u32 {
        self.core().shard_id
    }

    pub fn partition_id(&self) -> u32 {
        self.core().partition_id
    }

    pub fn tag(&self) -> u8 {
        self.core().tag
    }

    pub fn schema(&self) -> &MetaAttributes {
        &self.core().schema
    }

    pub fn has_memtable(&self) -> bool {
        matches!(self, SubEdgePartition::Root { .. })
    }

    pub fn add_edge(&mut self, req: &EdgeRequest) -> Result<()> {
        if req.src == req.dst {
            return Err(Error::UnSupportSelfLoop);
        }
        if VertexId(req.src).is_reserved() || VertexId(req.dst).is_reserved() {
            return Err(Error::invalid_argument(format!(
                "vertex ids >= {} are reserved sentinels (src={}, dst={})",
                VertexId::RESERVED_MIN,
                req.src,
                req.dst
            )));
        }
        match self {
            SubEdgePartition::Leaf(_) => {
                Err(Error::invalid_argument("add_edge requires a partition with a MemTable"))
            }
            SubEdgePartition::Root { core, memtable } => {
                core.interval.extend_to(req.dst);
                let mut edge = MemoryEdge::new(req.src, req.dst, req.weight, req.tag, core.schema.fixed_row_len());
                write_properties(&mut edge, &req.properties, &core.schema)?;
                memtable.add_edge(edge)
            }
        }
    }

    pub fn delete_edge(&mut self, src: u32, dst: u32, tag: u8) -> Result<()> {
        if let SubEdgePartition::Root { memtable, .. } = self {
            match memtable.delete_edge(src, dst, tag) {
                Ok(()) => return Ok(()),
                Err(Error::NotExist) => {}
                Err(e) => return Err(e),
            }
        }
        let core = self.core_mut();
        match core.locate(src, dst)? {
            Some(ord) => core.elist.update(ord, |e| e.set_tombstoned(true)),
            None => Err(Error::NotExist),
        }
    }

    pub fn set_edge_attributes(&mut self, req: &EdgeRequest) -> Result<()> {
        if let SubEdgePartition::Root { core, memtable } = self {
            match memtable.set_edge_attributes(req.src, req.dst, req.tag, Some(req.weight), &req.properties, &core.schema) {
                Ok(()) => return Ok(()),
                Err(Error::NotExist) => {}
                Err(e) => return Err(e),
            }
        }
        let (schema_clone, ord) = {
            let core = self.core_mut();
            let ord = core.locate(req.src, req.dst)?.ok_or(Error::NotExist)?;
            (core.schema.clone(), ord)
        };
        let core = self.core_mut();
        core.elist.update(ord, |e| e.weight = req.weight)?;
        for p in &req.properties {
            if let Some(col) = schema_clone.find_column(&p.name) {
                let idx = col.id.max(0) as usize;
                core.columns[idx].set(ord, &p.bytes)?;
                core.elist.update(ord, |e| {
                    let _ = e.properties_bitset.set(idx);
                })?;
            } else {
                tracing::debug!(column = %p.name, "property not declared in schema; ignored");
            }
        }
        Ok(())
    }

    pub fn get_edge_attributes(&mut self, src: u32, dst: u32, tag: u8) -> Result<EdgeRow> {
        if let SubEdgePartition::Root { memtable, .. } = self {
            if let Some(e) = memtable.get_edge_attributes(src, dst, tag) {
                return Ok(memory_edge_to_row(e, self.schema()));
            }
        }
        let core = self.core_mut();
        let ord = core.locate(src, dst)?.ok_or(Error::NotExist)?;
        core.read_row(ord)
    }

    pub fn get_out_edges(&mut self, src: u32) -> Result<Vec<EdgeRow>> {
        let mut rows = Vec::new();
        if let SubEdgePartition::Root { memtable, .. } = self {
            for e in memtable.get_out_edges(src) {
                rows.push(memory_edge_to_row(e, &self.core().schema));
            }
        }
        let core = self.core_mut();
        for ord in core.out_ordinals(src)? {
            rows.push(core.read_row(ord)?);
        }
        Ok(rows)
    }

    pub fn get_in_edges(&mut self, dst: u32) -> Result<Vec<EdgeRow>> {
        let mut rows = Vec::new();
        if let SubEdgePartition::Root { memtable, .. } = self {
            for e in memtable.get_in_edges(dst) {
                rows.push(memory_edge_to_row(e, &self.core().schema));
            }
        }
        let core = self.core_mut();
        for ord in core.in_ordinals(dst)? {
            rows.push(core.read_row(ord)?);
        }
        Ok(rows)
    }

    pub fn get_out_degree(&mut self, src: u32) -> Result<usize> {
        let mut n = self.core_mut().out_ordinals(src)?.len();
        if let SubEdgePartition::Root { memtable, .. } = self {
            n += memtable.get_out_degree(src);
        }
        Ok(n)
    }

    pub fn get_in_degree(&mut self, dst: u32) -> Result<usize> {
        let mut n = self.core_mut().in_ordinals(dst)?.len();
        if let SubEdgePartition::Root { memtable, .. } = self {
            n += memtable.get_in_degree(dst);
        }
        Ok(n)
    }

    pub fn delete_vertex(&mut self, v: u32) -> Result<()> {
        if let SubEdgePartition::Root { memtable, .. } = self {
            memtable.delete_vertex(v)?;
        }
        let core = self.core_mut();
        for ord in core.out_ordinals(v)? {
            core.elist.update(ord, |e| e.set_tombstoned(true))?;
        }
        for ord in core.in_ordinals(v)? {
            core.elist.update(ord, |e| e.set_tombstoned(true))?;
        }
        Ok(())
    }

    pub fn flush_cache(&mut self, force: bool) -> Result<()> {
        self.core_mut().flush_cache(force)
    }

    pub fn merge_edges_and_flush(&mut self, buffered: Vec<MemoryEdge>, interval: Interval) -> Result<()> {
        self.core_mut().merge_edges_and_flush(buffered, interval)
    }

    pub fn truncate_partition(&mut self) -> Result<()> {
        self.core_mut().truncate_partition()
    }

    pub fn create_edge_attr_col(&mut self, desc: ColumnDescriptor) -> Result<()> {
        if let SubEdgePartition::Root { memtable, .. } = self {
            if memtable.num_edges() > 0 {
                return Err(Error::not_implemented(
                    "adding a column while rows exist in the MemTable is not supported",
                ));
            }
        }
        self.core_mut().create_edge_attr_col(desc)
    }

    pub fn load_all_edges(&mut self) -> Result<Vec<MemoryEdge>> {
        self.core_mut().load_all_edges()
    }

    /// Drains the memtable, if any, returning its rows and the interval it had
    /// grown to. A no-op `(vec![], self.interval())` on a leaf partition.
    pub fn extract_memtable(&mut self) -> (Vec<MemoryEdge>, Interval) {
        match self {
            SubEdgePartition::Leaf(core) => (Vec::new(), core.interval),
            SubEdgePartition::Root { memtable, .. } => memtable.extract_all(),
        }
    }

    pub fn memtable_is_full(&self) -> bool {
        match self {
            SubEdgePartition::Leaf(_) => false,
            SubEdgePartition::Root { core, memtable } => {
                memtable.is_full(core.schema.fixed_row_len(), core.config.mem_buffer_mb)
            }
        }
    }

    /// `true` when `estimated_bytes > shard_size_mb * 1MB / (1 + split_factor)`; the
    /// denominator balances a root plus `split_factor` children.
    pub fn is_need_compact(&self) -> bool {
        let core = self.core();
        let mut bytes = core.estimated_bytes();
        if let SubEdgePartition::Root { memtable, .. } = self {
            bytes += memtable.estimated_bytes(core.schema.fixed_row_len());
        }
        bytes > core.config.compact_threshold_bytes()
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.core().dir
    }

    pub fn num_edges(&self) -> usize {
        self.core().elist.num_edges()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema::{ColumnDescriptor, ColumnType};
    use file_store::TempDir;

    fn schema() -> MetaAttributes {
        let mut s = MetaAttributes::new("knows", 1, "person", 1, "person", 1, true);
        s.add_column(ColumnDescriptor::new("since", ColumnType::Int64)).unwrap();
        s
    }

    fn open_root(dir: PathBuf) -> SubEdgePartition {
        SubEdgePartition::open(
            dir,
            1,
            0,
            Interval::new(0, 100),
            1,
            schema(),
            Arc::new(Config::default()),
            None,
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn round_trip_through_memtable() {
        let dir = TempDir::new().unwrap();
        let mut p = open_root(dir.as_ref().join("partition0-0-100-1"));

        let req = EdgeRequest::new("knows", 1, 2)
            .with_weight(0.5)
            .with_property("since", 2020i64.to_le_bytes());
        p.add_edge(&req).unwrap();

        let out = p.get_out_edges(1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, 2);
        assert_eq!(out[0].weight, 0.5);

        let inn = p.get_in_edges(2).unwrap();
        assert_eq!(inn.len(), 1);
        assert_eq!(inn[0].src, 1);
    }

    #[test]
    fn self_loop_rejected() {
        let dir = TempDir::new().unwrap();
        let mut p = open_root(dir.as_ref().join("partition0-0-100-1"));
        let req = EdgeRequest::new("knows", 5, 5);
        assert!(matches!(p.add_edge(&req), Err(Error::UnSupportSelfLoop)));
    }

    #[test]
    fn reserved_vertex_id_rejected() {
        let dir = TempDir::new().unwrap();
        let mut p = open_root(dir.as_ref().join("partition0-0-100-1"));
        let src_reserved = EdgeRequest::new("knows", u32::MAX, 1);
        assert!(matches!(p.add_edge(&src_reserved), Err(Error::InvalidArgument(_))));
        let dst_reserved = EdgeRequest::new("knows", 1, VertexId::RESERVED_MIN);
        assert!(matches!(p.add_edge(&dst_reserved), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn flush_then_tombstone_survives_read() {
        let dir = TempDir::new().unwrap();
        let dir_path = dir.as_ref().join("partition0-0-100-1");
        let mut p = open_root(dir_path);

        p.add_edge(&EdgeRequest::new("knows", 3, 4)).unwrap();
        let (buffered, interval) = p.extract_memtable();
        p.merge_edges_and_flush(buffered, interval).unwrap();
        assert_eq!(p.num_edges(), 1);

        p.delete_edge(3, 4, 0).unwrap();
        let out = p.get_out_edges(3).unwrap();
        assert!(out.is_empty());
        assert_eq!(p.num_edges(), 1, "tombstoning does not shrink elist");
    }

    #[test]
    fn dedup_on_flush_keeps_last_weight() {
        let dir = TempDir::new().unwrap();
        let mut p = open_root(dir.as_ref().join("partition0-0-100-1"));

        p.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(0.1)).unwrap();
        p.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(0.2)).unwrap();

        let (buffered, interval) = p.extract_memtable();
        p.merge_edges_and_flush(buffered, interval).unwrap();

        assert_eq!(p.get_out_degree(1).unwrap(), 1);
        let row = p.get_edge_attributes(1, 2, 0).unwrap();
        assert_eq!(row.weight, 0.2);
    }
}
