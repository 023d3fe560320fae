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

//! `EdgePartition` (C6): one `SubEdgePartition` per edge label, all sharing the same
//! vertex interval. Label-qualified requests dispatch directly; vertex-centric queries
//! that ignore label broadcast across every label's sub-partition.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::column::BlockCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layout;
use crate::request::{EdgeRequest, EdgeResultSet, EdgeRow};
use crate::schema::MetaAttributes;
use crate::sub_partition::SubEdgePartition;
use crate::types::{Interval, MemoryEdge};

pub struct EdgePartition {
    shard_id: u32,
    partition_id: u32,
    interval: Interval,
    dir: PathBuf,
    config: Arc<Config>,
    block_cache: Option<Arc<BlockCache>>,
    with_memtable: bool,
    by_label: FxHashMap<String, SubEdgePartition>,
}

impl EdgePartition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        dir: PathBuf,
        shard_id: u32,
        partition_id: u32,
        interval: Interval,
        schemas: &[MetaAttributes],
        config: Arc<Config>,
        block_cache: Option<Arc<BlockCache>>,
        with_memtable: bool,
        create: bool,
    ) -> Result<Self> {
        let mut by_label = FxHashMap::default();
        for schema in schemas {
            let partition_dir = layout::partition_dir(&dir, shard_id, partition_id, interval, schema.tag);
            let sub = SubEdgePartition::open(
                partition_dir,
                shard_id,
                partition_id,
                interval,
                schema.tag,
                schema.clone(),
                config.clone(),
                block_cache.clone(),
                with_memtable,
                create,
            )?;
            by_label.insert(schema.label.clone(), sub);
        }
        Ok(EdgePartition {
            shard_id,
            partition_id,
            interval,
            dir,
            config,
            block_cache,
            with_memtable,
            by_label,
        })
    }

    /// Lazily adds a new label's sub-partition to this node; used by
    /// `Db::create_edge_label` to fan a newly registered label out across an
    /// already-existing tree.
    pub fn add_label(&mut self, schema: &MetaAttributes) -> Result<()> {
        if self.by_label.contains_key(&schema.label) {
            return Ok(());
        }
        let partition_dir = layout::partition_dir(&self.dir, self.shard_id, self.partition_id, self.interval, schema.tag);
        let sub = SubEdgePartition::open(
            partition_dir,
            self.shard_id,
            self.partition_id,
            self.interval,
            schema.tag,
            schema.clone(),
            self.config.clone(),
            self.block_cache.clone(),
            self.with_memtable,
            true,
        )?;
        self.by_label.insert(schema.label.clone(), sub);
        Ok(())
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn extend_interval_to(&mut self, v: u32) {
        self.interval.extend_to(v);
    }

    fn labeled(&mut self, label: &str) -> Result<&mut SubEdgePartition> {
        self.by_label.get_mut(label).ok_or_else(|| Error::invalid_argument(format!("unknown edge label {label}")))
    }

    pub fn add_edge(&mut self, req: &EdgeRequest) -> Result<()> {
        self.labeled(&req.label)?.add_edge(req)?;
        self.interval.extend_to(req.dst);
        Ok(())
    }

    pub fn delete_edge(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<()> {
        self.labeled(label)?.delete_edge(src, dst, tag)
    }

    pub fn set_edge_attributes(&mut self, req: &EdgeRequest) -> Result<()> {
        self.labeled(&req.label)?.set_edge_attributes(req)
    }

    pub fn get_edge_attributes(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<EdgeRow> {
        self.labeled(label)?.get_edge_attributes(src, dst, tag)
    }

    /// `label = None` broadcasts across every label's sub-partition, stopping early
    /// once `limit` is crossed (the `OverLimit` short-circuit of spec.md §4.6).
    pub fn get_out_edges(&mut self, label: Option<&str>, src: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = EdgeResultSet::default();
        let parts: Vec<&mut SubEdgePartition> = match label {
            Some(l) => vec![self.labeled(l)?],
            None => self.by_label.values_mut().collect(),
        };
        for part in parts {
            for row in part.get_out_edges(src)? {
                if result.push(row, limit) {
                    return Ok(result);
                }
            }
        }
        Ok(result)
    }

    pub fn get_in_edges(&mut self, label: Option<&str>, dst: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = EdgeResultSet::default();
        let parts: Vec<&mut SubEdgePartition> = match label {
            Some(l) => vec![self.labeled(l)?],
            None => self.by_label.values_mut().collect(),
        };
        for part in parts {
            for row in part.get_in_edges(dst)? {
                if result.push(row, limit) {
                    return Ok(result);
                }
            }
        }
        Ok(result)
    }

    pub fn get_out_degree(&mut self, label: Option<&str>, src: u32) -> Result<usize> {
        let mut total = 0;
        match label {
            Some(l) => total += self.labeled(l)?.get_out_degree(src)?,
            None => {
                for part in self.by_label.values_mut() {
                    total += part.get_out_degree(src)?;
                }
            }
        }
        Ok(total)
    }

    pub fn get_in_degree(&mut self, label: Option<&str>, dst: u32) -> Result<usize> {
        let mut total = 0;
        match label {
            Some(l) => total += self.labeled(l)?.get_in_degree(dst)?,
            None => {
                for part in self.by_label.values_mut() {
                    total += part.get_in_degree(dst)?;
                }
            }
        }
        Ok(total)
    }

    pub fn delete_vertex(&mut self, v: u32) -> Result<()> {
        for part in self.by_label.values_mut() {
            part.delete_vertex(v)?;
        }
        Ok(())
    }

    pub fn flush_cache(&mut self, force: bool) -> Result<()> {
        for part in self.by_label.values_mut() {
            part.flush_cache(force)?;
        }
        Ok(())
    }

    pub fn create_edge_attr_col(&mut self, label: &str, desc: crate::schema::ColumnDescriptor) -> Result<()> {
        self.labeled(label)?.create_edge_attr_col(desc)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_label.keys().map(|s| s.as_str())
    }

    /// Any label's `MemTable` over `mem_buffer_mb`; drives root-only flush scheduling.
    pub fn any_memtable_full(&self) -> bool {
        self.by_label.values().any(|p| p.memtable_is_full())
    }

    /// Any label's on-disk footprint over `compact_threshold_bytes`; drives Level/Split
    /// compaction scheduling.
    pub fn any_needs_compact(&self) -> bool {
        self.by_label.values().any(|p| p.is_need_compact())
    }

    pub fn sub_partition(&self, label: &str) -> Option<&SubEdgePartition> {
        self.by_label.get(label)
    }

    pub fn sub_partition_mut(&mut self, label: &str) -> Option<&mut SubEdgePartition> {
        self.by_label.get_mut(label)
    }

    pub fn iter_sub_partitions_mut(&mut self) -> impl Iterator<Item = (&String, &mut SubEdgePartition)> {
        self.by_label.iter_mut()
    }

    pub fn extract_all_memtables(&mut self) -> Vec<(String, Vec<MemoryEdge>, Interval)> {
        self.by_label
            .iter_mut()
            .map(|(label, part)| {
                let (edges, interval) = part.extract_memtable();
                (label.clone(), edges, interval)
            })
            .collect()
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_store::TempDir;

    fn knows_schema() -> MetaAttributes {
        MetaAttributes::new("knows", 1, "person", 1, "person", 1, true)
    }

    fn follows_schema() -> MetaAttributes {
        MetaAttributes::new("follows", 2, "person", 1, "person", 1, false)
    }

    #[test]
    fn dispatches_per_label_and_broadcasts_when_unlabeled() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut ep = EdgePartition::open(
            dir.as_ref().to_path_buf(),
            0,
            0,
            Interval::new(0, 100),
            &[knows_schema(), follows_schema()],
            config,
            None,
            true,
            true,
        )
        .unwrap();

        ep.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(1.0)).unwrap();
        ep.add_edge(&EdgeRequest::new("follows", 1, 3).with_weight(0.0)).unwrap();

        let knows_only = ep.get_out_edges(Some("knows"), 1, None).unwrap();
        assert_eq!(knows_only.rows.len(), 1);
        assert_eq!(knows_only.rows[0].dst, 2);

        let both = ep.get_out_edges(None, 1, None).unwrap();
        assert_eq!(both.rows.len(), 2);
    }

    #[test]
    fn unknown_label_is_invalid_argument() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut ep =
            EdgePartition::open(dir.as_ref().to_path_buf(), 0, 0, Interval::new(0, 100), &[knows_schema()], config, None, true, true)
                .unwrap();

        let err = ep.add_edge(&EdgeRequest::new("unknown", 1, 2)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn over_limit_short_circuits_across_labels() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut ep = EdgePartition::open(
            dir.as_ref().to_path_buf(),
            0,
            0,
            Interval::new(0, 100),
            &[knows_schema(), follows_schema()],
            config,
            None,
            true,
            true,
        )
        .unwrap();

        ep.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(1.0)).unwrap();
        ep.add_edge(&EdgeRequest::new("follows", 1, 3).with_weight(0.0)).unwrap();

        let limited = ep.get_out_edges(None, 1, Some(1)).unwrap();
        assert_eq!(limited.rows.len(), 1);
        assert!(limited.over_limit);
    }

    #[test]
    fn add_label_is_idempotent_and_lazily_extends() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut ep =
            EdgePartition::open(dir.as_ref().to_path_buf(), 0, 0, Interval::new(0, 100), &[knows_schema()], config, None, true, true)
                .unwrap();

        assert!(ep.sub_partition("follows").is_none());
        ep.add_label(&follows_schema()).unwrap();
        assert!(ep.sub_partition("follows").is_some());
        ep.add_label(&follows_schema()).unwrap();
        assert_eq!(ep.labels().count(), 2);
    }
}
