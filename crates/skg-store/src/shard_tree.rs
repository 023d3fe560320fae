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

//! `ShardTree` (C7): one tree per top-level vertex interval. Partition 0 is the root
//! and carries the only `MemTable`s in the tree; interior/leaf partitions are pure
//! on-disk `SubEdgePartition`s reached by walking `children`.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::column::BlockCache;
use crate::compaction::Compaction;
use crate::config::Config;
use crate::edge_partition::EdgePartition;
use crate::error::{Error, Result};
use crate::request::{EdgeRequest, EdgeResultSet, EdgeRow};
use crate::schema::MetaAttributes;
use crate::types::Interval;

/// Serializable description of one node, persisted as part of `meta/intervals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: u32,
    pub interval: Interval,
    pub children: Vec<u32>,
}

/// Serializable description of one tree, persisted as part of `meta/intervals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTreeMeta {
    pub shard_id: u32,
    pub nodes: Vec<NodeMeta>,
}

pub(crate) struct Node {
    interval: Interval,
    children: Vec<u32>,
    edge_partition: EdgePartition,
}

pub struct ShardTree {
    shard_id: u32,
    db_root: PathBuf,
    config: Arc<Config>,
    block_cache: Option<Arc<BlockCache>>,
    schemas: Vec<MetaAttributes>,
    nodes: FxHashMap<u32, Node>,
    next_partition_id: u32,
}

impl ShardTree {
    pub fn create(
        db_root: PathBuf,
        shard_id: u32,
        top_interval: Interval,
        schemas: Vec<MetaAttributes>,
        config: Arc<Config>,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let root_ep = EdgePartition::open(
            db_root.clone(),
            shard_id,
            0,
            top_interval,
            &schemas,
            config.clone(),
            block_cache.clone(),
            true,
            true,
        )?;
        let mut nodes = FxHashMap::default();
        nodes.insert(0, Node { interval: top_interval, children: Vec::new(), edge_partition: root_ep });
        Ok(ShardTree { shard_id, db_root, config, block_cache, schemas, nodes, next_partition_id: 1 })
    }

    pub fn open(
        db_root: PathBuf,
        meta: ShardTreeMeta,
        schemas: Vec<MetaAttributes>,
        config: Arc<Config>,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let shard_id = meta.shard_id;
        let mut nodes = FxHashMap::default();
        let mut max_id = 0;
        for n in &meta.nodes {
            let ep = EdgePartition::open(
                db_root.clone(),
                shard_id,
                n.id,
                n.interval,
                &schemas,
                config.clone(),
                block_cache.clone(),
                n.id == 0,
                false,
            )?;
            nodes.insert(n.id, Node { interval: n.interval, children: n.children.clone(), edge_partition: ep });
            max_id = max_id.max(n.id);
        }
        Ok(ShardTree { shard_id, db_root, config, block_cache, schemas, nodes, next_partition_id: max_id + 1 })
    }

    pub fn to_meta(&self) -> ShardTreeMeta {
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        let nodes = ids
            .into_iter()
            .map(|id| {
                let n = &self.nodes[&id];
                NodeMeta { id, interval: n.interval, children: n.children.clone() }
            })
            .collect();
        ShardTreeMeta { shard_id: self.shard_id, nodes }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn top_interval(&self) -> Interval {
        self.nodes[&0].interval
    }

    pub(crate) fn node(&self, id: u32) -> Result<&Node> {
        self.nodes.get(&id).ok_or_else(|| Error::corruption(format!("unknown partition node {id}")))
    }

    pub(crate) fn node_mut(&mut self, id: u32) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or_else(|| Error::corruption(format!("unknown partition node {id}")))
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn schemas(&self) -> &[MetaAttributes] {
        &self.schemas
    }

    pub(crate) fn alloc_partition_id(&mut self) -> u32 {
        let id = self.next_partition_id;
        self.next_partition_id += 1;
        id
    }

    pub(crate) fn create_child_node(&mut self, id: u32, interval: Interval, schemas: &[MetaAttributes]) -> Result<()> {
        let ep = EdgePartition::open(
            self.db_root.clone(),
            self.shard_id,
            id,
            interval,
            schemas,
            self.config.clone(),
            self.block_cache.clone(),
            false,
            true,
        )?;
        self.nodes.insert(id, Node { interval, children: Vec::new(), edge_partition: ep });
        Ok(())
    }

    /// Every node whose interval contains `v`, ascending by id (deterministic walk
    /// order for the containment-based routing rules of spec.md §4.7).
    fn containing(&self, v: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.iter().filter(|(_, n)| n.interval.contains(v)).map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    fn all_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn add_edge(&mut self, req: &EdgeRequest) -> Result<()> {
        if req.check_exist {
            let mut set_req = req.clone();
            set_req.create_if_not_exist = true;
            return self.set_edge_attributes(&set_req);
        }
        let root = self.node_mut(0)?;
        root.edge_partition.add_edge(req)?;
        // `EdgePartition::add_edge` grows its own interval copy; keep the node's in sync
        // so containment walks (`get_in_edges`, `set_edge_attributes`, ...) see it too.
        let grown = root.edge_partition.interval();
        root.interval = grown;
        self.run_maintenance()
    }

    pub fn set_edge_attributes(&mut self, req: &EdgeRequest) -> Result<()> {
        for id in self.containing(req.dst) {
            match self.node_mut(id)?.edge_partition.set_edge_attributes(req) {
                Ok(()) => return Ok(()),
                Err(Error::NotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        if req.create_if_not_exist {
            let mut add_req = req.clone();
            add_req.check_exist = false;
            add_req.create_if_not_exist = false;
            return self.add_edge(&add_req);
        }
        Err(Error::NotExist)
    }

    pub fn delete_edge(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<()> {
        for id in self.containing(dst) {
            match self.node_mut(id)?.edge_partition.delete_edge(label, src, dst, tag) {
                Ok(()) => return Ok(()),
                Err(Error::NotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotExist)
    }

    pub fn get_edge_attributes(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<EdgeRow> {
        for id in self.containing(dst) {
            match self.node_mut(id)?.edge_partition.get_edge_attributes(label, src, dst, tag) {
                Ok(row) => return Ok(row),
                Err(Error::NotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotExist)
    }

    /// In-edges are restricted to partitions whose interval contains `dst`.
    pub fn get_in_edges(&mut self, label: Option<&str>, dst: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = EdgeResultSet::default();
        for id in self.containing(dst) {
            let remaining = limit.map(|l| l.saturating_sub(result.rows.len()));
            if remaining == Some(0) {
                break;
            }
            let mut partial = self.node_mut(id)?.edge_partition.get_in_edges(label, dst, remaining)?;
            let hit_limit = partial.over_limit;
            result.rows.append(&mut partial.rows);
            if hit_limit {
                result.over_limit = true;
                break;
            }
        }
        Ok(result)
    }

    /// Out-edges broadcast to every partition, since `src` may hold edges under any
    /// descendant interval.
    pub fn get_out_edges(&mut self, label: Option<&str>, src: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = EdgeResultSet::default();
        for id in self.all_ids() {
            let remaining = limit.map(|l| l.saturating_sub(result.rows.len()));
            if remaining == Some(0) {
                break;
            }
            let mut partial = self.node_mut(id)?.edge_partition.get_out_edges(label, src, remaining)?;
            let hit_limit = partial.over_limit;
            result.rows.append(&mut partial.rows);
            if hit_limit {
                result.over_limit = true;
                break;
            }
        }
        Ok(result)
    }

    pub fn get_both_edges(&mut self, label: Option<&str>, v: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = self.get_out_edges(label, v, limit)?;
        if result.over_limit {
            return Ok(result);
        }
        let remaining = limit.map(|l| l.saturating_sub(result.rows.len()));
        let mut inbound = self.get_in_edges(label, v, remaining)?;
        result.rows.append(&mut inbound.rows);
        result.over_limit |= inbound.over_limit;
        Ok(result)
    }

    pub fn get_out_degree(&mut self, label: Option<&str>, src: u32) -> Result<usize> {
        let mut total = 0;
        for id in self.all_ids() {
            total += self.node_mut(id)?.edge_partition.get_out_degree(label, src)?;
        }
        Ok(total)
    }

    pub fn get_in_degree(&mut self, label: Option<&str>, dst: u32) -> Result<usize> {
        let mut total = 0;
        for id in self.containing(dst) {
            total += self.node_mut(id)?.edge_partition.get_in_degree(label, dst)?;
        }
        Ok(total)
    }

    pub fn delete_vertex(&mut self, v: u32) -> Result<()> {
        for id in self.all_ids() {
            self.node_mut(id)?.edge_partition.delete_vertex(v)?;
        }
        Ok(())
    }

    pub fn flush_cache(&mut self, force: bool) -> Result<()> {
        for id in self.all_ids() {
            self.node_mut(id)?.edge_partition.flush_cache(force)?;
        }
        Ok(())
    }

    pub fn create_edge_attr_col(&mut self, label: &str, desc: crate::schema::ColumnDescriptor) -> Result<()> {
        for id in self.all_ids() {
            self.node_mut(id)?.edge_partition.create_edge_attr_col(label, desc.clone())?;
        }
        Ok(())
    }

    pub fn add_label(&mut self, schema: &MetaAttributes) -> Result<()> {
        for id in self.all_ids() {
            self.node_mut(id)?.edge_partition.add_label(schema)?;
        }
        if !self.schemas.iter().any(|s| s.label == schema.label) {
            self.schemas.push(schema.clone());
        }
        Ok(())
    }

    /// Drains the root `MemTable`(s) and any over-budget partition, synchronously,
    /// before `add_edge` returns (spec.md §5's ordering guarantee).
    fn run_maintenance(&mut self) -> Result<()> {
        loop {
            let mut did_work = false;

            if self.node(0)?.edge_partition.any_memtable_full() {
                Compaction::MemTable { node_id: 0 }.run(self)?;
                did_work = true;
            }

            let mut ids = self.all_ids();
            ids.sort_unstable();
            for id in ids {
                if self.node(id)?.edge_partition.any_needs_compact() {
                    let has_children = !self.node(id)?.children.is_empty();
                    if has_children {
                        Compaction::Level { node_id: id }.run(self)?;
                    } else {
                        Compaction::Split { node_id: id }.run(self)?;
                    }
                    did_work = true;
                    break;
                }
            }

            if !did_work {
                break;
            }
        }
        Ok(())
    }
}

impl Node {
    pub(crate) fn interval(&self) -> Interval {
        self.interval
    }

    pub(crate) fn children(&self) -> &[u32] {
        &self.children
    }

    pub(crate) fn edge_partition(&self) -> &EdgePartition {
        &self.edge_partition
    }

    pub(crate) fn edge_partition_mut(&mut self) -> &mut EdgePartition {
        &mut self.edge_partition
    }

    pub(crate) fn set_children(&mut self, children: Vec<u32>) {
        self.children = children;
    }

    pub(crate) fn extend_interval_to(&mut self, v: u32) {
        self.interval.extend_to(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MetaAttributes;
    use file_store::TempDir;

    fn schema() -> MetaAttributes {
        MetaAttributes::new("knows", 1, "person", 1, "person", 1, true)
    }

    #[test]
    fn add_and_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut tree =
            ShardTree::create(dir.as_ref().to_path_buf(), 0, Interval::new(0, 100), vec![schema()], config, None).unwrap();

        tree.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(1.0)).unwrap();
        tree.add_edge(&EdgeRequest::new("knows", 1, 3).with_weight(2.0)).unwrap();

        let out = tree.get_out_edges(None, 1, None).unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(tree.get_in_degree(None, 2).unwrap(), 1);
    }

    #[test]
    fn set_edge_attributes_falls_back_to_add_when_missing() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut tree =
            ShardTree::create(dir.as_ref().to_path_buf(), 0, Interval::new(0, 100), vec![schema()], config, None).unwrap();

        let req = EdgeRequest::new("knows", 5, 6).with_weight(3.0).with_create_if_not_exist(true);
        tree.set_edge_attributes(&req).unwrap();

        let row = tree.get_edge_attributes("knows", 5, 6, 0).unwrap();
        assert_eq!(row.weight, 3.0);
    }

    #[test]
    fn delete_edge_reports_not_exist() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut tree =
            ShardTree::create(dir.as_ref().to_path_buf(), 0, Interval::new(0, 100), vec![schema()], config, None).unwrap();

        let err = tree.delete_edge("knows", 1, 2, 0).unwrap_err();
        assert!(matches!(err, Error::NotExist));
    }
}
