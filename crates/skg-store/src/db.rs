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

//! `SkgDb`/`Handle` (spec.md §6 `SkgDB`): the top-level entry point, owning a forest
//! of `ShardTree`s keyed by shard id plus the shared edge-label schema registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::column::BlockCache;
use crate::config::Config;
use crate::error::{io_error_to_status, Error, Result};
use crate::layout;
use crate::request::{EdgeRequest, EdgeResultSet, EdgeRow};
use crate::schema::{ColumnDescriptor, MetaAttributes};
use crate::shard_tree::{ShardTree, ShardTreeMeta};
use crate::types::Interval;

/// Reserved-sentinel-aware upper bound for a shard's initial top-level interval
/// (vertex ids `>= u32::MAX - 1` are reserved, spec.md's glossary).
const MAX_VID: u32 = u32::MAX - 2;

fn default_shard_interval(config: &Config) -> Interval {
    let hi = config.max_interval_length.saturating_sub(1).min(MAX_VID).max(1);
    Interval::new(1, hi)
}

pub fn default_options() -> Config {
    Config::default()
}

pub struct SkgDb {
    db_root: PathBuf,
    config: Arc<Config>,
    block_cache: Option<Arc<BlockCache>>,
    schemas: Vec<MetaAttributes>,
    shards: FxHashMap<u32, ShardTree>,
}

impl SkgDb {
    /// Lays out a brand-new store: `meta/edge.attr.cnf`, a single shard-0 `ShardTree`,
    /// and the `meta/intervals` + `meta/CURRENT` pair.
    pub fn create(db_root: impl AsRef<Path>, config: Config, edge_labels: Vec<MetaAttributes>) -> Result<()> {
        config.validate()?;
        let db_root = db_root.as_ref().to_path_buf();
        fs::create_dir_all(layout::meta_dir(&db_root)).map_err(io_error_to_status)?;

        let config = Arc::new(config);
        let block_cache = new_block_cache(&config);
        let top_interval = default_shard_interval(&config);
        let tree = ShardTree::create(db_root.clone(), 0, top_interval, edge_labels.clone(), config.clone(), block_cache)?;

        write_json(&layout::edge_attr_conf_path(&db_root), &edge_labels)?;
        write_meta(&db_root, &[tree.to_meta()])?;
        Ok(())
    }

    /// Reopens an existing store, rebuilding every shard's `ShardTree` from
    /// `meta/intervals` and its schemas from `meta/edge.attr.cnf`.
    pub fn open(db_root: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let db_root = db_root.as_ref().to_path_buf();
        let schemas: Vec<MetaAttributes> = read_json(&layout::edge_attr_conf_path(&db_root))?;
        let tree_metas: Vec<ShardTreeMeta> = read_json(&layout::intervals_path(&db_root))?;

        let config = Arc::new(config);
        let block_cache = new_block_cache(&config);

        let mut shards = FxHashMap::default();
        for meta in tree_metas {
            let shard_id = meta.shard_id;
            let tree = ShardTree::open(db_root.clone(), meta, schemas.clone(), config.clone(), block_cache.clone())?;
            shards.insert(shard_id, tree);
        }

        Ok(SkgDb { db_root, config, block_cache, schemas, shards })
    }

    /// Rewrites `meta/intervals` via a temp-file-then-rename swap and repoints
    /// `meta/CURRENT` the same way, so a crash mid-write never leaves a half-written
    /// file live (spec.md §3's `CURRENT` pointer supplement).
    fn save_meta(&self) -> Result<()> {
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        let metas: Vec<ShardTreeMeta> = ids.into_iter().map(|id| self.shards[&id].to_meta()).collect();
        write_meta(&self.db_root, &metas)
    }

    /// Routes a vertex id to the shard whose interval currently contains it. A shard's
    /// root interval grows lazily as edges are added (`ShardTree::add_edge`), so with a
    /// single shard in play this always resolves to that shard, letting it grow to cover
    /// the new id rather than rejecting it outright.
    fn tree_for(&mut self, vid: u32) -> Result<&mut ShardTree> {
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for &id in &ids {
            if self.shards[&id].top_interval().contains(vid) {
                return self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"));
            }
        }
        if let [only] = ids[..] {
            return self.shards.get_mut(&only).ok_or_else(|| Error::corruption("shard vanished"));
        }
        Err(Error::invalid_argument(format!("vertex {vid} is outside every shard's interval")))
    }

    pub fn add_edge(&mut self, req: &EdgeRequest) -> Result<()> {
        self.tree_for(req.dst)?.add_edge(req)?;
        self.save_meta()
    }

    pub fn set_edge_attributes(&mut self, req: &EdgeRequest) -> Result<()> {
        self.tree_for(req.dst)?.set_edge_attributes(req)?;
        self.save_meta()
    }

    pub fn delete_edge(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<()> {
        self.tree_for(dst)?.delete_edge(label, src, dst, tag)?;
        self.save_meta()
    }

    pub fn get_edge_attributes(&mut self, label: &str, src: u32, dst: u32, tag: u8) -> Result<EdgeRow> {
        self.tree_for(dst)?.get_edge_attributes(label, src, dst, tag)
    }

    pub fn get_out_edges(&mut self, label: Option<&str>, src: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        let mut result = EdgeResultSet::default();
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let remaining = limit.map(|l| l.saturating_sub(result.rows.len()));
            if remaining == Some(0) {
                break;
            }
            let tree = self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?;
            let mut partial = tree.get_out_edges(label, src, remaining)?;
            let hit_limit = partial.over_limit;
            result.rows.append(&mut partial.rows);
            if hit_limit {
                result.over_limit = true;
                break;
            }
        }
        Ok(result)
    }

    pub fn get_in_edges(&mut self, label: Option<&str>, dst: u32, limit: Option<usize>) -> Result<EdgeResultSet> {
        self.tree_for(dst)?.get_in_edges(label, dst, limit)
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

    pub fn get_out_vertices(&mut self, label: Option<&str>, src: u32) -> Result<Vec<u32>> {
        Ok(distinct(self.get_out_edges(label, src, None)?.rows.iter().map(|r| r.dst)))
    }

    pub fn get_in_vertices(&mut self, label: Option<&str>, dst: u32) -> Result<Vec<u32>> {
        Ok(distinct(self.get_in_edges(label, dst, None)?.rows.iter().map(|r| r.src)))
    }

    pub fn get_both_vertices(&mut self, label: Option<&str>, v: u32) -> Result<Vec<u32>> {
        let out = self.get_out_edges(label, v, None)?.rows.into_iter().map(|r| r.dst);
        let inn = self.get_in_edges(label, v, None)?.rows.into_iter().map(|r| r.src);
        Ok(distinct(out.chain(inn)))
    }

    pub fn get_out_degree(&mut self, label: Option<&str>, src: u32) -> Result<usize> {
        let mut total = 0;
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            total += self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?.get_out_degree(label, src)?;
        }
        Ok(total)
    }

    pub fn get_in_degree(&mut self, label: Option<&str>, dst: u32) -> Result<usize> {
        self.tree_for(dst)?.get_in_degree(label, dst)
    }

    pub fn delete_vertex(&mut self, v: u32) -> Result<()> {
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?.delete_vertex(v)?;
        }
        self.save_meta()
    }

    /// Registers a new edge label, fanning it out across every existing shard/node.
    pub fn create_edge_label(&mut self, schema: MetaAttributes) -> Result<()> {
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?.add_label(&schema)?;
        }
        if !self.schemas.iter().any(|s| s.label == schema.label) {
            self.schemas.push(schema);
        }
        write_json(&layout::edge_attr_conf_path(&self.db_root), &self.schemas)?;
        self.save_meta()
    }

    pub fn create_edge_attr_col(&mut self, label: &str, col: ColumnDescriptor) -> Result<()> {
        let schema = self
            .schemas
            .iter_mut()
            .find(|s| s.label == label)
            .ok_or_else(|| Error::invalid_argument(format!("unknown edge label {label}")))?;
        schema.add_column(col.clone())?;

        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?.create_edge_attr_col(label, col.clone())?;
        }
        write_json(&layout::edge_attr_conf_path(&self.db_root), &self.schemas)
    }

    pub fn flush(&mut self) -> Result<()> {
        let mut ids: Vec<u32> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.shards.get_mut(&id).ok_or_else(|| Error::corruption("shard vanished"))?.flush_cache(true)?;
        }
        self.save_meta()
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

fn distinct(iter: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for v in iter {
        if seen.insert(v) {
            out.push(v);
        }
    }
    out
}

fn new_block_cache(config: &Config) -> Option<Arc<BlockCache>> {
    if config.edata_cache_mb == 0 {
        None
    } else {
        Some(BlockCache::new(config.edata_cache_mb, config.block_size))
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error_to_status)?;
    }
    fs::write(path, bytes).map_err(io_error_to_status)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(io_error_to_status)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Writes the new `intervals` payload under a temp name, renames it into place, then
/// repoints `CURRENT` at the canonical name the same way.
fn write_meta(db_root: &Path, tree_metas: &[ShardTreeMeta]) -> Result<()> {
    let meta_dir = layout::meta_dir(db_root);
    fs::create_dir_all(&meta_dir).map_err(io_error_to_status)?;

    let intervals_path = layout::intervals_path(db_root);
    let tmp_path = meta_dir.join("intervals.tmp");
    let bytes = serde_json::to_vec_pretty(tree_metas)?;
    fs::write(&tmp_path, bytes).map_err(io_error_to_status)?;
    fs::rename(&tmp_path, &intervals_path).map_err(io_error_to_status)?;

    let current_path = layout::current_pointer_path(db_root);
    let current_tmp = meta_dir.join("CURRENT.tmp");
    fs::write(&current_tmp, b"intervals").map_err(io_error_to_status)?;
    fs::rename(&current_tmp, &current_path).map_err(io_error_to_status)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ColumnType};
    use file_store::TempDir;

    fn knows_schema() -> MetaAttributes {
        let mut s = MetaAttributes::new("knows", 1, "person", 1, "person", 1, true);
        s.add_column(ColumnDescriptor::new("since", ColumnType::Time)).unwrap();
        s
    }

    #[test]
    fn create_open_round_trip_add_and_query() {
        let dir = TempDir::new().unwrap();
        SkgDb::create(dir.as_ref(), Config::default(), vec![knows_schema()]).unwrap();

        let mut db = SkgDb::open(dir.as_ref(), Config::default()).unwrap();
        db.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(0.5)).unwrap();

        let out = db.get_out_edges(None, 1, None).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].dst, 2);

        let back_in = db.get_in_edges(None, 2, None).unwrap();
        assert_eq!(back_in.rows.len(), 1);
        assert_eq!(back_in.rows[0].src, 1);
    }

    #[test]
    fn reopen_after_close_preserves_edges() {
        let dir = TempDir::new().unwrap();
        SkgDb::create(dir.as_ref(), Config::default(), vec![knows_schema()]).unwrap();

        {
            let mut db = SkgDb::open(dir.as_ref(), Config::default()).unwrap();
            db.add_edge(&EdgeRequest::new("knows", 10, 20).with_weight(1.0)).unwrap();
            db.flush().unwrap();
        }

        let mut db = SkgDb::open(dir.as_ref(), Config::default()).unwrap();
        let row = db.get_edge_attributes("knows", 10, 20, 0).unwrap();
        assert_eq!(row.weight, 1.0);
    }

    #[test]
    fn delete_vertex_removes_in_and_out_edges() {
        let dir = TempDir::new().unwrap();
        SkgDb::create(dir.as_ref(), Config::default(), vec![knows_schema()]).unwrap();
        let mut db = SkgDb::open(dir.as_ref(), Config::default()).unwrap();

        db.add_edge(&EdgeRequest::new("knows", 1, 2).with_weight(1.0)).unwrap();
        db.add_edge(&EdgeRequest::new("knows", 2, 3).with_weight(1.0)).unwrap();
        db.delete_vertex(2).unwrap();

        assert_eq!(db.get_out_edges(None, 1, None).unwrap().rows.len(), 0);
        assert_eq!(db.get_out_edges(None, 2, None).unwrap().rows.len(), 0);
    }
}
