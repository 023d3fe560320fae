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

//! Compaction engine (C8): MemTable flush, Level merge and Split, run against a
//! borrowed `ShardTree`.
//!
//! A node's `EdgePartition` groups one `SubEdgePartition` per label at a shared
//! interval, so a structural change (Level merge, Split) has to move every label in
//! lockstep: the label with the most on-disk edges drives the bucket boundaries, and
//! every other label's rows are bucketed against those same boundaries even though its
//! own distribution may differ. This keeps the tree's `children`/interval topology
//! single-valued per node, matching how `ShardTree` persists it.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::shard_tree::ShardTree;
use crate::types::{Interval, MemoryEdge};

pub enum Compaction {
    MemTable { node_id: u32 },
    Level { node_id: u32 },
    Split { node_id: u32 },
}

impl Compaction {
    pub fn run(&self, tree: &mut ShardTree) -> Result<()> {
        match self {
            Compaction::MemTable { node_id } => run_memtable_compaction(tree, *node_id),
            Compaction::Level { node_id } => run_level_compaction(tree, *node_id),
            Compaction::Split { node_id } => run_split_compaction(tree, *node_id),
        }
    }
}

/// Deduplicates by `(src, dst, tag)`, keeping whichever occurrence sorts last in the
/// input order. Unlike the writer's own pass this doesn't require adjacency, since the
/// vector here is sorted by `dst` alone.
fn dedup_keep_last(edges: &mut Vec<MemoryEdge>) {
    let mut last_index: FxHashMap<(u32, u32, u8), usize> = FxHashMap::default();
    for (i, e) in edges.iter().enumerate() {
        last_index.insert(e.key(), i);
    }
    let mut keep = vec![false; edges.len()];
    for idx in last_index.into_values() {
        keep[idx] = true;
    }
    let mut i = 0;
    edges.retain(|_| {
        let k = keep[i];
        i += 1;
        k
    });
}

fn run_memtable_compaction(tree: &mut ShardTree, node_id: u32) -> Result<()> {
    let node = tree.node_mut(node_id)?;
    let labels: Vec<String> = node.edge_partition().labels().map(str::to_string).collect();
    for label in labels {
        let sub = node
            .edge_partition_mut()
            .sub_partition_mut(&label)
            .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {label}")))?;
        let (buffered, interval) = sub.extract_memtable();
        if buffered.is_empty() {
            continue;
        }
        sub.merge_edges_and_flush(buffered, interval)?;
    }
    Ok(())
}

/// Bucket index of the first child interval containing `dst`, or the last bucket if
/// none does (covers any drift past the originally recorded boundaries).
fn bucket_for(dst: u32, intervals: &[Interval]) -> usize {
    intervals.iter().position(|iv| iv.contains(dst)).unwrap_or(intervals.len() - 1)
}

fn run_level_compaction(tree: &mut ShardTree, node_id: u32) -> Result<()> {
    let children_ids = tree.node(node_id)?.children().to_vec();
    if children_ids.is_empty() {
        return Ok(());
    }

    let need_uniq = tree.config().need_ensure_uniq_on_merge;
    let labels: Vec<String> = tree.node(node_id)?.edge_partition().labels().map(str::to_string).collect();

    for label in &labels {
        let node = tree.node_mut(node_id)?;
        let sub = node
            .edge_partition_mut()
            .sub_partition_mut(label)
            .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {label}")))?;
        sub.flush_cache(true)?;
        let mut edges = sub.load_all_edges()?;
        edges.sort_by_key(|e| e.dst);
        if need_uniq {
            dedup_keep_last(&mut edges);
        }

        let child_intervals: Vec<Interval> =
            children_ids.iter().map(|&cid| tree.node(cid).map(|n| n.interval())).collect::<Result<_>>()?;
        let mut buckets: Vec<Vec<MemoryEdge>> = (0..child_intervals.len()).map(|_| Vec::new()).collect();
        let mut max_dst: Vec<Option<u32>> = vec![None; child_intervals.len()];
        for edge in edges {
            let idx = bucket_for(edge.dst, &child_intervals);
            max_dst[idx] = Some(max_dst[idx].map_or(edge.dst, |m| m.max(edge.dst)));
            buckets[idx].push(edge);
        }

        for (i, &cid) in children_ids.iter().enumerate() {
            if let Some(m) = max_dst[i] {
                tree.node_mut(cid)?.extend_interval_to(m);
            }
            let child_interval = tree.node(cid)?.interval();
            let bucket = std::mem::take(&mut buckets[i]);
            if bucket.is_empty() {
                continue;
            }
            let child_sub = tree
                .node_mut(cid)?
                .edge_partition_mut()
                .sub_partition_mut(label)
                .ok_or_else(|| Error::corruption(format!("child {cid} missing label {label}")))?;
            child_sub.merge_edges_and_flush(bucket, child_interval)?;
        }
    }

    for label in &labels {
        tree.node_mut(node_id)?
            .edge_partition_mut()
            .sub_partition_mut(label)
            .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {label}")))?
            .truncate_partition()?;
    }
    Ok(())
}

/// Walks a `dst`-sorted, deduplicated edge vector into `n` contiguous vertex-id
/// buckets: recomputes `target_avg` over the remaining edges/buckets after each split
/// so the last bucket absorbs the remainder, and always spans the leaf's full
/// interval regardless of how sparse the tail is.
fn compute_split_boundaries(edges: &[MemoryEdge], leaf_interval: Interval, n: usize) -> Vec<Interval> {
    if n <= 1 || edges.is_empty() {
        return vec![leaf_interval];
    }

    let mut boundaries = Vec::new();
    let mut lower: i64 = leaf_interval.first as i64 - 1;
    let mut remaining_edges = edges.len();
    let mut remaining_buckets = n;
    let mut i = 0;

    while i < edges.len() && remaining_buckets > 1 {
        let target_avg = (remaining_edges / remaining_buckets).max(1);
        let mut count = 0;
        let mut last_dst = edges[i].dst;
        while i < edges.len() {
            last_dst = edges[i].dst;
            count += 1;
            i += 1;
            if count >= target_avg && (i >= edges.len() || edges[i].dst != last_dst) {
                break;
            }
        }
        boundaries.push(Interval::new((lower + 1) as u32, last_dst));
        lower = last_dst as i64;
        remaining_edges -= count;
        remaining_buckets -= 1;
    }

    boundaries.push(Interval::new((lower + 1) as u32, leaf_interval.second));
    boundaries
}

fn run_split_compaction(tree: &mut ShardTree, node_id: u32) -> Result<()> {
    if !tree.node(node_id)?.children().is_empty() {
        return Ok(());
    }

    let split_factor = tree.config().shard_split_factor.max(1);
    let leaf_interval = tree.node(node_id)?.interval();
    let labels: Vec<String> = tree.node(node_id)?.edge_partition().labels().map(str::to_string).collect();
    if labels.is_empty() {
        return Ok(());
    }

    let driving_label = labels
        .iter()
        .max_by_key(|l| {
            tree.node(node_id).ok().and_then(|n| n.edge_partition().sub_partition(l)).map(|s| s.num_edges()).unwrap_or(0)
        })
        .expect("labels is non-empty")
        .clone();

    let node = tree.node_mut(node_id)?;
    let driving_sub = node
        .edge_partition_mut()
        .sub_partition_mut(&driving_label)
        .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {driving_label}")))?;
    driving_sub.flush_cache(true)?;
    let mut driving_edges = driving_sub.load_all_edges()?;
    driving_edges.sort_by_key(|e| e.dst);
    dedup_keep_last(&mut driving_edges);

    let boundaries = compute_split_boundaries(&driving_edges, leaf_interval, split_factor);
    if boundaries.len() < 2 {
        return Ok(());
    }

    let schemas = tree.schemas().to_vec();
    let mut new_ids = Vec::with_capacity(boundaries.len());
    for interval in &boundaries {
        let id = tree.alloc_partition_id();
        tree.create_child_node(id, *interval, &schemas)?;
        new_ids.push(id);
    }

    for label in &labels {
        let node = tree.node_mut(node_id)?;
        let sub = node
            .edge_partition_mut()
            .sub_partition_mut(label)
            .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {label}")))?;

        let mut edges = if *label == driving_label {
            driving_edges.clone()
        } else {
            sub.flush_cache(true)?;
            let mut e = sub.load_all_edges()?;
            e.sort_by_key(|x| x.dst);
            dedup_keep_last(&mut e);
            e
        };

        let mut buckets: Vec<Vec<MemoryEdge>> = (0..boundaries.len()).map(|_| Vec::new()).collect();
        for edge in edges.drain(..) {
            let idx = bucket_for(edge.dst, &boundaries);
            buckets[idx].push(edge);
        }

        for (i, &cid) in new_ids.iter().enumerate() {
            let bucket = std::mem::take(&mut buckets[i]);
            if bucket.is_empty() {
                continue;
            }
            let child_interval = tree.node(cid)?.interval();
            let child_sub = tree
                .node_mut(cid)?
                .edge_partition_mut()
                .sub_partition_mut(label)
                .ok_or_else(|| Error::corruption(format!("child {cid} missing label {label}")))?;
            child_sub.merge_edges_and_flush(bucket, child_interval)?;
        }
    }

    for label in &labels {
        tree.node_mut(node_id)?
            .edge_partition_mut()
            .sub_partition_mut(label)
            .ok_or_else(|| Error::corruption(format!("node {node_id} missing label {label}")))?
            .truncate_partition()?;
    }
    tree.node_mut(node_id)?.set_children(new_ids);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::request::EdgeRequest;
    use crate::schema::MetaAttributes;
    use file_store::TempDir;
    use std::sync::Arc;

    fn schema() -> MetaAttributes {
        MetaAttributes::new("knows", 1, "person", 1, "person", 1, true)
    }

    #[test]
    fn split_then_level_grows_tree_with_disjoint_children() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(
            Config::default().with_shard_size_mb(1).with_shard_split_factor(4).with_mem_buffer_mb(1),
        );
        let mut tree = ShardTree::create(
            dir.as_ref().to_path_buf(),
            0,
            Interval::new(1, 2_000_000),
            vec![schema()],
            config,
            None,
        )
        .unwrap();

        for dst in 1..20_000u32 {
            tree.add_edge(&EdgeRequest::new("knows", dst % 997 + 1, dst).with_weight(1.0)).unwrap();
        }

        let root_children = tree.node(0).unwrap().children().to_vec();
        assert!(!root_children.is_empty(), "root should have split into children under the tiny byte budget");

        let mut prev_end: Option<u32> = None;
        for &cid in &root_children {
            let iv = tree.node(cid).unwrap().interval();
            if let Some(end) = prev_end {
                assert_eq!(iv.first, end + 1, "children must partition the interval with no gap or overlap");
            }
            prev_end = Some(iv.second);
        }
        assert_eq!(prev_end, Some(tree.node(0).unwrap().interval().second));
    }

    #[test]
    fn memtable_compaction_is_noop_when_empty() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config::default());
        let mut tree =
            ShardTree::create(dir.as_ref().to_path_buf(), 0, Interval::new(0, 100), vec![schema()], config, None).unwrap();
        Compaction::MemTable { node_id: 0 }.run(&mut tree).unwrap();
    }
}
