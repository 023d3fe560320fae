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

//! On-disk path conventions (spec.md §6), gathered in one place the way the original
//! groups them in `res/filenames.h`.

use std::path::{Path, PathBuf};

use crate::types::Interval;

pub fn meta_dir(db_root: &Path) -> PathBuf {
    db_root.join("meta")
}

pub fn intervals_path(db_root: &Path) -> PathBuf {
    meta_dir(db_root).join("intervals")
}

/// The original keeps a `CURRENT` pointer file in `meta/` so switching to a newly
/// written `intervals` file is a single atomic rename (`res/filenames.h`
/// `FILENAME::current_name`).
pub fn current_pointer_path(db_root: &Path) -> PathBuf {
    meta_dir(db_root).join("CURRENT")
}

pub fn edge_attr_conf_path(db_root: &Path) -> PathBuf {
    meta_dir(db_root).join("edge.attr.cnf")
}

pub fn vertex_attr_conf_path(db_root: &Path) -> PathBuf {
    meta_dir(db_root).join("vertex.attr.cnf")
}

pub fn num_vertices_path(db_root: &Path) -> PathBuf {
    meta_dir(db_root).join("numvertices")
}

pub fn shard_dir(db_root: &Path, shard_id: u32) -> PathBuf {
    db_root.join(format!("shard{shard_id}"))
}

pub fn partition_dir(db_root: &Path, shard_id: u32, partition_id: u32, interval: Interval, tag: u8) -> PathBuf {
    shard_dir(db_root, shard_id)
        .join(format!("partition{partition_id}-{}-{}-{tag}", interval.first, interval.second))
}

pub fn elist_path(partition_dir: &Path) -> PathBuf {
    partition_dir.join("elist")
}

pub fn src_idx_path(partition_dir: &Path) -> PathBuf {
    partition_dir.join("elist.src.idx")
}

pub fn dst_idx_path(partition_dir: &Path) -> PathBuf {
    partition_dir.join("elist.dst.idx")
}

pub fn column_dir(partition_dir: &Path) -> PathBuf {
    partition_dir.join("elist_col")
}

pub fn column_path(partition_dir: &Path, col_name: &str) -> PathBuf {
    column_dir(partition_dir).join(col_name)
}

pub fn vertex_column_path(db_root: &Path, label: &str, col_name: &str) -> PathBuf {
    db_root.join("vdata").join(format!("prop.v.{label}.{col_name}"))
}
