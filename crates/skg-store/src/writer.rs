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

//! SubPartition writer (C9): given a sorted, deduplicated edge vector, writes the
//! triple `(elist, elist.src.idx, elist.dst.idx)` plus every property column.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use file_store::ConstSerializable;
use rustc_hash::FxHashMap;

use crate::edge_list::VidIndexWriter;
use crate::error::Result;
use crate::layout;
use crate::schema::MetaAttributes;
use crate::types::{MemoryEdge, PersistentEdge, ABSENT_ORDINAL};

/// Sorts by `(src, dst)`, deduplicates by `(src, dst, tag)` keeping the later
/// occurrence (I3), logging each dropped duplicate.
fn sort_and_dedup(mut edges: Vec<MemoryEdge>) -> Vec<MemoryEdge> {
    edges.sort_by(|a, b| (a.src, a.dst).cmp(&(b.src, b.dst)));

    let mut deduped: Vec<MemoryEdge> = Vec::with_capacity(edges.len());
    let mut duplicate_count = 0usize;
    for e in edges {
        if let Some(last) = deduped.last() {
            if last.key() == e.key() {
                tracing::debug!(src = e.src, dst = e.dst, tag = e.tag, "dropping duplicate edge");
                duplicate_count += 1;
                *deduped.last_mut().unwrap() = e;
                continue;
            }
        }
        deduped.push(e);
    }
    if duplicate_count > 0 {
        tracing::info!(duplicate_count, "removed duplicate edges during sub-partition write");
    }
    deduped
}

/// Writes `edges` (already sorted+deduped, e.g. by `sort_and_dedup`) into `dir` as
/// the final on-disk triple plus column files, per spec.md §4.9 steps 3-6.
fn write_sorted(dir: &Path, edges: &[MemoryEdge], schema: &MetaAttributes) -> Result<()> {
    let n = edges.len();

    // step 3: LIFO stack of ordinals per dst, populated by reverse iteration so each
    // stack's top is the smallest ordinal sharing that dst.
    let mut aux: FxHashMap<u32, Vec<usize>> = FxHashMap::default();
    for i in (0..n).rev() {
        aux.entry(edges[i].dst).or_default().push(i);
    }

    std::fs::create_dir_all(dir).map_err(crate::error::io_error_to_status)?;
    std::fs::create_dir_all(layout::column_dir(dir)).map_err(crate::error::io_error_to_status)?;

    // step 4: seed the dst-index file in ascending dst order.
    let mut dst_dsts: Vec<u32> = aux.keys().copied().collect();
    dst_dsts.sort_unstable();
    let mut dst_writer = VidIndexWriter::create(layout::dst_idx_path(dir))?;
    for dst in dst_dsts {
        if let Some(stack) = aux.get_mut(&dst) {
            if let Some(first_ordinal) = stack.pop() {
                dst_writer.write(dst, first_ordinal as u32)?;
            }
        }
    }
    dst_writer.finish()?;

    // pre-size every column file to n * value_size bytes.
    let mut column_files: Vec<File> = Vec::with_capacity(schema.cols.len());
    for col in &schema.cols {
        let path = layout::column_path(dir, &col.name);
        let file = File::create(&path).map_err(crate::error::io_error_to_status)?;
        file.set_len((n * col.value_size) as u64).map_err(crate::error::io_error_to_status)?;
        column_files.push(file);
    }

    let mut src_writer = VidIndexWriter::create(layout::src_idx_path(dir))?;
    let mut elist_file = File::create(layout::elist_path(dir)).map_err(crate::error::io_error_to_status)?;
    let mut elist_buf = Vec::with_capacity(n * PersistentEdge::BYTES);

    let mut current_run: Option<(u32, usize)> = None;

    for (i, e) in edges.iter().enumerate() {
        // step 5a: column values in lockstep with ordinal.
        for (col_idx, col) in schema.cols.iter().enumerate() {
            if e.properties_bitset.get(col.id.max(0) as usize)? {
                let off = col.offset_within_row as usize;
                let bytes = &e.fixed_props[off..off + col.value_size];
                column_files[col_idx]
                    .seek(SeekFrom::Start((i * col.value_size) as u64))
                    .map_err(crate::error::io_error_to_status)?;
                column_files[col_idx].write_all(bytes).map_err(crate::error::io_error_to_status)?;
            }
        }

        // step 5b: start a new src run, closing out the previous one.
        match current_run {
            Some((run_src, _)) if run_src == e.src => {}
            _ => {
                if let Some((run_src, run_start)) = current_run.take() {
                    src_writer.write(run_src, run_start as u32)?;
                }
                current_run = Some((e.src, i));
            }
        }

        // step 5c: the row's `next` is the next-smallest ordinal sharing this dst.
        let next = aux.get_mut(&e.dst).and_then(|s| s.pop()).unwrap_or(ABSENT_ORDINAL as usize) as u32;

        // step 5d.
        let persistent = PersistentEdge {
            src: e.src,
            dst: e.dst,
            weight: e.weight,
            tag: e.tag,
            next_or_flags: next,
            properties_bitset: e.properties_bitset,
        };
        persistent.serialize(&mut elist_buf);
    }

    if let Some((run_src, run_start)) = current_run {
        src_writer.write(run_src, run_start as u32)?;
    }

    elist_file.write_all(&elist_buf).map_err(crate::error::io_error_to_status)?;
    src_writer.finish()?;
    for mut f in column_files {
        f.flush().map_err(crate::error::io_error_to_status)?;
    }

    Ok(())
}

/// The full C9 algorithm: sort, dedup, then write.
pub fn write_sub_partition(dir: &Path, edges: Vec<MemoryEdge>, schema: &MetaAttributes) -> Result<()> {
    let edges = sort_and_dedup(edges);
    write_sorted(dir, &edges, schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge_list::{EdgeListReader, VidIndex};
    use crate::schema::{ColumnDescriptor, ColumnType};
    use file_store::TempDir;

    fn schema() -> MetaAttributes {
        let mut s = MetaAttributes::new("knows", 1, "person", 1, "person", 1, true);
        s.add_column(ColumnDescriptor::new("since", ColumnType::Int64)).unwrap();
        s
    }

    #[test]
    fn writes_sorted_chain_and_indexes() {
        let dir = TempDir::new().unwrap();
        let schema = schema();
        let mut edges = Vec::new();
        // two edges into dst=5 from different sources, one edge into dst=6
        for (src, dst) in [(1u32, 5u32), (2, 5), (3, 6)] {
            edges.push(MemoryEdge::new(src, dst, 1.0, 0, schema.fixed_row_len()));
        }

        write_sub_partition(dir.as_ref(), edges, &schema).unwrap();

        let mut elist = EdgeListReader::open(layout::elist_path(dir.as_ref()), false, true).unwrap();
        assert_eq!(elist.num_edges(), 3);

        let dst_idx = VidIndex::open(layout::dst_idx_path(dir.as_ref())).unwrap();
        let first = dst_idx.first_in(5);
        assert_ne!(first, ABSENT_ORDINAL);
        let row0 = elist.get(first as usize).unwrap();
        assert_eq!(row0.dst, 5);
        let next = row0.next_ordinal();
        assert_ne!(next, ABSENT_ORDINAL, "two edges share dst=5, chain must continue");
        let row1 = elist.get(next as usize).unwrap();
        assert_eq!(row1.dst, 5);
        assert_eq!(row1.next_ordinal(), ABSENT_ORDINAL);

        let src_idx = VidIndex::open(layout::src_idx_path(dir.as_ref())).unwrap();
        let (first, past_last) = src_idx.out_range(1, 3).unwrap();
        assert_eq!(past_last - first, 1);
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let dir = TempDir::new().unwrap();
        let schema = schema();
        let e1 = MemoryEdge::new(1, 2, 0.1, 0, schema.fixed_row_len());
        let e2 = MemoryEdge::new(1, 2, 0.2, 0, schema.fixed_row_len());

        write_sub_partition(dir.as_ref(), vec![e1, e2], &schema).unwrap();

        let mut elist = EdgeListReader::open(layout::elist_path(dir.as_ref()), false, true).unwrap();
        assert_eq!(elist.num_edges(), 1);
        assert_eq!(elist.get(0).unwrap().weight, 0.2);
    }
}
