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

//! The per-partition write buffer (C4): two backends sharing one contract, dispatched
//! through a tagged enum (spec.md §9).

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::request::PropertyValue;
use crate::schema::MetaAttributes;
use crate::types::{Interval, MemoryEdge};

/// Deleted-key sentinel inherited from the sparsehash library the source used for its
/// hash backend (spec.md §9 Open Questions). A legitimate vertex id may never collide
/// with it: `add_edge`/`set_edge_attributes` reject `(u32::MAX, u32::MAX)` outright.
pub const HASH_FORBIDDEN_KEY: (u32, u32) = (u32::MAX, u32::MAX);

/// Applies the property-reorder rule: each supplied value is written at the byte
/// offset the *partition schema's* column descriptor dictates, zeroing prior content
/// first. A name absent from the schema is silently ignored with a debug log; a value
/// wider than the column's `value_size` is truncated at the prefix.
pub fn write_properties(edge: &mut MemoryEdge, props: &[PropertyValue], schema: &MetaAttributes) -> Result<()> {
    for p in props {
        match schema.find_column(&p.name) {
            Some(col) => {
                let off = col.offset_within_row as usize;
                let vs = col.value_size;
                if off + vs > edge.fixed_props.len() {
                    return Err(Error::corruption(format!(
                        "column {} offset {off}+{vs} exceeds row length {}",
                        col.name,
                        edge.fixed_props.len()
                    )));
                }
                edge.fixed_props[off..off + vs].fill(0);
                let n = p.bytes.len().min(vs);
                edge.fixed_props[off..off + n].copy_from_slice(&p.bytes[..n]);
                edge.properties_bitset.set(col.id.max(0) as usize)?;
            }
            None => {
                tracing::debug!(column = %p.name, "property not declared in schema; ignored");
            }
        }
    }
    Ok(())
}

fn is_live(e: &MemoryEdge) -> bool {
    !e.tombstoned
}

/// `Vec<MemoryEdge>`-backed memtable. All lookups scan linearly; `add_edge` overwrites
/// an existing `(src,dst,tag)` row in place rather than appending a duplicate, so
/// reads stay consistent before the next flush performs the formal I3 dedup.
#[derive(Debug, Default)]
pub struct VecMemTable {
    edges: Vec<MemoryEdge>,
    interval: Interval,
}

/// `(src,dst) -> MemoryEdge` hash-backed memtable. Point lookups are O(1);
/// range/neighborhood lookups still scan, since the map is not indexed by `src` alone.
#[derive(Debug, Default)]
pub struct HashMemTable {
    edges: FxHashMap<(u32, u32), MemoryEdge>,
    interval: Interval,
}

pub enum MemTable {
    Vec(VecMemTable),
    Hash(HashMemTable),
}

impl MemTable {
    pub fn new_vec(interval: Interval) -> Self {
        MemTable::Vec(VecMemTable { edges: Vec::new(), interval })
    }

    pub fn new_hash(interval: Interval) -> Self {
        MemTable::Hash(HashMemTable { edges: FxHashMap::default(), interval })
    }

    pub fn interval(&self) -> Interval {
        match self {
            MemTable::Vec(m) => m.interval,
            MemTable::Hash(m) => m.interval,
        }
    }

    fn guard_forbidden_key(&self, src: u32, dst: u32) -> Result<()> {
        if matches!(self, MemTable::Hash(_)) && (src, dst) == HASH_FORBIDDEN_KEY {
            return Err(Error::invalid_argument(
                "(u32::MAX, u32::MAX) is reserved as the hash memtable's deleted-key sentinel",
            ));
        }
        Ok(())
    }

    /// Adds or overwrites the row keyed by `(edge.src, edge.dst, edge.tag)`. Extends
    /// the memtable's interval to cover `edge.dst` (I5).
    pub fn add_edge(&mut self, edge: MemoryEdge) -> Result<()> {
        self.guard_forbidden_key(edge.src, edge.dst)?;
        match self {
            MemTable::Vec(m) => {
                if let Some(existing) = m.edges.iter_mut().find(|e| e.key() == edge.key()) {
                    *existing = edge.clone();
                } else {
                    m.edges.push(edge.clone());
                }
                m.interval.extend_to(edge.dst);
            }
            MemTable::Hash(m) => {
                m.interval.extend_to(edge.dst);
                m.edges.insert((edge.src, edge.dst), edge);
            }
        }
        Ok(())
    }

    pub fn delete_edge(&mut self, src: u32, dst: u32, tag: u8) -> Result<()> {
        match self {
            MemTable::Vec(m) => {
                let pos = m.edges.iter().position(|e| e.src == src && e.dst == dst && e.tag == tag);
                match pos {
                    Some(pos) => {
                        m.edges.remove(pos);
                        Ok(())
                    }
                    None => Err(Error::NotExist),
                }
            }
            MemTable::Hash(m) => match m.edges.remove(&(src, dst)) {
                Some(_) => Ok(()),
                None => Err(Error::NotExist),
            },
        }
    }

    pub fn set_edge_attributes(
        &mut self,
        src: u32,
        dst: u32,
        tag: u8,
        weight: Option<f32>,
        props: &[PropertyValue],
        schema: &MetaAttributes,
    ) -> Result<()> {
        let edge = self.find_mut(src, dst, tag).ok_or(Error::NotExist)?;
        if let Some(w) = weight {
            edge.weight = w;
        }
        write_properties(edge, props, schema)
    }

    pub fn get_edge_attributes(&self, src: u32, dst: u32, tag: u8) -> Option<&MemoryEdge> {
        self.find(src, dst, tag).filter(|e| is_live(e))
    }

    fn find(&self, src: u32, dst: u32, tag: u8) -> Option<&MemoryEdge> {
        match self {
            MemTable::Vec(m) => m.edges.iter().find(|e| e.src == src && e.dst == dst && e.tag == tag),
            MemTable::Hash(m) => m.edges.get(&(src, dst)).filter(|e| e.tag == tag),
        }
    }

    fn find_mut(&mut self, src: u32, dst: u32, tag: u8) -> Option<&mut MemoryEdge> {
        match self {
            MemTable::Vec(m) => m.edges.iter_mut().find(|e| e.src == src && e.dst == dst && e.tag == tag),
            MemTable::Hash(m) => m.edges.get_mut(&(src, dst)).filter(|e| e.tag == tag),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &MemoryEdge> + '_> {
        match self {
            MemTable::Vec(m) => Box::new(m.edges.iter()),
            MemTable::Hash(m) => Box::new(m.edges.values()),
        }
    }

    pub fn get_out_edges(&self, src: u32) -> Vec<&MemoryEdge> {
        self.iter().filter(|e| e.src == src && is_live(e)).collect()
    }

    pub fn get_in_edges(&self, dst: u32) -> Vec<&MemoryEdge> {
        self.iter().filter(|e| e.dst == dst && is_live(e)).collect()
    }

    pub fn get_both_edges(&self, v: u32) -> Vec<&MemoryEdge> {
        self.iter().filter(|e| (e.src == v || e.dst == v) && is_live(e)).collect()
    }

    pub fn get_out_degree(&self, src: u32) -> usize {
        self.get_out_edges(src).len()
    }

    pub fn get_in_degree(&self, dst: u32) -> usize {
        self.get_in_edges(dst).len()
    }

    /// Removes every row touching `v` as either endpoint. MemTable rows are transient
    /// pre-flush state, so deletion removes them outright rather than tombstoning.
    pub fn delete_vertex(&mut self, v: u32) -> Result<()> {
        match self {
            MemTable::Vec(m) => m.edges.retain(|e| e.src != v && e.dst != v),
            MemTable::Hash(m) => m.edges.retain(|_, e| e.src != v && e.dst != v),
        }
        Ok(())
    }

    pub fn num_edges(&self) -> usize {
        match self {
            MemTable::Vec(m) => m.edges.len(),
            MemTable::Hash(m) => m.edges.len(),
        }
    }

    /// `num_edges * (key_overhead + weight + schema.fixed_bytes_len)`; a heuristic,
    /// not a measurement.
    pub fn estimated_bytes(&self, fixed_row_len: usize) -> usize {
        let key_overhead = match self {
            MemTable::Vec(_) => 0,
            MemTable::Hash(_) => std::mem::size_of::<(u32, u32)>(),
        };
        self.num_edges() * (key_overhead + std::mem::size_of::<f32>() + fixed_row_len)
    }

    pub fn is_full(&self, fixed_row_len: usize, mem_buffer_mb: usize) -> bool {
        self.estimated_bytes(fixed_row_len) > mem_buffer_mb * 1024 * 1024
    }

    /// Swaps the backing store out, returning every buffered row and the interval
    /// the buffer had grown to.
    pub fn extract_all(&mut self) -> (Vec<MemoryEdge>, Interval) {
        match self {
            MemTable::Vec(m) => {
                let edges = std::mem::take(&mut m.edges);
                (edges, m.interval)
            }
            MemTable::Hash(m) => {
                let edges: Vec<MemoryEdge> = std::mem::take(&mut m.edges).into_values().collect();
                (edges, m.interval)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ColumnType};

    fn schema() -> MetaAttributes {
        let mut s = MetaAttributes::new("knows", 1, "person", 1, "person", 1, true);
        s.add_column(ColumnDescriptor::new("since", ColumnType::Int64)).unwrap();
        s
    }

    #[test]
    fn vec_memtable_add_overwrite_delete() {
        let schema = schema();
        let mut mt = MemTable::new_vec(Interval::new(0, 100));

        let mut e1 = MemoryEdge::new(1, 2, 0.1, 0, schema.fixed_row_len());
        write_properties(&mut e1, &[PropertyValue::new("since", 10i64.to_le_bytes())], &schema).unwrap();
        mt.add_edge(e1).unwrap();

        let mut e2 = MemoryEdge::new(1, 2, 0.2, 0, schema.fixed_row_len());
        write_properties(&mut e2, &[PropertyValue::new("since", 20i64.to_le_bytes())], &schema).unwrap();
        mt.add_edge(e2).unwrap();

        assert_eq!(mt.num_edges(), 1, "add_edge overwrites an existing key rather than duplicating");
        let got = mt.get_edge_attributes(1, 2, 0).unwrap();
        assert_eq!(got.weight, 0.2);

        mt.delete_edge(1, 2, 0).unwrap();
        assert!(mt.get_edge_attributes(1, 2, 0).is_none());
        assert!(matches!(mt.delete_edge(1, 2, 0), Err(Error::NotExist)));
    }

    #[test]
    fn hash_memtable_rejects_forbidden_key() {
        let mut mt = MemTable::new_hash(Interval::new(0, 100));
        let e = MemoryEdge::new(u32::MAX, u32::MAX, 1.0, 0, 0);
        assert!(matches!(mt.add_edge(e), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn delete_vertex_removes_both_directions() {
        let mut mt = MemTable::new_vec(Interval::new(0, 100));
        mt.add_edge(MemoryEdge::new(1, 2, 0.0, 0, 0)).unwrap();
        mt.add_edge(MemoryEdge::new(2, 3, 0.0, 0, 0)).unwrap();
        mt.add_edge(MemoryEdge::new(4, 5, 0.0, 0, 0)).unwrap();

        mt.delete_vertex(2).unwrap();
        assert_eq!(mt.num_edges(), 1);
        assert!(mt.get_edge_attributes(4, 5, 0).is_some());
    }

    #[test]
    fn property_reorder_rule_ignores_unknown_truncates_wide() {
        let schema = schema();
        let mut edge = MemoryEdge::new(1, 2, 0.0, 0, schema.fixed_row_len());
        write_properties(
            &mut edge,
            &[
                PropertyValue::new("since", vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 9]),
                PropertyValue::new("nonexistent", vec![1]),
            ],
            &schema,
        )
        .unwrap();
        assert_eq!(&edge.fixed_props[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(edge.properties_bitset.get(0).unwrap());
    }
}
