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

//! Schema types: `MetaAttributes` describes one edge (or vertex) label, `ColumnDescriptor`
//! describes one of its columns. The builder shape follows the original `ColumnDescriptor`
//! (`SetName`/`SetType`/`SetFixedLength`/`SetTimeFormat`), re-expressed as chained `with_*`
//! methods returning `Self`.

use file_store::ConstSerializable;
use serde::{Deserialize, Serialize};

use crate::types::MAX_COLUMNS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Tag,
    Weight,
    Int32,
    Int64,
    Float,
    Double,
    FixedBytes,
    Time,
    Varchar,
    Group,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
    pub id: i32,
    pub value_size: usize,
    pub fixed_length: usize,
    pub time_format: String,
    pub offset_within_row: u32,
    #[serde(default)]
    pub sub_cols: Vec<ColumnDescriptor>,
}

impl ColumnDescriptor {
    /// Sentinel for an offset that has not been assigned by `MetaAttributes::add_column`
    /// yet.
    pub const INVALID_OFFSET: u32 = u32::MAX;
    pub const ID_INVALID: i32 = -1;
    pub const ID_VERTICES_TAG: i32 = -2;
    pub const ID_VERTICES_BITSET: i32 = -3;

    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        ColumnDescriptor {
            name: name.into(),
            col_type,
            id: Self::ID_INVALID,
            value_size: 0,
            fixed_length: 0,
            time_format: String::new(),
            offset_within_row: Self::INVALID_OFFSET,
            sub_cols: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_type(mut self, col_type: ColumnType) -> Self {
        self.col_type = col_type;
        self
    }

    pub fn with_fixed_length(mut self, len: usize) -> Self {
        self.fixed_length = len;
        self
    }

    pub fn with_time_format(mut self, format: impl Into<String>) -> Self {
        self.time_format = format.into();
        self
    }

    pub fn with_column_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    pub fn add_sub_col(mut self, col: ColumnDescriptor) -> Self {
        self.sub_cols.push(col);
        self
    }

    /// The number of bytes this column occupies in a fixed-property row. `Varchar`
    /// is stored as a `(u32 offset, u32 len)` pair into the companion variable-bytes
    /// buffer, per spec.
    pub fn compute_value_size(&self) -> usize {
        match self.col_type {
            ColumnType::Tag => 1,
            ColumnType::Weight => 4,
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
            ColumnType::Float => 4,
            ColumnType::Double => 8,
            ColumnType::Time => 8,
            ColumnType::Varchar => 8,
            ColumnType::FixedBytes => self.fixed_length,
            ColumnType::Group => self.sub_cols.iter().map(|c| c.compute_value_size()).sum(),
            ColumnType::None => 0,
        }
    }
}

/// Schema for one edge-label (or vertex-label): `(label, tag, src_label, src_tag,
/// dst_label, dst_tag, is_weighted, cols[])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAttributes {
    pub label: String,
    pub tag: u8,
    pub src_label: String,
    pub src_tag: u8,
    pub dst_label: String,
    pub dst_tag: u8,
    pub is_weighted: bool,
    pub cols: Vec<ColumnDescriptor>,
}

impl MetaAttributes {
    pub fn new(
        label: impl Into<String>,
        tag: u8,
        src_label: impl Into<String>,
        src_tag: u8,
        dst_label: impl Into<String>,
        dst_tag: u8,
        is_weighted: bool,
    ) -> Self {
        MetaAttributes {
            label: label.into(),
            tag,
            src_label: src_label.into(),
            src_tag,
            dst_label: dst_label.into(),
            dst_tag,
            is_weighted,
            cols: Vec::new(),
        }
    }

    /// Appends a column, assigning it the next free column id and the current
    /// fixed-row-length as its `offset_within_row`. Used both at schema-registration
    /// time and by `SubEdgePartition::create_edge_attr_col`.
    pub fn add_column(&mut self, mut desc: ColumnDescriptor) -> crate::error::Result<&ColumnDescriptor> {
        if self.cols.len() >= MAX_COLUMNS {
            return Err(crate::error::Error::invalid_argument(
                "schema already declares the engine-wide maximum number of columns",
            ));
        }
        desc.value_size = desc.compute_value_size();
        desc.offset_within_row = self.fixed_row_len() as u32;
        desc.id = self.cols.len() as i32;
        self.cols.push(desc);
        Ok(self.cols.last().unwrap())
    }

    pub fn fixed_row_len(&self) -> usize {
        self.cols.iter().map(|c| c.value_size).sum()
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.cols.iter().find(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: i32) -> Option<&ColumnDescriptor> {
        self.cols.iter().find(|c| c.id == id)
    }
}

/// `(max_allocated_vid, num_vertices, storage_capacity_vid)` sidecar; the engine reads
/// and writes it through but never interprets its contents, since vertex-id encoding
/// is owned by an external collaborator (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NumVertices {
    pub max_allocated_vid: u64,
    pub num_vertices: u64,
    pub storage_capacity_vid: u64,
}

impl ConstSerializable for NumVertices {
    const BYTES: usize = 24;

    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.max_allocated_vid.to_le_bytes());
        buf.extend_from_slice(&self.num_vertices.to_le_bytes());
        buf.extend_from_slice(&self.storage_capacity_vid.to_le_bytes());
    }

    fn deserialize(buf: &[u8]) -> Self {
        NumVertices {
            max_allocated_vid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            num_vertices: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            storage_capacity_vid: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Reserved vertex-attribute column names the original engine always recognizes.
/// The vertex-attribute store itself is out of core scope (spec.md §1); this trait is
/// the narrow contract a real implementation would satisfy, kept here only so the
/// names don't have to be invented twice.
pub const GFS_VERTEX_COLUMN_NAME_DEGREE: &str = "__degree__";
pub const GFS_VERTEX_COLUMN_NAME_TAG: &str = "__tag__";

pub trait VertexColumnStore {
    fn get_vertex_attribute(&self, vid: u32, col: &str, out: &mut Vec<u8>) -> crate::error::Result<()>;
    fn set_vertex_attribute(&mut self, vid: u32, col: &str, value: &[u8]) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_column_assigns_offsets_sequentially() {
        let mut meta = MetaAttributes::new("knows", 1, "person", 1, "person", 1, true);
        meta.add_column(ColumnDescriptor::new("since", ColumnType::Time))
            .unwrap();
        meta.add_column(ColumnDescriptor::new("note", ColumnType::FixedBytes).with_fixed_length(8))
            .unwrap();

        assert_eq!(meta.cols[0].offset_within_row, 0);
        assert_eq!(meta.cols[0].value_size, 8);
        assert_eq!(meta.cols[1].offset_within_row, 8);
        assert_eq!(meta.cols[1].value_size, 8);
        assert_eq!(meta.fixed_row_len(), 16);
    }

    #[test]
    fn group_column_size_sums_sub_cols() {
        let group = ColumnDescriptor::new("g", ColumnType::Group)
            .add_sub_col(ColumnDescriptor::new("a", ColumnType::Int32))
            .add_sub_col(ColumnDescriptor::new("b", ColumnType::Double));
        assert_eq!(group.compute_value_size(), 12);
    }
}
