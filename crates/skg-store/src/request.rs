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

//! Request/result types for the in-process API surface (spec.md §6).

use crate::types::MemoryEdge;

/// One named property value supplied by a caller; matched against the destination
/// schema's column descriptor by name, not by the order it appears in here.
#[derive(Debug, Clone)]
pub struct PropertyValue {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl PropertyValue {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        PropertyValue { name: name.into(), bytes: bytes.into() }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub label: String,
    pub src: u32,
    pub dst: u32,
    pub tag: u8,
    pub weight: f32,
    pub properties: Vec<PropertyValue>,
    /// Add-edge only: if set, an existing `(src,dst,tag)` row is updated in place
    /// instead of a new row being appended (spec.md §4.7's "check_exist" flag).
    pub check_exist: bool,
    /// Set-edge-attributes only: if set and no partition holds the row, fall back to
    /// `add_edge`.
    pub create_if_not_exist: bool,
    pub limit: Option<usize>,
}

impl EdgeRequest {
    pub fn new(label: impl Into<String>, src: u32, dst: u32) -> Self {
        EdgeRequest {
            label: label.into(),
            src,
            dst,
            tag: 0,
            weight: 0.0,
            properties: Vec::new(),
            check_exist: false,
            create_if_not_exist: false,
            limit: None,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.properties.push(PropertyValue::new(name, bytes));
        self
    }

    pub fn with_check_exist(mut self, check_exist: bool) -> Self {
        self.check_exist = check_exist;
        self
    }

    pub fn with_create_if_not_exist(mut self, create: bool) -> Self {
        self.create_if_not_exist = create;
        self
    }

    pub fn key(&self) -> (u32, u32, u8) {
        (self.src, self.dst, self.tag)
    }
}

/// A decoded row of an edge query result: weight plus column-name-keyed property
/// bytes (present only for non-null columns, per I6).
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub src: u32,
    pub dst: u32,
    pub tag: u8,
    pub weight: f32,
    pub properties: Vec<(String, Vec<u8>)>,
}

impl EdgeRow {
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, b)| b.as_slice())
    }
}

/// A row-cursor result set. `over_limit` is set when the configured result-size cap
/// was hit; per spec.md §7 this counts as success, not failure.
#[derive(Debug, Clone, Default)]
pub struct EdgeResultSet {
    pub rows: Vec<EdgeRow>,
    pub over_limit: bool,
}

impl EdgeResultSet {
    pub fn push(&mut self, row: EdgeRow, limit: Option<usize>) -> bool {
        self.rows.push(row);
        if let Some(limit) = limit {
            if self.rows.len() >= limit {
                self.over_limit = true;
                return true;
            }
        }
        false
    }
}

pub(crate) fn memory_edge_to_row(edge: &MemoryEdge, schema: &crate::schema::MetaAttributes) -> EdgeRow {
    let mut properties = Vec::new();
    for col in &schema.cols {
        let id = col.id.max(0) as usize;
        if edge.properties_bitset.get(id).unwrap_or(false) {
            let off = col.offset_within_row as usize;
            let bytes = edge.fixed_props[off..off + col.value_size].to_vec();
            properties.push((col.name.clone(), bytes));
        }
    }
    EdgeRow { src: edge.src, dst: edge.dst, tag: edge.tag, weight: edge.weight, properties }
}
