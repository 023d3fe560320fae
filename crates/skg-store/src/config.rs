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

//! Engine configuration (spec.md §6's options table), built with a `WebgraphBuilder`-
//! style chained `with_*` API.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableType {
    Vec,
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Long,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnBackend {
    Mmap,
    Blocks,
    Raw,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mem_buffer_mb: usize,
    pub shard_size_mb: usize,
    pub shard_split_factor: usize,
    pub mem_table_type: MemTableType,
    pub edata_cache_mb: usize,
    pub use_mmap_read: bool,
    pub use_mmap_populate: bool,
    pub use_mmap_locked: bool,
    pub use_elias_gamma_compress: bool,
    pub max_interval_length: u32,
    pub id_type: IdType,
    pub column_backend: ColumnBackend,
    pub block_size: usize,
    pub need_ensure_uniq_on_merge: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mem_buffer_mb: 64,
            shard_size_mb: 256,
            shard_split_factor: 4,
            mem_table_type: MemTableType::Vec,
            edata_cache_mb: 32,
            use_mmap_read: true,
            use_mmap_populate: false,
            use_mmap_locked: false,
            use_elias_gamma_compress: false,
            max_interval_length: u32::MAX,
            id_type: IdType::Long,
            column_backend: ColumnBackend::Mmap,
            block_size: 4096,
            need_ensure_uniq_on_merge: false,
        }
    }
}

impl Config {
    pub fn with_mem_buffer_mb(mut self, v: usize) -> Self {
        self.mem_buffer_mb = v;
        self
    }

    pub fn with_shard_size_mb(mut self, v: usize) -> Self {
        self.shard_size_mb = v;
        self
    }

    pub fn with_shard_split_factor(mut self, v: usize) -> Self {
        self.shard_split_factor = v;
        self
    }

    pub fn with_mem_table_type(mut self, v: MemTableType) -> Self {
        self.mem_table_type = v;
        self
    }

    pub fn with_edata_cache_mb(mut self, v: usize) -> Self {
        self.edata_cache_mb = v;
        self
    }

    pub fn with_use_mmap_read(mut self, v: bool) -> Self {
        self.use_mmap_read = v;
        self
    }

    pub fn with_use_elias_gamma_compress(mut self, v: bool) -> Self {
        self.use_elias_gamma_compress = v;
        self
    }

    pub fn with_max_interval_length(mut self, v: u32) -> Self {
        self.max_interval_length = v;
        self
    }

    pub fn with_column_backend(mut self, v: ColumnBackend) -> Self {
        self.column_backend = v;
        self
    }

    /// `is_need_compact`'s denominator reflects a two-level balance: root plus
    /// `shard_split_factor` children.
    pub fn compact_threshold_bytes(&self) -> usize {
        (self.shard_size_mb * 1024 * 1024) / (1 + self.shard_split_factor)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.use_elias_gamma_compress {
            return Err(crate::error::Error::not_implemented(
                "Elias-Gamma compressed src-idx format is not implemented by this build",
            ));
        }
        Ok(())
    }
}
