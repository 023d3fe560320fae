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

//! A collection of simple disk-based data structures.

pub type Result<T> = std::result::Result<T, anyhow::Error>;

pub mod const_serializable;
pub mod owned_bytes;
pub mod peekable;
pub mod random_lookup;
pub mod temp;

pub use const_serializable::ConstSerializable;
pub use owned_bytes::OwnedBytes;
pub use peekable::Peekable;
pub use temp::{TempDir, TempFile};

pub(crate) fn gen_temp_path() -> std::path::PathBuf {
    std::env::temp_dir().join(uuid::Uuid::new_v4().to_string())
}
