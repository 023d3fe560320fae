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

//! The closed error/status set the engine can return. `NotExist` and `OverLimit` are
//! ordinary control-flow branches rather than failures; everything else aborts the
//! enclosing request.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup found nothing")]
    NotExist,

    #[error("result set reached its configured limit")]
    OverLimit,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on device")]
    NoSpace,

    #[error("on-disk invariant violated: {0}")]
    Corruption(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("self loops are not supported")]
    UnSupportSelfLoop,

    #[error("schema/json error: {0}")]
    Schema(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn not_implemented<S: Into<String>>(msg: S) -> Self {
        Error::NotImplemented(msg.into())
    }

    /// `true` for statuses the design treats as ordinary branches rather than failures.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Error::NotExist | Error::OverLimit)
    }
}

/// `From<io::Error>` distinguishes `FileNotFound` (expected, often "not yet created")
/// from other OS-level failures, matching the source's FileNotFound/IOError split.
pub fn io_error_to_status(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::FileNotFound(err.to_string())
    } else {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
