// This file is part of the non-uniform MS tile engine.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The tagged error sum shared by every crate in the workspace. Every
//! fallible operation returns `Result<T, Error>` (aliased `Result<T>` in
//! each crate) so that callers can match on the kind instead of string
//! sniffing, per the propagation policy in the design's error handling
//! section.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("could not open file {path:?}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite operation failed")]
    SqliteExec(#[from] rusqlite::Error),

    #[error("sqlite store is missing expected content: {0}")]
    SqliteMissingContent(String),

    #[error("function not implemented: {0}")]
    FunctionNotImplemented(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    pub fn missing_content(msg: impl Into<String>) -> Self {
        Error::SqliteMissingContent(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Error::FunctionNotImplemented(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_parameter_message_round_trips() {
        let err = Error::bad_parameter("reversed range");
        assert_eq!(err.to_string(), "bad parameter: reversed range");
    }
}
