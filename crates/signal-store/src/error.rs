// signal-store
// Copyright (C) 2025 Throneless Tech
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use libsignal_protocol::SignalProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("recipient address must carry a uuid, a number, or both")]
    EmptyAddress,
    #[error("not a valid E.164 number: `{0}`")]
    InvalidNumber(String),
    #[error("recipient store file is corrupt: {0}")]
    Corrupt(String),
    #[error("redirection chain for id {0} exceeded the live recipient count")]
    MergeCycle(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for SignalProtocolError {
    fn from(error: StoreError) -> Self {
        tracing::error!(%error, "recipient store error");
        SignalProtocolError::InvalidState("recipient store error", error.to_string())
    }
}
