// signal-common
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

use thiserror::Error;

/// The full error taxonomy of the core: bad input, server-side challenges,
/// transport failures, and a catch-all for assertion violations. Each
/// variant maps to exactly one process exit code via [`CoreError::exit_code`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    UserError(String),
    #[error("CAPTCHA required: {0}")]
    CaptchaRequired(String),
    #[error("registration lock in force, {time_remaining_secs}s remaining")]
    PinLocked { time_remaining_secs: u64 },
    #[error("incorrect PIN, {tries_remaining} tries remaining")]
    IncorrectPin { tries_remaining: u32 },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("untrusted identity key for {address}")]
    UntrustedKey { address: String },
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("recipient store error: {0}")]
    Store(signal_store::StoreError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}

/// `MergeCycle` is the recipient store's acyclicity assertion failing, not
/// an ordinary storage fault — it gets its own `CoreError::Unexpected`
/// mapping rather than falling into the blanket I/O bucket. See spec §7, §9.
impl From<signal_store::StoreError> for CoreError {
    fn from(error: signal_store::StoreError) -> Self {
        match error {
            signal_store::StoreError::MergeCycle(id) => {
                CoreError::Unexpected(format!("redirection chain for recipient {id} is cyclic"))
            }
            other => CoreError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Process exit codes contributed by the core, per the error taxonomy.
/// Only the CLI's outermost boundary should read this; library code
/// never calls `std::process::exit` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    UserError = 1,
    Unexpected = 2,
    Io = 3,
    UntrustedKey = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl CoreError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CoreError::UserError(_)
            | CoreError::CaptchaRequired(_)
            | CoreError::PinLocked { .. }
            | CoreError::IncorrectPin { .. } => ExitCode::UserError,
            CoreError::Io(_)
            | CoreError::File(_)
            | CoreError::Config(_)
            | CoreError::Store(_)
            | CoreError::Json(_) => ExitCode::Io,
            CoreError::UntrustedKey { .. } => ExitCode::UntrustedKey,
            CoreError::Unexpected(_) => ExitCode::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_cycle_exits_unexpected_not_io() {
        let error: CoreError = signal_store::StoreError::MergeCycle(7).into();
        assert!(matches!(error, CoreError::Unexpected(_)));
        assert_eq!(error.exit_code(), ExitCode::Unexpected);
    }

    #[test]
    fn ordinary_store_error_still_exits_io() {
        let error: CoreError = signal_store::StoreError::Corrupt("bad".to_owned()).into();
        assert!(matches!(error, CoreError::Store(_)));
        assert_eq!(error.exit_code(), ExitCode::Io);
    }
}
