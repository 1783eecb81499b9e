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

//! Account model, layered configuration, error taxonomy, and the Signal
//! service / Key Backup Service client contracts the registration core
//! drives but does not itself implement.

pub mod account;
pub mod config;
pub mod error;
pub mod kbs;
pub mod service;

pub use account::SignalAccount;
pub use config::Config;
pub use error::{CoreError, ExitCode, Result};
