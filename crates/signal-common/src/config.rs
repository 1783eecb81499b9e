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

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Layered configuration: built-in defaults, overridden by a TOML file,
/// overridden by `SIGNAL_`-prefixed environment variables, overridden by
/// whatever the CLI parsed — same precedence `bitpart`'s `main.rs` uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_url: String,
    pub storage_url: String,
    pub cdn_url: String,
    pub data_dir: PathBuf,
    pub voice_verification: bool,
    pub locale: String,
    pub mrenclave: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("org", "signal", "signal-cli")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".signal-cli"));
        Self {
            service_url: "https://chat.signal.org".to_owned(),
            storage_url: "https://storage.signal.org".to_owned(),
            cdn_url: "https://cdn.signal.org".to_owned(),
            data_dir,
            voice_verification: false,
            locale: "en-US".to_owned(),
            mrenclave: String::new(),
        }
    }
}

impl Config {
    pub fn recipient_store_path(&self) -> PathBuf {
        self.data_dir.join("recipients.json")
    }

    pub fn account_path(&self) -> PathBuf {
        self.data_dir.join("account.json")
    }

    /// Merge defaults, an optional TOML file, `SIGNAL_`-prefixed env vars,
    /// and CLI-parsed overrides, in that order of increasing precedence.
    pub fn load<O: Serialize>(config_path: Option<&Path>, cli_overrides: &O) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment
            .merge(Env::prefixed("SIGNAL_"))
            .merge(Serialized::defaults(cli_overrides));
        Ok(figment.extract()?)
    }
}
