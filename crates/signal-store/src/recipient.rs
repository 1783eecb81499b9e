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

use serde::{Deserialize, Serialize};

use crate::address::RecipientAddress;

/// Opaque, monotonically-assigned identifier for a recipient. Once merged,
/// an id is never reused as a live id again — see [`crate::store::RecipientStore::actual_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipientId(pub u64);

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub color: Option<String>,
    pub message_expiration_time: u32,
    pub blocked: bool,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnidentifiedAccessMode {
    Unknown,
    Disabled,
    Enabled,
    Unrestricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Gv2,
    Storage,
    Gv1Migration,
}

impl Capability {
    /// Unknown capability names are silently dropped — see spec §9 (open
    /// question: capability enum evolution).
    fn parse(name: &str) -> Option<Self> {
        match name {
            "GV2" => Some(Self::Gv2),
            "STORAGE" => Some(Self::Storage),
            "GV1_MIGRATION" => Some(Self::Gv1Migration),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Gv2 => "GV2",
            Self::Storage => "STORAGE",
            Self::Gv1Migration => "GV1_MIGRATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub last_update_timestamp: u64,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub about: Option<String>,
    pub about_emoji: Option<String>,
    pub avatar_url_path: Option<String>,
    pub unidentified_access_mode: UnidentifiedAccessMode,
    pub capabilities: Vec<Capability>,
}

/// Wire representation matching §6 of the spec: capability names are plain
/// strings on disk, unknown ones dropped on load.
pub(crate) mod wire {
    use super::*;

    #[derive(Serialize, Deserialize)]
    pub struct ProfileWire {
        pub last_update_timestamp: u64,
        pub given_name: Option<String>,
        pub family_name: Option<String>,
        pub about: Option<String>,
        pub about_emoji: Option<String>,
        pub avatar_url_path: Option<String>,
        pub unidentified_access_mode: UnidentifiedAccessMode,
        pub capabilities: Vec<String>,
    }

    impl From<&Profile> for ProfileWire {
        fn from(p: &Profile) -> Self {
            Self {
                last_update_timestamp: p.last_update_timestamp,
                given_name: p.given_name.clone(),
                family_name: p.family_name.clone(),
                about: p.about.clone(),
                about_emoji: p.about_emoji.clone(),
                avatar_url_path: p.avatar_url_path.clone(),
                unidentified_access_mode: p.unidentified_access_mode,
                capabilities: p.capabilities.iter().map(|c| c.as_str().to_owned()).collect(),
            }
        }
    }

    impl From<ProfileWire> for Profile {
        fn from(w: ProfileWire) -> Self {
            Self {
                last_update_timestamp: w.last_update_timestamp,
                given_name: w.given_name,
                family_name: w.family_name,
                about: w.about,
                about_emoji: w.about_emoji,
                avatar_url_path: w.avatar_url_path,
                unidentified_access_mode: w.unidentified_access_mode,
                capabilities: w
                    .capabilities
                    .iter()
                    .filter_map(|name| Capability::parse(name))
                    .collect(),
            }
        }
    }
}

/// 32-byte Signal profile cipher key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileKey(pub [u8; 32]);

/// Zero-knowledge-group credential bound to a [`ProfileKey`]; opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileKeyCredential(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: RecipientAddress,
    pub contact: Option<Contact>,
    pub profile_key: Option<ProfileKey>,
    pub profile_key_credential: Option<ProfileKeyCredential>,
    pub profile: Option<Profile>,
}

impl Recipient {
    pub fn new(address: RecipientAddress) -> Self {
        Self {
            address,
            contact: None,
            profile_key: None,
            profile_key_credential: None,
            profile: None,
        }
    }

    /// Merge `src` into `self` (the destination), preferring `self`'s values
    /// and falling back to `src`'s — see spec §4.1 "Merge semantics".
    pub(crate) fn absorb(&mut self, src: Recipient) {
        if self.contact.is_none() {
            self.contact = src.contact;
        }
        if self.profile_key.is_none() {
            self.profile_key = src.profile_key;
        }
        if self.profile_key_credential.is_none() {
            self.profile_key_credential = src.profile_key_credential;
        }
        if self.profile.is_none() {
            self.profile = src.profile;
        }
    }
}
