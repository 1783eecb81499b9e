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

use std::io::Write;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use libsignal_protocol::IdentityKeyPair;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use signal_store::E164;

/// The persistent state of the local device. See spec §3.
#[derive(Debug, Clone)]
pub struct SignalAccount {
    pub number: E164,
    pub password: String,
    pub aci: Option<Uuid>,
    pub device_id: Option<u32>,
    pub registration_id: u16,
    pub identity_key_pair: IdentityKeyPair,
    pub pin_master_key: Option<[u8; 32]>,
    pub registered: bool,
    pub discoverable: bool,
    pub device_name_encrypted: Option<Vec<u8>>,
}

impl SignalAccount {
    pub fn new(
        number: E164,
        password: String,
        registration_id: u16,
        identity_key_pair: IdentityKeyPair,
    ) -> Self {
        Self {
            number,
            password,
            aci: None,
            device_id: None,
            registration_id,
            identity_key_pair,
            pin_master_key: None,
            registered: false,
            discoverable: true,
            device_name_encrypted: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered && self.aci.is_some()
    }

    /// Own unidentified-access key, derived from the profile key the same
    /// way the registration-lock token is derived from the master key
    /// (HMAC-SHA256 over a fixed label) — see spec §3, §4.3.
    pub fn unidentified_access_key(profile_key: &[u8; 32]) -> [u8; 32] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(profile_key).expect("HMAC accepts any key length");
        mac.update(b"Unidentified Access");
        mac.finalize().into_bytes().into()
    }

    pub fn finish_registration(&mut self, aci: Uuid) {
        self.aci = Some(aci);
        self.device_id = Some(1);
        self.registered = true;
        self.pin_master_key = None;
    }

    pub fn finish_registration_with_lock(&mut self, aci: Uuid, master_key: [u8; 32]) {
        self.aci = Some(aci);
        self.device_id = Some(1);
        self.registered = true;
        self.pin_master_key = Some(master_key);
    }
}

/// On-disk representation, separate from the in-memory type because
/// `IdentityKeyPair` has no `serde` impl — mirrors the wire/domain split in
/// `signal_store::store`.
mod wire {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    pub struct AccountFile {
        pub number: String,
        pub password: String,
        pub aci: Option<Uuid>,
        pub device_id: Option<u32>,
        pub registration_id: u16,
        pub identity_key_pair: String,
        pub pin_master_key: Option<String>,
        pub registered: bool,
        pub discoverable: bool,
        pub device_name_encrypted: Option<String>,
    }

    pub fn dump(account: &SignalAccount) -> Result<Vec<u8>> {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        let file = AccountFile {
            number: account.number.to_string(),
            password: account.password.clone(),
            aci: account.aci,
            device_id: account.device_id,
            registration_id: account.registration_id,
            identity_key_pair: engine.encode(account.identity_key_pair.serialize()),
            pin_master_key: account.pin_master_key.map(|key| engine.encode(key)),
            registered: account.registered,
            discoverable: account.discoverable,
            device_name_encrypted: account
                .device_name_encrypted
                .as_ref()
                .map(|bytes| engine.encode(bytes)),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn load(bytes: &[u8]) -> Result<SignalAccount> {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        let file: AccountFile = serde_json::from_slice(bytes)?;
        let number: E164 = file
            .number
            .parse()
            .map_err(|error: signal_store::StoreError| CoreError::Unexpected(error.to_string()))?;
        let identity_key_pair_bytes = engine
            .decode(&file.identity_key_pair)
            .map_err(|error| CoreError::Unexpected(error.to_string()))?;
        let identity_key_pair = IdentityKeyPair::try_from(identity_key_pair_bytes.as_slice())
            .map_err(|error| CoreError::Unexpected(error.to_string()))?;
        let pin_master_key = file
            .pin_master_key
            .map(|value| {
                let bytes = engine
                    .decode(value)
                    .map_err(|error| CoreError::Unexpected(error.to_string()))?;
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| CoreError::Unexpected("master key must be 32 bytes".to_owned()))?;
                Ok::<_, CoreError>(array)
            })
            .transpose()?;
        let device_name_encrypted = file
            .device_name_encrypted
            .map(|value| {
                engine
                    .decode(value)
                    .map_err(|error| CoreError::Unexpected(error.to_string()))
            })
            .transpose()?;
        Ok(SignalAccount {
            number,
            password: file.password,
            aci: file.aci,
            device_id: file.device_id,
            registration_id: file.registration_id,
            identity_key_pair,
            pin_master_key,
            registered: file.registered,
            discoverable: file.discoverable,
            device_name_encrypted,
        })
    }
}

/// Load the account file, or `None` if it does not exist yet.
pub fn load(path: &Path) -> Result<Option<SignalAccount>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(wire::load(&bytes)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Persist the account atomically: write to a sibling temp file, flush,
/// then rename over the target — no partial JSON on crash, matching the
/// recipient store's persistence discipline (spec §5).
pub fn save(path: &Path, account: &SignalAccount) -> Result<()> {
    let bytes = wire::dump(account)?;
    let dir = path.parent().map(PathBuf::from).unwrap_or_default();
    std::fs::create_dir_all(&dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(&bytes)?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|error| CoreError::Io(error.to_string()))?;
    Ok(())
}
