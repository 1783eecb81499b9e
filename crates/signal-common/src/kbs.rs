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

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::service::BackupCredentials;

type HmacSha256 = Hmac<Sha256>;

/// Opaque token exchanged for the account's stored master key.
#[derive(Debug, Clone)]
pub struct KbsToken(pub Vec<u8>);

/// What the enclave told us in response to a PIN.
#[derive(Debug, Clone)]
pub enum KbsOutcome {
    MasterKey([u8; 32]),
    WrongPin { tries_remaining: u32 },
    NoData,
}

#[derive(Debug, Error)]
pub enum KbsError {
    #[error("enclave attestation or transport error: {0}")]
    Io(String),
}

/// The Key Backup Service enclave: an attested TLS channel, external to
/// this core (spec §4.3, §6).
#[async_trait(?Send)]
pub trait KbsClient {
    async fn get_token(&self, credentials: &BackupCredentials) -> Result<KbsToken, KbsError>;
    async fn restore_master_key(
        &self,
        pin: &str,
        token: &KbsToken,
    ) -> Result<KbsOutcome, KbsError>;
}

/// The registration-lock token derived from a PIN, plus the master key it
/// came from (the caller persists the latter on the account — spec §4.4).
#[derive(Debug, Clone)]
pub struct RegistrationLock {
    pub token: String,
    pub master_key: [u8; 32],
}

#[derive(Debug, Error)]
pub enum PinError {
    #[error(transparent)]
    Kbs(#[from] KbsError),
    #[error("no backup data for this account")]
    NoData,
    #[error("incorrect PIN, {tries_remaining} tries remaining")]
    IncorrectPin { tries_remaining: u32 },
}

/// Derives a registration-lock token from a user PIN by contacting the Key
/// Backup Service enclave. See spec §4.3.
pub struct PinHelper<C> {
    client: C,
    mrenclave: String,
}

impl<C: KbsClient> PinHelper<C> {
    pub fn new(client: C, mrenclave: impl Into<String>) -> Self {
        Self {
            client,
            mrenclave: mrenclave.into(),
        }
    }

    pub fn mrenclave(&self) -> &str {
        &self.mrenclave
    }

    pub async fn derive_registration_lock(
        &self,
        pin: &str,
        credentials: &BackupCredentials,
    ) -> Result<RegistrationLock, PinError> {
        let token = self.client.get_token(credentials).await?;
        match self.client.restore_master_key(pin, &token).await? {
            KbsOutcome::NoData => Err(PinError::NoData),
            KbsOutcome::WrongPin { tries_remaining } => {
                Err(PinError::IncorrectPin { tries_remaining })
            }
            KbsOutcome::MasterKey(master_key) => Ok(RegistrationLock {
                token: registration_lock_token(&master_key),
                master_key,
            }),
        }
    }
}

/// `HMAC_SHA256(masterKey, "Registration Lock")`, hex-encoded — spec §4.3.
fn registration_lock_token(master_key: &[u8; 32]) -> String {
    let mut mac = HmacSha256::new_from_slice(master_key).expect("HMAC accepts any key length");
    mac.update(b"Registration Lock");
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubClient {
        outcome: KbsOutcome,
    }

    #[async_trait(?Send)]
    impl KbsClient for StubClient {
        async fn get_token(&self, _credentials: &BackupCredentials) -> Result<KbsToken, KbsError> {
            Ok(KbsToken(vec![0u8; 16]))
        }

        async fn restore_master_key(
            &self,
            _pin: &str,
            _token: &KbsToken,
        ) -> Result<KbsOutcome, KbsError> {
            Ok(self.outcome.clone())
        }
    }

    fn credentials() -> BackupCredentials {
        BackupCredentials {
            username: "user".to_owned(),
            password: "pass".to_owned(),
        }
    }

    #[tokio::test]
    async fn derives_token_deterministically_from_master_key() {
        let helper = PinHelper::new(
            StubClient {
                outcome: KbsOutcome::MasterKey([9u8; 32]),
            },
            "deadbeef",
        );
        let lock_a = helper.derive_registration_lock("1234", &credentials()).await.unwrap();
        let lock_b = helper.derive_registration_lock("1234", &credentials()).await.unwrap();
        assert_eq!(lock_a.token, lock_b.token);
        assert_eq!(lock_a.master_key, [9u8; 32]);
    }

    #[tokio::test]
    async fn wrong_pin_surfaces_tries_remaining() {
        let helper = PinHelper::new(
            StubClient {
                outcome: KbsOutcome::WrongPin { tries_remaining: 4 },
            },
            "deadbeef",
        );
        let error = helper
            .derive_registration_lock("0000", &credentials())
            .await
            .unwrap_err();
        assert!(matches!(error, PinError::IncorrectPin { tries_remaining: 4 }));
    }

    #[tokio::test]
    async fn no_data_is_reported() {
        let helper = PinHelper::new(
            StubClient {
                outcome: KbsOutcome::NoData,
            },
            "deadbeef",
        );
        let error = helper
            .derive_registration_lock("0000", &credentials())
            .await
            .unwrap_err();
        assert!(matches!(error, PinError::NoData));
    }
}
