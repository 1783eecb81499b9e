// signal-cli
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

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use signal_common::account::SignalAccount;
use signal_common::error::{CoreError, Result};
use signal_common::kbs::{KbsClient, PinHelper};
use signal_common::service::{ServiceError, SignalServiceClient};
use signal_store::{ProtocolStore, RecipientStore, PRE_KEY_BATCH_SIZE};

/// `IDLE -> CODE_REQUESTED -> VERIFIED -> REGISTERED`, with a shortcut
/// `REACTIVATED` from `IDLE` for an account that already carries an ACI.
/// See spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    CodeRequested,
    Verified,
    Registered,
    Reactivated,
}

/// A fully registered account, handed off by [`RegistrationManager`] once
/// verification completes. Owns the account outright — no shared mutable
/// reference escapes the registration manager (spec §5, §9).
pub struct Manager<S> {
    account: SignalAccount,
    service: S,
    protocol: ProtocolStore,
}

impl<S: SignalServiceClient> Manager<S> {
    pub fn account(&self) -> &SignalAccount {
        &self.account
    }

    pub fn into_account(self) -> SignalAccount {
        self.account
    }

    pub fn protocol(&self) -> &ProtocolStore {
        &self.protocol
    }

    /// Generate a fresh batch of one-time pre-keys and a signed pre-key,
    /// persist them through the [`ProtocolStore`], and upload the bundle.
    /// See spec §4.4 step 1.
    pub async fn refresh_pre_keys(&mut self) -> Result<()> {
        self.protocol
            .generate_pre_keys(PRE_KEY_BATCH_SIZE)
            .await
            .map_err(|error| CoreError::Unexpected(error.to_string()))?;
        self.service
            .refresh_pre_keys(&self.account)
            .await
            .into_result()
            .map_err(CoreError::from)
    }

    pub async fn get_remote_storage(&self) -> Result<()> {
        self.service
            .get_remote_storage(&self.account)
            .await
            .into_result()
            .map_err(CoreError::from)
    }

    /// A missing dependency here is a soft warning, not fatal — spec §4.4
    /// step 3.
    pub async fn set_empty_profile(&self) {
        if let Err(error) = self
            .service
            .set_empty_profile(&self.account)
            .await
            .into_result()
            .map_err(CoreError::from)
        {
            warn!(%error, "failed to submit empty initial profile, continuing");
        }
    }
}

/// Drives the request-code -> verify-code -> finish transitions for a
/// single account. See spec §4.4.
pub struct RegistrationManager<S, K> {
    account: Option<SignalAccount>,
    state: RegistrationState,
    service: S,
    pin_helper: PinHelper<K>,
    locale: String,
    protocol: ProtocolStore,
}

impl<S: SignalServiceClient, K: KbsClient> RegistrationManager<S, K> {
    pub fn new(
        account: SignalAccount,
        service: S,
        pin_helper: PinHelper<K>,
        locale: impl Into<String>,
        recipients: Arc<RecipientStore>,
    ) -> Self {
        let protocol = ProtocolStore::new(
            recipients,
            account.identity_key_pair.clone(),
            u32::from(account.registration_id),
        );
        Self {
            state: RegistrationState::Idle,
            account: Some(account),
            service,
            pin_helper,
            locale: locale.into(),
            protocol,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Reconstruct a manager already in `state`, for the common case where
    /// `register()` and `verify_account()` run as separate CLI invocations
    /// and the in-memory state machine doesn't survive the process exit.
    pub fn resume(
        account: SignalAccount,
        service: S,
        pin_helper: PinHelper<K>,
        locale: impl Into<String>,
        recipients: Arc<RecipientStore>,
        state: RegistrationState,
    ) -> Self {
        let protocol = ProtocolStore::new(
            recipients,
            account.identity_key_pair.clone(),
            u32::from(account.registration_id),
        );
        Self {
            account: Some(account),
            state,
            service,
            pin_helper,
            locale: locale.into(),
            protocol,
        }
    }

    fn account(&self) -> &SignalAccount {
        self.account
            .as_ref()
            .expect("account is present until registration finishes")
    }

    /// `register(voice, captcha?)` from `IDLE`, or an idempotent re-request
    /// from `CODE_REQUESTED`.
    pub async fn register(&mut self, voice: bool, captcha: Option<&str>) -> Result<()> {
        match self.state {
            RegistrationState::Idle => {
                if self.account().is_registered() {
                    trace!("account already has an ACI, attempting silent reactivation");
                    match self
                        .service
                        .set_account_attributes(self.account())
                        .await
                        .into_result()
                    {
                        Ok(()) => {
                            self.state = RegistrationState::Reactivated;
                            info!("reactivated existing registration");
                            return Ok(());
                        }
                        Err(ServiceError::Io(message)) => {
                            warn!(%message, "reactivation failed, falling back to normal registration");
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
            }
            RegistrationState::CodeRequested => {
                debug!("re-requesting verification code");
            }
            _ => {
                return Err(CoreError::UserError(
                    "register() is only valid from IDLE or CODE_REQUESTED".to_owned(),
                ));
            }
        }

        let captcha = captcha.map(strip_captcha_prefix);
        let number = self.account().number.clone();
        let response = if voice {
            self.service
                .request_voice(&number, &self.locale, captcha.as_deref())
                .await
        } else {
            self.service.request_sms(&number, captcha.as_deref()).await
        };
        response.into_result().map_err(CoreError::from)?;

        self.state = RegistrationState::CodeRequested;
        Ok(())
    }

    /// `verifyAccount(code, pin?)` from `CODE_REQUESTED`. On success,
    /// consumes `self` and yields a [`Manager`].
    pub async fn verify_account(mut self, code: &str, pin: Option<&str>) -> Result<Manager<S>> {
        if self.state != RegistrationState::CodeRequested {
            return Err(CoreError::UserError(
                "verifyAccount() is only valid after register() has requested a code".to_owned(),
            ));
        }

        let code: String = code.chars().filter(|c| *c != '-').collect();
        let number = self.account().number.clone();
        let registration_id = self.account().registration_id;

        let outcome = self
            .service
            .verify_account(&number, &code, registration_id)
            .await
            .into_result();

        let result = match outcome {
            Ok(result) => {
                let mut account = self.account.take().expect("account present");
                account.finish_registration(result.aci);
                self.account = Some(account);
                result
            }
            Err(ServiceError::Locked(locked)) => {
                let Some(pin) = pin else {
                    return Err(CoreError::PinLocked {
                        time_remaining_secs: locked.time_remaining_secs,
                    });
                };

                let lock = self
                    .pin_helper
                    .derive_registration_lock(pin, &locked.backup_credentials)
                    .await
                    .map_err(|error| match error {
                        signal_common::kbs::PinError::IncorrectPin { tries_remaining } => {
                            CoreError::IncorrectPin { tries_remaining }
                        }
                        signal_common::kbs::PinError::NoData => {
                            CoreError::Io("key backup service has no data for this account".to_owned())
                        }
                        signal_common::kbs::PinError::Kbs(inner) => CoreError::Io(inner.to_string()),
                    })?;

                let retry = self
                    .service
                    .verify_account_with_registration_lock_pin(
                        &number,
                        &code,
                        registration_id,
                        &lock.token,
                    )
                    .await
                    .into_result();

                match retry {
                    Ok(result) => {
                        let mut account = self.account.take().expect("account present");
                        account.finish_registration_with_lock(result.aci, lock.master_key);
                        self.account = Some(account);
                        result
                    }
                    Err(ServiceError::Locked(_)) => {
                        return Err(CoreError::Unexpected(
                            "registration lock accepted by KBS but rejected again by the server"
                                .to_owned(),
                        ));
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            Err(other) => return Err(other.into()),
        };

        self.state = RegistrationState::Verified;
        debug!(aci = %result.aci, "verification succeeded");

        let account = self.account.take().expect("account present after verification");
        self.state = RegistrationState::Registered;
        let mut manager = Manager {
            account,
            service: self.service,
            protocol: self.protocol,
        };

        manager.refresh_pre_keys().await?;
        if result.storage_capable {
            manager.get_remote_storage().await?;
        }
        manager.set_empty_profile().await;

        Ok(manager)
    }
}

/// Registration QR/deep-link URIs carry a `signalcaptcha://` prefix that
/// the server's CAPTCHA endpoint does not expect — spec §4.4.
fn strip_captcha_prefix(captcha: &str) -> String {
    captcha
        .strip_prefix("signalcaptcha://")
        .unwrap_or(captcha)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use libsignal_protocol::IdentityKeyPair;
    use signal_common::kbs::{KbsOutcome, KbsToken};
    use signal_common::service::{BackupCredentials, ServiceApplicationError, ServiceResponse, VerifyAccountResult};
    use signal_store::{NullMergeSink, E164};
    use std::cell::Cell;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn account() -> SignalAccount {
        SignalAccount::new(
            "+15551234567".parse().unwrap(),
            "hunter2".to_owned(),
            12345,
            IdentityKeyPair::generate(&mut rand::rng()),
        )
    }

    fn recipients() -> (Arc<RecipientStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            RecipientStore::open(dir.path().join("recipients.json"), Arc::new(NullMergeSink))
                .unwrap();
        (Arc::new(store), dir)
    }

    struct StubService {
        verify_outcome: Mutex<Vec<ServiceResponse<VerifyAccountResult>>>,
        sms_requested: Cell<bool>,
    }

    #[async_trait(?Send)]
    impl SignalServiceClient for StubService {
        async fn request_sms(&self, _number: &E164, _captcha: Option<&str>) -> ServiceResponse<()> {
            self.sms_requested.set(true);
            ServiceResponse::success(())
        }

        async fn request_voice(
            &self,
            _number: &E164,
            _locale: &str,
            _captcha: Option<&str>,
        ) -> ServiceResponse<()> {
            ServiceResponse::success(())
        }

        async fn verify_account(
            &self,
            _number: &E164,
            _code: &str,
            _registration_id: u16,
        ) -> ServiceResponse<VerifyAccountResult> {
            self.verify_outcome.lock().unwrap().remove(0)
        }

        async fn verify_account_with_registration_lock_pin(
            &self,
            _number: &E164,
            _code: &str,
            _registration_id: u16,
            _lock_token: &str,
        ) -> ServiceResponse<VerifyAccountResult> {
            self.verify_outcome.lock().unwrap().remove(0)
        }

        async fn set_account_attributes(&self, _account: &SignalAccount) -> ServiceResponse<()> {
            ServiceResponse::success(())
        }

        async fn refresh_pre_keys(&self, _account: &SignalAccount) -> ServiceResponse<()> {
            ServiceResponse::success(())
        }

        async fn get_remote_storage(&self, _account: &SignalAccount) -> ServiceResponse<()> {
            ServiceResponse::success(())
        }

        async fn set_empty_profile(&self, _account: &SignalAccount) -> ServiceResponse<()> {
            ServiceResponse::success(())
        }
    }

    struct StubKbs {
        outcome: KbsOutcome,
    }

    #[async_trait(?Send)]
    impl KbsClient for StubKbs {
        async fn get_token(
            &self,
            _credentials: &BackupCredentials,
        ) -> std::result::Result<KbsToken, signal_common::kbs::KbsError> {
            Ok(KbsToken(vec![0u8; 16]))
        }

        async fn restore_master_key(
            &self,
            _pin: &str,
            _token: &KbsToken,
        ) -> std::result::Result<KbsOutcome, signal_common::kbs::KbsError> {
            Ok(self.outcome.clone())
        }
    }

    #[tokio::test]
    async fn happy_path_registers_and_verifies() {
        let service = StubService {
            verify_outcome: Mutex::new(vec![ServiceResponse::success(VerifyAccountResult {
                aci: Uuid::new_v4(),
                storage_capable: true,
            })]),
            sms_requested: Cell::new(false),
        };
        let pin_helper = PinHelper::new(
            StubKbs {
                outcome: KbsOutcome::NoData,
            },
            "deadbeef",
        );
        let (recipients, _dir) = recipients();
        let mut manager = RegistrationManager::new(account(), service, pin_helper, "en-US", recipients);

        manager
            .register(false, Some("signalcaptcha://abc"))
            .await
            .unwrap();
        assert_eq!(manager.state(), RegistrationState::CodeRequested);
        assert!(manager.service.sms_requested.get());

        let manager = manager.verify_account("123-456", None).await.unwrap();
        assert!(manager.account().is_registered());
    }

    #[tokio::test]
    async fn pin_locked_without_pin_surfaces_time_remaining() {
        let service = StubService {
            verify_outcome: Mutex::new(vec![ServiceResponse::application_error(
                ServiceApplicationError::Locked(signal_common::service::LockedException {
                    time_remaining_secs: 3600,
                    backup_credentials: BackupCredentials {
                        username: "u".to_owned(),
                        password: "p".to_owned(),
                    },
                }),
            )]),
            sms_requested: Cell::new(false),
        };
        let pin_helper = PinHelper::new(
            StubKbs {
                outcome: KbsOutcome::NoData,
            },
            "deadbeef",
        );
        let (recipients, _dir) = recipients();
        let mut manager = RegistrationManager::new(account(), service, pin_helper, "en-US", recipients);
        manager.register(false, None).await.unwrap();

        let error = manager.verify_account("123456", None).await.unwrap_err();
        assert!(matches!(
            error,
            CoreError::PinLocked { time_remaining_secs: 3600 }
        ));
    }

    #[tokio::test]
    async fn verify_before_register_is_a_user_error() {
        let service = StubService {
            verify_outcome: Mutex::new(vec![]),
            sms_requested: Cell::new(false),
        };
        let pin_helper = PinHelper::new(
            StubKbs {
                outcome: KbsOutcome::NoData,
            },
            "deadbeef",
        );
        let (recipients, _dir) = recipients();
        let manager = RegistrationManager::new(account(), service, pin_helper, "en-US", recipients);
        let error = manager.verify_account("123456", None).await.unwrap_err();
        assert!(matches!(error, CoreError::UserError(_)));
    }
}
