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
use uuid::Uuid;

use crate::account::SignalAccount;
use crate::error::CoreError;
use signal_store::E164;

/// Credentials the verify endpoint hands back alongside a registration-lock
/// rejection, opaque to the core — passed straight through to the KBS.
#[derive(Debug, Clone)]
pub struct BackupCredentials {
    pub username: String,
    pub password: String,
}

/// The server rejected verification because a registration lock is in
/// force. See spec §4.3/§4.4.
#[derive(Debug, Clone)]
pub struct LockedException {
    pub time_remaining_secs: u64,
    pub backup_credentials: BackupCredentials,
}

/// The application-level outcome of a server call that the caller may want
/// to intercept rather than have normalized into a plain I/O error.
#[derive(Debug, Clone)]
pub enum ServiceApplicationError {
    CaptchaRequired(String),
    Locked(LockedException),
    Other(String),
}

/// Normalized outcome of unwrapping a [`ServiceResponse`]. Distinct from
/// [`CoreError`] because `Locked` carries data (`LockedException`) that
/// `RegistrationManager` must inspect before deciding how to surface it —
/// see spec §4.4.
#[derive(Debug, Clone)]
pub enum ServiceError {
    Io(String),
    CaptchaRequired(String),
    Locked(LockedException),
    Unexpected(String),
}

impl From<ServiceError> for CoreError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Io(message) => CoreError::Io(message),
            ServiceError::CaptchaRequired(message) => CoreError::CaptchaRequired(message),
            ServiceError::Locked(locked) => {
                tracing::error!(
                    time_remaining_secs = locked.time_remaining_secs,
                    "registration lock surfaced where it was not expected"
                );
                CoreError::Unexpected("unhandled registration lock".to_owned())
            }
            ServiceError::Unexpected(message) => CoreError::Unexpected(message),
        }
    }
}

/// Every Signal service call returns one of these: an execution error
/// (transport-level, outranks everything else), an application error
/// (HTTP-level, may be a subtype the caller wants to intercept), or a
/// result. See spec §4.5.
#[derive(Debug)]
pub struct ServiceResponse<T> {
    pub execution_error: Option<String>,
    pub application_error: Option<ServiceApplicationError>,
    pub result: Option<T>,
}

impl<T> ServiceResponse<T> {
    pub fn success(result: T) -> Self {
        Self {
            execution_error: None,
            application_error: None,
            result: Some(result),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self {
            execution_error: Some(message.into()),
            application_error: None,
            result: None,
        }
    }

    pub fn application_error(error: ServiceApplicationError) -> Self {
        Self {
            execution_error: None,
            application_error: Some(error),
            result: None,
        }
    }

    /// Normalize both error channels into a single [`ServiceError`]. The
    /// execution error outranks the application error.
    pub fn into_result(self) -> Result<T, ServiceError> {
        if let Some(message) = self.execution_error {
            return Err(ServiceError::Io(message));
        }
        if let Some(error) = self.application_error {
            return Err(match error {
                ServiceApplicationError::CaptchaRequired(message) => {
                    ServiceError::CaptchaRequired(message)
                }
                ServiceApplicationError::Locked(locked) => ServiceError::Locked(locked),
                ServiceApplicationError::Other(message) => ServiceError::Unexpected(message),
            });
        }
        self.result
            .ok_or_else(|| ServiceError::Unexpected("empty service response".to_owned()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyAccountResult {
    pub aci: Uuid,
    pub storage_capable: bool,
}

/// The Signal service HTTP client: an external collaborator per spec §1/§6,
/// used by `RegistrationManager` but implemented elsewhere (the real push
/// service transport is out of scope for this core).
#[async_trait(?Send)]
pub trait SignalServiceClient {
    async fn request_sms(
        &self,
        number: &E164,
        captcha: Option<&str>,
    ) -> ServiceResponse<()>;

    async fn request_voice(
        &self,
        number: &E164,
        locale: &str,
        captcha: Option<&str>,
    ) -> ServiceResponse<()>;

    async fn verify_account(
        &self,
        number: &E164,
        code: &str,
        registration_id: u16,
    ) -> ServiceResponse<VerifyAccountResult>;

    async fn verify_account_with_registration_lock_pin(
        &self,
        number: &E164,
        code: &str,
        registration_id: u16,
        lock_token: &str,
    ) -> ServiceResponse<VerifyAccountResult>;

    /// Idempotent reactivation of an already-registered account.
    async fn set_account_attributes(&self, account: &SignalAccount) -> ServiceResponse<()>;

    async fn refresh_pre_keys(&self, account: &SignalAccount) -> ServiceResponse<()>;

    async fn get_remote_storage(&self, account: &SignalAccount) -> ServiceResponse<()>;

    async fn set_empty_profile(&self, account: &SignalAccount) -> ServiceResponse<()>;
}
