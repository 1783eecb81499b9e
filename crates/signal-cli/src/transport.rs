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

//! The Signal push service and Key Backup Service are external
//! collaborators to this core (`signal_common::service`, `signal_common::kbs`)
//! and their wire transports are out of scope here. These stand-ins let the
//! binary link and the registration state machine run end to end; a real
//! deployment swaps them for HTTP/attested-TLS clients.

use async_trait::async_trait;

use signal_common::kbs::{KbsClient, KbsError, KbsOutcome, KbsToken};
use signal_common::service::{
    BackupCredentials, ServiceResponse, SignalServiceClient, VerifyAccountResult,
};
use signal_common::SignalAccount;
use signal_store::E164;

const NO_TRANSPORT: &str = "no Signal service transport configured for this build";

fn unreachable<T>() -> ServiceResponse<T> {
    ServiceResponse::execution_error(NO_TRANSPORT)
}

pub struct UnconfiguredServiceClient;

#[async_trait(?Send)]
impl SignalServiceClient for UnconfiguredServiceClient {
    async fn request_sms(&self, _number: &E164, _captcha: Option<&str>) -> ServiceResponse<()> {
        unreachable()
    }

    async fn request_voice(
        &self,
        _number: &E164,
        _locale: &str,
        _captcha: Option<&str>,
    ) -> ServiceResponse<()> {
        unreachable()
    }

    async fn verify_account(
        &self,
        _number: &E164,
        _code: &str,
        _registration_id: u16,
    ) -> ServiceResponse<VerifyAccountResult> {
        unreachable()
    }

    async fn verify_account_with_registration_lock_pin(
        &self,
        _number: &E164,
        _code: &str,
        _registration_id: u16,
        _lock_token: &str,
    ) -> ServiceResponse<VerifyAccountResult> {
        unreachable()
    }

    async fn set_account_attributes(&self, _account: &SignalAccount) -> ServiceResponse<()> {
        unreachable()
    }

    async fn refresh_pre_keys(&self, _account: &SignalAccount) -> ServiceResponse<()> {
        unreachable()
    }

    async fn get_remote_storage(&self, _account: &SignalAccount) -> ServiceResponse<()> {
        unreachable()
    }

    async fn set_empty_profile(&self, _account: &SignalAccount) -> ServiceResponse<()> {
        unreachable()
    }
}

pub struct UnconfiguredKbsClient;

#[async_trait(?Send)]
impl KbsClient for UnconfiguredKbsClient {
    async fn get_token(&self, _credentials: &BackupCredentials) -> Result<KbsToken, KbsError> {
        Err(KbsError::Io(NO_TRANSPORT.to_owned()))
    }

    async fn restore_master_key(
        &self,
        _pin: &str,
        _token: &KbsToken,
    ) -> Result<KbsOutcome, KbsError> {
        Err(KbsError::Io(NO_TRANSPORT.to_owned()))
    }
}
