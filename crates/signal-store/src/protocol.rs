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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsignal_protocol::{
    Direction, IdentityChange, IdentityKey, IdentityKeyPair, IdentityKeyStore, KeyPair, PreKeyId,
    PreKeyRecord, PreKeyStore, ProtocolAddress, SessionRecord, SessionStore,
    SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};
use tracing::{trace, warn};

use crate::recipient::RecipientId;
use crate::store::RecipientStore;

/// How much we trust a remote identity key — see spec §3 "IdentityInfo".
/// `libsignal_protocol::IdentityKeyStore` only distinguishes new/unchanged
/// from replaced; this tracks the registration-lock-relevant distinction
/// between "we noticed this changed" and "a human explicitly verified it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Untrusted,
    TrustedUnverified,
    TrustedVerified,
}

#[derive(Debug, Clone)]
struct IdentityInfo {
    identity_key: IdentityKey,
    trust_level: TrustLevel,
    #[allow(dead_code)]
    added_timestamp: DateTime<Utc>,
}

/// One-time pre-keys generated per refresh. See spec §4.4 step 1.
pub const PRE_KEY_BATCH_SIZE: u32 = 100;

struct SessionEntry {
    record: SessionRecord,
    /// Set by `archive_session`: the record is retained but a new outbound
    /// message must start a fresh session. See spec §4.2.
    #[allow(dead_code)]
    archived: bool,
}

/// Signal Protocol storage contract: identity keys/trust, pre-keys, signed
/// pre-keys, and sessions, keyed by `(name, deviceId)`. Names are resolved
/// through a [`RecipientStore`] on every write so that a later merge reroutes
/// all associated state to the surviving recipient — spec §4.2.
pub struct ProtocolStore {
    recipients: Arc<RecipientStore>,
    identity_key_pair: IdentityKeyPair,
    local_registration_id: u32,
    identities: Mutex<HashMap<RecipientId, IdentityInfo>>,
    sessions: Mutex<HashMap<(RecipientId, u32), SessionEntry>>,
    pre_keys: Mutex<HashMap<u32, PreKeyRecord>>,
    signed_pre_keys: Mutex<HashMap<u32, SignedPreKeyRecord>>,
}

impl ProtocolStore {
    pub fn new(
        recipients: Arc<RecipientStore>,
        identity_key_pair: IdentityKeyPair,
        local_registration_id: u32,
    ) -> Self {
        Self {
            recipients,
            identity_key_pair,
            local_registration_id,
            identities: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            pre_keys: Mutex::new(HashMap::new()),
            signed_pre_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Route `address.name()` (a uuid string or an E.164 number) through the
    /// recipient store at low trust: we're recording traffic we observed,
    /// not asserting a new identity link.
    fn resolve(&self, address: &ProtocolAddress) -> Result<RecipientId, SignalProtocolError> {
        let addr = parse_name(address.name())
            .map_err(|error| SignalProtocolError::InvalidArgument(error.to_string()))?;
        self.recipients
            .resolve(&addr, false)
            .map_err(SignalProtocolError::from)
    }

    /// Retain the session but mark it non-current; new outbound messages
    /// must start a new session. See spec §4.2.
    pub fn archive_session(&self, address: &ProtocolAddress) -> Result<(), SignalProtocolError> {
        let id = self.resolve(address)?;
        let mut sessions = self.sessions.lock().expect("protocol store mutex poisoned");
        if let Some(entry) = sessions.get_mut(&(id, address.device_id().into())) {
            entry.archived = true;
        }
        Ok(())
    }

    pub fn set_identity_trust_level(
        &self,
        address: &ProtocolAddress,
        trust_level: TrustLevel,
    ) -> Result<(), SignalProtocolError> {
        let id = self.resolve(address)?;
        let mut identities = self.identities.lock().expect("protocol store mutex poisoned");
        if let Some(info) = identities.get_mut(&id) {
            info.trust_level = trust_level;
        }
        Ok(())
    }

    /// Generate `count` fresh one-time pre-keys and a new signed pre-key,
    /// persist them locally, and return the public bundle ready to upload.
    /// See spec §4.4 step 1.
    pub async fn generate_pre_keys(
        &mut self,
        count: u32,
    ) -> Result<(Vec<PreKeyRecord>, SignedPreKeyRecord), SignalProtocolError> {
        let mut rng = rand::rng();

        let offset = self.pre_keys.lock().expect("protocol store mutex poisoned").len() as u32;
        let mut pre_keys = Vec::with_capacity(count as usize);
        for i in 0..count {
            let key_pair = KeyPair::generate(&mut rng);
            let id = PreKeyId::from(offset + i + 1);
            let record = PreKeyRecord::new(id, &key_pair);
            self.save_pre_key(id, &record).await?;
            pre_keys.push(record);
        }

        let signed_offset = self
            .signed_pre_keys
            .lock()
            .expect("protocol store mutex poisoned")
            .len() as u32;
        let signed_id = SignedPreKeyId::from(signed_offset + 1);
        let signed_key_pair = KeyPair::generate(&mut rng);
        let signature = self
            .identity_key_pair
            .private_key()
            .calculate_signature(&signed_key_pair.public_key.serialize(), &mut rng)?;
        let signed_pre_key = SignedPreKeyRecord::new(
            signed_id,
            Utc::now().timestamp_millis() as u64,
            &signed_key_pair,
            &signature,
        );
        self.save_signed_pre_key(signed_id, &signed_pre_key).await?;

        Ok((pre_keys, signed_pre_key))
    }

    /// Called by a [`crate::store::MergeSink`] implementation once a merge
    /// has been decided: rewrite every keyed entry from `src` to `dst`.
    pub fn merge_recipients(&self, dst: RecipientId, src: RecipientId) {
        let mut identities = self.identities.lock().expect("protocol store mutex poisoned");
        if let Some(info) = identities.remove(&src) {
            identities.entry(dst).or_insert(info);
        }
        drop(identities);

        let mut sessions = self.sessions.lock().expect("protocol store mutex poisoned");
        let stale_keys: Vec<(RecipientId, u32)> = sessions
            .keys()
            .filter(|(id, _)| *id == src)
            .copied()
            .collect();
        for (_, device_id) in stale_keys.iter().copied() {
            if let Some(entry) = sessions.remove(&(src, device_id)) {
                sessions.entry((dst, device_id)).or_insert(entry);
            }
        }
    }
}

fn parse_name(name: &str) -> Result<crate::address::RecipientAddress, crate::error::StoreError> {
    if let Ok(uuid) = uuid::Uuid::parse_str(name) {
        Ok(crate::address::RecipientAddress::from_uuid(uuid))
    } else {
        let number: crate::address::E164 = name.parse()?;
        Ok(crate::address::RecipientAddress::from_number(number))
    }
}

#[async_trait(?Send)]
impl IdentityKeyStore for ProtocolStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        Ok(self.identity_key_pair)
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        Ok(self.local_registration_id)
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, SignalProtocolError> {
        let id = self.resolve(address)?;
        let mut identities = self.identities.lock().expect("protocol store mutex poisoned");
        match identities.get_mut(&id) {
            None => {
                trace!(%address, "trusting new identity");
                identities.insert(
                    id,
                    IdentityInfo {
                        identity_key: *identity_key,
                        trust_level: TrustLevel::TrustedUnverified,
                        added_timestamp: Utc::now(),
                    },
                );
                Ok(IdentityChange::NewOrUnchanged)
            }
            Some(existing) if existing.identity_key == *identity_key => {
                Ok(IdentityChange::NewOrUnchanged)
            }
            Some(existing) => {
                warn!(%address, "identity key changed, downgrading trust to untrusted");
                existing.identity_key = *identity_key;
                existing.trust_level = TrustLevel::Untrusted;
                existing.added_timestamp = Utc::now();
                Ok(IdentityChange::ReplacedExisting)
            }
        }
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        right_identity_key: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        let id = self.resolve(address)?;
        let identities = self.identities.lock().expect("protocol store mutex poisoned");
        match identities.get(&id) {
            None => Ok(true),
            Some(info) if info.identity_key == *right_identity_key => Ok(true),
            Some(info) => Ok(info.trust_level != TrustLevel::TrustedVerified),
        }
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        let id = self.resolve(address)?;
        let identities = self.identities.lock().expect("protocol store mutex poisoned");
        Ok(identities.get(&id).map(|info| info.identity_key))
    }
}

#[async_trait(?Send)]
impl PreKeyStore for ProtocolStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        let pre_keys = self.pre_keys.lock().expect("protocol store mutex poisoned");
        pre_keys.get(&u32::from(id)).cloned().ok_or_else(|| {
            SignalProtocolError::InvalidState("get_pre_key", format!("pre key {id} not found"))
        })
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let mut pre_keys = self.pre_keys.lock().expect("protocol store mutex poisoned");
        pre_keys.insert(u32::from(id), record.clone());
        Ok(())
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        let mut pre_keys = self.pre_keys.lock().expect("protocol store mutex poisoned");
        pre_keys.remove(&u32::from(id));
        Ok(())
    }
}

#[async_trait(?Send)]
impl SignedPreKeyStore for ProtocolStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        let signed_pre_keys = self
            .signed_pre_keys
            .lock()
            .expect("protocol store mutex poisoned");
        signed_pre_keys.get(&u32::from(id)).cloned().ok_or_else(|| {
            SignalProtocolError::InvalidState(
                "get_signed_pre_key",
                format!("signed pre key {id} not found"),
            )
        })
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let mut signed_pre_keys = self
            .signed_pre_keys
            .lock()
            .expect("protocol store mutex poisoned");
        signed_pre_keys.insert(u32::from(id), record.clone());
        Ok(())
    }
}

#[async_trait(?Send)]
impl SessionStore for ProtocolStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        let id = self.resolve(address)?;
        let sessions = self.sessions.lock().expect("protocol store mutex poisoned");
        Ok(sessions
            .get(&(id, address.device_id().into()))
            .map(|entry| entry.record.clone()))
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        let id = self.resolve(address)?;
        let mut sessions = self.sessions.lock().expect("protocol store mutex poisoned");
        sessions.insert(
            (id, address.device_id().into()),
            SessionEntry {
                record: record.clone(),
                archived: false,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NullMergeSink;
    use libsignal_protocol::DeviceId;

    fn new_store() -> (ProtocolStore, Arc<RecipientStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let recipients = Arc::new(
            RecipientStore::open(dir.path().join("recipients.json"), Arc::new(NullMergeSink))
                .unwrap(),
        );
        let key_pair = IdentityKeyPair::generate(&mut rand::rng());
        let store = ProtocolStore::new(recipients.clone(), key_pair, 1234);
        (store, recipients, dir)
    }

    #[tokio::test]
    async fn generate_pre_keys_persists_locally_and_ids_dont_collide_on_refresh() {
        let (mut store, _recipients, _dir) = new_store();
        let (first_batch, first_signed) = store.generate_pre_keys(10).await.unwrap();
        assert_eq!(first_batch.len(), 10);
        for record in &first_batch {
            assert!(store.get_pre_key(record.id().unwrap()).await.is_ok());
        }
        assert!(store.get_signed_pre_key(first_signed.id().unwrap()).await.is_ok());

        let (second_batch, second_signed) = store.generate_pre_keys(5).await.unwrap();
        let first_ids: std::collections::HashSet<_> =
            first_batch.iter().map(|r| r.id().unwrap()).collect();
        for record in &second_batch {
            assert!(!first_ids.contains(&record.id().unwrap()));
        }
        assert_ne!(first_signed.id().unwrap(), second_signed.id().unwrap());
    }

    #[tokio::test]
    async fn save_identity_detects_key_change() {
        let (mut store, _recipients, _dir) = new_store();
        let address =
            ProtocolAddress::new(uuid::Uuid::new_v4().to_string(), DeviceId::new(1).unwrap());
        let key1 = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();
        let key2 = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();

        assert_eq!(
            store.save_identity(&address, &key1).await.unwrap(),
            IdentityChange::NewOrUnchanged
        );
        assert_eq!(
            store.save_identity(&address, &key1).await.unwrap(),
            IdentityChange::NewOrUnchanged
        );
        assert_eq!(
            store.save_identity(&address, &key2).await.unwrap(),
            IdentityChange::ReplacedExisting
        );
        assert_eq!(store.get_identity(&address).await.unwrap(), Some(key2));
    }

    #[tokio::test]
    async fn merge_recipients_reroutes_sessions_and_identity() {
        let (mut store, recipients, _dir) = new_store();
        let uuid = uuid::Uuid::new_v4();
        let number: crate::address::E164 = "+15550001111".parse().unwrap();

        let uuid_address = ProtocolAddress::new(uuid.to_string(), DeviceId::new(1).unwrap());
        let number_address =
            ProtocolAddress::new(number.to_string(), DeviceId::new(1).unwrap());

        let key = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();
        store.save_identity(&number_address, &key).await.unwrap();
        store
            .store_session(&number_address, &SessionRecord::new_fresh())
            .await
            .unwrap();

        let uuid_id = recipients
            .resolve(&crate::address::RecipientAddress::from_uuid(uuid), false)
            .unwrap();
        let number_id = recipients
            .resolve(
                &crate::address::RecipientAddress::from_number(number.clone()),
                false,
            )
            .unwrap();
        assert_ne!(uuid_id, number_id);

        let merged_addr =
            crate::address::RecipientAddress::new(Some(uuid), Some(number)).unwrap();
        recipients.resolve(&merged_addr, true).unwrap();
        store.merge_recipients(uuid_id, number_id);

        assert!(store.load_session(&uuid_address).await.unwrap().is_some());
        assert_eq!(store.get_identity(&uuid_address).await.unwrap(), Some(key));
    }

    #[derive(Debug, Clone)]
    struct ArbitraryAddress(ProtocolAddress);

    impl quickcheck::Arbitrary for ArbitraryAddress {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let uuid = uuid::Uuid::from_u128(u128::arbitrary(g));
            let device_id = 1 + u32::arbitrary(g) % 16;
            ArbitraryAddress(ProtocolAddress::new(
                uuid.to_string(),
                DeviceId::new(device_id).unwrap(),
            ))
        }
    }

    #[derive(Clone)]
    struct ArbitraryKeyPair(IdentityKeyPair);

    impl quickcheck::Arbitrary for ArbitraryKeyPair {
        fn arbitrary(_g: &mut quickcheck::Gen) -> Self {
            // Gen isn't a CryptoRng, so generate with the real RNG instead.
            ArbitraryKeyPair(IdentityKeyPair::generate(&mut rand::rng()))
        }
    }

    /// A freshly saved identity is always trusted against itself, for any
    /// address and key pair.
    #[quickcheck_async::tokio]
    async fn saving_an_identity_trusts_it_immediately(
        address: ArbitraryAddress,
        key_pair: ArbitraryKeyPair,
    ) -> bool {
        let (mut store, _recipients, _dir) = new_store();
        let identity_key = *key_pair.0.identity_key();
        store.save_identity(&address.0, &identity_key).await.unwrap();
        store
            .is_trusted_identity(&address.0, &identity_key, Direction::Receiving)
            .await
            .unwrap()
    }
}
