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
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::address::{E164, RecipientAddress};
use crate::error::{Result, StoreError};
use crate::recipient::{Contact, Profile, ProfileKey, ProfileKeyCredential, Recipient, RecipientId};

/// Registered once per [`RecipientStore`], invoked after a merge so that
/// sibling stores (protocol sessions, UI contact caches) can rewrite their
/// own keys from `src` to `dst`. Fired outside the store's mutex — see
/// spec §5 "Shared state".
pub trait MergeSink: Send + Sync {
    fn merge_recipients(&self, dst: RecipientId, src: RecipientId);
}

/// Default sink for callers (and tests) that don't maintain any sibling
/// per-recipient state.
pub struct NullMergeSink;

impl MergeSink for NullMergeSink {
    fn merge_recipients(&self, _dst: RecipientId, _src: RecipientId) {}
}

struct Inner {
    last_id: u64,
    recipients: HashMap<RecipientId, Recipient>,
    by_uuid: HashMap<Uuid, RecipientId>,
    by_number: HashMap<E164, RecipientId>,
    redirects: HashMap<RecipientId, RecipientId>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            last_id: 0,
            recipients: HashMap::new(),
            by_uuid: HashMap::new(),
            by_number: HashMap::new(),
            redirects: HashMap::new(),
        }
    }

    fn create_recipient(&mut self, addr: RecipientAddress) -> RecipientId {
        self.last_id += 1;
        let id = RecipientId(self.last_id);
        if let Some(uuid) = addr.uuid() {
            self.by_uuid.insert(uuid, id);
        }
        if let Some(number) = addr.number().cloned() {
            self.by_number.insert(number, id);
        }
        self.recipients.insert(id, Recipient::new(addr));
        id
    }

    fn attach_number(&mut self, id: RecipientId, number: E164) {
        let recipient = self.recipients.get_mut(&id).expect("id is live");
        if let Some(old) = recipient.address.take_number() {
            self.by_number.remove(&old);
        }
        recipient.address.set_number(Some(number.clone()));
        self.by_number.insert(number, id);
    }

    fn attach_uuid(&mut self, id: RecipientId, uuid: Uuid) {
        let recipient = self.recipients.get_mut(&id).expect("id is live");
        if let Some(old) = recipient.address.take_uuid() {
            self.by_uuid.remove(&old);
        }
        recipient.address.set_uuid(Some(uuid));
        self.by_uuid.insert(uuid, id);
    }

    fn strip_number(&mut self, id: RecipientId) {
        let recipient = self.recipients.get_mut(&id).expect("id is live");
        if let Some(number) = recipient.address.take_number() {
            self.by_number.remove(&number);
        }
    }

    /// Merge `src` into `dst`, attaching `number` to `dst` in the same step
    /// (the number that justified the merge) and recording the redirection.
    fn merge(&mut self, dst: RecipientId, src: RecipientId, number: E164) -> Result<()> {
        self.attach_number(dst, number);
        let src_recipient = self
            .recipients
            .remove(&src)
            .ok_or_else(|| StoreError::Corrupt(format!("recipient {src} vanished mid-merge")))?;
        self.redirects.insert(src, dst);
        let dst_recipient = self.recipients.get_mut(&dst).expect("dst is live");
        dst_recipient.absorb(src_recipient);
        Ok(())
    }

    /// The resolution algorithm of spec §4.1. Returns the resolved id and,
    /// if a merge happened, the `(dst, src)` pair for the merge sink.
    fn resolve(
        &mut self,
        addr: &RecipientAddress,
        high_trust: bool,
    ) -> Result<(RecipientId, Option<(RecipientId, RecipientId)>)> {
        let r_u = addr.uuid().and_then(|u| self.by_uuid.get(&u).copied());
        let r_n = addr.number().and_then(|n| self.by_number.get(n).copied());

        // Branch 1: neither identifier is known.
        if r_u.is_none() && r_n.is_none() {
            let create_addr = if high_trust || addr.has_only_one_field() {
                addr.clone()
            } else {
                RecipientAddress::from_uuid(
                    addr.uuid().expect("both fields present implies a uuid"),
                )
            };
            let id = self.create_recipient(create_addr);
            return Ok((id, None));
        }

        // Branch 2: already linked to the same recipient.
        if let (Some(ru), Some(rn)) = (r_u, r_n) {
            if ru == rn {
                return Ok((ru, None));
            }
        }

        // Branch 3: low trust and at least one record exists — read only.
        if !high_trust {
            let id = r_u.or(r_n).expect("branch 1 handled the none/none case");
            return Ok((id, None));
        }

        match (r_u, r_n) {
            // Branch 4: uuid known, number unknown.
            (Some(ru), None) => {
                if let Some(number) = addr.number() {
                    self.attach_number(ru, number.clone());
                }
                Ok((ru, None))
            }
            // Branch 5: number known, uuid unknown.
            (None, Some(rn)) => {
                let existing_uuid = self.recipients.get(&rn).and_then(|r| r.address.uuid());
                match existing_uuid {
                    Some(existing) if Some(existing) != addr.uuid() => {
                        self.strip_number(rn);
                        let id = self.create_recipient(addr.clone());
                        Ok((id, None))
                    }
                    _ => {
                        if let Some(uuid) = addr.uuid() {
                            self.attach_uuid(rn, uuid);
                        }
                        Ok((rn, None))
                    }
                }
            }
            // Branch 6: both known, and (per branch 2) distinct.
            (Some(ru), Some(rn)) => {
                let rn_uuid = self.recipients.get(&rn).and_then(|r| r.address.uuid());
                if let Some(rn_uuid) = rn_uuid {
                    if Some(rn_uuid) != addr.uuid() {
                        self.strip_number(rn);
                        if let Some(number) = addr.number() {
                            self.attach_number(ru, number.clone());
                        }
                        return Ok((ru, None));
                    }
                }
                let number = addr
                    .number()
                    .cloned()
                    .expect("r_n was resolved from addr.number");
                self.merge(ru, rn, number)?;
                Ok((ru, Some((ru, rn))))
            }
            (None, None) => unreachable!("handled by branch 1"),
        }
    }

    fn actual_id(&self, mut id: RecipientId) -> Result<RecipientId> {
        let limit = self.recipients.len() + self.redirects.len() + 1;
        for _ in 0..limit {
            match self.redirects.get(&id) {
                Some(&next) => id = next,
                None => return Ok(id),
            }
        }
        Err(StoreError::MergeCycle(id.0))
    }
}

/// Content-addressable registry reconciling phone numbers and service UUIDs
/// into stable [`RecipientId`]s. See spec §4.1.
pub struct RecipientStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    merge_sink: Arc<dyn MergeSink>,
}

impl RecipientStore {
    /// Load the store from `path`, or start empty if the file doesn't exist
    /// (spec §6: "A missing file is equivalent to an empty store").
    pub fn open(path: impl Into<PathBuf>, merge_sink: Arc<dyn MergeSink>) -> Result<Self> {
        let path = path.into();
        let inner = match std::fs::read(&path) {
            Ok(bytes) => wire::load(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no recipient store on disk, starting empty");
                Inner::empty()
            }
            Err(error) => return Err(error.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
            merge_sink,
        })
    }

    /// Low- or high-trust resolution of `addr` to a stable id. See spec §4.1.
    pub fn resolve(&self, addr: &RecipientAddress, high_trust: bool) -> Result<RecipientId> {
        let (id, merge_event) = {
            let mut inner = self.inner.lock().expect("recipient store mutex poisoned");
            let outcome = inner.resolve(addr, high_trust)?;
            self.persist_locked(&inner)?;
            outcome
        };
        if let Some((dst, src)) = merge_event {
            trace!(%dst, %src, "recipients merged");
            self.merge_sink.merge_recipients(dst, src);
        }
        Ok(id)
    }

    /// Follow the redirection chain for `id` until a live id is reached.
    pub fn actual_id(&self, id: RecipientId) -> Result<RecipientId> {
        let inner = self.inner.lock().expect("recipient store mutex poisoned");
        inner.actual_id(id)
    }

    pub fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let inner = self.inner.lock().expect("recipient store mutex poisoned");
        let actual = inner.actual_id(id)?;
        Ok(inner.recipients.get(&actual).cloned())
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<RecipientId> {
        let inner = self.inner.lock().expect("recipient store mutex poisoned");
        inner.by_uuid.get(&uuid).copied()
    }

    pub fn by_number(&self, number: &E164) -> Option<RecipientId> {
        let inner = self.inner.lock().expect("recipient store mutex poisoned");
        inner.by_number.get(number).copied()
    }

    pub fn list(&self) -> Vec<(RecipientId, Recipient)> {
        let inner = self.inner.lock().expect("recipient store mutex poisoned");
        inner
            .recipients
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let bytes = wire::dump(inner)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

/// Serialize `bytes` to `path` atomically: write to a sibling temp file in
/// the same directory, flush, then rename over the destination. A failure
/// anywhere in this sequence leaves the previous file untouched — see spec
/// §4.1 "Persistence".
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|error| StoreError::Io(error.error))?;
    Ok(())
}

mod wire {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct StoreFile {
        #[serde(rename = "lastId")]
        last_id: u64,
        recipients: Vec<RecipientFile>,
    }

    #[derive(Serialize, Deserialize)]
    struct ContactFile {
        name: String,
        color: Option<String>,
        #[serde(rename = "messageExpirationTime")]
        message_expiration_time: u32,
        blocked: bool,
        archived: bool,
    }

    #[derive(Serialize, Deserialize)]
    struct RecipientFile {
        id: u64,
        number: Option<String>,
        uuid: Option<String>,
        #[serde(rename = "profileKey")]
        profile_key: Option<String>,
        #[serde(rename = "profileKeyCredential")]
        profile_key_credential: Option<String>,
        contact: Option<ContactFile>,
        profile: Option<crate::recipient::wire::ProfileWire>,
    }

    pub(super) fn dump(inner: &Inner) -> Result<Vec<u8>> {
        let mut recipients: Vec<RecipientFile> = inner
            .recipients
            .iter()
            .map(|(id, r)| RecipientFile {
                id: id.0,
                number: r.address.number().map(|n| n.to_string()),
                uuid: r.address.uuid().map(|u| u.to_string()),
                profile_key: r
                    .profile_key
                    .as_ref()
                    .map(|k| base64::engine::general_purpose::STANDARD.encode(k.0)),
                profile_key_credential: r
                    .profile_key_credential
                    .as_ref()
                    .map(|c| base64::engine::general_purpose::STANDARD.encode(&c.0)),
                contact: r.contact.as_ref().map(|c| ContactFile {
                    name: c.name.clone(),
                    color: c.color.clone(),
                    message_expiration_time: c.message_expiration_time,
                    blocked: c.blocked,
                    archived: c.archived,
                }),
                profile: r.profile.as_ref().map(Into::into),
            })
            .collect();
        recipients.sort_by_key(|r| r.id);
        let file = StoreFile {
            last_id: inner.last_id,
            recipients,
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub(super) fn load(bytes: &[u8]) -> Result<Inner> {
        let file: StoreFile = serde_json::from_slice(bytes)?;
        let mut inner = Inner::empty();
        inner.last_id = file.last_id;
        for r in file.recipients {
            let uuid = r
                .uuid
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let number = r.number.map(|s| s.parse()).transpose()?;
            let address = RecipientAddress::new(uuid, number)
                .map_err(|_| StoreError::Corrupt(format!("recipient {} has no identifier", r.id)))?;
            let mut recipient = Recipient::new(address.clone());
            recipient.profile_key = r
                .profile_key
                .map(|b64| decode_32(&b64))
                .transpose()?
                .map(ProfileKey);
            recipient.profile_key_credential = r
                .profile_key_credential
                .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64))
                .transpose()?
                .map(ProfileKeyCredential);
            recipient.contact = r.contact.map(|c| Contact {
                name: c.name,
                color: c.color,
                message_expiration_time: c.message_expiration_time,
                blocked: c.blocked,
                archived: c.archived,
            });
            recipient.profile = r.profile.map(Profile::from);

            let id = RecipientId(r.id);
            if let Some(uuid) = address.uuid() {
                inner.by_uuid.insert(uuid, id);
            }
            if let Some(number) = address.number().cloned() {
                inner.by_number.insert(number, id);
            }
            inner.recipients.insert(id, recipient);
        }
        Ok(inner)
    }

    fn decode_32(b64: &str) -> Result<[u8; 32]> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
        bytes
            .try_into()
            .map_err(|_| StoreError::Corrupt("profile key is not 32 bytes".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        calls: Mutex<Vec<(RecipientId, RecipientId)>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl MergeSink for CountingSink {
        fn merge_recipients(&self, dst: RecipientId, src: RecipientId) {
            self.calls.lock().unwrap().push((dst, src));
        }
    }

    fn store() -> (RecipientStore, Arc<CountingSink>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sink = CountingSink::new();
        let store =
            RecipientStore::open(dir.path().join("recipients.json"), sink.clone()).unwrap();
        (store, sink, dir)
    }

    fn number(s: &str) -> E164 {
        s.parse().unwrap()
    }

    #[test]
    fn scenario_1_new_user_uuid_only() {
        let (store, _sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let id = store
            .resolve(&RecipientAddress::from_uuid(u1), false)
            .unwrap();
        assert_eq!(id, RecipientId(1));
        let recipient = store.get(id).unwrap().unwrap();
        assert_eq!(recipient.address.uuid(), Some(u1));
        assert_eq!(recipient.address.number(), None);
    }

    #[test]
    fn scenario_2_low_trust_sighting_drops_number() {
        let (store, _sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let n = number("+15550000001");
        let addr = RecipientAddress::new(Some(u1), Some(n)).unwrap();
        let id = store.resolve(&addr, false).unwrap();
        let recipient = store.get(id).unwrap().unwrap();
        assert_eq!(recipient.address.uuid(), Some(u1));
        assert_eq!(recipient.address.number(), None);
    }

    #[test]
    fn scenario_3_high_trust_binding_is_idempotent() {
        let (store, _sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let n = number("+15550000001");
        let id1 = store.resolve(&RecipientAddress::from_uuid(u1), false).unwrap();

        let addr = RecipientAddress::new(Some(u1), Some(n.clone())).unwrap();
        let id2 = store.resolve(&addr, true).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(
            store.get(id2).unwrap().unwrap().address.number(),
            Some(n.clone()).as_ref()
        );

        let id3 = store.resolve(&addr, true).unwrap();
        assert_eq!(id2, id3);
    }

    #[test]
    fn scenario_4_merge() {
        let (store, sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let n = number("+15550000001");
        let id1 = store.resolve(&RecipientAddress::from_uuid(u1), false).unwrap();
        let id2 = store
            .resolve(&RecipientAddress::from_number(n.clone()), false)
            .unwrap();
        assert_ne!(id1, id2);

        let addr = RecipientAddress::new(Some(u1), Some(n)).unwrap();
        let merged = store.resolve(&addr, true).unwrap();
        assert_eq!(merged, id1);
        assert_eq!(store.actual_id(id2).unwrap(), id1);
        assert_eq!(
            store.get(id2).unwrap().unwrap().address,
            store.get(id1).unwrap().unwrap().address
        );
        assert_eq!(sink.calls.lock().unwrap().as_slice(), &[(id1, id2)]);
    }

    #[test]
    fn scenario_5_number_stealing() {
        let (store, sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let n = number("+15550000001");

        let addr1 = RecipientAddress::new(Some(u1), Some(n.clone())).unwrap();
        let id1 = store.resolve(&addr1, true).unwrap();
        let id2 = store.resolve(&RecipientAddress::from_uuid(u2), false).unwrap();

        let addr2 = RecipientAddress::new(Some(u2), Some(n.clone())).unwrap();
        let result = store.resolve(&addr2, true).unwrap();
        assert_eq!(result, id2);

        let r1 = store.get(id1).unwrap().unwrap();
        assert_eq!(r1.address.uuid(), Some(u1));
        assert_eq!(r1.address.number(), None);

        let r2 = store.get(id2).unwrap().unwrap();
        assert_eq!(r2.address.uuid(), Some(u2));
        assert_eq!(r2.address.number(), Some(&n));

        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn low_trust_never_mutates_existing_recipients() {
        let (store, _sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let n = number("+15550000001");
        let id1 = store.resolve(&RecipientAddress::from_uuid(u1), true).unwrap();
        let before = store.get(id1).unwrap().unwrap();

        let addr = RecipientAddress::new(Some(u1), Some(n)).unwrap();
        let id2 = store.resolve(&addr, false).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.get(id1).unwrap().unwrap(), before);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipients.json");
        let u1 = Uuid::new_v4();
        let n = number("+15550000001");
        {
            let store = RecipientStore::open(&path, Arc::new(NullMergeSink)).unwrap();
            let addr = RecipientAddress::new(Some(u1), Some(n.clone())).unwrap();
            store.resolve(&addr, true).unwrap();
        }
        let reloaded = RecipientStore::open(&path, Arc::new(NullMergeSink)).unwrap();
        let id = reloaded.by_uuid(u1).unwrap();
        let recipient = reloaded.get(id).unwrap().unwrap();
        assert_eq!(recipient.address.number(), Some(&n));
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let store = RecipientStore::open(&path, Arc::new(NullMergeSink)).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn actual_id_on_unknown_id_is_a_no_op() {
        let (store, _sink, _dir) = store();
        // actual_id on a never-emitted id is itself (no redirection entry).
        assert_eq!(store.actual_id(RecipientId(999)).unwrap(), RecipientId(999));
    }

    #[test]
    fn actual_id_follows_a_chain_of_merges() {
        let (store, _sink, _dir) = store();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let n = number("+15550000001");

        let id1 = store.resolve(&RecipientAddress::from_uuid(u1), false).unwrap();
        let id2 = store
            .resolve(&RecipientAddress::new(Some(u2), Some(n.clone())).unwrap(), true)
            .unwrap();
        assert_ne!(id1, id2);

        // Bind u1 to u2's number at high trust: merges id2 into id1 only if
        // u1 is the uuid match and id2 is the number match, so resolve with
        // addr=(u1, n) merges id2 (the number owner) into id1 (the uuid owner).
        let merged = store
            .resolve(&RecipientAddress::new(Some(u1), Some(n)).unwrap(), true)
            .unwrap();
        assert_eq!(merged, id1);
        assert_eq!(store.actual_id(id2).unwrap(), id1);
    }

    #[derive(Debug, Clone)]
    struct ArbitraryAddress(RecipientAddress);

    impl quickcheck::Arbitrary for ArbitraryAddress {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let uuid = Uuid::from_u128(u128::arbitrary(g));
            let number = number(&format!("+1{:010}", u64::arbitrary(g) % 10_000_000_000));
            let addr = match bool::arbitrary(g) {
                true => RecipientAddress::new(Some(uuid), Some(number)).unwrap(),
                false if bool::arbitrary(g) => RecipientAddress::from_uuid(uuid),
                false => RecipientAddress::from_number(number),
            };
            ArbitraryAddress(addr)
        }
    }

    /// Resolving the same address twice at the same trust level is
    /// idempotent: the second call never creates a new recipient or merges
    /// anything, it just hands back the id the first call produced.
    #[quickcheck_macros::quickcheck]
    fn resolve_is_idempotent_for_a_repeated_address(addr: ArbitraryAddress, high_trust: bool) -> bool {
        let (store, sink, _dir) = store();
        let first = store.resolve(&addr.0, high_trust).unwrap();
        let calls_after_first = sink.calls.lock().unwrap().len();
        let second = store.resolve(&addr.0, high_trust).unwrap();
        let calls_after_second = sink.calls.lock().unwrap().len();
        first == second && calls_after_first == calls_after_second
    }
}
