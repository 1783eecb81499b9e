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

//! Recipient identity resolution and Signal Protocol key storage.
//!
//! [`RecipientStore`] is the single source of truth for "which uuid and
//! which phone number refer to the same person"; [`ProtocolStore`] builds
//! the Signal Protocol storage contract on top of it so that a recipient
//! merge reroutes sessions and identity keys along with everything else.

mod address;
mod error;
mod protocol;
mod recipient;
mod store;

pub use address::{E164, RecipientAddress};
pub use error::{Result, StoreError};
pub use protocol::{ProtocolStore, TrustLevel, PRE_KEY_BATCH_SIZE};
pub use recipient::{
    Capability, Contact, Profile, ProfileKey, ProfileKeyCredential, Recipient, RecipientId,
    UnidentifiedAccessMode,
};
pub use store::{MergeSink, NullMergeSink, RecipientStore};
