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

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// An E.164 phone number, e.g. `+15551234567`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct E164(String);

impl FromStr for E164 {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('+').unwrap_or(s);
        if s.starts_with('+') && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        {
            Ok(Self(s.to_owned()))
        } else {
            Err(StoreError::InvalidNumber(s.to_owned()))
        }
    }
}

impl TryFrom<String> for E164 {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<E164> for String {
    fn from(value: E164) -> Self {
        value.0
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for E164 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A pair of Signal user identifiers: a stable service UUID (ACI) and/or an
/// E.164 phone number. At least one must be present. Fields are private so
/// every construction path — including deserialization — goes through
/// [`RecipientAddress::new`] and its invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecipientAddressWire", into = "RecipientAddressWire")]
pub struct RecipientAddress {
    uuid: Option<Uuid>,
    number: Option<E164>,
}

#[derive(Serialize, Deserialize)]
struct RecipientAddressWire {
    uuid: Option<Uuid>,
    number: Option<E164>,
}

impl TryFrom<RecipientAddressWire> for RecipientAddress {
    type Error = StoreError;

    fn try_from(wire: RecipientAddressWire) -> Result<Self, Self::Error> {
        RecipientAddress::new(wire.uuid, wire.number)
    }
}

impl From<RecipientAddress> for RecipientAddressWire {
    fn from(addr: RecipientAddress) -> Self {
        Self {
            uuid: addr.uuid,
            number: addr.number,
        }
    }
}

impl RecipientAddress {
    pub fn new(uuid: Option<Uuid>, number: Option<E164>) -> Result<Self, StoreError> {
        if uuid.is_none() && number.is_none() {
            return Err(StoreError::EmptyAddress);
        }
        Ok(Self { uuid, number })
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            number: None,
        }
    }

    pub fn from_number(number: E164) -> Self {
        Self {
            uuid: None,
            number: Some(number),
        }
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn number(&self) -> Option<&E164> {
        self.number.as_ref()
    }

    /// True if every field present in both addresses agrees.
    pub fn is_compatible_with(&self, other: &RecipientAddress) -> bool {
        match (&self.uuid, &other.uuid) {
            (Some(a), Some(b)) if a != b => return false,
            _ => {}
        }
        match (&self.number, &other.number) {
            (Some(a), Some(b)) if a != b => return false,
            _ => {}
        }
        true
    }

    pub fn has_only_one_field(&self) -> bool {
        self.uuid.is_none() != self.number.is_none()
    }

    /// Replace the number, returning whichever one was previously attached.
    /// Crate-internal: callers must preserve the at-least-one-field
    /// invariant themselves (the recipient store always attaches before it
    /// strips the other field).
    pub(crate) fn take_number(&mut self) -> Option<E164> {
        self.number.take()
    }

    pub(crate) fn set_number(&mut self, number: Option<E164>) {
        self.number = number;
    }

    pub(crate) fn take_uuid(&mut self) -> Option<Uuid> {
        self.uuid.take()
    }

    pub(crate) fn set_uuid(&mut self, uuid: Option<Uuid>) {
        self.uuid = uuid;
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uuid, &self.number) {
            (Some(uuid), Some(number)) => write!(f, "{uuid} ({number})"),
            (Some(uuid), None) => write!(f, "{uuid}"),
            (None, Some(number)) => write!(f, "{number}"),
            (None, None) => unreachable!("RecipientAddress invariant: at least one field present"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_e164() {
        assert_eq!("+15551234567".parse::<E164>().unwrap().to_string(), "+15551234567");
    }

    #[test]
    fn rejects_missing_plus() {
        assert!("15551234567".parse::<E164>().is_err());
    }

    #[test]
    fn rejects_non_digits() {
        assert!("+1555abc4567".parse::<E164>().is_err());
    }

    #[test]
    fn compatible_requires_agreement_on_shared_fields() {
        let uuid = Uuid::new_v4();
        let a = RecipientAddress::new(Some(uuid), Some("+15551234567".parse().unwrap())).unwrap();
        let b = RecipientAddress::new(Some(uuid), None).unwrap();
        assert!(a.is_compatible_with(&b));

        let c = RecipientAddress::new(Some(Uuid::new_v4()), None).unwrap();
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn empty_address_rejected() {
        assert!(matches!(
            RecipientAddress::new(None, None),
            Err(StoreError::EmptyAddress)
        ));
    }

    #[test]
    fn deserializing_an_empty_address_is_rejected_not_a_panic() {
        let result: std::result::Result<RecipientAddress, _> =
            serde_json::from_str(r#"{"uuid":null,"number":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn deserialize_then_display_round_trips() {
        let uuid = Uuid::new_v4();
        let json = format!(r#"{{"uuid":"{uuid}","number":null}}"#);
        let addr: RecipientAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr.to_string(), uuid.to_string());
    }
}
