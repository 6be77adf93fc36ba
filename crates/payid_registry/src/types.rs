//! Types for the PayID registry

use crate::errors::{MalformedReason, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Character separating the account part from the host part.
pub const PAYID_DELIMITER: char = '$';

/// Validated, normalized PayID (`<account>$<host>`).
///
/// The only way to obtain one is [`PayId::parse`], so every value held by the
/// registry contains exactly one delimiter and is already lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayId(String);

impl PayId {
    /// Validate and normalize a raw identifier.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        match raw.matches(PAYID_DELIMITER).count() {
            0 => Err(RegistryError::MalformedIdentifier {
                pay_id: raw.to_string(),
                reason: MalformedReason::MissingDelimiter,
            }),
            1 => Ok(Self(raw.to_lowercase())),
            _ => Err(RegistryError::MalformedIdentifier {
                pay_id: raw.to_string(),
                reason: MalformedReason::MultipleDelimiters,
            }),
        }
    }

    /// Get the identifier as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PayId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PayId> for String {
    fn from(value: PayId) -> Self {
        value.0
    }
}

/// One payment destination under a PayID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressEntry {
    /// Payment rail tag, e.g. `XRPL` or `ACH`
    pub payment_network: String,
    /// Sub-scope of the network; absent for rails without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Network-specific payload, stored and returned verbatim
    pub details: serde_json::Value,
}

impl AddressEntry {
    pub fn new(
        payment_network: impl Into<String>,
        environment: Option<&str>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            payment_network: payment_network.into(),
            environment: environment.map(str::to_string),
            details,
        }
    }

    /// Composite key identifying this entry within its record.
    pub fn key(&self) -> AddressKey {
        AddressKey {
            payment_network: self.payment_network.to_ascii_uppercase(),
            environment: self.environment.as_deref().map(str::to_ascii_uppercase),
        }
    }
}

/// `(paymentNetwork, environment)` pair, compared case-insensitively.
///
/// `environment: None` is a key value of its own and never collides with a
/// present environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub payment_network: String,
    pub environment: Option<String>,
}

/// Stored association between one PayID and its address entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub pay_id: PayId,
    pub addresses: Vec<AddressEntry>,
}

/// Unvalidated record as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    pub pay_id: String,
    pub addresses: Vec<AddressEntry>,
}

impl RecordRequest {
    pub fn new(pay_id: impl Into<String>, addresses: Vec<AddressEntry>) -> Self {
        Self {
            pay_id: pay_id.into(),
            addresses,
        }
    }

    /// Validate the identifier and the uniqueness of address keys.
    pub fn validate(self) -> Result<Record, RegistryError> {
        let pay_id = PayId::parse(&self.pay_id)?;
        ensure_unique_keys(&self.addresses)?;
        Ok(Record {
            pay_id,
            addresses: self.addresses,
        })
    }
}

fn ensure_unique_keys(addresses: &[AddressEntry]) -> Result<(), RegistryError> {
    let mut seen = HashSet::with_capacity(addresses.len());
    for entry in addresses {
        if !seen.insert(entry.key()) {
            return Err(RegistryError::DuplicateAddressKey {
                payment_network: entry.payment_network.clone(),
                environment: entry.environment.clone(),
            });
        }
    }
    Ok(())
}

/// Result of [`crate::PayIdRegistry::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// An existing record was replaced (and possibly renamed)
    Updated(Record),
    /// No record existed at the target; one was created under the body's PayID
    Created(Record),
}

impl UpsertOutcome {
    pub fn record(&self) -> &Record {
        match self {
            Self::Updated(record) | Self::Created(record) => record,
        }
    }
}

/// Result of [`crate::PayIdRegistry::delete`]. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotPresent,
}
