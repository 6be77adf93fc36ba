//! Error types for the PayID registry

use std::fmt;
use thiserror::Error;

/// Why an identifier failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    MissingDelimiter,
    MultipleDelimiters,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDelimiter => f.write_str("missing delimiter"),
            Self::MultipleDelimiters => f.write_str("multiple delimiters"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Malformed PayID {pay_id}: {reason}")]
    MalformedIdentifier {
        pay_id: String,
        reason: MalformedReason,
    },

    #[error("PayID not found: {pay_id}")]
    NotFound { pay_id: String },

    #[error("PayID already exists: {pay_id}")]
    AlreadyExists { pay_id: String },

    #[error("Duplicate address for network {payment_network} (environment {environment:?})")]
    DuplicateAddressKey {
        payment_network: String,
        environment: Option<String>,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl RegistryError {
    /// Only storage failures are worth retrying; every other class is
    /// deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedIdentifier { .. } => "malformed_identifier",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::DuplicateAddressKey { .. } => "duplicate_address_key",
            Self::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<sled::Error> for RegistryError {
    fn from(value: sled::Error) -> Self {
        Self::StorageUnavailable(value.into())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(value: serde_json::Error) -> Self {
        Self::StorageUnavailable(anyhow::Error::new(value).context("stored record is not decodable"))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
