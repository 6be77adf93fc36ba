//! PayID Registry
//!
//! Maps human-readable payment identifiers (`<account>$<host>`) to sets of
//! payment-network addresses keyed by `(paymentNetwork, environment)`.
//! The registry owns validation, uniqueness and the rename-aware upsert;
//! persistence is delegated to a [`RecordStore`] backend.

pub mod errors;
pub mod registry;
pub mod store;
pub mod types;

pub use errors::*;
pub use registry::{Cancellation, PayIdRegistry};
pub use store::{MemoryRecordStore, RecordStore, SledRecordStore};
pub use types::*;
