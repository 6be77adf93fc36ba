//! PayID registry implementation
//!
//! Validates identifiers, enforces global PayID uniqueness and per-record
//! address-key uniqueness, and implements the rename-aware upsert used by the
//! update endpoint.

use crate::errors::*;
use crate::store::{MemoryRecordStore, RecordStore};
use crate::types::*;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;

/// Handshake between a caller that may stop waiting and a mutation that may
/// still be queued behind the write gate.
///
/// Exactly one side wins: either the mutation claims the token before its
/// first write, or the caller cancels it and nothing is written.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicU8>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the call. Returns `false` if the mutation already started
    /// committing, in which case its real outcome must be awaited.
    pub fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }

    fn begin_commit(&self) -> Result<()> {
        self.0
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                warn!("Registry call abandoned by its caller before commit");
                RegistryError::StorageUnavailable(anyhow!("call abandoned before commit"))
            })
    }
}

/// Decision taken by `upsert` before anything is written.
#[derive(Debug, PartialEq, Eq)]
enum UpsertPlan {
    Update,
    UpdateAndRename,
    Create,
    Conflict,
}

/// PayID registry
///
/// Owns a handle to a [`RecordStore`]. Mutations serialize through a single
/// write gate so the check-then-write sequences of `create` and `upsert`
/// cannot interleave; reads go straight to the store.
pub struct PayIdRegistry {
    store: Arc<dyn RecordStore>,
    writes: Mutex<()>,
}

impl PayIdRegistry {
    /// Create a registry over the given store
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            writes: Mutex::new(()),
        }
    }

    /// Create a registry backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordStore::new()))
    }

    /// Validate and normalize an identifier
    pub fn validate(pay_id: &str) -> Result<PayId> {
        PayId::parse(pay_id)
    }

    /// Fetch the record stored under `pay_id`
    pub fn get(&self, pay_id: &str) -> Result<Record> {
        let result = self.get_inner(pay_id);
        record_outcome("get", &result);
        result
    }

    fn get_inner(&self, pay_id: &str) -> Result<Record> {
        let pay_id = Self::validate(pay_id)?;
        self.store
            .load(&pay_id)?
            .ok_or_else(|| RegistryError::NotFound {
                pay_id: pay_id.to_string(),
            })
    }

    /// Insert a new record. Fails if the PayID is already taken.
    pub fn create(&self, request: RecordRequest) -> Result<Record> {
        self.create_cancellable(request, &Cancellation::new())
    }

    /// [`Self::create`] that writes nothing once `cancel` has been cancelled.
    pub fn create_cancellable(
        &self,
        request: RecordRequest,
        cancel: &Cancellation,
    ) -> Result<Record> {
        let result = self.create_inner(request, cancel);
        record_outcome("create", &result);
        result
    }

    fn create_inner(&self, request: RecordRequest, cancel: &Cancellation) -> Result<Record> {
        let record = request.validate()?;

        let _gate = self.writes.lock();
        if self.store.load(&record.pay_id)?.is_some() {
            return Err(RegistryError::AlreadyExists {
                pay_id: record.pay_id.to_string(),
            });
        }
        cancel.begin_commit()?;
        self.store.put(&record)?;

        info!(pay_id = %record.pay_id, addresses = record.addresses.len(), "Created PayID record");
        Ok(record)
    }

    /// Update-or-insert keyed by `target` (the path PayID).
    ///
    /// * target exists: its addresses are replaced; if the body PayID differs
    ///   the record moves to the new key. Reported as `Updated`.
    /// * target missing: a record is created under the body PayID, not the
    ///   target. Reported as `Created`.
    /// * the body PayID differs from the target and is already taken by
    ///   another record: `AlreadyExists`, nothing is written.
    pub fn upsert(&self, target: &str, request: RecordRequest) -> Result<UpsertOutcome> {
        self.upsert_cancellable(target, request, &Cancellation::new())
    }

    /// [`Self::upsert`] that writes nothing once `cancel` has been cancelled.
    pub fn upsert_cancellable(
        &self,
        target: &str,
        request: RecordRequest,
        cancel: &Cancellation,
    ) -> Result<UpsertOutcome> {
        let result = self.upsert_inner(target, request, cancel);
        record_outcome("upsert", &result);
        result
    }

    fn upsert_inner(
        &self,
        target: &str,
        request: RecordRequest,
        cancel: &Cancellation,
    ) -> Result<UpsertOutcome> {
        let target = Self::validate(target)?;
        let record = request.validate()?;

        let _gate = self.writes.lock();
        let plan = self.plan_upsert(&target, &record)?;
        debug!(target = %target, pay_id = %record.pay_id, ?plan, "Planned PayID upsert");

        if plan == UpsertPlan::Conflict {
            return Err(RegistryError::AlreadyExists {
                pay_id: record.pay_id.to_string(),
            });
        }
        cancel.begin_commit()?;

        match plan {
            UpsertPlan::Update => {
                self.store.put(&record)?;
                info!(pay_id = %record.pay_id, "Updated PayID record");
                Ok(UpsertOutcome::Updated(record))
            }
            UpsertPlan::UpdateAndRename => {
                self.store.relocate(&target, &record)?;
                info!(from = %target, to = %record.pay_id, "Renamed PayID record");
                Ok(UpsertOutcome::Updated(record))
            }
            UpsertPlan::Create | UpsertPlan::Conflict => {
                self.store.put(&record)?;
                info!(pay_id = %record.pay_id, "Created PayID record via upsert");
                Ok(UpsertOutcome::Created(record))
            }
        }
    }

    fn plan_upsert(&self, target: &PayId, record: &Record) -> Result<UpsertPlan> {
        let renaming = *target != record.pay_id;
        if renaming && self.store.load(&record.pay_id)?.is_some() {
            return Ok(UpsertPlan::Conflict);
        }

        Ok(match (self.store.load(target)?.is_some(), renaming) {
            (true, false) => UpsertPlan::Update,
            (true, true) => UpsertPlan::UpdateAndRename,
            (false, _) => UpsertPlan::Create,
        })
    }

    /// Remove the record under `pay_id`. Removing a missing record succeeds.
    pub fn delete(&self, pay_id: &str) -> Result<DeleteOutcome> {
        self.delete_cancellable(pay_id, &Cancellation::new())
    }

    /// [`Self::delete`] that removes nothing once `cancel` has been cancelled.
    pub fn delete_cancellable(&self, pay_id: &str, cancel: &Cancellation) -> Result<DeleteOutcome> {
        let result = self.delete_inner(pay_id, cancel);
        record_outcome("delete", &result);
        result
    }

    fn delete_inner(&self, pay_id: &str, cancel: &Cancellation) -> Result<DeleteOutcome> {
        let pay_id = Self::validate(pay_id)?;

        let _gate = self.writes.lock();
        cancel.begin_commit()?;
        if self.store.remove(&pay_id)? {
            info!(pay_id = %pay_id, "Deleted PayID record");
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!(pay_id = %pay_id, "Delete of absent PayID is a no-op");
            Ok(DeleteOutcome::NotPresent)
        }
    }

    /// Number of stored records
    pub fn count(&self) -> Result<usize> {
        self.store.len()
    }
}

impl Default for PayIdRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for PayIdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayIdRegistry").finish_non_exhaustive()
    }
}

fn record_outcome<T>(op: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    metrics::counter!("payid_registry_operations_total", "op" => op, "outcome" => outcome)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn xrpl_testnet(address: &str) -> AddressEntry {
        AddressEntry::new("XRPL", Some("TESTNET"), json!({ "address": address }))
    }

    fn ach() -> AddressEntry {
        AddressEntry::new(
            "ACH",
            None,
            json!({"accountNumber": "000123456789", "routingNumber": "123456789"}),
        )
    }

    fn request(pay_id: &str, addresses: Vec<AddressEntry>) -> RecordRequest {
        RecordRequest::new(pay_id, addresses)
    }

    fn is_not_found(err: &RegistryError) -> bool {
        matches!(err, RegistryError::NotFound { .. })
    }

    #[test]
    fn test_create_then_get_round_trips() {
        let registry = PayIdRegistry::in_memory();
        let req = request(
            "alice$xpring.money",
            vec![xrpl_testnet("TVacixsWrqyWCr98eTYP7FSzE9NwupESR4TrnijN7fccNiS")],
        );

        let created = registry.create(req.clone()).unwrap();
        assert_eq!(created.pay_id.as_str(), req.pay_id);
        assert_eq!(created.addresses, req.addresses);

        let fetched = registry.get("alice$xpring.money").unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let registry = PayIdRegistry::in_memory();
        let err = registry.get("johndoe$xpring.money").unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_get_malformed_is_not_not_found() {
        let registry = PayIdRegistry::in_memory();
        let err = registry.get("johndoe.xpring.money").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MalformedIdentifier {
                reason: MalformedReason::MissingDelimiter,
                ..
            }
        ));
    }

    #[test]
    fn test_create_duplicate_pay_id_conflicts_regardless_of_addresses() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![ach()]))
            .unwrap();

        let err = registry
            .create(request("alice$xpring.money", vec![xrpl_testnet("T1")]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));

        let err = registry
            .create(request("ALICE$xpring.money", vec![]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));

        assert_eq!(registry.get("alice$xpring.money").unwrap().addresses, vec![ach()]);
    }

    #[test]
    fn test_create_rejects_duplicate_address_keys() {
        let registry = PayIdRegistry::in_memory();
        let err = registry
            .create(request(
                "dupe$xpring.money",
                vec![xrpl_testnet("T1"), xrpl_testnet("T2")],
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddressKey { .. }));
        assert!(is_not_found(&registry.get("dupe$xpring.money").unwrap_err()));
    }

    #[test]
    fn test_create_accepts_entry_without_environment() {
        let registry = PayIdRegistry::in_memory();
        let ach_testnet = AddressEntry::new("ACH", Some("TESTNET"), json!({"accountNumber": "1"}));
        let record = registry
            .create(request("bank$xpring.money", vec![ach(), ach_testnet]))
            .unwrap();
        assert_eq!(record.addresses.len(), 2);
    }

    #[test]
    fn test_upsert_replaces_addresses_in_place() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![xrpl_testnet("T1")]))
            .unwrap();

        let outcome = registry
            .upsert("alice$xpring.money", request("alice$xpring.money", vec![ach()]))
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Updated(_)));
        assert_eq!(outcome.record().addresses, vec![ach()]);
        assert_eq!(registry.get("alice$xpring.money").unwrap().addresses, vec![ach()]);
    }

    #[test]
    fn test_upsert_renames_to_unused_pay_id() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![xrpl_testnet("T1")]))
            .unwrap();

        let outcome = registry
            .upsert(
                "alice$xpring.money",
                request("alice$bitpay.com", vec![xrpl_testnet("T9")]),
            )
            .unwrap();

        assert!(matches!(outcome, UpsertOutcome::Updated(_)));
        assert!(is_not_found(&registry.get("alice$xpring.money").unwrap_err()));
        let moved = registry.get("alice$bitpay.com").unwrap();
        assert_eq!(moved.addresses, vec![xrpl_testnet("T9")]);
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_creates_under_body_pay_id_when_target_missing() {
        let registry = PayIdRegistry::in_memory();
        let outcome = registry
            .upsert("ghost$xpring.money", request("bob$xpring.money", vec![ach()]))
            .unwrap();

        match outcome {
            UpsertOutcome::Created(record) => {
                assert_eq!(record.pay_id.as_str(), "bob$xpring.money")
            }
            other => panic!("expected Created, got {other:?}"),
        }
        assert!(is_not_found(&registry.get("ghost$xpring.money").unwrap_err()));
        assert!(registry.get("bob$xpring.money").is_ok());
    }

    #[test]
    fn test_upsert_onto_taken_pay_id_conflicts_without_mutation() {
        let registry = PayIdRegistry::in_memory();
        let alice = registry
            .create(request("alice$xpring.money", vec![xrpl_testnet("T1")]))
            .unwrap();
        let bob = registry.create(request("bob$xpring.money", vec![ach()])).unwrap();

        let err = registry
            .upsert("alice$xpring.money", request("bob$xpring.money", vec![]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));

        assert_eq!(registry.get("alice$xpring.money").unwrap(), alice);
        assert_eq!(registry.get("bob$xpring.money").unwrap(), bob);
    }

    #[test]
    fn test_upsert_conflicts_even_when_target_missing() {
        let registry = PayIdRegistry::in_memory();
        let bob = registry.create(request("bob$xpring.money", vec![ach()])).unwrap();

        let err = registry
            .upsert("nobody$xpring.money", request("bob$xpring.money", vec![]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
        assert_eq!(registry.get("bob$xpring.money").unwrap(), bob);
    }

    #[test]
    fn test_upsert_with_malformed_body_pay_id_leaves_store_untouched() {
        let registry = PayIdRegistry::in_memory();
        let alice = registry
            .create(request("alice$xpring.money", vec![xrpl_testnet("T1")]))
            .unwrap();

        let err = registry
            .upsert("alice$xpring.money", request("alice$bob$xpring.money", vec![ach()]))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MalformedIdentifier {
                reason: MalformedReason::MultipleDelimiters,
                ..
            }
        ));
        assert_eq!(registry.get("alice$xpring.money").unwrap(), alice);
    }

    #[test]
    fn test_upsert_with_malformed_target_is_rejected() {
        let registry = PayIdRegistry::in_memory();
        let err = registry
            .upsert("alice.xpring.money", request("alice$xpring.money", vec![]))
            .unwrap_err();
        match err {
            RegistryError::MalformedIdentifier { pay_id, reason } => {
                assert_eq!(pay_id, "alice.xpring.money");
                assert_eq!(reason, MalformedReason::MissingDelimiter);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.count().unwrap(), 0);
    }

    #[test]
    fn test_upsert_rejects_duplicate_address_keys() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![ach()]))
            .unwrap();

        let err = registry
            .upsert("alice$xpring.money", request("alice$xpring.money", vec![ach(), ach()]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddressKey { .. }));
        assert_eq!(registry.get("alice$xpring.money").unwrap().addresses, vec![ach()]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![ach()]))
            .unwrap();

        assert_eq!(registry.delete("alice$xpring.money").unwrap(), DeleteOutcome::Deleted);
        assert_eq!(
            registry.delete("alice$xpring.money").unwrap(),
            DeleteOutcome::NotPresent
        );
        assert!(is_not_found(&registry.get("alice$xpring.money").unwrap_err()));
    }

    #[test]
    fn test_delete_malformed_fails() {
        let registry = PayIdRegistry::in_memory();
        assert!(matches!(
            registry.delete("a$b$c").unwrap_err(),
            RegistryError::MalformedIdentifier { .. }
        ));
    }

    #[test]
    fn test_validate_normalizes_and_rejects() {
        let pay_id = PayIdRegistry::validate("Alice$Xpring.Money").unwrap();
        assert_eq!(pay_id.as_str(), "alice$xpring.money");
        assert!(matches!(
            PayIdRegistry::validate("alice").unwrap_err(),
            RegistryError::MalformedIdentifier {
                reason: MalformedReason::MissingDelimiter,
                ..
            }
        ));
    }

    #[test]
    fn test_cancelled_mutations_write_nothing() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![ach()]))
            .unwrap();

        let cancel = Cancellation::new();
        assert!(cancel.cancel());
        assert!(cancel.is_cancelled());

        let err = registry
            .create_cancellable(request("bob$xpring.money", vec![ach()]), &cancel)
            .unwrap_err();
        assert!(err.is_retryable());
        let err = registry
            .upsert_cancellable(
                "alice$xpring.money",
                request("alice$bitpay.com", vec![]),
                &cancel,
            )
            .unwrap_err();
        assert!(err.is_retryable());
        let err = registry
            .delete_cancellable("alice$xpring.money", &cancel)
            .unwrap_err();
        assert!(err.is_retryable());

        assert!(is_not_found(&registry.get("bob$xpring.money").unwrap_err()));
        assert!(is_not_found(&registry.get("alice$bitpay.com").unwrap_err()));
        assert_eq!(registry.get("alice$xpring.money").unwrap().addresses, vec![ach()]);
    }

    #[test]
    fn test_cancel_after_commit_reports_started() {
        let registry = PayIdRegistry::in_memory();
        let cancel = Cancellation::new();
        registry
            .create_cancellable(request("alice$xpring.money", vec![ach()]), &cancel)
            .unwrap();

        assert!(!cancel.cancel());
        assert!(!cancel.is_cancelled());
        assert!(registry.get("alice$xpring.money").is_ok());
    }

    #[test]
    fn test_conflict_is_reported_even_when_cancelled() {
        let registry = PayIdRegistry::in_memory();
        registry
            .create(request("alice$xpring.money", vec![ach()]))
            .unwrap();

        let cancel = Cancellation::new();
        cancel.cancel();
        let err = registry
            .create_cancellable(request("alice$xpring.money", vec![]), &cancel)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    fn malformed_pay_id() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9.]{0,20}",
            "[a-z0-9.]{0,8}\\$[a-z0-9.]{0,8}\\$[a-z0-9.$]{0,8}",
        ]
    }

    proptest! {
        #[test]
        fn malformed_pay_ids_never_touch_the_store(raw in malformed_pay_id()) {
            let registry = PayIdRegistry::in_memory();
            let is_malformed =
                |err: RegistryError| matches!(err, RegistryError::MalformedIdentifier { .. });

            prop_assert!(is_malformed(registry.get(&raw).unwrap_err()));
            prop_assert!(is_malformed(registry.delete(&raw).unwrap_err()));
            prop_assert!(is_malformed(registry.create(request(&raw, vec![])).unwrap_err()));
            prop_assert!(is_malformed(
                registry.upsert(&raw, request("ok$example.com", vec![])).unwrap_err()
            ));
            prop_assert!(is_malformed(
                registry.upsert("ok$example.com", request(&raw, vec![])).unwrap_err()
            ));
            prop_assert_eq!(registry.count().unwrap(), 0);
        }
    }
}
