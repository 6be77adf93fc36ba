//! Record storage backends
//!
//! The registry never touches a map directly; it is handed a [`RecordStore`]
//! and performs every read and write through it. Each method is atomic on its
//! own, `relocate` included, so readers never observe a half-written record.

use crate::errors::*;
use crate::types::*;
use anyhow::anyhow;
use parking_lot::RwLock;
use sled::transaction::TransactionResult;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;

/// Abstract record storage
pub trait RecordStore: Send + Sync {
    fn load(&self, pay_id: &PayId) -> Result<Option<Record>>;
    /// Insert or overwrite the record keyed by its own PayID.
    fn put(&self, record: &Record) -> Result<()>;
    /// Remove `previous` and install `record` under its PayID in one step.
    fn relocate(&self, previous: &PayId, record: &Record) -> Result<()>;
    fn remove(&self, pay_id: &PayId) -> Result<bool>;
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory implementation
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<PayId, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, pay_id: &PayId) -> Result<Option<Record>> {
        Ok(self.records.read().get(pay_id).cloned())
    }

    fn put(&self, record: &Record) -> Result<()> {
        self.records
            .write()
            .insert(record.pay_id.clone(), record.clone());
        Ok(())
    }

    fn relocate(&self, previous: &PayId, record: &Record) -> Result<()> {
        let mut records = self.records.write();
        records.remove(previous);
        records.insert(record.pay_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, pay_id: &PayId) -> Result<bool> {
        Ok(self.records.write().remove(pay_id).is_some())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

/// Sled-backed implementation
pub struct SledRecordStore {
    db: Db,
    records: Tree,
}

impl SledRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        tracing::info!(records = records.len(), "Opened sled record store");
        Ok(Self { db, records })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl RecordStore for SledRecordStore {
    fn load(&self, pay_id: &PayId) -> Result<Option<Record>> {
        self.records
            .get(pay_id.as_str().as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn put(&self, record: &Record) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.records.insert(record.pay_id.as_str().as_bytes(), data)?;
        Ok(())
    }

    fn relocate(&self, previous: &PayId, record: &Record) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        let result: TransactionResult<(), ()> = self.records.transaction(|tx| {
            tx.remove(previous.as_str().as_bytes())?;
            tx.insert(record.pay_id.as_str().as_bytes(), data.as_slice())?;
            Ok(())
        });
        result.map_err(|err| anyhow!("sled relocate transaction failed: {err:?}"))?;
        Ok(())
    }

    fn remove(&self, pay_id: &PayId) -> Result<bool> {
        Ok(self.records.remove(pay_id.as_str().as_bytes())?.is_some())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}
