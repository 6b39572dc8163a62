//! StateStore — redb-backed document persistence for jobgrid.
//!
//! Provides generic document operations (fetch, scan, insert, modify,
//! find-and-modify, bulk update) that the typed entity modules build on.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! redb serializes write transactions, so every read-then-write performed
//! inside one write transaction is atomic with respect to every other writer
//! on the same `Database`. redb locks the file exclusively: a second `open`
//! of the same path fails, so all processes sharing a store must share one
//! `StateStore` (clones of the same handle).

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use jobgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// A JSON document stored in its own table.
pub trait Document: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;
    /// Human name used in error messages.
    const KIND: &'static str;

    fn key(&self) -> &str;

    /// Recompute derived fields after loading.
    fn refresh(&mut self, _now: u64) {}
}

/// A document that a single process can hold a lease on.
pub trait Leasable: Document {
    fn holder(&self) -> Option<&str>;

    fn set_holder(&mut self, process: Option<String>);

    /// Documents in an error state keep their lease when the holder dies so
    /// that finished work is not picked up again.
    fn releasable_on_death(&self) -> bool;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(PROCESSES).map_err(map_err!(Table))?;
            txn.open_table(JOBS).map_err(map_err!(Table))?;
            txn.open_table(TASKS).map_err(map_err!(Table))?;
            txn.open_table(DATASETS).map_err(map_err!(Table))?;
            txn.open_table(MODULES).map_err(map_err!(Table))?;
            txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction, committing on success and rolling
    /// back on error.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(result) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(result)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    // ── Generic document access ────────────────────────────────────

    /// Get a document by key.
    pub(crate) fn fetch<D: Document>(&self, key: &str) -> StateResult<Option<D>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
        let mut doc = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => decode::<D>(guard.value())?,
            None => return Ok(None),
        };
        doc.refresh(epoch_millis());
        Ok(Some(doc))
    }

    /// Get a document by key, failing with `NotFound` when absent.
    pub(crate) fn fetch_required<D: Document>(&self, key: &str) -> StateResult<D> {
        self.fetch(key)?
            .ok_or_else(|| StateError::NotFound(format!("{} {key}", D::KIND)))
    }

    /// All documents matching `pred`, in key order.
    pub(crate) fn scan<D: Document>(&self, pred: impl Fn(&D) -> bool) -> StateResult<Vec<D>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
        let mut docs = decode_matching(&table, &pred)?;
        let now = epoch_millis();
        for doc in &mut docs {
            doc.refresh(now);
        }
        Ok(docs)
    }

    pub(crate) fn count<D: Document>(&self, pred: impl Fn(&D) -> bool) -> StateResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
        Ok(decode_matching(&table, &pred)?.len())
    }

    /// Insert or replace a document.
    pub(crate) fn put<D: Document>(&self, doc: &D) -> StateResult<()> {
        self.write(|txn| store_doc(txn, doc))?;
        debug!(kind = D::KIND, key = doc.key(), "document stored");
        Ok(())
    }

    /// Load a document, apply `f` and write it back atomically. Nothing is
    /// written when `f` fails.
    pub(crate) fn modify<D: Document>(
        &self,
        key: &str,
        f: impl FnOnce(&WriteTransaction, &mut D) -> StateResult<()>,
    ) -> StateResult<D> {
        let mut doc = self.write(|txn| {
            let mut doc: D = load_doc(txn, key)?
                .ok_or_else(|| StateError::NotFound(format!("{} {key}", D::KIND)))?;
            f(txn, &mut doc)?;
            store_doc(txn, &doc)?;
            Ok(doc)
        })?;
        doc.refresh(epoch_millis());
        Ok(doc)
    }

    /// Pick the first document matching `pred` under `order`, apply `f`
    /// and write it back, all in one write transaction. Returns the new
    /// version, or `None` when nothing matched.
    pub(crate) fn find_and_modify<D: Document>(
        &self,
        pred: impl Fn(&D) -> bool,
        order: impl Fn(&D, &D) -> Ordering,
        f: impl FnOnce(&mut D),
    ) -> StateResult<Option<D>> {
        let found = self.write(|txn| {
            let candidates = {
                let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
                decode_matching(&table, &pred)?
            };
            let Some(mut doc) = candidates.into_iter().min_by(|a, b| order(a, b)) else {
                return Ok(None);
            };
            f(&mut doc);
            store_doc(txn, &doc)?;
            Ok(Some(doc))
        })?;
        Ok(found.map(|mut doc| {
            doc.refresh(epoch_millis());
            doc
        }))
    }

    /// Apply `f` to every document matching `pred` in one write transaction.
    /// Returns how many documents were updated.
    pub(crate) fn update_all<D: Document>(
        &self,
        pred: impl Fn(&D) -> bool,
        f: impl Fn(&mut D),
    ) -> StateResult<usize> {
        let updated = self.write(|txn| {
            let docs = {
                let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
                decode_matching(&table, &pred)?
            };
            let count = docs.len();
            for mut doc in docs {
                f(&mut doc);
                store_doc(txn, &doc)?;
            }
            Ok(count)
        })?;
        debug!(kind = D::KIND, updated, "bulk update applied");
        Ok(updated)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

fn decode<D: Document>(bytes: &[u8]) -> StateResult<D> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn decode_matching<D, T>(table: &T, pred: &impl Fn(&D) -> bool) -> StateResult<Vec<D>>
where
    D: Document,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let doc: D = decode(value.value())?;
        if pred(&doc) {
            results.push(doc);
        }
    }
    Ok(results)
}

/// Read a document inside a write transaction.
pub(crate) fn load_doc<D: Document>(txn: &WriteTransaction, key: &str) -> StateResult<Option<D>> {
    let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
    let doc = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode::<D>(guard.value())?),
        None => None,
    };
    Ok(doc)
}

/// Read all matching documents inside a write transaction.
pub(crate) fn load_matching<D: Document>(
    txn: &WriteTransaction,
    pred: impl Fn(&D) -> bool,
) -> StateResult<Vec<D>> {
    let table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
    decode_matching(&table, &pred)
}

/// Write a document inside a write transaction.
pub(crate) fn store_doc<D: Document>(txn: &WriteTransaction, doc: &D) -> StateResult<()> {
    let value = serde_json::to_vec(doc).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(D::TABLE).map_err(map_err!(Table))?;
    table
        .insert(doc.key(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Insert a document whose key must not exist yet.
pub(crate) fn insert_new_doc<D: Document>(txn: &WriteTransaction, doc: &D) -> StateResult<()> {
    if load_doc::<D>(txn, doc.key())?.is_some() {
        return Err(StateError::IdentifierTaken(format!(
            "{} {}",
            D::KIND,
            doc.key()
        )));
    }
    store_doc(txn, doc)
}

/// Increment and return a named store-wide counter.
pub(crate) fn next_counter(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dataset, DatasetStatus, ROOT_USER};

    fn dataset(id: &str) -> Dataset {
        Dataset {
            id: id.to_string(),
            user: ROOT_USER.to_string(),
            schema_in: "tensor[2]".to_string(),
            schema_out: "scalar".to_string(),
            status: DatasetStatus::Validated,
            process: None,
        }
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgrid.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put(&dataset("iris")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.fetch::<Dataset>("iris").unwrap(), Some(dataset("iris")));
    }

    #[test]
    fn one_handle_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgrid.redb");
        let store = StateStore::open(&path).unwrap();
        assert!(matches!(StateStore::open(&path), Err(StateError::Open(_))));

        // Clones share the one handle and see each other's writes.
        let clone = store.clone();
        clone.put(&dataset("iris")).unwrap();
        assert_eq!(store.fetch::<Dataset>("iris").unwrap(), Some(dataset("iris")));
    }

    #[test]
    fn empty_store_reads() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.fetch::<Dataset>("x").unwrap().is_none());
        assert!(store.scan(|_: &Dataset| true).unwrap().is_empty());
        assert_eq!(store.count(|_: &Dataset| true).unwrap(), 0);
        let none = store
            .find_and_modify(|_: &Dataset| true, |a, b| a.id.cmp(&b.id), |_| {})
            .unwrap();
        assert!(none.is_none());
        assert_eq!(store.update_all(|_: &Dataset| true, |_| {}).unwrap(), 0);
    }

    #[test]
    fn failed_modify_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&dataset("iris")).unwrap();
        let err = store
            .modify("iris", |_, d: &mut Dataset| {
                d.status = DatasetStatus::Archived;
                Err(StateError::BadInput("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::BadInput(_)));
        assert_eq!(
            store.fetch::<Dataset>("iris").unwrap().unwrap().status,
            DatasetStatus::Validated
        );
        assert!(store.modify("ghost", |_, _: &mut Dataset| Ok(())).unwrap_err().is_not_found());
    }

    #[test]
    fn insert_new_rejects_existing_key() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&dataset("iris")).unwrap();
        let err = store
            .write(|txn| insert_new_doc(txn, &dataset("iris")))
            .unwrap_err();
        assert!(matches!(err, StateError::IdentifierTaken(_)));
    }

    #[test]
    fn counters_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.write(|txn| next_counter(txn, "c")).unwrap();
        let b = store.write(|txn| next_counter(txn, "c")).unwrap();
        let other = store.write(|txn| next_counter(txn, "d")).unwrap();
        assert_eq!((a, b, other), (1, 2, 1));
    }
}
