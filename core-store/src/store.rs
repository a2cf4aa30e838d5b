//! # Local Store Contract
//!
//! Capabilities are split into [`Readable`], [`Writable`] and [`Observable`];
//! [`LocalStore`] is their union and is what the rest of the core depends on.
//!
//! ## Writes
//!
//! [`Writable::begin`] waits for the store's write queue and returns a
//! [`Transaction`]. Only one transaction per store is open at a time, in FIFO
//! order. Reads never wait for the queue; they see the last committed state.
//!
//! ```rust,ignore
//! let mut tx = store.begin().await?;
//! tx.upsert("course", "A", |doc| {
//!     doc.insert("name".into(), "New".into());
//!     Ok(())
//! })
//! .await?;
//! tx.save().await?;
//! ```
//!
//! Dropping a transaction without [`Transaction::save`] rolls it back, so an
//! error propagated with `?` never leaves partial writes behind.

use crate::notify::{ChangeListener, ListenerRegistry, Subscription};
use crate::record::{to_document, Change, ChangeSet, Document, Entity, Record};
use crate::scope::Scope;
use crate::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

#[async_trait]
pub trait Readable: Send + Sync {
    /// Matching records in scope order.
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Record>>;

    async fn get(&self, entity_type: &str, key: &str) -> Result<Option<Record>>;

    async fn count(&self, scope: &Scope) -> Result<u64> {
        Ok(self.fetch(scope).await?.len() as u64)
    }
}

#[async_trait]
pub trait Writable: Send + Sync {
    /// Waits for the write queue and opens a transaction.
    async fn begin(&self) -> Result<Transaction>;
}

pub trait Observable: Send + Sync {
    /// Registers a listener fired after every commit touching `scope`.
    fn observe(&self, scope: Scope, listener: ChangeListener) -> Subscription;
}

/// A complete local store backend.
pub trait LocalStore: Readable + Writable + Observable {}

impl<T: Readable + Writable + Observable + ?Sized> LocalStore for T {}

/// Typed reads over any [`Readable`].
#[async_trait]
pub trait ReadableExt: Readable {
    async fn fetch_entities<T: Entity>(&self, scope: &Scope) -> Result<Vec<T>> {
        self.fetch(scope)
            .await?
            .iter()
            .map(Record::decode::<T>)
            .collect()
    }

    async fn get_entity<T: Entity>(&self, key: &str) -> Result<Option<T>> {
        match self.get(T::ENTITY_TYPE, key).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }
}

impl<S: Readable + ?Sized> ReadableExt for S {}

/// Backend half of a transaction. Implementations stage writes and apply
/// them atomically in `commit`; dropping without commit discards them.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get(&mut self, entity_type: &str, key: &str) -> Result<Option<Record>>;

    /// Records of the scope's type including staged writes, unordered.
    async fn candidates(&mut self, scope: &Scope) -> Result<Vec<Record>>;

    async fn put(&mut self, record: &Record) -> Result<()>;

    async fn remove(&mut self, entity_type: &str, key: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

type RecordId = (String, String);

/// An open write transaction holding the store's write queue.
pub struct Transaction {
    inner: Box<dyn StoreTransaction>,
    listeners: Arc<ListenerRegistry>,
    now: DateTime<Utc>,
    /// State of each touched record before the transaction, in first-touch order.
    touched: Vec<RecordId>,
    before: HashMap<RecordId, Option<Record>>,
    after: HashMap<RecordId, Option<Record>>,
    /// Every record upserted or put, changed or not.
    written: HashSet<RecordId>,
    aborted: Option<String>,
    _queue: OwnedMutexGuard<()>,
}

impl Transaction {
    pub fn new(
        inner: Box<dyn StoreTransaction>,
        listeners: Arc<ListenerRegistry>,
        now: DateTime<Utc>,
        queue: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            inner,
            listeners,
            now,
            touched: Vec::new(),
            before: HashMap::new(),
            after: HashMap::new(),
            written: HashSet::new(),
            aborted: None,
            _queue: queue,
        }
    }

    /// Timestamp stamped on every record written by this transaction.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub async fn get(&mut self, entity_type: &str, key: &str) -> Result<Option<Record>> {
        self.inner.get(entity_type, key).await
    }

    pub async fn get_entity<T: Entity>(&mut self, key: &str) -> Result<Option<T>> {
        match self.get(T::ENTITY_TYPE, key).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    /// Reads the scope including this transaction's own writes.
    pub async fn fetch(&mut self, scope: &Scope) -> Result<Vec<Record>> {
        let candidates = self.inner.candidates(scope).await?;
        Ok(scope.apply(candidates))
    }

    /// Looks up `(entity_type, key)`, creates it when absent, and applies
    /// `mutator` to its fields. A mutator error aborts the transaction.
    pub async fn upsert<F>(&mut self, entity_type: &str, key: &str, mutator: F) -> Result<Record>
    where
        F: FnOnce(&mut Document) -> Result<()> + Send,
    {
        let existing = self.get(entity_type, key).await?;
        let mut document = existing
            .as_ref()
            .map(Record::document)
            .unwrap_or_default();

        if let Err(e) = mutator(&mut document) {
            warn!(entity_type, key, error = %e, "Mutator failed, aborting transaction");
            self.aborted = Some(e.to_string());
            return Err(e);
        }

        self.written
            .insert((entity_type.to_string(), key.to_string()));
        if let Some(existing) = existing {
            if existing.document() == document {
                return Ok(existing);
            }
        }

        let record = Record::new(entity_type, key, document, self.now);
        self.put(record.clone()).await?;
        Ok(record)
    }

    /// Upserts a typed entity, replacing all of its fields.
    pub async fn upsert_entity<T: Entity>(&mut self, entity: &T) -> Result<Record> {
        let fields = to_document(entity)?;
        self.upsert(T::ENTITY_TYPE, &entity.key(), move |document| {
            *document = fields;
            Ok(())
        })
        .await
    }

    /// Writes a whole record, stamped with the transaction time.
    pub async fn put(&mut self, mut record: Record) -> Result<()> {
        record.validate()?;
        record.updated_at = self.now;
        let id = (record.entity_type.clone(), record.key.clone());
        self.remember(&id).await?;
        self.inner.put(&record).await?;
        self.written.insert(id.clone());
        self.after.insert(id, Some(record));
        Ok(())
    }

    /// `(entity_type, key)` of every record this transaction upserted,
    /// including upserts that left the record as it was.
    pub fn written(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.written
            .iter()
            .map(|(entity_type, key)| (entity_type.as_str(), key.as_str()))
    }

    /// Deletes one record. Returns whether it existed.
    pub async fn delete(&mut self, entity_type: &str, key: &str) -> Result<bool> {
        let id = (entity_type.to_string(), key.to_string());
        self.remember(&id).await?;
        let existed = self.inner.get(entity_type, key).await?.is_some();
        if existed {
            self.inner.remove(entity_type, key).await?;
            self.after.insert(id, None);
        }
        Ok(existed)
    }

    /// Deletes the given records.
    pub async fn delete_records(&mut self, records: &[Record]) -> Result<u64> {
        let mut removed = 0;
        for record in records {
            if self.delete(&record.entity_type, &record.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes everything in `scope`. Returns the number removed.
    pub async fn delete_matching(&mut self, scope: &Scope) -> Result<u64> {
        let matching = self.fetch(scope).await?;
        self.delete_records(&matching).await
    }

    /// Commits all staged writes atomically, then notifies listeners.
    pub async fn save(mut self) -> Result<ChangeSet> {
        if let Some(reason) = self.aborted.take() {
            return Err(StoreError::Aborted(reason));
        }

        let changes: Vec<Change> = self
            .touched
            .iter()
            .filter_map(|id| {
                let before = self.before.get(id).cloned().flatten();
                let after = self.after.get(id).cloned().unwrap_or_else(|| before.clone());
                Change::between(before, after)
            })
            .collect();

        let Transaction {
            inner,
            listeners,
            _queue: queue,
            ..
        } = self;

        inner.commit().await?;
        debug!(changes = changes.len(), "Transaction committed");

        // Queue stays held until listeners ran so they observe commits in order.
        listeners.notify(&changes);
        drop(queue);

        Ok(ChangeSet { changes })
    }

    async fn remember(&mut self, id: &RecordId) -> Result<()> {
        if !self.before.contains_key(id) {
            let original = self.inner.get(&id.0, &id.1).await?;
            self.before.insert(id.clone(), original);
            self.touched.push(id.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("now", &self.now)
            .field("touched", &self.touched.len())
            .field("aborted", &self.aborted)
            .finish()
    }
}
