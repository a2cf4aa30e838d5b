//! In-memory record index.
//!
//! Same contract as the SQLite backend without durability. Used by tests and
//! by hosts that only need a session-scoped cache.

use crate::notify::{ChangeListener, ListenerRegistry, Subscription};
use crate::record::Record;
use crate::scope::Scope;
use crate::store::{Observable, Readable, StoreTransaction, Transaction, Writable};
use crate::Result;
use async_trait::async_trait;
use bridge_traits::{Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

type Tables = HashMap<String, BTreeMap<String, Record>>;

pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    write_queue: Arc<Mutex<()>>,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            write_queue: Arc::new(Mutex::new(())),
            listeners: ListenerRegistry::new(),
            clock,
        }
    }

    /// Number of committed records across all types.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Readable for MemoryStore {
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Record>> {
        let candidates: Vec<Record> = self
            .tables
            .read()
            .get(&scope.entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        Ok(scope.apply(candidates))
    }

    async fn get(&self, entity_type: &str, key: &str) -> Result<Option<Record>> {
        Ok(self
            .tables
            .read()
            .get(entity_type)
            .and_then(|table| table.get(key))
            .cloned())
    }
}

#[async_trait]
impl Writable for MemoryStore {
    async fn begin(&self) -> Result<Transaction> {
        let queue = self.write_queue.clone().lock_owned().await;
        let inner = MemoryTransaction {
            tables: self.tables.clone(),
            staged: HashMap::new(),
        };
        Ok(Transaction::new(
            Box::new(inner),
            self.listeners.clone(),
            self.clock.now(),
            queue,
        ))
    }
}

impl Observable for MemoryStore {
    fn observe(&self, scope: Scope, listener: ChangeListener) -> Subscription {
        self.listeners.register(scope, listener)
    }
}

/// Staged writes overlaid on the committed tables. `None` marks a delete.
struct MemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    staged: HashMap<(String, String), Option<Record>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(&mut self, entity_type: &str, key: &str) -> Result<Option<Record>> {
        if let Some(staged) = self.staged.get(&(entity_type.to_string(), key.to_string())) {
            return Ok(staged.clone());
        }
        Ok(self
            .tables
            .read()
            .get(entity_type)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn candidates(&mut self, scope: &Scope) -> Result<Vec<Record>> {
        let mut merged: BTreeMap<String, Record> = self
            .tables
            .read()
            .get(&scope.entity_type)
            .cloned()
            .unwrap_or_default();

        for ((entity_type, key), staged) in &self.staged {
            if *entity_type != scope.entity_type {
                continue;
            }
            match staged {
                Some(record) => {
                    merged.insert(key.clone(), record.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    async fn put(&mut self, record: &Record) -> Result<()> {
        self.staged.insert(
            (record.entity_type.clone(), record.key.clone()),
            Some(record.clone()),
        );
        Ok(())
    }

    async fn remove(&mut self, entity_type: &str, key: &str) -> Result<()> {
        self.staged
            .insert((entity_type.to_string(), key.to_string()), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { tables, staged } = *self;
        let mut tables = tables.write();
        for ((entity_type, key), staged) in staged {
            match staged {
                Some(record) => {
                    tables.entry(entity_type).or_default().insert(key, record);
                }
                None => {
                    if let Some(table) = tables.get_mut(&entity_type) {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
