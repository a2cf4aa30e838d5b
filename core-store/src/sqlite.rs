//! # SQLite Record Store
//!
//! Durable [`LocalStore`](crate::LocalStore) backend over a single `records`
//! table. Each transaction is a real SQLite transaction, so a dropped
//! [`Transaction`] rolls back and a failed commit leaves nothing behind.
//!
//! Filtering and ordering reuse [`Scope::apply`], keeping results identical
//! to [`MemoryStore`](crate::MemoryStore).

use crate::db::{create_pool, DatabaseConfig};
use crate::notify::{ChangeListener, ListenerRegistry, Subscription};
use crate::record::Record;
use crate::scope::Scope;
use crate::store::{Observable, Readable, StoreTransaction, Transaction, Writable};
use crate::{Result, StoreError};
use async_trait::async_trait;
use bridge_traits::{Clock, SystemClock};
use chrono::DateTime;
use sqlx::{FromRow, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub struct SqliteStore {
    pool: SqlitePool,
    write_queue: Arc<Mutex<()>>,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Wraps an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_queue: Arc::new(Mutex::new(())),
            listeners: ListenerRegistry::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Opens (and migrates) the database described by `config`.
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Database row representation of a record
#[derive(Debug, FromRow)]
struct RecordRow {
    entity_type: String,
    key: String,
    data: String,
    updated_at: i64,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let updated_at = DateTime::from_timestamp_millis(row.updated_at).ok_or_else(|| {
            StoreError::InvalidRecord {
                entity_type: row.entity_type.clone(),
                key: row.key.clone(),
                message: format!("timestamp {} out of range", row.updated_at),
            }
        })?;

        Ok(Record {
            data: serde_json::from_str(&row.data)?,
            entity_type: row.entity_type,
            key: row.key,
            updated_at,
        })
    }
}

const SELECT_BY_TYPE: &str =
    "SELECT entity_type, key, data, updated_at FROM records WHERE entity_type = ?";
const SELECT_ONE: &str =
    "SELECT entity_type, key, data, updated_at FROM records WHERE entity_type = ? AND key = ?";

fn decode_rows(rows: Vec<RecordRow>) -> Result<Vec<Record>> {
    rows.into_iter().map(Record::try_from).collect()
}

#[async_trait]
impl Readable for SqliteStore {
    #[instrument(skip(self, scope), fields(entity_type = %scope.entity_type))]
    async fn fetch(&self, scope: &Scope) -> Result<Vec<Record>> {
        let rows: Vec<RecordRow> = sqlx::query_as(SELECT_BY_TYPE)
            .bind(&scope.entity_type)
            .fetch_all(&self.pool)
            .await?;
        let records = scope.apply(decode_rows(rows)?);
        debug!(count = records.len(), "Fetched scope");
        Ok(records)
    }

    async fn get(&self, entity_type: &str, key: &str) -> Result<Option<Record>> {
        let row: Option<RecordRow> = sqlx::query_as(SELECT_ONE)
            .bind(entity_type)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Record::try_from).transpose()
    }
}

#[async_trait]
impl Writable for SqliteStore {
    async fn begin(&self) -> Result<Transaction> {
        let queue = self.write_queue.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(Transaction::new(
            Box::new(SqliteTransaction { tx }),
            self.listeners.clone(),
            self.clock.now(),
            queue,
        ))
    }
}

impl Observable for SqliteStore {
    fn observe(&self, scope: Scope, listener: ChangeListener) -> Subscription {
        self.listeners.register(scope, listener)
    }
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn get(&mut self, entity_type: &str, key: &str) -> Result<Option<Record>> {
        let row: Option<RecordRow> = sqlx::query_as(SELECT_ONE)
            .bind(entity_type)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Record::try_from).transpose()
    }

    async fn candidates(&mut self, scope: &Scope) -> Result<Vec<Record>> {
        let rows: Vec<RecordRow> = sqlx::query_as(SELECT_BY_TYPE)
            .bind(&scope.entity_type)
            .fetch_all(&mut *self.tx)
            .await?;
        decode_rows(rows)
    }

    async fn put(&mut self, record: &Record) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        sqlx::query(
            r#"
            INSERT INTO records (entity_type, key, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (entity_type, key) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.entity_type)
        .bind(&record.key)
        .bind(data)
        .bind(record.updated_at.timestamp_millis())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove(&mut self, entity_type: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE entity_type = ? AND key = ?")
            .bind(entity_type)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
