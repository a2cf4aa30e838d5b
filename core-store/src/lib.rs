//! # Local Store & Cache Policy
//!
//! Durable, queryable persistence of typed records with change notification,
//! plus the TTL bookkeeping that decides whether a cached read is still fresh.
//!
//! ## Overview
//!
//! - **Records** (`record`): `(entity_type, key)`-unique JSON documents and the
//!   [`Entity`] trait for typed access
//! - **Scopes** (`scope`): predicate, ordering and section grouping evaluated
//!   identically by every backend
//! - **Store contract** (`store`): [`Readable`], [`Writable`], [`Observable`] and
//!   their union [`LocalStore`]; [`Transaction`] with upsert-by-key
//! - **Backends**: [`SqliteStore`] (sqlx, WAL) and [`MemoryStore`]
//! - **Cache policy** (`cache`): [`CachePolicy`], [`CacheEntry`], [`CacheKey`]

pub mod cache;
pub mod db;
pub mod error;
pub mod memory;
pub mod notify;
pub mod record;
pub mod scope;
pub mod sqlite;
pub mod store;

pub use cache::{CacheEntry, CacheKey, CachePolicy, DEFAULT_TTL, NO_CACHE};
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use notify::{ChangeListener, ListenerRegistry, Subscription};
pub use record::{to_document, Change, ChangeSet, Document, Entity, Record};
pub use scope::{Predicate, Scope, Section, SortDescriptor};
pub use sqlite::SqliteStore;
pub use store::{
    LocalStore, Observable, Readable, ReadableExt, StoreTransaction, Transaction, Writable,
};
