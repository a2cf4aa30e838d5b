//! # Use-Case / Reactive Store
//!
//! Pairs network operations with Local Store writes and exposes the results as
//! continuously updated views.
//!
//! ## Overview
//!
//! - **Requests** (`request`): REST and GraphQL operation descriptors
//! - **Transport** (`transport`): one request, one decoded JSON response
//! - **Pagination** (`pagination`): `Link` header and `meta.pagination.next` cursors
//! - **Use Cases** (`use_case`): request + scope + idempotent write rule
//! - **Fetcher** (`fetcher`): page-by-page write-through with TTL bookkeeping
//! - **Reactive Store** (`reactive`): cache-gated reads and live observations
//!
//! ## Failure policy
//!
//! Interactive reads are never retried. A failed refresh returns a
//! [`SyncError`] and the Local Store keeps its last known good data.

pub mod error;
pub mod fetcher;
pub mod pagination;
pub mod reactive;
pub mod request;
pub mod transport;
pub mod use_case;

pub use error::{Result, SyncError};
pub use fetcher::{FetchOutcome, Fetcher};
pub use pagination::{next_page_url, parse_link_header, Link, DEFAULT_PAGE_LIMIT};
pub use reactive::{Observation, ReactiveStore};
pub use request::RequestDescriptor;
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use use_case::{DeleteUseCase, FetchCollection, LocalUseCase, UseCase};
