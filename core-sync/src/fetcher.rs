//! # Fetcher
//!
//! Runs a use case's network side and writes each page through the Local
//! Store.
//!
//! ## Page protocol
//!
//! Every page is written in its own transaction, in cursor order, so readers
//! see a growing but correctly ordered result while an exhaust is running.
//! Pages only upsert. The last page's transaction records the cache entry and
//! applies the use case's invalidations, so TTL bookkeeping never commits
//! without the data it describes.
//!
//! When the use case replaces its scope and the server reported no further
//! page, the last page's transaction also deletes the in-scope records that
//! no page of this fetch wrote.
//!
//! ## Failure
//!
//! A transport failure returns the error before any transaction opens for
//! that page. Nothing already cached is removed, even when earlier pages of
//! the same exhaust were written.

use crate::pagination::DEFAULT_PAGE_LIMIT;
use crate::transport::{Transport, TransportResponse};
use crate::use_case::UseCase;
use crate::{Result, SyncError};
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use core_runtime::logging::redact_url;
use core_store::{CachePolicy, LocalStore, Record};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
struct Page {
    /// Last page this fetch writes.
    last: bool,
    /// The server reported no further page.
    complete: bool,
}

/// Result of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Pages written.
    pub pages: u32,
    /// The server announced more pages that were not followed.
    pub has_more: bool,
}

impl FetchOutcome {
    pub fn local() -> Self {
        Self {
            pages: 0,
            has_more: false,
        }
    }
}

pub struct Fetcher {
    store: Arc<dyn LocalStore>,
    cache: Arc<CachePolicy>,
    transport: Arc<dyn Transport>,
    events: Option<EventBus>,
    page_limit: u32,
}

impl Fetcher {
    pub fn new(cache: Arc<CachePolicy>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store: cache.store().clone(),
            cache,
            transport,
            events: None,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CachePolicy> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetches and writes the first page only.
    pub async fn fetch<U: UseCase>(&self, use_case: &U) -> Result<FetchOutcome> {
        self.run(use_case, false).await
    }

    /// Follows pagination cursors until the server reports no next page.
    pub async fn exhaust<U: UseCase>(&self, use_case: &U) -> Result<FetchOutcome> {
        self.run(use_case, true).await
    }

    #[instrument(skip(self, use_case), fields(cache_key = ?use_case.cache_key()))]
    async fn run<U: UseCase>(&self, use_case: &U, all_pages: bool) -> Result<FetchOutcome> {
        let Some(mut request) = use_case.request() else {
            return Ok(FetchOutcome::local());
        };

        let mut pages = 0u32;
        let mut seen = HashSet::new();
        loop {
            let response = match self.transport.send(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.report_failure(use_case, pages, &e);
                    return Err(e);
                }
            };
            pages += 1;

            let next = use_case.next_page(&response);
            let last = !all_pages || next.is_none();
            if !last && pages >= self.page_limit {
                let e = SyncError::PageLimit(self.page_limit);
                self.report_failure(use_case, pages, &e);
                return Err(e);
            }

            let page = Page {
                last,
                complete: next.is_none(),
            };
            let written = self.write_page(use_case, &response, page, &mut seen).await;
            if let Err(e) = written {
                self.report_failure(use_case, pages, &e);
                return Err(e);
            }
            debug!(page = pages, request = %redact_url(&request.describe()), "Wrote page");

            let has_more = next.is_some();
            match next {
                Some(next) if !last => request = next,
                _ => {
                    let outcome = FetchOutcome { pages, has_more };
                    info!(pages, has_more = outcome.has_more, "Fetch complete");
                    self.emit(CacheEvent::Refreshed {
                        cache_key: use_case.cache_key(),
                        pages,
                    });
                    return Ok(outcome);
                }
            }
        }
    }

    async fn write_page<U: UseCase>(
        &self,
        use_case: &U,
        response: &TransportResponse,
        page: Page,
        seen: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;

        use_case.write(response, &mut tx).await?;
        seen.extend(
            tx.written()
                .map(|(entity_type, key)| (entity_type.to_string(), key.to_string())),
        );

        if page.complete && use_case.replaces_scope() {
            let stale: Vec<Record> = tx
                .fetch(&use_case.scope())
                .await?
                .into_iter()
                .filter(|record| {
                    !seen.contains(&(record.entity_type.clone(), record.key.clone()))
                })
                .collect();
            let removed = tx.delete_records(&stale).await?;
            debug!(removed, "Removed records the server no longer lists");
        }

        let mut invalidated = Vec::new();
        if page.last {
            if let Some(key) = use_case.cache_key() {
                self.cache
                    .record_fetch_in(&mut tx, &key, use_case.ttl())
                    .await?;
            }
            for prefix in use_case.invalidates() {
                let removed = self.cache.invalidate_in(&mut tx, &prefix).await?;
                invalidated.push((prefix, removed));
            }
        }

        tx.save().await?;
        for (prefix, removed) in invalidated {
            self.cache.announce_invalidated(&prefix, removed);
        }
        Ok(())
    }

    fn report_failure<U: UseCase>(&self, use_case: &U, pages_written: u32, error: &SyncError) {
        warn!(pages_written, error = %error, "Fetch failed");
        self.emit(CacheEvent::RefreshFailed {
            cache_key: use_case.cache_key(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(events) = &self.events {
            events.emit(CoreEvent::Cache(event)).ok();
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("page_limit", &self.page_limit)
            .field("has_event_bus", &self.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestDescriptor;
    use crate::transport::MockTransport;
    use crate::use_case::FetchCollection;
    use bridge_traits::{BridgeError, ManualClock};
    use core_store::{Entity, MemoryStore, ReadableExt, Scope, SortDescriptor};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Course {
        id: String,
        name: String,
    }

    impl Entity for Course {
        const ENTITY_TYPE: &'static str = "course";

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn fetcher(transport: MockTransport) -> (Fetcher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        let cache = Arc::new(CachePolicy::new(store, clock.clone()));
        (Fetcher::new(cache, Arc::new(transport)), clock)
    }

    fn courses() -> FetchCollection<Course> {
        FetchCollection::new(RequestDescriptor::get("/api/v1/courses"))
            .with_cache_key("courses")
            .with_scope(Scope::of::<Course>().order_by(SortDescriptor::asc("name")))
    }

    fn page(items: serde_json::Value, next: Option<&str>) -> TransportResponse {
        let response = TransportResponse::new(items);
        match next {
            Some(url) => response.with_header("Link", format!("<{}>; rel=\"next\"", url)),
            None => response,
        }
    }

    #[tokio::test]
    async fn test_fetch_writes_first_page_and_records_ttl() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Ok(page(
                json!([{ "id": "1", "name": "Biology" }]),
                Some("https://x/courses?page=2"),
            ))
        });
        let (fetcher, _) = fetcher(transport);

        let outcome = fetcher.fetch(&courses()).await.unwrap();

        assert_eq!(outcome, FetchOutcome { pages: 1, has_more: true });
        assert!(fetcher.cache().is_valid("courses").await.unwrap());
        assert_eq!(fetcher.store().count(&Scope::of::<Course>()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_cached_data() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport.expect_send().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(page(json!([{ "id": "1", "name": "Biology" }]), None))
            } else {
                Err(SyncError::Network(BridgeError::OperationFailed(
                    "connection reset".to_string(),
                )))
            }
        });
        let (fetcher, clock) = fetcher(transport);
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let fetcher = fetcher.with_event_bus(events);

        fetcher.exhaust(&courses()).await.unwrap();
        let before: Vec<Course> = fetcher
            .store()
            .fetch_entities(&courses().scope())
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(3));
        let err = fetcher.exhaust(&courses()).await.unwrap_err();
        assert!(err.is_network());

        let after: Vec<Course> = fetcher
            .store()
            .fetch_entities(&courses().scope())
            .await
            .unwrap();
        assert_eq!(before, after);
        assert!(!fetcher.cache().is_valid("courses").await.unwrap());

        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::Cache(CacheEvent::Refreshed { pages: 1, .. })
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::Cache(CacheEvent::RefreshFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_replacing_scope_drops_records_gone_from_server() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport.expect_send().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(page(
                    json!([{ "id": "1", "name": "Biology" }, { "id": "2", "name": "Art" }]),
                    None,
                ))
            } else {
                Ok(page(json!([{ "id": "2", "name": "Art" }]), None))
            }
        });
        let (fetcher, _) = fetcher(transport);
        let use_case = courses().replacing_scope();

        fetcher.exhaust(&use_case).await.unwrap();
        fetcher.exhaust(&use_case).await.unwrap();

        let left: Vec<Course> = fetcher.store().fetch_entities(&use_case.scope()).await.unwrap();
        assert_eq!(left, vec![Course { id: "2".into(), name: "Art".into() }]);
    }

    #[tokio::test]
    async fn test_page_limit_stops_runaway_pagination() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(3).returning(|_| {
            Ok(page(
                json!([{ "id": "1", "name": "Biology" }]),
                Some("https://x/courses?page=again"),
            ))
        });
        let (fetcher, _) = fetcher(transport);
        let fetcher = fetcher.with_page_limit(3);

        let err = fetcher.exhaust(&courses()).await.unwrap_err();
        assert!(matches!(err, SyncError::PageLimit(3)));
        assert!(!fetcher.cache().is_valid("courses").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidation_is_announced_once_committed() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(page(json!({ "id": "9", "name": "Sent" }), None)));
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        let events = EventBus::new(8);
        let cache = Arc::new(CachePolicy::new(store, clock).with_event_bus(events.clone()));
        cache
            .record_fetch("inbox/sent?contextCode=all", Duration::from_secs(3600))
            .await
            .unwrap();
        let mut rx = events.subscribe();
        let fetcher = Fetcher::new(cache.clone(), Arc::new(transport));

        let send = FetchCollection::<Course>::new(RequestDescriptor::post(
            "/api/v1/conversations",
            json!({ "body": "hi" }),
        ))
        .uncached()
        .invalidating("inbox/");
        fetcher.fetch(&send).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Cache(CacheEvent::Invalidated {
                prefix: "inbox/".to_string(),
                removed: 1,
            })
        );
        assert!(!cache.is_valid("inbox/sent?contextCode=all").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_prefixes_with_its_write() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(page(json!({ "id": "9", "name": "Sent" }), None)));
        let (fetcher, _) = fetcher(transport);
        fetcher
            .cache()
            .record_fetch("inbox/inbox?contextCode=all", Duration::from_secs(3600))
            .await
            .unwrap();

        let send = FetchCollection::<Course>::new(RequestDescriptor::post(
            "/api/v1/conversations",
            json!({ "body": "hi" }),
        ))
        .uncached()
        .invalidating("inbox/");
        fetcher.fetch(&send).await.unwrap();

        assert!(!fetcher
            .cache()
            .is_valid("inbox/inbox?contextCode=all")
            .await
            .unwrap());
        assert!(fetcher.store().get("course", "9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_use_case_never_sends() {
        let transport = MockTransport::new();
        let (fetcher, _) = fetcher(transport);
        let local = crate::use_case::LocalUseCase::<Course>::new(Scope::of::<Course>());

        assert_eq!(fetcher.exhaust(&local).await.unwrap(), FetchOutcome::local());
    }
}
