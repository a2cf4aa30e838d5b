//! # Use Cases
//!
//! A use case binds one network operation to one local write rule and one
//! query scope. The [`Fetcher`](crate::Fetcher) drives the network side and
//! the [`ReactiveStore`](crate::ReactiveStore) exposes the scope to callers.
//!
//! ## Invalidation contract
//!
//! Reads are TTL-gated by their [`cache_key`](UseCase::cache_key). Mutations
//! list the key prefixes they make stale in [`invalidates`](UseCase::invalidates);
//! those entries are deleted in the same transaction as the mutation's write,
//! so the next read of an affected list goes to the network.
//!
//! ## Merge rule
//!
//! [`write`](UseCase::write) must be idempotent: applying the same response
//! twice leaves the store as applying it once. Writing through
//! [`Transaction::upsert_entity`] gives that for free.

use crate::pagination::next_page_url;
use crate::request::RequestDescriptor;
use crate::transport::TransportResponse;
use crate::{Result, SyncError};
use async_trait::async_trait;
use core_store::{Entity, Scope, Transaction, DEFAULT_TTL};
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;

#[async_trait]
pub trait UseCase: Send + Sync + 'static {
    /// Entity type the scope yields.
    type Model: Entity;

    /// Records this use case exposes, in display order.
    fn scope(&self) -> Scope;

    /// Cache key gating the network refresh. `None` always fetches.
    fn cache_key(&self) -> Option<String>;

    fn ttl(&self) -> Duration {
        DEFAULT_TTL
    }

    /// Network operation. `None` marks a local-only use case.
    fn request(&self) -> Option<RequestDescriptor>;

    /// Once a fetch has written the final page, deletes the records in
    /// [`scope`](UseCase::scope) that none of its pages wrote, so records
    /// gone from the server disappear locally.
    fn replaces_scope(&self) -> bool {
        false
    }

    /// Cache key prefixes made stale by a successful write.
    fn invalidates(&self) -> Vec<String> {
        Vec::new()
    }

    /// Merges one response page into the store.
    async fn write(&self, response: &TransportResponse, tx: &mut Transaction) -> Result<()>;

    /// Request for the page after `response`.
    fn next_page(&self, response: &TransportResponse) -> Option<RequestDescriptor> {
        next_page_url(response).map(RequestDescriptor::follow)
    }
}

/// Upserts every entity of a response.
///
/// Items are read from the JSON pointer given to [`items_at`](Self::items_at),
/// otherwise from a top level array or its `data` field. A single object is
/// written as one entity, which also makes this the stock mutation use case:
///
/// ```rust,ignore
/// let send = FetchCollection::<Conversation>::new(RequestDescriptor::post(
///     "/api/v1/conversations",
///     json!({ "recipients": ["42"], "body": "Hello" }),
/// ))
/// .uncached()
/// .invalidating("inbox/");
/// ```
pub struct FetchCollection<T> {
    request: RequestDescriptor,
    scope: Scope,
    cache_key: Option<String>,
    ttl: Duration,
    replaces_scope: bool,
    invalidates: Vec<String>,
    items_at: Option<String>,
    _model: PhantomData<fn() -> T>,
}

impl<T: Entity> FetchCollection<T> {
    /// Cached under the request's own description until configured otherwise.
    pub fn new(request: RequestDescriptor) -> Self {
        Self {
            cache_key: Some(request.describe()),
            request,
            scope: Scope::of::<T>(),
            ttl: DEFAULT_TTL,
            replaces_scope: false,
            invalidates: Vec::new(),
            items_at: None,
            _model: PhantomData,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Never TTL-gated.
    pub fn uncached(mut self) -> Self {
        self.cache_key = None;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn replacing_scope(mut self) -> Self {
        self.replaces_scope = true;
        self
    }

    pub fn invalidating(mut self, prefix: impl Into<String>) -> Self {
        self.invalidates.push(prefix.into());
        self
    }

    /// JSON pointer (`/data/course/modules`) to the items in each page.
    pub fn items_at(mut self, pointer: impl Into<String>) -> Self {
        self.items_at = Some(pointer.into());
        self
    }

    fn items<'a>(&self, body: &'a Value) -> Result<Vec<&'a Value>> {
        let target = match &self.items_at {
            Some(pointer) => body.pointer(pointer),
            None if body.is_array() => Some(body),
            None => body.get("data").or(Some(body)),
        };

        match target {
            Some(Value::Array(items)) => Ok(items.iter().collect()),
            Some(item @ Value::Object(_)) => Ok(vec![item]),
            _ => Err(SyncError::InvalidResponse(format!(
                "no {} items in response",
                T::ENTITY_TYPE
            ))),
        }
    }
}

#[async_trait]
impl<T: Entity> UseCase for FetchCollection<T> {
    type Model = T;

    fn scope(&self) -> Scope {
        self.scope.clone()
    }

    fn cache_key(&self) -> Option<String> {
        self.cache_key.clone()
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn request(&self) -> Option<RequestDescriptor> {
        Some(self.request.clone())
    }

    fn replaces_scope(&self) -> bool {
        self.replaces_scope
    }

    fn invalidates(&self) -> Vec<String> {
        self.invalidates.clone()
    }

    async fn write(&self, response: &TransportResponse, tx: &mut Transaction) -> Result<()> {
        for item in self.items(&response.body)? {
            let entity: T = serde_json::from_value(item.clone())?;
            tx.upsert_entity(&entity).await?;
        }
        Ok(())
    }
}

/// Serves a scope straight from the store without ever touching the network.
pub struct LocalUseCase<T> {
    scope: Scope,
    _model: PhantomData<fn() -> T>,
}

impl<T: Entity> LocalUseCase<T> {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            _model: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> UseCase for LocalUseCase<T> {
    type Model = T;

    fn scope(&self) -> Scope {
        self.scope.clone()
    }

    fn cache_key(&self) -> Option<String> {
        None
    }

    fn request(&self) -> Option<RequestDescriptor> {
        None
    }

    async fn write(&self, _response: &TransportResponse, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

/// Sends a delete and, once the server accepts it, removes the scope locally.
pub struct DeleteUseCase<T> {
    request: RequestDescriptor,
    scope: Scope,
    invalidates: Vec<String>,
    _model: PhantomData<fn() -> T>,
}

impl<T: Entity> DeleteUseCase<T> {
    pub fn new(request: RequestDescriptor, scope: Scope) -> Self {
        Self {
            request,
            scope,
            invalidates: Vec::new(),
            _model: PhantomData,
        }
    }

    pub fn invalidating(mut self, prefix: impl Into<String>) -> Self {
        self.invalidates.push(prefix.into());
        self
    }
}

#[async_trait]
impl<T: Entity> UseCase for DeleteUseCase<T> {
    type Model = T;

    fn scope(&self) -> Scope {
        self.scope.clone()
    }

    fn cache_key(&self) -> Option<String> {
        None
    }

    fn request(&self) -> Option<RequestDescriptor> {
        Some(self.request.clone())
    }

    fn invalidates(&self) -> Vec<String> {
        self.invalidates.clone()
    }

    async fn write(&self, _response: &TransportResponse, tx: &mut Transaction) -> Result<()> {
        tx.delete_matching(&self.scope).await?;
        Ok(())
    }

    fn next_page(&self, _response: &TransportResponse) -> Option<RequestDescriptor> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_store::{LocalStore, MemoryStore, Predicate, ReadableExt};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ContextColor {
        canvas_context_id: String,
        color: String,
    }

    impl Entity for ContextColor {
        const ENTITY_TYPE: &'static str = "context_color";

        fn key(&self) -> String {
            self.canvas_context_id.clone()
        }
    }

    async fn write_page<U: UseCase>(store: &Arc<dyn LocalStore>, use_case: &U, body: Value) {
        let mut tx = store.begin().await.unwrap();
        use_case
            .write(&TransportResponse::new(body), &mut tx)
            .await
            .unwrap();
        tx.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_collection_reads_items_from_pointer() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let use_case = FetchCollection::<ContextColor>::new(RequestDescriptor::get(
            "/api/v1/users/self/colors",
        ))
        .with_cache_key("context_colors")
        .items_at("/custom_colors");

        write_page(
            &store,
            &use_case,
            json!({ "custom_colors": [
                { "canvas_context_id": "course_1", "color": "#ff0000" },
                { "canvas_context_id": "course_2", "color": "#00ff00" }
            ]}),
        )
        .await;

        let colors: Vec<ContextColor> = store.fetch_entities(&use_case.scope()).await.unwrap();
        assert_eq!(colors.len(), 2);
        assert_eq!(use_case.cache_key().as_deref(), Some("context_colors"));
    }

    #[tokio::test]
    async fn test_collection_accepts_data_field_and_single_object() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let use_case =
            FetchCollection::<ContextColor>::new(RequestDescriptor::get("/api/v1/colors"));

        write_page(
            &store,
            &use_case,
            json!({ "data": [{ "canvas_context_id": "course_1", "color": "#111111" }] }),
        )
        .await;
        write_page(
            &store,
            &use_case,
            json!({ "canvas_context_id": "course_2", "color": "#222222" }),
        )
        .await;

        assert_eq!(store.count(&use_case.scope()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_collection_rejects_unexpected_shapes() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let use_case =
            FetchCollection::<ContextColor>::new(RequestDescriptor::get("/api/v1/colors"));

        let mut tx = store.begin().await.unwrap();
        let err = use_case
            .write(&TransportResponse::new(json!("nope")), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResponse(_)));

        let err = use_case
            .write(&TransportResponse::new(json!([{ "color": 3 }])), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_scope() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let colors = FetchCollection::<ContextColor>::new(RequestDescriptor::get("/colors"));
        write_page(
            &store,
            &colors,
            json!([
                { "canvas_context_id": "course_1", "color": "#111111" },
                { "canvas_context_id": "course_2", "color": "#222222" }
            ]),
        )
        .await;

        let delete = DeleteUseCase::<ContextColor>::new(
            RequestDescriptor::delete("/api/v1/users/self/colors/course_1"),
            Scope::of::<ContextColor>().filter(Predicate::key_prefix("course_1")),
        )
        .invalidating("context_colors");
        write_page(&store, &delete, Value::Null).await;

        let left: Vec<ContextColor> = store.fetch_entities(&colors.scope()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].canvas_context_id, "course_2");
        assert_eq!(delete.invalidates(), vec!["context_colors".to_string()]);
        assert!(delete.cache_key().is_none());
    }

    #[test]
    fn test_defaults() {
        let local = LocalUseCase::<ContextColor>::new(Scope::of::<ContextColor>());
        assert!(local.request().is_none());
        assert!(local.cache_key().is_none());
        assert_eq!(local.ttl(), DEFAULT_TTL);
        assert!(!local.replaces_scope());

        let fetch = FetchCollection::<ContextColor>::new(RequestDescriptor::get("/api/v1/colors"));
        assert_eq!(fetch.cache_key().as_deref(), Some("GET /api/v1/colors"));
        assert!(fetch.uncached().cache_key().is_none());
    }
}
