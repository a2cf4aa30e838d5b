//! # Reactive Store
//!
//! Binds a [`UseCase`] to the shared store, cache policy and transport, and
//! exposes its scope as a one-shot read or a continuously updated
//! [`Observation`].
//!
//! ## Read path
//!
//! 1. Offline mode, or a use case without a request: read the store.
//! 2. `ignore_cache == false` and the cache key is still valid: read the store.
//! 3. Otherwise fetch (first page or every page), write through, then read
//!    the store. A failed fetch returns the error and leaves the store as it
//!    was.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let colors = ReactiveStore::new(GetContextColors::default(), fetcher.clone());
//! let mut observation = colors.observe(false);
//! while let Some(update) = observation.next().await {
//!     render(update?);
//! }
//! ```

use crate::fetcher::{FetchOutcome, Fetcher};
use crate::use_case::UseCase;
use crate::Result;
use core_store::{ChangeSet, ReadableExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub struct ReactiveStore<U: UseCase> {
    use_case: Arc<U>,
    fetcher: Arc<Fetcher>,
    offline: bool,
}

impl<U: UseCase> Clone for ReactiveStore<U> {
    fn clone(&self) -> Self {
        Self {
            use_case: self.use_case.clone(),
            fetcher: self.fetcher.clone(),
            offline: self.offline,
        }
    }
}

impl<U: UseCase> ReactiveStore<U> {
    pub fn new(use_case: U, fetcher: Arc<Fetcher>) -> Self {
        Self {
            use_case: Arc::new(use_case),
            fetcher,
            offline: false,
        }
    }

    /// Serves every read from the Local Store, never touching the network.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn use_case(&self) -> &U {
        &self.use_case
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Current scope contents, refreshed from the network first when the cache
    /// does not satisfy the read.
    #[instrument(skip(self), fields(cache_key = ?self.use_case.cache_key()))]
    pub async fn get_entities(
        &self,
        ignore_cache: bool,
        load_all_pages: bool,
    ) -> Result<Vec<U::Model>> {
        if self.needs_refresh(ignore_cache).await? {
            self.refresh(load_all_pages).await?;
        }
        self.get_entities_from_database().await
    }

    /// Refreshes regardless of the cache entry.
    pub async fn force_refresh(&self, load_all_pages: bool) -> Result<Vec<U::Model>> {
        self.get_entities(true, load_all_pages).await
    }

    /// Scope contents as last committed, without any network activity.
    pub async fn get_entities_from_database(&self) -> Result<Vec<U::Model>> {
        let entities = self
            .fetcher
            .store()
            .fetch_entities(&self.use_case.scope())
            .await?;
        Ok(entities)
    }

    /// Emits the scope now and again after every commit that touches it.
    ///
    /// The first emission follows the same path as
    /// [`get_entities`](Self::get_entities) with every page loaded. When that
    /// refresh fails the error is emitted, followed by the stale contents if
    /// there are any. Cancelling stops emissions; a fetch already in flight
    /// still completes and writes through.
    pub fn observe(&self, ignore_cache: bool) -> Observation<U::Model> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<()>();
        let subscription = self.fetcher.store().observe(
            self.use_case.scope(),
            Arc::new(move |_: &ChangeSet| {
                changed_tx.send(()).ok();
            }),
        );

        let this = self.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let _subscription = subscription;

            let refreshed = match this.needs_refresh(ignore_cache).await {
                Ok(true) => this.refresh(true).await.map(|_| ()),
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            // Commits up to here are covered by the snapshot read below.
            while changed_rx.try_recv().is_ok() {}
            let snapshot = this.get_entities_from_database().await;
            if cancelled.is_cancelled() {
                return;
            }

            match refreshed {
                Ok(()) => {
                    if sender.send(snapshot).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Initial load failed, serving stale data");
                    if sender.send(Err(e)).is_err() {
                        return;
                    }
                    match snapshot {
                        Ok(stale) if stale.is_empty() => {}
                        other => {
                            if sender.send(other).is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = changed_rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        while changed_rx.try_recv().is_ok() {}

                        let snapshot = this.get_entities_from_database().await;
                        if cancelled.is_cancelled() || sender.send(snapshot).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Observation closed");
        });

        Observation { receiver, token }
    }

    async fn needs_refresh(&self, ignore_cache: bool) -> Result<bool> {
        if self.offline || self.use_case.request().is_none() {
            return Ok(false);
        }
        if ignore_cache {
            return Ok(true);
        }
        match self.use_case.cache_key() {
            Some(key) => Ok(!self.fetcher.cache().is_valid(&key).await?),
            None => Ok(true),
        }
    }

    async fn refresh(&self, load_all_pages: bool) -> Result<FetchOutcome> {
        if load_all_pages {
            self.fetcher.exhaust(self.use_case.as_ref()).await
        } else {
            self.fetcher.fetch(self.use_case.as_ref()).await
        }
    }
}

/// A live view of a use case's scope. Dropping it cancels.
pub struct Observation<T> {
    receiver: mpsc::UnboundedReceiver<Result<Vec<T>>>,
    token: CancellationToken,
}

impl<T> Observation<T> {
    /// Next emission, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<Result<Vec<T>>> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Drop for Observation<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<T> std::fmt::Debug for Observation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
