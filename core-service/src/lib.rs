//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, filesystem,
//! clock) into the shared Rust core: one Local Store, one Cache Policy Engine,
//! one API transport and one course download pipeline, all reachable through
//! an explicit [`CoreService`] handle instead of process-wide singletons.
//! Desktop apps typically enable the `desktop-shims` feature so the bridges
//! default to `bridge-desktop`.
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/offline.db")
//!     .api_base_url("https://school.instructure.com")
//!     .access_token(token)
//!     .build()?;
//! let core = CoreService::bootstrap(config).await?;
//!
//! core.pipeline().select(&["42".to_string()]).await?;
//! let handle = core.pipeline().download(&["42".to_string()]).await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

pub use core_offline::{CourseSyncPipeline, CourseSyncSummary, DiskBudget, OfflineConfig};
pub use core_runtime::config::{CoreConfig, CoreConfigBuilder};
pub use core_runtime::events::{CoreEvent, EventBus, EventStream};
pub use core_store::{CachePolicy, LocalStore};
pub use core_sync::{FetchCollection, Fetcher, ReactiveStore, RequestDescriptor, UseCase};

use core_offline::{ApiContentResolver, DownloadRepository};
use core_store::{DatabaseConfig, Entity, SqliteStore};
use core_sync::HttpTransport;
use std::sync::Arc;
use tracing::{info, instrument};

/// Components shared by every use case and the download pipeline.
pub struct CoreComponents {
    pub store: Arc<dyn LocalStore>,
    pub cache: Arc<CachePolicy>,
    pub fetcher: Arc<Fetcher>,
    pub pipeline: CourseSyncPipeline,
    pub events: EventBus,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    components: Arc<CoreComponents>,
}

impl CoreService {
    /// Opens the database and builds every component from `config`.
    #[instrument(skip(config), fields(database = %config.database_path.display()))]
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let database = if config.uses_in_memory_database() {
            DatabaseConfig::in_memory()
        } else {
            DatabaseConfig::new(config.database_path.clone())
        };
        let store: Arc<dyn LocalStore> =
            Arc::new(SqliteStore::open(database).await?.with_clock(config.clock.clone()));

        let events = EventBus::default();
        let cache = Arc::new(
            CachePolicy::new(store.clone(), config.clock.clone()).with_event_bus(events.clone()),
        );

        let mut transport = HttpTransport::new(config.http_client.clone(), &config.api_base_url);
        if let Some(token) = &config.access_token {
            transport = transport.with_access_token(token.clone());
        }
        let fetcher = Arc::new(
            Fetcher::new(cache.clone(), Arc::new(transport)).with_event_bus(events.clone()),
        );

        let budget = Self::disk_budget(&config, &DownloadRepository::new(store.clone())).await?;
        let pipeline = CourseSyncPipeline::new(
            OfflineConfig::default().with_root_directory(config.offline_root.clone()),
            Arc::new(ApiContentResolver::new(fetcher.clone())),
            config.http_client.clone(),
            config.file_system.clone(),
            store.clone(),
            budget,
            Some(events.clone()),
        )?;

        let snapshot = pipeline.budget().snapshot();
        info!(
            offline_mode = config.offline_mode,
            capacity = snapshot.capacity,
            consumed = snapshot.consumed,
            "Core service ready"
        );

        Ok(Self::from_parts(
            config,
            CoreComponents {
                store,
                cache,
                fetcher,
                pipeline,
                events,
            },
        ))
    }

    /// Assembles a service from pre-built components.
    pub fn from_parts(config: CoreConfig, components: CoreComponents) -> Self {
        Self {
            config: Arc::new(config),
            components: Arc::new(components),
        }
    }

    /// Fixed quota when configured, otherwise the free space under the
    /// offline root plus what earlier sessions already downloaded.
    async fn disk_budget(config: &CoreConfig, repository: &DownloadRepository) -> Result<DiskBudget> {
        let consumed = repository.completed_bytes().await?;

        let budget = match config.disk_quota_bytes {
            Some(quota) => DiskBudget::with_quota(quota),
            None => {
                let fs = &config.file_system;
                fs.create_dir_all(&config.offline_root).await?;
                let free = fs.available_space(&config.offline_root).await?;
                DiskBudget::new(free.saturating_add(consumed))
            }
        };
        Ok(budget.with_consumed(consumed))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.components.store
    }

    pub fn cache(&self) -> &Arc<CachePolicy> {
        &self.components.cache
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.components.fetcher
    }

    pub fn pipeline(&self) -> &CourseSyncPipeline {
        &self.components.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.components.events
    }

    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.components.events.subscribe())
    }

    /// Binds a use case to the shared store, cache and transport.
    /// Honors the configured offline mode.
    pub fn reactive_store<U: UseCase>(&self, use_case: U) -> ReactiveStore<U> {
        ReactiveStore::new(use_case, self.components.fetcher.clone()).offline(self.config.offline_mode)
    }

    /// A collection fetch cached for the configured default TTL.
    pub fn collection<T: Entity>(&self, request: RequestDescriptor) -> FetchCollection<T> {
        FetchCollection::new(request).with_ttl(self.config.default_ttl)
    }

    /// Stops every running course download.
    pub fn shutdown(&self) {
        info!("Shutting down core service");
        self.components.pipeline.cancel_all();
    }
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("config", &self.config)
            .field("pipeline", &self.components.pipeline)
            .finish()
    }
}
