//! # Core Configuration Module
//!
//! Provides configuration management for the offline sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the host bridges and settings every component needs.
//! It enforces fail-fast validation so that a missing capability is reported
//! at startup instead of at the first download.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - API requests and file transfers (desktop default: reqwest)
//! - `FileSystemAccess` - Offline content storage (desktop default: tokio fs)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for
//! both bridges are injected automatically if not provided.
//!
//! ## Optional Dependencies
//!
//! - `Clock` - Time source for TTL decisions (default: `SystemClock`)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/offline.db")
//!     .offline_root("/path/to/Offline")
//!     .api_base_url("https://school.instructure.com")
//!     .access_token("token")
//!     .http_client(Arc::new(MyHttpClient))
//!     .file_system(Arc::new(MyFileSystem))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Missing the API base URL
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/offline.db")
//!     .build()
//!     .expect("Should fail - missing api base url");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, FileSystemAccess, HttpClient, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Database path that selects a private in-memory store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Default freshness window for use cases that do not declare their own.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Longest TTL a use case may register (one week).
const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Core configuration for the offline sync core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file, or [`IN_MEMORY_DATABASE`]
    pub database_path: PathBuf,

    /// Directory that receives downloaded course content
    pub offline_root: PathBuf,

    /// Base URL of the LMS API (e.g. `https://school.instructure.com`)
    pub api_base_url: String,

    /// Bearer token attached to API requests
    pub access_token: Option<String>,

    /// Serve every read from the local store and never touch the network
    pub offline_mode: bool,

    /// TTL applied to use cases without an explicit TTL
    pub default_ttl: Duration,

    /// Fixed disk budget for offline content. `None` uses the free space
    /// reported by the file system.
    pub disk_quota_bytes: Option<u64>,

    /// HTTP client for API requests and downloads
    pub http_client: Arc<dyn HttpClient>,

    /// File system access abstraction
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Time source for cache freshness decisions
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("offline_root", &self.offline_root)
            .field("api_base_url", &self.api_base_url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("offline_mode", &self.offline_mode)
            .field("default_ttl", &self.default_ttl)
            .field("disk_quota_bytes", &self.disk_quota_bytes)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Whether the database should live in memory only.
    pub fn uses_in_memory_database(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_DATABASE
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path and offline root are not empty
    /// - API base URL is an absolute http(s) URL
    /// - Default TTL is within one week
    /// - A fixed disk quota, when given, is non-zero
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.offline_root.as_os_str().is_empty() {
            return Err(Error::Config(
                "Offline root directory cannot be empty".to_string(),
            ));
        }

        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"))
        {
            return Err(Error::Config(format!(
                "API base URL must start with http:// or https://, got '{}'",
                self.api_base_url
            )));
        }

        if self.default_ttl > MAX_TTL {
            return Err(Error::Config(
                "Default TTL exceeds maximum of 7 days".to_string(),
            ));
        }

        if self.disk_quota_bytes == Some(0) {
            return Err(Error::Config(
                "Disk quota must be greater than 0 bytes. Omit it to use free disk space."
                    .to_string(),
            ));
        }

        if let Some(token) = &self.access_token {
            if token.trim().is_empty() {
                return Err(Error::Config(
                    "Access token cannot be blank. Omit it for anonymous requests.".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for API requests and downloads. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Mobile: inject a URLSession/OkHttp backed client."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    let client = bridge_desktop::ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for offline content. \
                 Desktop: enable the 'desktop-shims' feature to use the default TokioFileSystem. \
                 Mobile: inject a sandboxed file system bridge."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Ok(Arc::new(bridge_desktop::TokioFileSystem::new()))
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) once every required value is set.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    offline_root: Option<PathBuf>,
    api_base_url: Option<String>,
    access_token: Option<String>,
    offline_mode: bool,
    default_ttl: Option<Duration>,
    disk_quota_bytes: Option<u64>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/path/to/offline.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Uses a private in-memory database (tests, previews).
    pub fn in_memory_database(mut self) -> Self {
        self.database_path = Some(PathBuf::from(IN_MEMORY_DATABASE));
        self
    }

    /// Sets the directory for downloaded course content.
    ///
    /// Default: `Offline` next to the database file.
    pub fn offline_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.offline_root = Some(path.into());
        self
    }

    /// Sets the API base URL.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Sets the bearer token sent with every API request.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Serves reads from the local store only.
    pub fn offline_mode(mut self, enabled: bool) -> Self {
        self.offline_mode = enabled;
        self
    }

    /// Sets the fallback TTL. Default: 2 hours.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Caps offline content at a fixed number of bytes.
    pub fn disk_quota_bytes(mut self, bytes: u64) -> Self {
        self.disk_quota_bytes = Some(bytes);
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) is used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the file system access implementation.
    ///
    /// If not provided, the desktop default (tokio fs-based) is used when
    /// the `desktop-shims` feature is enabled.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error if:
    /// - Database path or API base URL is missing
    /// - A required bridge is missing and no desktop default is available
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let api_base_url = self.api_base_url.ok_or_else(|| {
            Error::Config("API base URL is required. Use .api_base_url() to set it.".to_string())
        })?;

        let offline_root = match self.offline_root {
            Some(root) => root,
            None => database_path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(|parent| parent.join("Offline"))
                .unwrap_or_else(|| PathBuf::from("Offline")),
        };

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let config = CoreConfig {
            database_path,
            offline_root,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            access_token: self.access_token,
            offline_mode: self.offline_mode,
            default_ttl: self.default_ttl.unwrap_or(DEFAULT_TTL),
            disk_quota_bytes: self.disk_quota_bytes,
            http_client,
            file_system,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}
