//! Streaming file transfers with bounded retries.

use bridge_traits::{FileSystemAccess, HttpClient};
use core_runtime::logging::{redact_url, strip_path};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};

/// Receives `(bytes_written, content_length)` after every chunk.
pub type ProgressCallback<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Downloads one file into the offline directory.
///
/// Transient failures (timeouts, 5xx, 429, dropped connections) are retried
/// up to `max_retry_attempts` times with exponential backoff. A failing disk
/// write ends the transfer at once. The partial file is deleted whenever a
/// transfer does not complete.
pub struct FileDownloader {
    http: Arc<dyn HttpClient>,
    fs: Arc<dyn FileSystemAccess>,
    config: OfflineConfig,
}

impl FileDownloader {
    pub fn new(
        http: Arc<dyn HttpClient>,
        fs: Arc<dyn FileSystemAccess>,
        config: &OfflineConfig,
    ) -> Self {
        Self {
            http,
            fs,
            config: config.clone(),
        }
    }

    /// Downloads `url` to `path`, returning the bytes written.
    #[instrument(
        skip(self, url, path, cancel, on_progress),
        fields(file = %strip_path(path), url = %redact_url(url))
    )]
    pub async fn download(
        &self,
        url: &str,
        path: &Path,
        cancel: &CancellationToken,
        on_progress: ProgressCallback<'_>,
    ) -> Result<u64> {
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }

        let max_attempts = self.config.max_retry_attempts.max(1);
        let attempt_timeout = self.config.download_timeout;
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OfflineError::Cancelled),
                result = timeout(attempt_timeout, self.transfer(url, path, on_progress)) => {
                    result.unwrap_or(Err(OfflineError::Timeout(attempt_timeout)))
                }
            };

            let error = match result {
                Ok(bytes) => {
                    debug!(bytes, attempt, "Download complete");
                    return Ok(bytes);
                }
                Err(e) => e,
            };

            self.discard(path).await;
            if attempt >= max_attempts || !error.is_transient() {
                warn!(attempt, error = %error, "Download failed");
                return Err(error);
            }

            let delay = self.config.backoff(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Download attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OfflineError::Cancelled),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn transfer(
        &self,
        url: &str,
        path: &Path,
        on_progress: ProgressCallback<'_>,
    ) -> Result<u64> {
        let download = self.http.download_stream(url.to_string()).await?;
        let total = download.content_length;
        on_progress(0, total);

        let report = move |written: u64| on_progress(written, total);
        let written = self.fs.write_stream(path, download.stream, &report).await?;
        Ok(written)
    }

    async fn discard(&self, path: &Path) {
        match self.fs.exists(path).await {
            Ok(true) => {
                if let Err(e) = self.fs.delete_file(path).await {
                    warn!(error = %e, "Failed to delete partial download");
                }
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Could not check for partial download"),
        }
    }
}
