//! Download pipeline configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OfflineError, Result};

/// Configuration for the course download pipeline.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Courses downloading at the same time (default: 3)
    pub max_concurrent_courses: usize,

    /// Files downloading at the same time across all courses (default: 6)
    pub max_concurrent_files: usize,

    /// Attempts per file before it is marked failed (default: 3)
    pub max_retry_attempts: u32,

    /// Delay before the second attempt, doubled for each later one (default: 100ms)
    pub retry_base_delay: Duration,

    /// Timeout for a single transfer attempt (default: 300s)
    pub download_timeout: Duration,

    /// Directory holding one `course-<id>` folder per downloaded course
    pub root_directory: PathBuf,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_courses: 3,
            max_concurrent_files: 6,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            download_timeout: Duration::from_secs(300),
            root_directory: PathBuf::from("Offline"),
        }
    }
}

impl OfflineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_courses(mut self, count: usize) -> Self {
        self.max_concurrent_courses = count;
        self
    }

    pub fn with_max_concurrent_files(mut self, count: usize) -> Self {
        self.max_concurrent_files = count;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_directory = root.into();
        self
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }

    /// `<root>/course-<id>`
    pub fn course_directory(&self, course_id: &str) -> PathBuf {
        self.root_directory.join(format!("course-{}", course_id))
    }

    /// `<root>/course-<id>/<file-id>-<name>`
    pub fn file_path(&self, course_id: &str, file_id: &str, name: &str) -> PathBuf {
        self.course_directory(course_id)
            .join(format!("{}-{}", file_id, sanitize_file_name(name)))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_courses == 0 {
            return Err(OfflineError::Config(
                "max_concurrent_courses must be at least 1".to_string(),
            ));
        }

        if self.max_concurrent_files == 0 {
            return Err(OfflineError::Config(
                "max_concurrent_files must be at least 1".to_string(),
            ));
        }

        if self.max_retry_attempts == 0 {
            return Err(OfflineError::Config(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.download_timeout.is_zero() {
            return Err(OfflineError::Config(
                "download_timeout must be greater than 0".to_string(),
            ));
        }

        if self.root_directory.as_os_str().is_empty() {
            return Err(OfflineError::Config(
                "root_directory cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Path separators and control characters become `_`; an empty name becomes `file`.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True when `path` lies inside `root`.
pub(crate) fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}
