//! Resource limits for script execution
//!
//! These limits keep a runaway script from exhausting the host: engine heap
//! and stack, buffered HTTP bodies, and the worker pool size.

use std::time::Duration;

/// Maximum accepted length of a filesystem path, in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum accepted length of a URL, in bytes.
pub const MAX_URL_LENGTH: usize = 2083;

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default read size for stream handles: 4KB
pub const SMALL_BUFFER_SIZE: usize = 4 * 1024;

/// Default maximum buffered response body: 10MB
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Unix permission bits for key files (owner read/write only).
pub const FILE_PERM_EXCLUSIVE: u32 = 0o600;

/// Maximum number of redirects followed by the HTTP client.
pub const MAX_REDIRECTS: usize = 10;

/// Resource limits for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```rust
/// use swrt::RuntimeLimits;
///
/// let limits = RuntimeLimits::new()
///     .memory_limit(64 * 1024 * 1024)
///     .max_response_bytes(1024 * 1024);
/// assert_eq!(limits.worker_threads, 4);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Engine heap limit in bytes. 0 means unlimited.
    /// Default: 0
    pub memory_limit: usize,

    /// Engine stack limit in bytes (deep recursion guard).
    /// Default: 1MB
    pub max_stack_size: usize,

    /// Maximum size of a non-streaming HTTP response body.
    /// Default: 10MB
    pub max_response_bytes: usize,

    /// Number of worker threads serving network and file operations.
    /// Default: 4
    pub worker_threads: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            max_stack_size: 1024 * 1024,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            worker_threads: 4,
        }
    }
}

impl RuntimeLimits {
    /// Create new limits with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set engine heap limit (0 = unlimited)
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set engine stack limit
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    /// Set maximum buffered response size
    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    /// Set worker thread count (at least 1)
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }
}
