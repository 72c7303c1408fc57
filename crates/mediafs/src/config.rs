//! Mount configuration for the media filesystem.
//!
//! One [`MountConfig`] value is built at startup and handed to the node
//! tree, the reconciler and the filesystem. Nothing reads configuration
//! from global state.

use std::time::Duration;

/// Default reconciliation period. Also used as the kernel attribute TTL.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(60);

/// Default deadline for establishing a remote connection or fetching a snapshot.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a single buffered read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of one block pulled from the origin (256 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Default upper bound of a reader's prefetch buffer (16 MiB).
pub const DEFAULT_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Tuning for per-file streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Deadline for opening a ranged request against the origin.
    pub setup_timeout: Duration,
    /// Deadline for one `read` to be satisfied from the buffer.
    pub read_timeout: Duration,
    /// Bytes pulled from the origin per step.
    pub block_size: usize,
    /// Maximum bytes held in the prefetch buffer.
    pub cache_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            block_size: DEFAULT_BLOCK_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Configuration options for the media filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Name of the movie subtree under the mount root.
    pub movies_dir: String,

    /// Name of the show subtree under the mount root.
    pub shows_dir: String,

    /// Period between timer-driven reconciliations.
    ///
    /// Attributes are advertised to the kernel with this TTL so `stat()`
    /// results stay valid between refreshes.
    pub refresh_period: Duration,

    /// Streaming parameters for opened files.
    pub stream: StreamConfig,

    /// User ID reported as owner of every entry.
    pub uid: u32,

    /// Group ID reported as owner of every entry.
    pub gid: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            movies_dir: "movies".to_string(),
            shows_dir: "shows".to_string(),
            refresh_period: DEFAULT_REFRESH_PERIOD,
            stream: StreamConfig::default(),
            // SAFETY: getuid/getgid cannot fail and have no preconditions
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl MountConfig {
    /// TTL advertised for attributes and entries.
    pub fn attr_ttl(&self) -> Duration {
        self.refresh_period
    }

    /// Sets the names of the two subtrees.
    #[must_use]
    pub fn subtrees(mut self, movies: impl Into<String>, shows: impl Into<String>) -> Self {
        self.movies_dir = movies.into();
        self.shows_dir = shows.into();
        self
    }

    /// Sets the reconciliation period.
    #[must_use]
    pub fn refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    /// Sets the deadline for connection setup.
    #[must_use]
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.stream.setup_timeout = timeout;
        self
    }

    /// Sets the deadline for a buffered read.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.stream.read_timeout = timeout;
        self
    }

    /// Sets the prefetch buffer bound. Clamped to at least one block.
    #[must_use]
    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.stream.cache_size = bytes.max(self.stream.block_size);
        self
    }

    /// Sets the origin block size. Zero is treated as one byte.
    #[must_use]
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.stream.block_size = bytes.max(1);
        self.stream.cache_size = self.stream.cache_size.max(self.stream.block_size);
        self
    }

    /// Sets the reported ownership.
    #[must_use]
    pub fn ownership(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.movies_dir, "movies");
        assert_eq!(config.shows_dir, "shows");
        assert_eq!(config.attr_ttl(), Duration::from_secs(60));
        assert_eq!(config.stream.block_size, 256 * 1024);
        assert_eq!(config.stream.cache_size, 16 * 1024 * 1024);
        assert_eq!(config.stream.setup_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .subtrees("Films", "TV")
            .refresh_period(Duration::from_secs(300))
            .read_timeout(Duration::from_secs(5))
            .ownership(1000, 100);
        assert_eq!(config.movies_dir, "Films");
        assert_eq!(config.shows_dir, "TV");
        assert_eq!(config.attr_ttl(), Duration::from_secs(300));
        assert_eq!(config.stream.read_timeout, Duration::from_secs(5));
        assert_eq!((config.uid, config.gid), (1000, 100));
    }

    #[test]
    fn test_cache_never_smaller_than_block() {
        let config = MountConfig::default().block_size(1024).cache_size(10);
        assert_eq!(config.stream.cache_size, 1024);

        let config = MountConfig::default().cache_size(4096).block_size(8192);
        assert_eq!(config.stream.cache_size, 8192);
    }
}
