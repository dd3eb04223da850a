//! Reader, writer and retry configuration.
//!
//! All structs are plain values with builder-style setters. Validation
//! happens eagerly when a reader or writer is constructed.

use std::time::Duration;

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};

/// Default part size for multipart uploads (50 MiB)
pub const DEFAULT_PART_SIZE: usize = 50 * 1024 * 1024;

/// Default line terminator for `readline`
pub const DEFAULT_LINE_TERMINATOR: u8 = b'\n';

/// Attempt ceiling and backoff schedule for remote calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after every further failure
    pub initial_backoff: Duration,
    /// Upper bound of a single delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Configuration(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Configuration of a [`BufferedReader`](crate::BufferedReader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Bytes pulled from the remote per buffer fill
    pub buffer_size: usize,
    /// Size of each range request; `None` requests open-ended ranges
    pub range_chunk_size: Option<u64>,
    pub line_terminator: u8,
    /// Serve forward seeks inside the buffered window without I/O
    pub seek_within_buffer: bool,
    pub retry: RetryConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CHUNK_SIZE,
            range_chunk_size: None,
            line_terminator: DEFAULT_LINE_TERMINATOR,
            seek_within_buffer: true,
            retry: RetryConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_range_chunk_size(mut self, range_chunk_size: Option<u64>) -> Self {
        self.range_chunk_size = range_chunk_size;
        self
    }

    pub fn with_line_terminator(mut self, line_terminator: u8) -> Self {
        self.line_terminator = line_terminator;
        self
    }

    pub fn with_seek_within_buffer(mut self, enabled: bool) -> Self {
        self.seek_within_buffer = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Configuration("buffer_size must be positive".into()));
        }
        if self.range_chunk_size == Some(0) {
            return Err(Error::Configuration(
                "range_chunk_size must be positive when set".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Configuration of a [`Writer`](crate::Writer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Bytes per uploaded part; raised to the store's minimum if smaller
    pub part_size: usize,
    /// Use the multipart protocol; otherwise buffer everything for one put
    pub multipart: bool,
    pub retry: RetryConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart: true,
            retry: RetryConfig::default(),
        }
    }
}

impl WriterConfig {
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_multipart(mut self, multipart: bool) -> Self {
        self.multipart = multipart;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(Error::Configuration("part_size must be positive".into()));
        }
        self.retry.validate()
    }
}
