mod http;
mod local;
pub mod memory;

pub use http::{HttpConfig, HttpStore};
pub use local::LocalStore;
pub use memory::MemoryStore;

use bytes::Bytes;
use std::fmt;
use std::io::Read;

use crate::error::TransportError;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Identity of one remote object: a container (bucket) and a key within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub container: String,
    pub key: String,
}

impl ObjectHandle {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// `container/key`, or just the key when there is no container.
    pub fn path(&self) -> String {
        if self.container.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", self.container, self.key)
        }
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Byte interval of a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// The whole object, no `Range` header
    Full,
    /// `bytes=N-`: from N to the end
    From(u64),
    /// `bytes=A-B`: A through B, inclusive
    Inclusive(u64, u64),
    /// `bytes=-N`: the last N bytes
    Suffix(u64),
}

impl ByteRange {
    /// Value of the HTTP `Range` header, if any.
    pub fn header(&self) -> Option<String> {
        match *self {
            ByteRange::Full => None,
            ByteRange::From(start) => Some(format!("bytes={start}-")),
            ByteRange::Inclusive(start, end) => Some(format!("bytes={start}-{end}")),
            ByteRange::Suffix(len) => Some(format!("bytes=-{len}")),
        }
    }

    /// Resolve against an object of `size` bytes into a half-open interval.
    ///
    /// Returns `None` when the range is not satisfiable, the way S3 answers
    /// `416 InvalidRange`: any start at or past the end, or a suffix of an
    /// empty object.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        match *self {
            ByteRange::Full => Some((0, size)),
            ByteRange::From(start) if start < size => Some((start, size)),
            ByteRange::Inclusive(start, end) if start < size && start <= end => {
                Some((start, end.saturating_add(1).min(size)))
            }
            ByteRange::Suffix(len) if size > 0 && len > 0 => Some((size - len.min(size), size)),
            _ => None,
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header() {
            Some(header) => f.write_str(&header),
            None => f.write_str("bytes=*"),
        }
    }
}

/// Streaming body of a range response.
pub type Body = Box<dyn Read + Send>;

/// Answer to a range request.
pub struct RangeResponse {
    /// Offset of the first byte of `body` within the object
    pub start: u64,
    /// Declared total size of the object, when the store reports it
    pub total_size: Option<u64>,
    pub body: Body,
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("start", &self.start)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// A store that can serve byte ranges of its objects.
pub trait RangeSource: Send + Sync {
    fn get_range(&self, handle: &ObjectHandle, range: ByteRange) -> TransportResult<RangeResponse>;
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    pub part_number: u32,
    pub etag: String,
    pub size: usize,
}

/// A store that accepts multipart uploads and whole-object puts.
pub trait MultipartSink: Send + Sync {
    /// Smallest part the store accepts for any part but the last one
    fn min_part_size(&self) -> usize {
        1
    }

    fn initiate(&self, handle: &ObjectHandle) -> TransportResult<String>;

    fn upload_part(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> TransportResult<String>;

    /// Assemble the upload; `parts` are in ascending part-number order.
    fn complete(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> TransportResult<()>;

    fn abort(&self, handle: &ObjectHandle, upload_id: &str) -> TransportResult<()>;

    /// Create or replace the object with `data` in one request.
    fn put(&self, handle: &ObjectHandle, data: Bytes) -> TransportResult<()>;
}
