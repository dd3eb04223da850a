//! # rangefile
//!
//! Seekable streaming reads and multipart writes over range-addressable
//! object stores.
//!
//! Remote objects are read through HTTP-style byte-range requests and exposed
//! as ordinary `std::io::{Read, BufRead, Seek}` values. Large objects are
//! written by cutting the stream into parts and uploading them one at a time,
//! so memory stays bounded and nothing becomes visible until the upload is
//! committed.
//!
//! ## Features
//!
//! - Lazy range requests, chunked or open-ended
//! - Seeks relative to start, current position or end, including suffix
//!   requests before the object size is known
//! - Bounded retries with exponential backoff for every remote call
//! - Multipart uploads that either commit completely or leave no object
//! - HTTP (plain range GETs, S3-style multipart), local directory and
//!   in-memory stores
//! - Transparent gzip and bzip2, chosen explicitly or from the key's extension
//!
//! ## Example
//!
//! ```no_run
//! use std::io::SeekFrom;
//! use std::sync::Arc;
//! use rangefile::{HttpConfig, HttpStore, ObjectHandle, ReaderConfig};
//!
//! fn main() -> rangefile::Result<()> {
//!     let store = Arc::new(HttpStore::new(HttpConfig::new("https://example.com"))?);
//!     let handle = ObjectHandle::new("", "logs/app.log");
//!
//!     let mut reader = rangefile::open_reader(store, handle, ReaderConfig::default())?;
//!     reader.seek(SeekFrom::End(-1024))?;
//!     for line in reader.lines() {
//!         print!("{}", String::from_utf8_lossy(&line?));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod cli;
pub mod compression;
pub mod config;
pub mod error;
pub mod io;
pub mod reader;
pub mod retry;
pub mod writer;

use std::sync::Arc;

pub use buffer::{ByteBuffer, Chunks};
pub use cli::Cli;
pub use compression::{Compression, EncodedWriter};
pub use config::{ReaderConfig, RetryConfig, WriterConfig};
pub use error::{Error, Result, TransportError, WriteState};
pub use io::{
    ByteRange, HttpConfig, HttpStore, LocalStore, MemoryStore, MultipartSink, ObjectHandle,
    PartDescriptor, RangeSource,
};
pub use reader::{BufferedReader, RawReader};
pub use retry::RetryPolicy;
pub use writer::{MultipartWriter, SinglepartWriter, Writer};

/// Open `handle` for buffered, seekable reading.
pub fn open_reader<S>(store: Arc<S>, handle: ObjectHandle, config: ReaderConfig) -> Result<BufferedReader<S>>
where
    S: RangeSource + ?Sized,
{
    BufferedReader::new(store, handle, config)
}

/// Open `handle` for writing; multipart unless `config.multipart` is off.
pub fn open_writer<S>(store: Arc<S>, handle: ObjectHandle, config: WriterConfig) -> Result<Writer<S>>
where
    S: MultipartSink + ?Sized,
{
    Writer::new(store, handle, config)
}
