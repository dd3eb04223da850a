//! Range-request reader
//!
//! Keeps a logical position over a remote object and serves reads from one
//! open range body at a time. Bodies are opened lazily on the first read after
//! construction or a seek, and dropped whenever the position jumps.

use bytes::Bytes;
use std::io::{self, Read, SeekFrom};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::io::{Body, ByteRange, ObjectHandle, RangeResponse, RangeSource, TransportResult};
use crate::retry::RetryPolicy;

/// Move `base` by a signed `delta`, saturating at both ends.
pub(crate) fn offset_by(base: u64, delta: i64) -> u64 {
    if delta < 0 {
        base.saturating_sub(delta.unsigned_abs())
    } else {
        base.saturating_add(delta as u64)
    }
}

#[derive(Default)]
struct ReadSession {
    position: u64,
    content_length: Option<u64>,
    body: Option<Body>,
    /// The open body covers a bounded range, so its end is not the object's
    body_bounded: bool,
}

impl ReadSession {
    fn at_eof(&self) -> bool {
        matches!(self.content_length, Some(len) if self.position >= len)
    }

    fn learn_length(&mut self, total: u64) {
        match self.content_length {
            None => {
                debug!("content length is {}", total);
                self.content_length = Some(total);
            }
            Some(known) if known != total => {
                warn!("object size changed from {} to {} while reading", known, total);
            }
            Some(_) => {}
        }
    }

    fn next_range(&self, chunk_size: Option<u64>) -> ByteRange {
        match chunk_size {
            Some(chunk) => {
                let mut end = self.position.saturating_add(chunk.max(1) - 1);
                if let Some(len) = self.content_length {
                    end = end.min(len.saturating_sub(1));
                }
                ByteRange::Inclusive(self.position, end)
            }
            None => ByteRange::From(self.position),
        }
    }

    /// Issue `range` and make its body current, recovering out-of-range answers.
    fn open<S: RangeSource + ?Sized>(
        &mut self,
        source: &S,
        handle: &ObjectHandle,
        range: ByteRange,
    ) -> TransportResult<()> {
        self.body = None;
        debug!("opening {} {}", handle, range);
        match source.get_range(handle, range) {
            Ok(response) => self.attach(range, response),
            Err(TransportError::OutOfRange {
                actual_size: Some(size),
            }) => {
                debug!("{} is out of range, object size is {}", range, size);
                self.learn_length(size);
                self.position = match range {
                    ByteRange::Suffix(n) => size.saturating_sub(n),
                    _ => self.position.min(size),
                };
                Ok(())
            }
            Err(TransportError::OutOfRange { actual_size: None }) => {
                debug!("{} is out of range, fetching {} whole to learn its size", range, handle);
                let response = source.get_range(handle, ByteRange::Full)?;
                self.attach(range, response)
            }
            Err(e) => Err(e),
        }
    }

    fn attach(&mut self, range: ByteRange, response: RangeResponse) -> TransportResult<()> {
        if let Some(total) = response.total_size {
            self.learn_length(total);
        }

        let desired = match range {
            ByteRange::Suffix(n) => self
                .content_length
                .map(|len| len.saturating_sub(n))
                .unwrap_or(response.start),
            _ => self.position,
        };
        if let Some(len) = self.content_length {
            if desired >= len {
                self.position = len;
                return Ok(());
            }
        }
        if response.start > desired {
            return Err(TransportError::fatal(format!(
                "store answered from offset {} but {} was requested",
                response.start, desired
            )));
        }

        let mut body = response.body;
        let skip = desired - response.start;
        if skip > 0 {
            // The store ignored the range; discard everything before `desired`.
            debug!("skipping {} bytes of an unranged body", skip);
            let skipped = io::copy(&mut Read::by_ref(&mut body).take(skip), &mut io::sink())
                .map_err(TransportError::from_io)?;
            if skipped < skip {
                return Err(TransportError::transient(format!(
                    "body ended after {skipped} of {skip} skipped bytes"
                )));
            }
        }

        self.position = desired;
        self.body_bounded = matches!(range, ByteRange::Inclusive(..)) && response.start == desired;
        self.body = Some(body);
        Ok(())
    }

    /// One attempt at reading into `buf`; opens ranges as needed.
    fn read_once<S: RangeSource + ?Sized>(
        &mut self,
        source: &S,
        handle: &ObjectHandle,
        chunk_size: Option<u64>,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.at_eof() {
                self.body = None;
                return Ok(0);
            }

            let fresh = self.body.is_none();
            if fresh {
                let before = self.position;
                self.open(source, handle, self.next_range(chunk_size))?;
                if self.body.is_none() {
                    if self.at_eof() || self.position != before {
                        continue;
                    }
                    return Err(TransportError::fatal(format!(
                        "offset {before} of {handle} is unreachable"
                    )));
                }
            }

            let Some(body) = self.body.as_mut() else {
                continue;
            };
            match body.read(buf) {
                Ok(0) => {
                    self.body = None;
                    match self.content_length {
                        Some(len) if self.position >= len => return Ok(0),
                        Some(len) if fresh => {
                            return Err(TransportError::transient(format!(
                                "body of {handle} ended at {} of {len} bytes",
                                self.position
                            )));
                        }
                        Some(_) => continue,
                        None if self.body_bounded && !fresh => continue,
                        None => {
                            self.learn_length(self.position);
                            return Ok(0);
                        }
                    }
                }
                Ok(n) => {
                    self.position += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.body = None;
                    return Err(TransportError::from_io(e));
                }
            }
        }
    }
}

/// Reads a remote object through byte-range requests.
pub struct RawReader<S: RangeSource + ?Sized> {
    source: Arc<S>,
    handle: ObjectHandle,
    retry: RetryPolicy,
    range_chunk_size: Option<u64>,
    session: ReadSession,
}

impl<S: RangeSource + ?Sized> RawReader<S> {
    /// Create a reader positioned at offset 0. No request is made yet.
    pub fn new(
        source: Arc<S>,
        handle: ObjectHandle,
        retry: RetryPolicy,
        range_chunk_size: Option<u64>,
    ) -> Self {
        Self {
            source,
            handle,
            retry,
            range_chunk_size,
            session: ReadSession::default(),
        }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn tell(&self) -> u64 {
        self.session.position
    }

    /// Object size, once a response has revealed it.
    pub fn content_length(&self) -> Option<u64> {
        self.session.content_length
    }

    pub fn is_eof(&self) -> bool {
        self.session.at_eof()
    }

    /// Move to a new position, dropping the open body.
    ///
    /// Targets are clamped to `[0, content_length]` once the length is known.
    /// Before that, a positive target opens its range here and seeking
    /// relative to the end issues a suffix request; either response reveals
    /// the length.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.session.body = None;

        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => offset_by(self.session.position, delta),
            SeekFrom::End(delta) => match self.session.content_length {
                Some(len) => offset_by(len, delta),
                None => return self.seek_from_unknown_end(delta),
            },
        };

        match self.session.content_length {
            Some(len) => self.session.position = target.min(len),
            None if target == 0 => self.session.position = 0,
            None => return self.seek_to_unverified(target),
        }
        debug!("{} positioned at {}", self.handle, self.session.position);
        Ok(self.session.position)
    }

    /// Open the range at `target` right away, so a target past the end is
    /// clamped here rather than by a later read.
    fn seek_to_unverified(&mut self, target: u64) -> Result<u64> {
        let Self {
            source,
            handle,
            retry,
            range_chunk_size,
            session,
        } = self;
        let previous = session.position;
        session.position = target;
        let range = session.next_range(*range_chunk_size);

        let opened = retry.run(&format!("seek {handle}"), || {
            session.open(source.as_ref(), handle, range)
        });
        if let Err(e) = opened {
            session.body = None;
            session.position = previous;
            return Err(e);
        }
        debug!("{} positioned at {}", handle, session.position);
        Ok(session.position)
    }

    fn seek_from_unknown_end(&mut self, delta: i64) -> Result<u64> {
        // A one-byte suffix is the cheapest request that reports the size.
        let range = if delta < 0 {
            ByteRange::Suffix(delta.unsigned_abs())
        } else {
            ByteRange::Suffix(1)
        };

        let Self {
            source,
            handle,
            retry,
            session,
            ..
        } = self;
        retry.run(&format!("seek {handle}"), || {
            session.open(source.as_ref(), handle, range)
        })?;

        if delta >= 0 {
            session.body = None;
            if let Some(len) = session.content_length {
                session.position = len;
            }
        }
        debug!("{} positioned at {}", handle, session.position);
        Ok(session.position)
    }

    /// Read at most `buf.len()` bytes; 0 means end of object.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Self {
            source,
            handle,
            retry,
            range_chunk_size,
            session,
        } = self;
        retry.run(&format!("read {handle}"), || {
            session.read_once(source.as_ref(), handle, *range_chunk_size, &mut *buf)
        })
    }

    /// Read `size` bytes (everything left for `None`), crossing range
    /// boundaries as needed. Shorter only at the end of the object.
    ///
    /// On error nothing is returned and the position is left where it was.
    pub fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes> {
        let start = self.session.position;
        let result = self.collect(size);
        if result.is_err() {
            self.session.body = None;
            self.session.position = start;
        }
        result
    }

    fn collect(&mut self, size: Option<usize>) -> Result<Bytes> {
        let mut out = Vec::new();
        match size {
            Some(size) => {
                out.resize(size, 0);
                let mut filled = 0;
                while filled < size {
                    let n = self.read_into(&mut out[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
            }
            None => {
                let mut chunk = vec![0u8; 64 * 1024];
                loop {
                    let n = self.read_into(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
            }
        }
        Ok(Bytes::from(out))
    }
}

impl<S: RangeSource + ?Sized> Read for RawReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(Into::into)
    }
}
