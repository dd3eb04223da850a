use bytes::{Bytes, BytesMut};
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;

use super::raw::{RawReader, offset_by};
use crate::buffer::ByteBuffer;
use crate::config::ReaderConfig;
use crate::error::Result;
use crate::io::{ObjectHandle, RangeSource};
use crate::retry::RetryPolicy;

/// Seekable, buffered reader over a remote object.
///
/// `tell()` always equals the bytes returned so far plus the net effect of
/// seeks. Remote requests are made in `buffer_size` chunks, so small reads
/// and line iteration are served from memory most of the time.
pub struct BufferedReader<S: RangeSource + ?Sized> {
    raw: RawReader<S>,
    /// Bytes fetched by `raw` but not handed out yet
    buffer: ByteBuffer,
    eof: bool,
    line_terminator: u8,
    seek_within_buffer: bool,
}

impl<S: RangeSource + ?Sized> BufferedReader<S> {
    pub fn new(source: Arc<S>, handle: ObjectHandle, config: ReaderConfig) -> Result<Self> {
        let retry = RetryPolicy::new(config.retry.clone());
        Self::with_retry_policy(source, handle, config, retry)
    }

    /// Like [`new`](Self::new), with a caller-supplied retry policy.
    pub fn with_retry_policy(
        source: Arc<S>,
        handle: ObjectHandle,
        config: ReaderConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        debug!("opening {} for reading", handle);
        Ok(Self {
            raw: RawReader::new(source, handle, retry, config.range_chunk_size),
            buffer: ByteBuffer::new(config.buffer_size),
            eof: false,
            line_terminator: config.line_terminator,
            seek_within_buffer: config.seek_within_buffer,
        })
    }

    pub fn handle(&self) -> &ObjectHandle {
        self.raw.handle()
    }

    /// Logical position: bytes handed out plus seeks.
    pub fn tell(&self) -> u64 {
        self.raw.tell().saturating_sub(self.buffer.len() as u64)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.raw.content_length()
    }

    /// Read `size` bytes, or everything left for `None`.
    ///
    /// Returns fewer bytes only at the end of the object; an empty result
    /// means the end was reached.
    pub fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes> {
        match size {
            Some(0) => Ok(Bytes::new()),
            Some(size) => {
                self.fill_to(size)?;
                Ok(self.buffer.read(Some(size)))
            }
            None => {
                // Bytes pulled before a failure stay buffered for the next call.
                while !self.eof {
                    self.fill_chunk()?;
                }
                Ok(self.buffer.read(None))
            }
        }
    }

    /// Read through the next line terminator, which is kept.
    ///
    /// The last line may lack a terminator; an empty result means the end
    /// was reached.
    pub fn readline(&mut self) -> Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            if let Some(i) = self.buffer.find(self.line_terminator) {
                let tail = self.buffer.read(Some(i + 1));
                if line.is_empty() {
                    return Ok(tail);
                }
                line.extend_from_slice(&tail);
                return Ok(line.freeze());
            }
            line.extend_from_slice(&self.buffer.read(None));
            if self.eof || self.fill_chunk()? == 0 {
                break;
            }
        }
        Ok(line.freeze())
    }

    /// Iterate over the remaining lines.
    pub fn lines(&mut self) -> Lines<'_, S> {
        Lines { reader: self }
    }

    /// Move the logical position.
    ///
    /// Targets are clamped into the object once its length is known. A
    /// forward move that stays inside the buffered bytes is served from the
    /// buffer when `seek_within_buffer` is enabled; anything else drops the
    /// buffer and repositions the underlying reader.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let position = self.tell();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => Some(offset_by(position, delta)),
            SeekFrom::End(delta) => self.raw.content_length().map(|len| offset_by(len, delta)),
        };
        let target = target.map(|t| match self.raw.content_length() {
            Some(len) => t.min(len),
            None => t,
        });

        if let Some(target) = target {
            if self.seek_within_buffer
                && target >= position
                && target - position <= self.buffer.len() as u64
            {
                self.buffer.advance((target - position) as usize);
                return Ok(target);
            }
        }

        self.buffer.empty();
        let position = self.raw.seek(target.map_or(pos, SeekFrom::Start))?;
        self.eof = self.raw.is_eof();
        Ok(position)
    }

    fn fill_chunk(&mut self) -> Result<usize> {
        let n = self.buffer.fill(&mut self.raw, None)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn fill_to(&mut self, size: usize) -> Result<()> {
        while self.buffer.len() < size && !self.eof {
            self.fill_chunk()?;
        }
        Ok(())
    }
}

impl<S: RangeSource + ?Sized> Read for BufferedReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Large reads with nothing buffered skip the copy.
        if self.buffer.is_empty() && buf.len() >= self.buffer.chunk_size() {
            let n = self.raw.read(buf)?;
            if n == 0 {
                self.eof = true;
            }
            return Ok(n);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<S: RangeSource + ?Sized> BufRead for BufferedReader<S> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buffer.is_empty() && !self.eof {
            self.fill_chunk()?;
        }
        Ok(self.buffer.peek(None))
    }

    fn consume(&mut self, amt: usize) {
        self.buffer.advance(amt);
    }
}

impl<S: RangeSource + ?Sized> Seek for BufferedReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        BufferedReader::seek(self, pos).map_err(Into::into)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.tell())
    }
}

/// Iterator returned by [`BufferedReader::lines`]; lines keep their terminator.
pub struct Lines<'a, S: RangeSource + ?Sized> {
    reader: &'a mut BufferedReader<S>,
}

impl<S: RangeSource + ?Sized> Iterator for Lines<'_, S> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.readline() {
            Ok(line) if line.is_empty() => None,
            other => Some(other),
        }
    }
}
