//! Chunked accumulation buffer
//!
//! Amortizes network round trips: every fill pulls the same number of bytes
//! from its source, and reads hand out [`Bytes`] split off the front of the
//! buffer without copying.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};

/// Default number of bytes pulled per fill (128 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Byte buffer that is filled in fixed-size chunks.
///
/// The buffer has no maximum size; `chunk_size` only bounds how much a single
/// [`fill`](ByteBuffer::fill) may pull. Consumed bytes are released lazily,
/// when the next fill compacts the storage.
#[derive(Debug)]
pub struct ByteBuffer {
    bytes: BytesMut,
    chunk_size: usize,
}

impl ByteBuffer {
    /// Create a buffer that pulls at most `chunk_size` bytes per fill.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read up to `size` bytes (all unread bytes for `None`) and advance.
    pub fn read(&mut self, size: Option<usize>) -> Bytes {
        let n = self.clamp(size);
        self.bytes.split_to(n).freeze()
    }

    /// Look at up to `size` bytes without advancing.
    pub fn peek(&self, size: Option<usize>) -> &[u8] {
        &self.bytes[..self.clamp(size)]
    }

    /// Skip up to `n` unread bytes, returning how many were skipped.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.bytes.len());
        self.bytes.advance(n);
        n
    }

    /// Offset of the first occurrence of `byte` among the unread bytes.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.bytes.iter().position(|&b| b == byte)
    }

    /// Discard all content.
    pub fn empty(&mut self) {
        self.bytes.clear();
    }

    /// Pull bytes from `source` until `size` bytes (capped at `chunk_size`)
    /// were added or the source stops producing. Returns the number added;
    /// zero means the source is exhausted for now.
    pub fn fill<R: Read + ?Sized>(&mut self, source: &mut R, size: Option<usize>) -> io::Result<usize> {
        let want = size.map_or(self.chunk_size, |s| s.min(self.chunk_size));
        if want == 0 {
            return Ok(0);
        }

        // Reserving reclaims the space of already consumed bytes when possible.
        let start = self.bytes.len();
        self.bytes.reserve(want);
        self.bytes.resize(start + want, 0);

        let mut filled = 0;
        while filled < want {
            match source.read(&mut self.bytes[start + filled..start + want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.bytes.truncate(start + filled);
                    return Err(e);
                }
            }
        }

        self.bytes.truncate(start + filled);
        Ok(filled)
    }

    fn clamp(&self, size: Option<usize>) -> usize {
        size.map_or(self.bytes.len(), |s| s.min(self.bytes.len()))
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Adapts an iterator of byte chunks into a pull reader.
///
/// Chunks larger than what the caller asked for are split; the rest is kept
/// for the next read, so a fill never takes more than it was allowed to.
pub struct Chunks<I> {
    iter: I,
    pending: Bytes,
}

impl<I> Chunks<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            pending: Bytes::new(),
        }
    }
}

impl<I> Read for Chunks<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.iter.next() {
                Some(chunk) => self.pending = chunk.into(),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_is_capped_by_chunk_size() {
        let mut buffer = ByteBuffer::new(4);
        let mut source: &[u8] = b"0123456789";

        assert_eq!(buffer.fill(&mut source, None).unwrap(), 4);
        assert_eq!(buffer.fill(&mut source, Some(100)).unwrap(), 4);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.fill(&mut source, None).unwrap(), 2);
        assert_eq!(buffer.fill(&mut source, None).unwrap(), 0);
        assert_eq!(&buffer.read(None)[..], b"0123456789");
    }

    #[test]
    fn test_len_tracks_filled_minus_read() {
        let mut buffer = ByteBuffer::new(6);
        let mut source: &[u8] = b"abcdefghijkl";
        let mut filled = 0;
        let mut read = 0;

        for size in [Some(3), None, Some(5), Some(1)] {
            filled += buffer.fill(&mut source, size).unwrap();
            read += buffer.read(Some(2)).len();
            assert_eq!(buffer.len(), filled - read);
        }
    }

    #[test]
    fn test_read_and_peek() {
        let mut buffer = ByteBuffer::new(16);
        let mut source: &[u8] = b"hello world";
        buffer.fill(&mut source, None).unwrap();

        assert!(buffer.read(Some(0)).is_empty());
        assert_eq!(buffer.peek(Some(5)), b"hello");
        assert_eq!(buffer.len(), 11);
        assert_eq!(&buffer.read(Some(6))[..], b"hello ");
        assert_eq!(buffer.peek(Some(100)), b"world");
        assert_eq!(buffer.peek(None), b"world");
        assert_eq!(&buffer.read(Some(100))[..], b"world");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fill_compacts_after_partial_read() {
        let mut buffer = ByteBuffer::new(4);
        let mut source: &[u8] = b"abcdefgh";
        buffer.fill(&mut source, None).unwrap();
        buffer.read(Some(3));
        buffer.fill(&mut source, None).unwrap();
        assert_eq!(buffer.peek(None), b"defgh");
    }

    #[test]
    fn test_empty_and_advance() {
        let mut buffer = ByteBuffer::new(8);
        let mut source: &[u8] = b"abcdef";
        buffer.fill(&mut source, None).unwrap();

        assert_eq!(buffer.advance(2), 2);
        assert_eq!(buffer.find(b'e'), Some(2));
        assert_eq!(buffer.advance(10), 4);
        assert!(buffer.is_empty());

        let mut source: &[u8] = b"xyz";
        buffer.fill(&mut source, None).unwrap();
        buffer.empty();
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_fill_from_chunks_keeps_overshoot() {
        let chunks = vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cdefg"),
            Bytes::new(),
            Bytes::from_static(b"h"),
        ];
        let mut source = Chunks::new(chunks.into_iter());
        let mut buffer = ByteBuffer::new(4);

        assert_eq!(buffer.fill(&mut source, None).unwrap(), 4);
        assert_eq!(buffer.peek(None), b"abcd");
        assert_eq!(buffer.fill(&mut source, Some(2)).unwrap(), 2);
        assert_eq!(buffer.fill(&mut source, None).unwrap(), 2);
        assert_eq!(buffer.fill(&mut source, None).unwrap(), 0);
        assert_eq!(&buffer.read(None)[..], b"abcdefgh");
    }
}
