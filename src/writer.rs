//! Writers that upload to a [`MultipartSink`]
//!
//! [`MultipartWriter`] cuts the byte stream into fixed-size parts and uploads
//! each one as soon as it is complete, so memory stays bounded by one part.
//! [`SinglepartWriter`] keeps everything in memory and puts the object once.
//! Either way an object becomes visible only on a successful `close()`.

use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::error::{Error, Result, WriteState};
use crate::io::{MultipartSink, ObjectHandle, PartDescriptor};
use crate::retry::RetryPolicy;

/// Streams an object to the store as a multipart upload.
pub struct MultipartWriter<S: MultipartSink + ?Sized> {
    sink: Arc<S>,
    handle: ObjectHandle,
    retry: RetryPolicy,
    upload_id: String,
    /// The upload was aborted ahead of an empty-object put
    upload_aborted: bool,
    part_size: usize,
    buffer: BytesMut,
    parts: Vec<PartDescriptor>,
    total_bytes: u64,
    state: WriteState,
    /// Set when a part could not be uploaded; only `terminate` is allowed then
    failed_part: Option<u32>,
}

impl<S: MultipartSink + ?Sized> MultipartWriter<S> {
    /// Initiate a multipart upload for `handle`.
    pub fn new(sink: Arc<S>, handle: ObjectHandle, config: WriterConfig) -> Result<Self> {
        let retry = RetryPolicy::new(config.retry.clone());
        Self::with_retry_policy(sink, handle, config, retry)
    }

    pub fn with_retry_policy(
        sink: Arc<S>,
        handle: ObjectHandle,
        config: WriterConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;

        let min_part_size = sink.min_part_size();
        let part_size = if config.part_size < min_part_size {
            warn!(
                "part size {} is below the store minimum, using {}",
                config.part_size, min_part_size
            );
            min_part_size
        } else {
            config.part_size
        };

        let upload_id = retry.run(&format!("initiate upload of {handle}"), || {
            sink.initiate(&handle)
        })?;
        debug!("started upload {} for {}", upload_id, handle);

        Ok(Self {
            sink,
            handle,
            retry,
            upload_id,
            upload_aborted: false,
            part_size,
            buffer: BytesMut::with_capacity(part_size),
            parts: Vec::new(),
            total_bytes: 0,
            state: WriteState::Open,
            failed_part: None,
        })
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Effective part size after clamping to the store minimum.
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Total bytes accepted so far.
    pub fn tell(&self) -> u64 {
        self.total_bytes
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    /// Parts uploaded so far, in part-number order.
    pub fn parts(&self) -> &[PartDescriptor] {
        &self.parts
    }

    /// Accept all of `data`, uploading every part that fills up.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_writable("write")?;
        self.buffer.extend_from_slice(data);
        self.total_bytes += data.len() as u64;

        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.upload_part(part)?;
        }
        Ok(data.len())
    }

    /// Upload the remainder and commit the object. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state != WriteState::Open {
            return Ok(());
        }
        self.ensure_writable("close")?;

        if !self.buffer.is_empty() {
            let last = self.buffer.split().freeze();
            self.upload_part(last)?;
        }

        let Self {
            sink,
            handle,
            retry,
            upload_id,
            upload_aborted,
            parts,
            ..
        } = self;
        if parts.is_empty() {
            // Stores refuse to complete an upload without parts.
            debug!("nothing written to {}, creating an empty object", handle);
            if !*upload_aborted {
                retry.run(&format!("abort upload of {handle}"), || {
                    sink.abort(handle, upload_id)
                })?;
                *upload_aborted = true;
            }
            retry.run(&format!("put {handle}"), || sink.put(handle, Bytes::new()))?;
        } else {
            retry.run(&format!("complete upload of {handle}"), || {
                sink.complete(handle, upload_id, parts)
            })?;
        }

        self.state = WriteState::Closed;
        info!(
            "committed {} ({} bytes in {} parts)",
            self.handle,
            self.total_bytes,
            self.parts.len()
        );
        Ok(())
    }

    /// Abort the upload and discard everything written.
    pub fn terminate(&mut self) -> Result<()> {
        match self.state {
            WriteState::Aborted => return Ok(()),
            WriteState::Closed => return Err(Error::upload_state("terminate", WriteState::Closed)),
            WriteState::Open => {}
        }

        if !self.upload_aborted {
            let Self {
                sink,
                handle,
                retry,
                upload_id,
                ..
            } = self;
            retry.run(&format!("abort upload of {handle}"), || {
                sink.abort(handle, upload_id)
            })?;
            self.upload_aborted = true;
        }

        self.buffer.clear();
        self.state = WriteState::Aborted;
        info!("aborted upload {} of {}", self.upload_id, self.handle);
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        match (self.state, self.failed_part) {
            (WriteState::Open, None) => Ok(()),
            (WriteState::Open, Some(part_number)) => Err(Error::UploadState {
                operation,
                state: WriteState::Open,
                detail: Some(format!("part #{part_number} failed, terminate the upload")),
            }),
            (state, _) => Err(Error::upload_state(operation, state)),
        }
    }

    fn upload_part(&mut self, data: Bytes) -> Result<()> {
        let part_number = self.parts.len() as u32 + 1;
        let size = data.len();
        debug!("uploading part #{} of {} ({} bytes)", part_number, self.handle, size);

        let Self {
            sink,
            handle,
            retry,
            upload_id,
            ..
        } = self;
        let result = retry.run(&format!("upload part #{part_number} of {handle}"), || {
            sink.upload_part(handle, upload_id, part_number, data.clone())
        });

        match result {
            Ok(etag) => {
                self.parts.push(PartDescriptor {
                    part_number,
                    etag,
                    size,
                });
                Ok(())
            }
            Err(e) => {
                self.failed_part = Some(part_number);
                Err(e)
            }
        }
    }
}

impl<S: MultipartSink + ?Sized> Drop for MultipartWriter<S> {
    fn drop(&mut self) {
        if self.state != WriteState::Open || self.upload_aborted {
            return;
        }
        warn!(
            "writer for {} dropped without close, aborting upload {}",
            self.handle, self.upload_id
        );
        if let Err(e) = self.sink.abort(&self.handle, &self.upload_id) {
            warn!("failed to abort upload {}: {}", self.upload_id, e);
        }
    }
}

impl<S: MultipartSink + ?Sized> io::Write for MultipartWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        MultipartWriter::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffers an object in memory and stores it with one put on close.
pub struct SinglepartWriter<S: MultipartSink + ?Sized> {
    sink: Arc<S>,
    handle: ObjectHandle,
    retry: RetryPolicy,
    buffer: BytesMut,
    state: WriteState,
}

impl<S: MultipartSink + ?Sized> SinglepartWriter<S> {
    pub fn new(sink: Arc<S>, handle: ObjectHandle, config: WriterConfig) -> Result<Self> {
        let retry = RetryPolicy::new(config.retry.clone());
        Self::with_retry_policy(sink, handle, config, retry)
    }

    pub fn with_retry_policy(
        sink: Arc<S>,
        handle: ObjectHandle,
        config: WriterConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sink,
            handle,
            retry,
            buffer: BytesMut::new(),
            state: WriteState::Open,
        })
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn tell(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.state != WriteState::Open {
            return Err(Error::upload_state("write", self.state));
        }
        self.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state != WriteState::Open {
            return Ok(());
        }
        let data = self.buffer.split().freeze();
        let Self {
            sink, handle, retry, ..
        } = self;
        if let Err(e) = retry.run(&format!("put {handle}"), || sink.put(handle, data.clone())) {
            // Keep the content so close can be retried.
            self.buffer = BytesMut::from(data);
            return Err(e);
        }

        self.state = WriteState::Closed;
        info!("committed {} ({} bytes)", self.handle, data.len());
        Ok(())
    }

    pub fn terminate(&mut self) -> Result<()> {
        match self.state {
            WriteState::Aborted => Ok(()),
            WriteState::Closed => Err(Error::upload_state("terminate", WriteState::Closed)),
            WriteState::Open => {
                self.buffer = BytesMut::new();
                self.state = WriteState::Aborted;
                Ok(())
            }
        }
    }
}

impl<S: MultipartSink + ?Sized> io::Write for SinglepartWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SinglepartWriter::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A writer of either kind, picked by [`WriterConfig::multipart`].
pub enum Writer<S: MultipartSink + ?Sized> {
    Multipart(MultipartWriter<S>),
    Singlepart(SinglepartWriter<S>),
}

impl<S: MultipartSink + ?Sized> Writer<S> {
    pub fn new(sink: Arc<S>, handle: ObjectHandle, config: WriterConfig) -> Result<Self> {
        let retry = RetryPolicy::new(config.retry.clone());
        Self::with_retry_policy(sink, handle, config, retry)
    }

    pub fn with_retry_policy(
        sink: Arc<S>,
        handle: ObjectHandle,
        config: WriterConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if config.multipart {
            MultipartWriter::with_retry_policy(sink, handle, config, retry).map(Writer::Multipart)
        } else {
            SinglepartWriter::with_retry_policy(sink, handle, config, retry).map(Writer::Singlepart)
        }
    }

    pub fn handle(&self) -> &ObjectHandle {
        match self {
            Writer::Multipart(w) => w.handle(),
            Writer::Singlepart(w) => w.handle(),
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            Writer::Multipart(w) => w.tell(),
            Writer::Singlepart(w) => w.tell(),
        }
    }

    pub fn state(&self) -> WriteState {
        match self {
            Writer::Multipart(w) => w.state(),
            Writer::Singlepart(w) => w.state(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            Writer::Multipart(w) => w.write(data),
            Writer::Singlepart(w) => w.write(data),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Writer::Multipart(w) => w.close(),
            Writer::Singlepart(w) => w.close(),
        }
    }

    pub fn terminate(&mut self) -> Result<()> {
        match self {
            Writer::Multipart(w) => w.terminate(),
            Writer::Singlepart(w) => w.terminate(),
        }
    }
}

impl<S: MultipartSink + ?Sized> io::Write for Writer<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::TransportError;
    use crate::io::MemoryStore;
    use crate::io::memory::Operation;

    fn handle() -> ObjectHandle {
        ObjectHandle::new("bucket", "out.bin")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default().with_max_attempts(3)).with_sleeper(|_| {})
    }

    fn multipart(store: &Arc<MemoryStore>, part_size: usize) -> MultipartWriter<MemoryStore> {
        let config = WriterConfig::default().with_part_size(part_size);
        MultipartWriter::with_retry_policy(Arc::clone(store), handle(), config, policy()).unwrap()
    }

    #[test]
    fn test_parts_are_cut_at_part_size() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = multipart(&store, 4);

        assert_eq!(writer.write(b"abcdefghij").unwrap(), 10);
        assert_eq!(writer.parts().len(), 2);
        assert_eq!(writer.tell(), 10);
        writer.close().unwrap();

        let numbers: Vec<u32> = writer.parts().iter().map(|p| p.part_number).collect();
        let sizes: Vec<usize> = writer.parts().iter().map(|p| p.size).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(&store.object(&handle()).unwrap()[..], b"abcdefghij");
        assert_eq!(writer.state(), WriteState::Closed);
    }

    #[test]
    fn test_empty_close_creates_empty_object() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = multipart(&store, 4);
        writer.close().unwrap();

        assert_eq!(store.object(&handle()).unwrap().len(), 0);
        assert_eq!(store.calls(Operation::Complete), 0);
        assert_eq!(store.calls(Operation::Abort), 1);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[test]
    fn test_empty_close_recovers_from_failed_put() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = multipart(&store, 4);
        store.fail_next(Operation::Put, [TransportError::fatal("403 Forbidden")]);

        assert!(matches!(writer.close(), Err(Error::Transport { .. })));
        assert_eq!(writer.state(), WriteState::Open);
        writer.close().unwrap();

        assert_eq!(writer.state(), WriteState::Closed);
        assert_eq!(store.object(&handle()).unwrap().len(), 0);
        assert_eq!(store.calls(Operation::Abort), 1);
    }

    #[test]
    fn test_terminate_after_failed_empty_put() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(Operation::Put, [TransportError::fatal("403 Forbidden")]);
        {
            let mut writer = multipart(&store, 4);
            assert!(writer.close().is_err());
            writer.terminate().unwrap();
            assert_eq!(writer.state(), WriteState::Aborted);
        }
        {
            store.fail_next(Operation::Put, [TransportError::fatal("403 Forbidden")]);
            let mut writer = multipart(&store, 4);
            assert!(writer.close().is_err());
        }

        assert_eq!(store.calls(Operation::Abort), 2);
        assert_eq!(store.pending_uploads(), 0);
        assert!(!store.contains(&handle()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = multipart(&store, 4);
        writer.write(b"abc").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();

        assert_eq!(store.calls(Operation::Complete), 1);
        assert!(matches!(
            writer.write(b"x"),
            Err(Error::UploadState { state: WriteState::Closed, .. })
        ));
        assert!(writer.terminate().is_err());
    }

    #[test]
    fn test_terminate_leaves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = multipart(&store, 4);
        writer.write(b"abcdefg").unwrap();
        writer.terminate().unwrap();
        writer.close().unwrap();

        assert!(!store.contains(&handle()));
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(store.calls(Operation::Complete), 0);
        assert_eq!(writer.state(), WriteState::Aborted);
    }

    #[test]
    fn test_failed_part_blocks_completion() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(Operation::UploadPart, [TransportError::fatal("403 Forbidden")]);
        let mut writer = multipart(&store, 4);

        assert!(matches!(writer.write(b"abcd"), Err(Error::Transport { .. })));
        assert_eq!(writer.state(), WriteState::Open);
        assert!(matches!(writer.write(b"e"), Err(Error::UploadState { .. })));
        assert!(matches!(writer.close(), Err(Error::UploadState { .. })));

        writer.terminate().unwrap();
        assert!(!store.contains(&handle()));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[test]
    fn test_transient_part_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(
            Operation::UploadPart,
            [TransportError::transient("reset"), TransportError::transient("reset")],
        );
        let mut writer = multipart(&store, 4);
        writer.write(b"abcd").unwrap();
        writer.close().unwrap();

        assert_eq!(store.calls(Operation::UploadPart), 3);
        assert_eq!(writer.parts()[0].part_number, 1);
        assert_eq!(&store.object(&handle()).unwrap()[..], b"abcd");
    }

    #[test]
    fn test_part_size_is_raised_to_store_minimum() {
        let store = Arc::new(MemoryStore::new().with_min_part_size(8));
        let mut writer = multipart(&store, 3);
        assert_eq!(writer.part_size(), 8);

        writer.write(&[7u8; 20]).unwrap();
        writer.close().unwrap();
        assert_eq!(store.object(&handle()).unwrap().len(), 20);
    }

    #[test]
    fn test_drop_aborts_open_upload() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut writer = multipart(&store, 4);
            writer.write(b"abcdef").unwrap();
        }
        assert_eq!(store.pending_uploads(), 0);
        assert!(!store.contains(&handle()));
    }

    #[test]
    fn test_singlepart_puts_once() {
        let store = Arc::new(MemoryStore::new());
        let config = WriterConfig::default().with_multipart(false);
        let mut writer = Writer::with_retry_policy(Arc::clone(&store), handle(), config, policy()).unwrap();

        writer.write(b"hello ").unwrap();
        writer.write(b"world").unwrap();
        assert_eq!(writer.tell(), 11);
        assert!(!store.contains(&handle()));
        writer.close().unwrap();
        writer.close().unwrap();

        assert_eq!(store.calls(Operation::Put), 1);
        assert_eq!(store.calls(Operation::Initiate), 0);
        assert_eq!(&store.object(&handle()).unwrap()[..], b"hello world");
    }

    #[test]
    fn test_singlepart_close_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(Operation::Put, [TransportError::fatal("503 Service Unavailable")]);
        let config = WriterConfig::default().with_multipart(false);
        let mut writer = SinglepartWriter::with_retry_policy(Arc::clone(&store), handle(), config, policy()).unwrap();

        writer.write(b"payload").unwrap();
        assert!(writer.close().is_err());
        assert_eq!(writer.tell(), 7);
        assert_eq!(writer.state(), WriteState::Open);

        writer.close().unwrap();
        assert_eq!(&store.object(&handle()).unwrap()[..], b"payload");
        assert_eq!(store.calls(Operation::Put), 2);
    }

    #[test]
    fn test_singlepart_terminate_discards() {
        let store = Arc::new(MemoryStore::new());
        let config = WriterConfig::default().with_multipart(false);
        let mut writer = Writer::with_retry_policy(Arc::clone(&store), handle(), config, policy()).unwrap();
        writer.write(b"data").unwrap();
        writer.terminate().unwrap();
        writer.close().unwrap();
        assert_eq!(store.calls(Operation::Put), 0);
        assert_eq!(writer.state(), WriteState::Aborted);
    }

    #[test]
    fn test_std_write() {
        use std::io::Write;

        let store = Arc::new(MemoryStore::new());
        let config = WriterConfig::default().with_part_size(5);
        let mut writer = Writer::with_retry_policy(Arc::clone(&store), handle(), config, policy()).unwrap();
        write!(writer, "{}-{}", "left", "right").unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();
        assert_eq!(&store.object(&handle()).unwrap()[..], b"left-right");
    }
}
