//! In-process object store
//!
//! Behaves like a strict S3 bucket: unsatisfiable ranges answer with
//! [`TransportError::OutOfRange`], multipart commits must list parts in
//! ascending order and respect the minimum part size, and an empty commit is
//! rejected. Failures can be injected per operation, and every call is
//! counted, which makes it the backbone of the test suite.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    ByteRange, MultipartSink, ObjectHandle, PartDescriptor, RangeResponse, RangeSource,
    TransportResult,
};
use crate::error::TransportError;

/// Remote operations that can be counted and failed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Initiate,
    UploadPart,
    Complete,
    Abort,
    Put,
}

#[derive(Debug, Default)]
struct Upload {
    path: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, Upload>,
    faults: HashMap<Operation, VecDeque<TransportError>>,
    calls: HashMap<Operation, usize>,
    ranges: Vec<ByteRange>,
}

/// Thread-safe in-memory object store
pub struct MemoryStore {
    state: Mutex<State>,
    next_upload: AtomicU64,
    min_part_size: usize,
    report_actual_size: bool,
    honor_ranges: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_upload: AtomicU64::new(1),
            min_part_size: 1,
            report_actual_size: true,
            honor_ranges: true,
        }
    }

    /// Require non-final parts to be at least `size` bytes.
    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size.max(1);
        self
    }

    /// Whether out-of-range answers carry the actual object size.
    pub fn with_actual_size_hint(mut self, report: bool) -> Self {
        self.report_actual_size = report;
        self
    }

    /// Whether `Range` is honored; when not, every get returns the full object.
    pub fn with_ranges_honored(mut self, honor: bool) -> Self {
        self.honor_ranges = honor;
        self
    }

    pub fn insert(&self, handle: &ObjectHandle, data: impl Into<Bytes>) {
        self.state.lock().objects.insert(handle.path(), data.into());
    }

    pub fn object(&self, handle: &ObjectHandle) -> Option<Bytes> {
        self.state.lock().objects.get(&handle.path()).cloned()
    }

    pub fn contains(&self, handle: &ObjectHandle) -> bool {
        self.state.lock().objects.contains_key(&handle.path())
    }

    /// Make the next calls of `op` fail with `errors`, one per call.
    pub fn fail_next(&self, op: Operation, errors: impl IntoIterator<Item = TransportError>) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every range requested so far, in order.
    pub fn requested_ranges(&self) -> Vec<ByteRange> {
        self.state.lock().ranges.clone()
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    fn enter(&self, op: Operation) -> TransportResult<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn no_such_upload(upload_id: &str) -> TransportError {
    TransportError::NotFound {
        key: format!("upload {upload_id}"),
    }
}

impl RangeSource for MemoryStore {
    fn get_range(&self, handle: &ObjectHandle, range: ByteRange) -> TransportResult<RangeResponse> {
        let mut state = self.enter(Operation::Get)?;
        state.ranges.push(range);

        let path = handle.path();
        let data = state
            .objects
            .get(&path)
            .cloned()
            .ok_or(TransportError::NotFound { key: path })?;
        let size = data.len() as u64;

        let effective = if self.honor_ranges { range } else { ByteRange::Full };
        let (start, end) = effective.resolve(size).ok_or(TransportError::OutOfRange {
            actual_size: self.report_actual_size.then_some(size),
        })?;

        Ok(RangeResponse {
            start,
            total_size: Some(size),
            body: Box::new(Cursor::new(data.slice(start as usize..end as usize))),
        })
    }
}

impl MultipartSink for MemoryStore {
    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    fn initiate(&self, handle: &ObjectHandle) -> TransportResult<String> {
        let mut state = self.enter(Operation::Initiate)?;
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                path: handle.path(),
                ..Default::default()
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _handle: &ObjectHandle,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> TransportResult<String> {
        let mut state = self.enter(Operation::UploadPart)?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        if part_number == 0 {
            return Err(TransportError::fatal("part numbers start at 1"));
        }
        let etag = format!("\"{upload_id}-{part_number}-{}\"", data.len());
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    fn complete(
        &self,
        _handle: &ObjectHandle,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> TransportResult<()> {
        let mut state = self.enter(Operation::Complete)?;
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(TransportError::fatal(
                "MalformedXML: a multipart upload needs at least one part",
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransportError::fatal("InvalidPartOrder"));
        }

        let mut assembled = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let (etag, data) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| TransportError::fatal(format!("InvalidPart #{}", part.part_number)))?;
            if *etag != part.etag {
                return Err(TransportError::fatal(format!(
                    "InvalidPart #{}: etag mismatch",
                    part.part_number
                )));
            }
            if i + 1 < parts.len() && data.len() < self.min_part_size {
                return Err(TransportError::fatal(format!(
                    "EntityTooSmall: part #{} is {} bytes",
                    part.part_number,
                    data.len()
                )));
            }
            assembled.extend_from_slice(data);
        }

        let path = upload.path.clone();
        state.uploads.remove(upload_id);
        state.objects.insert(path, Bytes::from(assembled));
        Ok(())
    }

    fn abort(&self, _handle: &ObjectHandle, upload_id: &str) -> TransportResult<()> {
        let mut state = self.enter(Operation::Abort)?;
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    fn put(&self, handle: &ObjectHandle, data: Bytes) -> TransportResult<()> {
        let mut state = self.enter(Operation::Put)?;
        state.objects.insert(handle.path(), data);
        Ok(())
    }
}
