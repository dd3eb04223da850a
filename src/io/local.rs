use bytes::Bytes;
use flate2::Crc;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{
    ByteRange, MultipartSink, ObjectHandle, PartDescriptor, RangeResponse, RangeSource,
    TransportResult,
};
use crate::error::TransportError;

/// A directory tree served as an object store.
///
/// Objects live at `root/container/key`. Multipart parts are staged as files
/// in a hidden directory next to the target and assembled on completion, so
/// an unfinished upload never shows up under the object's name.
pub struct LocalStore {
    root: PathBuf,
    next_upload: AtomicU64,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_upload: AtomicU64::new(0),
        }
    }

    pub fn object_path(&self, handle: &ObjectHandle) -> PathBuf {
        let mut path = self.root.clone();
        if !handle.container.is_empty() {
            path.push(&handle.container);
        }
        path.push(&handle.key);
        path
    }

    fn staging_dir(&self, handle: &ObjectHandle, upload_id: &str) -> PathBuf {
        let target = self.object_path(handle);
        let name = target
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}.{upload_id}.parts"))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{part_number:05}"))
    }
}

fn crc_etag(data: &[u8]) -> String {
    let mut crc = Crc::new();
    crc.update(data);
    format!("{:08x}", crc.sum())
}

fn missing(path: &Path) -> TransportError {
    TransportError::NotFound {
        key: path.display().to_string(),
    }
}

fn classify(path: &Path, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        missing(path)
    } else {
        TransportError::from_io(err)
    }
}

fn create_parent(path: &Path) -> TransportResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(TransportError::from_io)?;
        }
    }
    Ok(())
}

/// Distinguishes temporary files of concurrent writes within one process.
static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

/// Write `data` to a temporary sibling and rename it over `path`.
fn write_atomically(path: &Path, write: impl FnOnce(&mut File) -> io::Result<()>) -> TransportResult<()> {
    create_parent(path)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{name}.tmp{}-{}",
        std::process::id(),
        NEXT_TMP.fetch_add(1, Ordering::Relaxed)
    ));
    let result = File::create(&tmp)
        .and_then(|mut file| {
            write(&mut file)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(TransportError::from_io)
}

impl RangeSource for LocalStore {
    fn get_range(&self, handle: &ObjectHandle, range: ByteRange) -> TransportResult<RangeResponse> {
        let path = self.object_path(handle);
        let mut file = File::open(&path).map_err(|e| classify(&path, e))?;
        let size = file.metadata().map_err(TransportError::from_io)?.len();

        // An empty file read as a whole is fine; ranged reads follow S3 rules.
        let (start, end) = match range {
            ByteRange::Full | ByteRange::From(0) if size == 0 => (0, 0),
            _ => range.resolve(size).ok_or(TransportError::OutOfRange {
                actual_size: Some(size),
            })?,
        };

        file.seek(SeekFrom::Start(start))
            .map_err(TransportError::from_io)?;
        debug!("local read {} [{}, {})", path.display(), start, end);

        Ok(RangeResponse {
            start,
            total_size: Some(size),
            body: Box::new(file.take(end - start)),
        })
    }
}

impl MultipartSink for LocalStore {
    fn initiate(&self, handle: &ObjectHandle) -> TransportResult<String> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let upload_id = format!(
            "{:x}-{}",
            nanos,
            self.next_upload.fetch_add(1, Ordering::Relaxed)
        );
        let dir = self.staging_dir(handle, &upload_id);
        fs::create_dir_all(&dir).map_err(TransportError::from_io)?;
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> TransportResult<String> {
        let dir = self.staging_dir(handle, upload_id);
        if !dir.is_dir() {
            return Err(missing(&dir));
        }
        write_atomically(&Self::part_path(&dir, part_number), |file| {
            file.write_all(&data)
        })?;
        Ok(crc_etag(&data))
    }

    fn complete(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> TransportResult<()> {
        let dir = self.staging_dir(handle, upload_id);
        if !dir.is_dir() {
            return Err(missing(&dir));
        }
        if parts.is_empty() {
            return Err(TransportError::fatal("cannot complete an upload without parts"));
        }

        let mut chunks = Vec::with_capacity(parts.len());
        for part in parts {
            let path = Self::part_path(&dir, part.part_number);
            let data = fs::read(&path).map_err(|e| classify(&path, e))?;
            if crc_etag(&data) != part.etag {
                return Err(TransportError::fatal(format!(
                    "etag mismatch for part #{}",
                    part.part_number
                )));
            }
            chunks.push(data);
        }

        write_atomically(&self.object_path(handle), |file| {
            chunks.iter().try_for_each(|chunk| file.write_all(chunk))
        })?;
        fs::remove_dir_all(&dir).map_err(TransportError::from_io)
    }

    fn abort(&self, handle: &ObjectHandle, upload_id: &str) -> TransportResult<()> {
        let dir = self.staging_dir(handle, upload_id);
        fs::remove_dir_all(&dir).map_err(|e| classify(&dir, e))
    }

    fn put(&self, handle: &ObjectHandle, data: Bytes) -> TransportResult<()> {
        write_atomically(&self.object_path(handle), |file| file.write_all(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(response: RangeResponse) -> Vec<u8> {
        let mut out = Vec::new();
        let mut body = response.body;
        body.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_range_reads() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let handle = ObjectHandle::new("bucket", "data.txt");
        store.put(&handle, Bytes::from_static(b"hello, world")).unwrap();

        let response = store.get_range(&handle, ByteRange::Inclusive(7, 11)).unwrap();
        assert_eq!(response.total_size, Some(12));
        assert_eq!(read_all(response), b"world");

        let response = store.get_range(&handle, ByteRange::Suffix(6)).unwrap();
        assert_eq!(response.start, 6);
        assert_eq!(read_all(response), b"world");

        let err = store.get_range(&handle, ByteRange::From(12)).unwrap_err();
        assert!(matches!(err, TransportError::OutOfRange { actual_size: Some(12) }));
    }

    #[test]
    fn test_concurrent_puts_to_one_key() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalStore::new(dir.path()));
        let handle = ObjectHandle::new("bucket", "shared.bin");

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                let handle = handle.clone();
                std::thread::spawn(move || store.put(&handle, Bytes::from(vec![i; 4096])))
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }

        let data = fs::read(store.object_path(&handle)).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|&b| b == data[0]));
        let leftovers = fs::read_dir(dir.path().join("bucket")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_missing_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let err = store
            .get_range(&ObjectHandle::new("", "absent"), ByteRange::Full)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound { .. }));
    }

    #[test]
    fn test_empty_object_reads_whole() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let handle = ObjectHandle::new("", "empty");
        store.put(&handle, Bytes::new()).unwrap();

        let response = store.get_range(&handle, ByteRange::From(0)).unwrap();
        assert!(read_all(response).is_empty());
        assert!(store.get_range(&handle, ByteRange::Suffix(1)).is_err());
    }

    #[test]
    fn test_multipart_assembles_in_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let handle = ObjectHandle::new("bucket", "nested/out.bin");

        let upload_id = store.initiate(&handle).unwrap();
        let etag1 = store
            .upload_part(&handle, &upload_id, 1, Bytes::from_static(b"abc"))
            .unwrap();
        let etag2 = store
            .upload_part(&handle, &upload_id, 2, Bytes::from_static(b"de"))
            .unwrap();
        assert!(!store.object_path(&handle).exists());

        let parts = [
            PartDescriptor { part_number: 1, etag: etag1, size: 3 },
            PartDescriptor { part_number: 2, etag: etag2, size: 2 },
        ];
        store.complete(&handle, &upload_id, &parts).unwrap();

        assert_eq!(fs::read(store.object_path(&handle)).unwrap(), b"abcde");
        assert!(!store.staging_dir(&handle, &upload_id).exists());
    }

    #[test]
    fn test_abort_discards_parts() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let handle = ObjectHandle::new("bucket", "out.bin");

        let upload_id = store.initiate(&handle).unwrap();
        store
            .upload_part(&handle, &upload_id, 1, Bytes::from_static(b"abc"))
            .unwrap();
        store.abort(&handle, &upload_id).unwrap();

        assert!(!store.staging_dir(&handle, &upload_id).exists());
        assert!(!store.object_path(&handle).exists());
        assert!(store.upload_part(&handle, &upload_id, 2, Bytes::new()).is_err());
    }
}
