//! Transparent gzip and bzip2 on top of readers and writers
//!
//! Compression is chosen explicitly by the caller or inferred from the key's
//! extension. Offsets and seeks always refer to the stored (compressed) bytes.

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::error::{Error, Result, WriteState};
use crate::io::MultipartSink;
use crate::writer::Writer;

/// Compression applied when opening an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Read and write the bytes as stored
    Disable,
    /// Gzip for `.gz` keys, bzip2 for `.bz2` keys, nothing otherwise
    #[default]
    InferFromExtension,
    Gzip,
    Bz2,
}

impl Compression {
    /// Settle `InferFromExtension` into a concrete choice for `key`.
    pub fn resolve(self, key: &str) -> Compression {
        match self {
            Compression::InferFromExtension => {
                let key = key.to_ascii_lowercase();
                if key.ends_with(".gz") {
                    Compression::Gzip
                } else if key.ends_with(".bz2") {
                    Compression::Bz2
                } else {
                    Compression::Disable
                }
            }
            other => other,
        }
    }

    /// Wrap a reader over the object named `key` with the matching decoder.
    pub fn wrap_reader<R>(self, key: &str, reader: R) -> Box<dyn Read + Send>
    where
        R: Read + Send + 'static,
    {
        match self.resolve(key) {
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Bz2 => Box::new(MultiBzDecoder::new(reader)),
            _ => Box::new(reader),
        }
    }

    /// Wrap a writer for the object named `key` with the matching encoder.
    pub fn wrap_writer<S>(self, key: &str, writer: Writer<S>) -> EncodedWriter<S>
    where
        S: MultipartSink + ?Sized,
    {
        match self.resolve(key) {
            Compression::Gzip => {
                EncodedWriter::Gzip(GzEncoder::new(writer, flate2::Compression::default()))
            }
            Compression::Bz2 => {
                EncodedWriter::Bz2(BzEncoder::new(writer, bzip2::Compression::default()))
            }
            _ => EncodedWriter::Plain(writer),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Disable => "disable",
            Compression::InferFromExtension => "infer_from_extension",
            Compression::Gzip => ".gz",
            Compression::Bz2 => ".bz2",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" | "none" => Ok(Compression::Disable),
            "infer_from_extension" | "infer" => Ok(Compression::InferFromExtension),
            ".gz" | "gz" | "gzip" => Ok(Compression::Gzip),
            ".bz2" | "bz2" | "bzip2" => Ok(Compression::Bz2),
            other => Err(Error::Configuration(format!(
                "unknown compression {other:?}, expected disable, infer_from_extension, .gz or .bz2"
            ))),
        }
    }
}

/// A [`Writer`], possibly behind an encoder.
pub enum EncodedWriter<S: MultipartSink + ?Sized> {
    Plain(Writer<S>),
    Gzip(GzEncoder<Writer<S>>),
    Bz2(BzEncoder<Writer<S>>),
}

impl<S: MultipartSink + ?Sized> EncodedWriter<S> {
    fn inner(&self) -> &Writer<S> {
        match self {
            EncodedWriter::Plain(w) => w,
            EncodedWriter::Gzip(enc) => enc.get_ref(),
            EncodedWriter::Bz2(enc) => enc.get_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut Writer<S> {
        match self {
            EncodedWriter::Plain(w) => w,
            EncodedWriter::Gzip(enc) => enc.get_mut(),
            EncodedWriter::Bz2(enc) => enc.get_mut(),
        }
    }

    /// Stored bytes accepted so far.
    pub fn tell(&self) -> u64 {
        self.inner().tell()
    }

    pub fn state(&self) -> WriteState {
        self.inner().state()
    }

    /// Finish the encoded stream, then commit the object.
    pub fn close(&mut self) -> Result<()> {
        if self.state() == WriteState::Open {
            match self {
                EncodedWriter::Plain(_) => {}
                EncodedWriter::Gzip(enc) => enc.try_finish()?,
                EncodedWriter::Bz2(enc) => enc.try_finish()?,
            }
        }
        self.inner_mut().close()
    }

    pub fn terminate(&mut self) -> Result<()> {
        self.inner_mut().terminate()
    }
}

impl<S: MultipartSink + ?Sized> Write for EncodedWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncodedWriter::Plain(w) => Write::write(w, buf),
            EncodedWriter::Gzip(enc) => enc.write(buf),
            EncodedWriter::Bz2(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::io::{MemoryStore, ObjectHandle};
    use std::sync::Arc;

    #[test]
    fn test_infer_from_extension() {
        let infer = Compression::InferFromExtension;
        assert_eq!(infer.resolve("logs/today.txt.gz"), Compression::Gzip);
        assert_eq!(infer.resolve("LOGS.GZ"), Compression::Gzip);
        assert_eq!(infer.resolve("dump.sql.bz2"), Compression::Bz2);
        assert_eq!(infer.resolve("logs/today.txt"), Compression::Disable);
        assert_eq!(Compression::Disable.resolve("a.gz"), Compression::Disable);
    }

    #[test]
    fn test_parse() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("bz2".parse::<Compression>().unwrap(), Compression::Bz2);
        assert_eq!(".bz2".parse::<Compression>().unwrap(), Compression::Bz2);
        assert_eq!("disable".parse::<Compression>().unwrap(), Compression::Disable);
        assert!("lz4".parse::<Compression>().is_err());
    }

    #[test]
    fn test_gzip_round_trip_through_store() {
        let store = Arc::new(MemoryStore::new());
        let handle = ObjectHandle::new("bucket", "notes.txt.gz");
        let config = WriterConfig::default().with_part_size(16);

        let writer = Writer::new(Arc::clone(&store), handle.clone(), config).unwrap();
        let mut writer = Compression::InferFromExtension.wrap_writer(&handle.key, writer);
        writer.write_all(b"first line\nsecond line\n").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert_eq!(writer.state(), WriteState::Closed);

        let stored = store.object(&handle).unwrap();
        assert_eq!(&stored[..2], &[0x1f, 0x8b]);

        let mut decoded = String::new();
        Compression::InferFromExtension
            .wrap_reader(&handle.key, io::Cursor::new(stored))
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "first line\nsecond line\n");
    }

    #[test]
    fn test_bz2_round_trip_through_store() {
        let store = Arc::new(MemoryStore::new());
        let handle = ObjectHandle::new("bucket", "notes.txt.bz2");
        let config = WriterConfig::default().with_part_size(16);

        let writer = Writer::new(Arc::clone(&store), handle.clone(), config).unwrap();
        let mut writer = Compression::InferFromExtension.wrap_writer(&handle.key, writer);
        writer.write_all(b"first line\nsecond line\n").unwrap();
        writer.close().unwrap();
        assert_eq!(writer.state(), WriteState::Closed);

        let stored = store.object(&handle).unwrap();
        assert_eq!(&stored[..3], b"BZh");

        let mut decoded = String::new();
        Compression::InferFromExtension
            .wrap_reader(&handle.key, io::Cursor::new(stored))
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "first line\nsecond line\n");
    }
}
