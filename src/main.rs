//! Main entry point for the rangefile CLI application.
//!
//! Streams objects to stdout and copies them between local paths and HTTP
//! endpoints, reading through range requests and writing through multipart
//! uploads.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, Read, SeekFrom, Write};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rangefile::cli::{CatArgs, Command, CpArgs, Location};
use rangefile::{
    Cli, HttpConfig, HttpStore, LocalStore, MultipartSink, ObjectHandle, RangeSource,
    ReaderConfig, WriterConfig,
};

/// An opened store together with the object it addresses.
struct Endpoint {
    handle: ObjectHandle,
    source: Arc<dyn RangeSource>,
    sink: Arc<dyn MultipartSink>,
    /// Kept for transfer statistics
    http: Option<Arc<HttpStore>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Cat(args) => cat(&cli, args),
        Command::Cp(args) => cp(&cli, args),
    }
}

/// Resolve a command-line location to a store and an object handle.
fn connect(cli: &Cli, location: &str) -> Result<Endpoint> {
    match Location::parse(location) {
        Location::Http { endpoint, key } => {
            if key.is_empty() {
                anyhow::bail!("{location} does not name an object");
            }
            let mut config = HttpConfig::new(endpoint);
            if let Some(user) = &cli.user {
                config = config.with_basic_auth(user, cli.password.clone().unwrap_or_default());
            }
            let store = Arc::new(HttpStore::new(config)?);
            Ok(Endpoint {
                handle: ObjectHandle::new("", key),
                source: store.clone(),
                sink: store.clone(),
                http: Some(store),
            })
        }
        Location::Local(path) => {
            let store = Arc::new(LocalStore::new("."));
            Ok(Endpoint {
                handle: ObjectHandle::new("", path.to_string_lossy()),
                source: store.clone(),
                sink: store,
                http: None,
            })
        }
    }
}

fn cat(cli: &Cli, args: &CatArgs) -> Result<()> {
    let endpoint = connect(cli, &args.source)?;
    let config = ReaderConfig::default()
        .with_buffer_size(args.buffer_size)
        .with_range_chunk_size(args.range_chunk_size)
        .with_retry(cli.retry_config());

    let mut reader = rangefile::open_reader(Arc::clone(&endpoint.source), endpoint.handle.clone(), config)?;
    if let Some(offset) = args.offset {
        reader.seek(SeekFrom::Start(offset))?;
    }
    if let Some(tail) = args.tail {
        let tail = i64::try_from(tail).context("--tail is too large")?;
        reader.seek(SeekFrom::End(-tail))?;
    }

    let reader = args.compression.wrap_reader(&endpoint.handle.key, reader);
    let mut reader: Box<dyn Read> = match args.length {
        Some(length) => Box::new(reader.take(length)),
        None => reader,
    };

    let mut stdout = io::stdout().lock();
    io::copy(&mut reader, &mut stdout)
        .map_err(rangefile::Error::from)
        .with_context(|| format!("failed to read {}", args.source))?;
    stdout.flush()?;

    report_transfer(cli, &[&endpoint]);
    Ok(())
}

fn cp(cli: &Cli, args: &CpArgs) -> Result<()> {
    let source = connect(cli, &args.source)?;
    let dest = connect(cli, &args.dest)?;

    let reader_config = ReaderConfig::default().with_retry(cli.retry_config());
    let reader = rangefile::open_reader(Arc::clone(&source.source), source.handle.clone(), reader_config)?;
    let mut reader = args.compression.wrap_reader(&source.handle.key, reader);

    let writer_config = WriterConfig::default()
        .with_part_size(args.part_size)
        .with_multipart(!args.single_part)
        .with_retry(cli.retry_config());
    let writer = rangefile::open_writer(Arc::clone(&dest.sink), dest.handle.clone(), writer_config)
        .with_context(|| format!("failed to open {} for writing", args.dest))?;
    let mut writer = args.compression.wrap_writer(&dest.handle.key, writer);

    match io::copy(&mut reader, &mut writer) {
        Ok(copied) => {
            writer
                .close()
                .with_context(|| format!("failed to commit {}", args.dest))?;
            info!("copied {} to {} ({} bytes stored)", args.source, args.dest, writer.tell());
            if !cli.is_quiet() {
                eprintln!("Copied {} from {}", format_size(copied), args.source);
            }
        }
        Err(e) => {
            if let Err(abort) = writer.terminate() {
                warn!("failed to abort upload of {}: {}", args.dest, abort);
            }
            return Err(rangefile::Error::from(e))
                .with_context(|| format!("failed to copy {} to {}", args.source, args.dest));
        }
    }

    report_transfer(cli, &[&source, &dest]);
    Ok(())
}

/// Display network transfer statistics for HTTP endpoints.
fn report_transfer(cli: &Cli, endpoints: &[&Endpoint]) {
    if cli.is_quiet() {
        return;
    }
    let stores: Vec<_> = endpoints.iter().filter_map(|e| e.http.as_ref()).collect();
    if stores.is_empty() {
        return;
    }
    let transferred: u64 = stores.iter().map(|s| s.transferred_bytes()).sum();
    eprintln!("\nTotal bytes transferred: {}", format_size(transferred));
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
