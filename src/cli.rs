use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::compression::Compression;
use crate::config::{DEFAULT_PART_SIZE, RetryConfig};

#[derive(Parser, Debug)]
#[command(name = "rangefile")]
#[command(version)]
#[command(about = "Stream and copy objects over HTTP range requests and multipart uploads", long_about = None)]
#[command(after_help = "Examples:\n  \
  rangefile cat https://example.com/logs/app.log --tail 4096   print the last 4 KiB\n  \
  rangefile cat data.csv.gz --offset 0 --length 100             first 100 decoded bytes\n  \
  rangefile cp big.bin http://localhost:9000/bucket/big.bin     multipart upload")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode, no transfer statistics
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// User for HTTP basic authentication
    #[arg(long, env = "RANGEFILE_USER", global = true)]
    pub user: Option<String>,

    /// Password for HTTP basic authentication
    #[arg(long, env = "RANGEFILE_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Attempts per remote call before giving up
    #[arg(long, env = "RANGEFILE_MAX_ATTEMPTS", default_value_t = 6, global = true)]
    pub max_attempts: u32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write an object, or a slice of it, to stdout
    Cat(CatArgs),
    /// Copy an object between local paths and HTTP URLs
    Cp(CpArgs),
}

#[derive(Args, Debug)]
pub struct CatArgs {
    /// Local path or HTTP URL
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Start reading at this byte offset
    #[arg(long, value_name = "BYTES", conflicts_with = "tail")]
    pub offset: Option<u64>,

    /// Start reading this many bytes before the end
    #[arg(long, value_name = "BYTES")]
    pub tail: Option<u64>,

    /// Stop after this many bytes
    #[arg(long, value_name = "BYTES")]
    pub length: Option<u64>,

    /// Bytes pulled per buffer fill
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub buffer_size: usize,

    /// Size of each range request (default: open-ended ranges)
    #[arg(long, value_name = "BYTES")]
    pub range_chunk_size: Option<u64>,

    /// disable, infer_from_extension, .gz or .bz2
    #[arg(long, default_value = "infer_from_extension")]
    pub compression: Compression,
}

#[derive(Args, Debug)]
pub struct CpArgs {
    /// Local path or HTTP URL to read
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Local path or HTTP URL to write
    #[arg(value_name = "DEST")]
    pub dest: String,

    /// Bytes per uploaded part
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_PART_SIZE)]
    pub part_size: usize,

    /// Buffer the whole object and store it with one request
    #[arg(long)]
    pub single_part: bool,

    /// Decode the source and encode the destination by extension
    #[arg(long, default_value = "disable")]
    pub compression: Compression,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::default().with_max_attempts(self.max_attempts)
    }
}

/// Where an object lives, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// `endpoint` is `scheme://authority`; `key` is the path without its leading slash
    Http { endpoint: String, key: String },
    Local(PathBuf),
}

pub fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

impl Location {
    pub fn parse(s: &str) -> Location {
        if !is_http_url(s) {
            return Location::Local(PathBuf::from(s));
        }
        let authority_start = s.find("://").map_or(0, |i| i + 3);
        match s[authority_start..].find('/') {
            Some(i) => Location::Http {
                endpoint: s[..authority_start + i].to_string(),
                key: s[authority_start + i + 1..].to_string(),
            },
            None => Location::Http {
                endpoint: s.to_string(),
                key: String::new(),
            },
        }
    }
}
