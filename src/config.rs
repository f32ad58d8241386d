use crate::services::{
    AssemblerOptions, ShareDuration, ShareSettings, StoreBackend, assembler::DEFAULT_CHUNK_SIZE,
    expiry::DEFAULT_LEASE_TTL, retry::RetryPolicy, share_code::DEFAULT_CODE_ATTEMPTS,
};
use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// One week.
const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    pub storage_dir: String,
    pub chunk_size: usize,
    pub write_concurrency: usize,
    pub prefetch_depth: usize,
    pub code_attempts: u32,
    pub store_retries: u32,
    pub retry_backoff_ms: u64,
    pub default_duration: String,
    /// Seconds a burn-after-read lease survives without renewal.
    pub read_lease_ttl_secs: u64,
    /// 0 disables the limit.
    pub max_upload_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked file sharing service")]
pub struct Args {
    /// Host to bind to (overrides SHARE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHARE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides SHARE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk store backend (overrides SHARE_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub store_backend: Option<StoreBackend>,

    /// Directory for the filesystem backend (overrides SHARE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Maximum bytes per stored chunk (overrides SHARE_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Chunk writes in flight per upload (overrides SHARE_STORE_WRITE_CONCURRENCY)
    #[arg(long)]
    pub write_concurrency: Option<usize>,

    /// Chunk reads in flight per download (overrides SHARE_STORE_PREFETCH_DEPTH)
    #[arg(long)]
    pub prefetch_depth: Option<usize>,

    /// Share code allocation attempts (overrides SHARE_STORE_CODE_ATTEMPTS)
    #[arg(long)]
    pub code_attempts: Option<u32>,

    /// Attempts per chunk store call (overrides SHARE_STORE_STORE_RETRIES)
    #[arg(long)]
    pub store_retries: Option<u32>,

    /// First retry delay in milliseconds (overrides SHARE_STORE_RETRY_BACKOFF_MS)
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Lifetime of shares uploaded without one, e.g. `1day` (overrides SHARE_STORE_DEFAULT_DURATION)
    #[arg(long)]
    pub default_duration: Option<String>,

    /// Seconds before an unrenewed read lease lapses (overrides SHARE_STORE_READ_LEASE_TTL_SECS)
    #[arg(long)]
    pub read_lease_ttl_secs: Option<u64>,

    /// Largest accepted upload, 0 for no limit (overrides SHARE_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Delete expired shares once and exit
    #[arg(long)]
    pub purge_expired: bool,
}

/// One-shot modes selected on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tasks {
    pub migrate: bool,
    pub purge_expired: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and one-shot tasks.
    pub fn from_env_and_args() -> Result<(Self, Tasks)> {
        Self::merge(Args::parse())
    }

    /// Merge parsed arguments over the environment and validate the result.
    pub fn merge(args: Args) -> Result<(Self, Tasks)> {
        let backend = match args.store_backend {
            Some(backend) => backend,
            None => match env::var("SHARE_STORE_BACKEND") {
                Ok(value) => parse_backend(&value)?,
                Err(env::VarError::NotPresent) => StoreBackend::Filesystem,
                Err(err) => return Err(err).context("reading SHARE_STORE_BACKEND"),
            },
        };

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("SHARE_STORE_HOST", "0.0.0.0")),
            port: or_env(args.port, "SHARE_STORE_PORT", 3000)?,
            database_url: args.database_url.unwrap_or_else(|| {
                env_string("SHARE_STORE_DATABASE_URL", "sqlite://./data/meta/share_store.db")
            }),
            store_backend: backend,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_string("SHARE_STORE_STORAGE_DIR", "./data/chunks")),
            chunk_size: or_env(args.chunk_size, "SHARE_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            write_concurrency: or_env(args.write_concurrency, "SHARE_STORE_WRITE_CONCURRENCY", 4)?,
            prefetch_depth: or_env(args.prefetch_depth, "SHARE_STORE_PREFETCH_DEPTH", 1)?,
            code_attempts: or_env(
                args.code_attempts,
                "SHARE_STORE_CODE_ATTEMPTS",
                DEFAULT_CODE_ATTEMPTS,
            )?,
            store_retries: or_env(args.store_retries, "SHARE_STORE_STORE_RETRIES", 3)?,
            retry_backoff_ms: or_env(args.retry_backoff_ms, "SHARE_STORE_RETRY_BACKOFF_MS", 50)?,
            default_duration: args
                .default_duration
                .unwrap_or_else(|| env_string("SHARE_STORE_DEFAULT_DURATION", "1hour")),
            read_lease_ttl_secs: or_env(
                args.read_lease_ttl_secs,
                "SHARE_STORE_READ_LEASE_TTL_SECS",
                DEFAULT_LEASE_TTL.num_seconds() as u64,
            )?,
            max_upload_bytes: or_env(args.max_upload_bytes, "SHARE_STORE_MAX_UPLOAD_BYTES", 0)?,
        };
        cfg.validate()?;

        let tasks = Tasks {
            migrate: args.migrate,
            purge_expired: args.purge_expired,
        };
        Ok((cfg, tasks))
    }

    /// Reject settings the storage core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk size must be at least 1 byte");
        }
        if self.write_concurrency == 0 {
            bail!("write concurrency must be at least 1");
        }
        if self.prefetch_depth == 0 {
            bail!("prefetch depth must be at least 1");
        }
        if self.code_attempts == 0 {
            bail!("code attempts must be at least 1");
        }
        if self.read_lease_ttl_secs == 0 || self.read_lease_ttl_secs > MAX_LEASE_TTL_SECS {
            bail!("read lease ttl must be between 1 and {} seconds", MAX_LEASE_TTL_SECS);
        }
        if self.store_retries == 0 {
            bail!("store retries must be at least 1 (the first attempt counts)");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retries,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    pub fn assembler_options(&self) -> AssemblerOptions {
        AssemblerOptions {
            chunk_size: self.chunk_size,
            write_concurrency: self.write_concurrency,
            prefetch_depth: self.prefetch_depth,
            max_object_size: (self.max_upload_bytes > 0).then_some(self.max_upload_bytes),
            retry: self.retry_policy(),
        }
    }

    pub fn share_settings(&self) -> ShareSettings {
        ShareSettings {
            code_attempts: self.code_attempts,
            default_duration: ShareDuration::parse(&self.default_duration),
            read_lease_ttl: TimeDelta::seconds(self.read_lease_ttl_secs as i64),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn or_env<T>(arg: Option<T>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_backend(value: &str) -> Result<StoreBackend> {
    match value.trim().to_ascii_lowercase().as_str() {
        "filesystem" | "fs" => Ok(StoreBackend::Filesystem),
        "memory" => Ok(StoreBackend::Memory),
        other => bail!("unknown SHARE_STORE_BACKEND `{}`", other),
    }
}
