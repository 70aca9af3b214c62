use crate::middleware::TrustedSubnet;
use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use observer_common::duration::parse_duration;
use observer_storage::logged::DEFAULT_CONNECT_BUDGET;
use observer_storage::StorageConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ADDRESS: &str = "localhost:8080";
const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_FILE_STORAGE_PATH: &str = "/tmp/metrics-db.json";

/// Command line of the server. Every option also reads its environment
/// variable; the optional JSON file fills whatever both leave unset.
#[derive(Debug, Default, Parser)]
#[command(name = "observer-server", version, about = "Collects metrics reported by observer agents")]
pub struct ServerArgs {
    /// Listen address
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Snapshot period; 0 writes a snapshot after every update
    #[arg(short = 'i', long, env = "STORE_INTERVAL", value_parser = parse_duration)]
    pub store_interval: Option<Duration>,

    /// Snapshot file; an empty value keeps metrics in memory only
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<String>,

    /// Load the last snapshot on start-up
    #[arg(
        short = 'r',
        long,
        env = "RESTORE",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub restore: Option<bool>,

    /// SQLite database (path, `sqlite://path` or `:memory:`); takes precedence over the file
    #[arg(short = 'd', long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// Shared secret for HashSHA256 signatures
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// Path to the RSA private key (PEM) for encrypted bodies
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Only accept requests whose X-Real-IP falls in this CIDR
    #[arg(short = 't', long, env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<String>,

    /// JSON configuration file
    #[arg(short = 'c', long, env = "CONFIG")]
    pub config: Option<PathBuf>,
}

/// JSON configuration file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub address: Option<String>,
    #[serde(with = "humantime_serde")]
    pub store_interval: Option<Duration>,
    pub store_file: Option<PathBuf>,
    pub restore: Option<bool>,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolved server configuration, built once at start-up.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub store_interval: Duration,
    /// `None` when snapshots are disabled.
    pub file_storage_path: Option<PathBuf>,
    pub restore: bool,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<TrustedSubnet>,
    pub connect_budget: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            store_interval: DEFAULT_STORE_INTERVAL,
            file_storage_path: Some(PathBuf::from(DEFAULT_FILE_STORAGE_PATH)),
            restore: true,
            database_dsn: None,
            key: None,
            crypto_key: None,
            trusted_subnet: None,
            connect_budget: DEFAULT_CONNECT_BUDGET,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Reads the config file named by `args` (if any) and resolves.
    pub fn load(args: ServerArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merges flags/env over the file over built-in defaults.
    pub fn resolve(args: ServerArgs, file: FileConfig) -> Result<Self> {
        let defaults = Self::default();
        let trusted_subnet = non_empty(args.trusted_subnet.or(file.trusted_subnet))
            .map(|raw| {
                raw.parse::<TrustedSubnet>()
                    .with_context(|| format!("invalid trusted subnet '{raw}'"))
            })
            .transpose()?;

        let config = Self {
            address: args.address.or(file.address).unwrap_or(defaults.address),
            store_interval: args
                .store_interval
                .or(file.store_interval)
                .unwrap_or(defaults.store_interval),
            // An explicitly empty path disables snapshots.
            file_storage_path: match args.file_storage_path.map(PathBuf::from).or(file.store_file) {
                Some(path) if path.as_os_str().is_empty() => None,
                Some(path) => Some(path),
                None => defaults.file_storage_path,
            },
            restore: args.restore.or(file.restore).unwrap_or(defaults.restore),
            database_dsn: non_empty(args.database_dsn.or(file.database_dsn)),
            key: non_empty(args.key.or(file.key)),
            crypto_key: args
                .crypto_key
                .or(file.crypto_key)
                .filter(|p| !p.as_os_str().is_empty()),
            trusted_subnet,
            connect_budget: defaults.connect_budget,
        };
        if config.address.trim().is_empty() {
            bail!("listen address must not be empty");
        }
        Ok(config)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            dsn: self.database_dsn.clone(),
            file_path: self.file_storage_path.clone(),
            restore: self.restore,
            store_interval: self.store_interval,
            connect_budget: self.connect_budget,
        }
    }
}
