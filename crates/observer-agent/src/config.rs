use anyhow::{bail, Context, Result};
use clap::Parser;
use observer_common::duration::parse_duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ADDRESS: &str = "localhost:8080";
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Command line of the agent. Every option also reads its environment
/// variable; the optional JSON file fills whatever both leave unset.
#[derive(Debug, Default, Parser)]
#[command(name = "observer-agent", version, about = "Samples host metrics and reports them to an observer server")]
pub struct AgentArgs {
    /// Server address, `host:port` or a full URL
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// How often metrics are sent
    #[arg(short = 'r', long, env = "REPORT_INTERVAL", value_parser = parse_duration)]
    pub report_interval: Option<Duration>,

    /// How often metrics are sampled
    #[arg(short = 'p', long, env = "POLL_INTERVAL", value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Concurrent single-metric requests per report; 0 sends one batch
    #[arg(short = 'l', long, env = "RATE_LIMIT", allow_negative_numbers = true)]
    pub rate_limit: Option<i64>,

    /// Shared secret for the HashSHA256 request signature
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// Path to the server's RSA public key (PEM)
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

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
    pub report_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    pub rate_limit: Option<i64>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolved agent configuration, built once at start-up.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub report_interval: Duration,
    pub poll_interval: Duration,
    /// Zero selects bulk mode.
    pub rate_limit: usize,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl AgentConfig {
    /// Reads the config file named by `args` (if any) and resolves.
    pub fn load(args: AgentArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merges flags/env over the file over built-in defaults.
    pub fn resolve(args: AgentArgs, file: FileConfig) -> Result<Self> {
        let config = Self {
            address: args
                .address
                .or(file.address)
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            report_interval: args
                .report_interval
                .or(file.report_interval)
                .unwrap_or(DEFAULT_REPORT_INTERVAL),
            poll_interval: args
                .poll_interval
                .or(file.poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            rate_limit: args
                .rate_limit
                .or(file.rate_limit)
                .map(|limit| usize::try_from(limit).unwrap_or(0))
                .unwrap_or(0),
            key: args.key.or(file.key).filter(|k| !k.is_empty()),
            crypto_key: args
                .crypto_key
                .or(file.crypto_key)
                .filter(|p| !p.as_os_str().is_empty()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            bail!("server address must not be empty");
        }
        if self.report_interval.is_zero() {
            bail!("report interval must be positive");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        Ok(())
    }
}
