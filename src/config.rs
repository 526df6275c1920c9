//! Configuration module for ethertok.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::bench::payload::BatchMode;
use crate::bench::report::RunLabels;
use crate::bench::Addressing;
use crate::link::raw;
use crate::protocol::{MacAddr, DEFAULT_PROTOCOL_ID};
use crate::tokenizer::SpecialTokens;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "ethertok")]
#[command(author = "ethertok authors")]
#[command(version = "0.1.0")]
#[command(about = "Tokenization over raw Ethernet frames: service and load generator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Network interface to bind (e.g., eth0)
    #[arg(short = 'i', long, global = true)]
    pub interface: Option<String>,

    /// Link-layer protocol id, hex (0x88b5) or decimal
    #[arg(long, global = true, value_parser = parse_protocol_id)]
    pub protocol_id: Option<u16>,

    /// Hardware address of this host (read from the interface if omitted)
    #[arg(long, global = true)]
    pub local_mac: Option<MacAddr>,

    /// Hardware address of the tokenization service
    #[arg(long, global = true)]
    pub remote_mac: Option<MacAddr>,

    /// First client port
    #[arg(long, global = true)]
    pub client_port: Option<u16>,

    /// Port the service listens on
    #[arg(long, global = true)]
    pub service_port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer tokenization requests on the interface
    Serve(ServeArgs),
    /// Measure round-trip latency over a fixed number of requests
    Latency(LatencyArgs),
    /// Measure sustained throughput for a fixed duration
    Throughput(ThroughputArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// JSON vocabulary ({"word": id, ...})
    #[arg(long, conflicts_with = "byte_level")]
    pub vocab: Option<PathBuf>,

    /// Tokenize to raw byte values instead of a vocabulary
    #[arg(long)]
    pub byte_level: bool,
}

#[derive(Args, Debug)]
pub struct LatencyArgs {
    /// Engine label recorded with the results
    #[arg(short, long, default_value = "unknown")]
    pub engine: String,

    /// Tokenizer label recorded with the results
    #[arg(short, long, default_value = "unknown")]
    pub tokenizer: String,

    /// Recorded requests
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub requests: usize,

    /// Words per request (upper bound in random and step modes)
    #[arg(short = 'b', long, default_value_t = 75)]
    pub max_batch: u32,

    #[arg(long, value_enum, default_value_t = BatchMode::Random)]
    pub batch_mode: BatchMode,

    /// Reply deadline per request, in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Requests in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Unrecorded requests made before measuring
    #[arg(long)]
    pub warmup: Option<usize>,

    /// Write the latency CDF to this CSV file
    #[arg(long)]
    pub cdf_file: Option<PathBuf>,

    /// Append the run summary to this CSV file
    #[arg(long)]
    pub summary_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ThroughputArgs {
    /// Engine label recorded with the results
    #[arg(short, long, default_value = "unknown")]
    pub engine: String,

    /// Tokenizer label recorded with the results
    #[arg(short, long, default_value = "unknown")]
    pub tokenizer: String,

    /// Run duration in seconds
    #[arg(short, long, default_value_t = 10.0)]
    pub duration: f64,

    /// Words per request
    #[arg(short = 'b', long, default_value_t = 25)]
    pub batch: u32,

    /// Reply deadline per request, in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Append the results row to this CSV file
    #[arg(long)]
    pub results_file: Option<PathBuf>,
}

fn parse_protocol_id(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid protocol id '{s}': {e}"))
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Link-related configuration
#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    pub interface: Option<String>,
    #[serde(default = "default_protocol_id")]
    pub protocol_id: u16,
    pub local_mac: Option<MacAddr>,
    pub remote_mac: Option<MacAddr>,
    /// Largest frame the interface carries
    pub mtu: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            protocol_id: default_protocol_id(),
            local_mac: None,
            remote_mac: None,
            mtu: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            client_port: default_client_port(),
            service_port: default_service_port(),
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_throughput_timeout_ms")]
    pub throughput_timeout_ms: u64,
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
    #[serde(default = "default_summary_file")]
    pub summary_file: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_warmup")]
    pub warmup: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            throughput_timeout_ms: default_throughput_timeout_ms(),
            results_file: default_results_file(),
            summary_file: default_summary_file(),
            concurrency: default_concurrency(),
            warmup: default_warmup(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Vocab,
    Bytes,
}

/// Tokenizer configuration (server only)
#[derive(Debug, Deserialize)]
pub struct TokenizerConfig {
    pub kind: Option<TokenizerKind>,
    pub vocab: Option<PathBuf>,
    #[serde(default = "default_cls_id")]
    pub cls_id: u32,
    #[serde(default = "default_sep_id")]
    pub sep_id: u32,
    #[serde(default = "default_unk_id")]
    pub unk_id: u32,
    /// Reject out-of-vocabulary words instead of mapping them to `unk_id`
    #[serde(default)]
    pub strict: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: None,
            vocab: None,
            cls_id: default_cls_id(),
            sep_id: default_sep_id(),
            unk_id: default_unk_id(),
            strict: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_protocol_id() -> u16 {
    DEFAULT_PROTOCOL_ID
}

fn default_client_port() -> u16 {
    12345
}

fn default_service_port() -> u16 {
    67
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_throughput_timeout_ms() -> u64 {
    1000
}

fn default_results_file() -> PathBuf {
    PathBuf::from("throughput_results.csv")
}

fn default_summary_file() -> PathBuf {
    PathBuf::from("tokenization_summary.csv")
}

fn default_concurrency() -> usize {
    1
}

fn default_warmup() -> usize {
    1
}

fn default_cls_id() -> u32 {
    101
}

fn default_sep_id() -> u32 {
    102
}

fn default_unk_id() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

const FALLBACK_MTU: usize = 1500;

/// Link settings after merging CLI and file.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub interface: String,
    pub protocol_id: u16,
    pub local_mac: Option<MacAddr>,
    pub remote_mac: Option<MacAddr>,
    pub mtu: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSettings {
    Bytes,
    Vocab {
        path: PathBuf,
        special: SpecialTokens,
    },
}

#[derive(Debug, Clone)]
pub struct LatencySettings {
    pub labels: RunLabels,
    pub requests: usize,
    pub max_batch: u32,
    pub batch_mode: BatchMode,
    pub timeout: Duration,
    pub concurrency: usize,
    pub warmup: usize,
    pub cdf_file: Option<PathBuf>,
    pub summary_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ThroughputSettings {
    pub labels: RunLabels,
    pub duration: Duration,
    pub batch: u32,
    pub timeout: Duration,
    pub results_file: PathBuf,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Serve(TokenizerSettings),
    Latency(LatencySettings),
    Throughput(ThroughputSettings),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub link: LinkSettings,
    pub client_port: u16,
    pub service_port: u16,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args over a parsed file, then validate.
    pub fn from_parts(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let interface = cli
            .interface
            .or(file.link.interface)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid("no interface given (--interface or [link] interface)".into())
            })?;

        let link = LinkSettings {
            interface,
            protocol_id: cli.protocol_id.unwrap_or(file.link.protocol_id),
            local_mac: cli.local_mac.or(file.link.local_mac),
            remote_mac: cli.remote_mac.or(file.link.remote_mac),
            mtu: file.link.mtu,
        };

        let mode = match cli.command {
            Command::Serve(args) => Mode::Serve(resolve_tokenizer(args, file.tokenizer)?),
            Command::Latency(args) => Mode::Latency(LatencySettings {
                labels: RunLabels {
                    engine: args.engine,
                    tokenizer: args.tokenizer,
                },
                requests: args.requests,
                max_batch: args.max_batch,
                batch_mode: args.batch_mode,
                timeout: Duration::from_millis(args.timeout_ms.unwrap_or(file.bench.timeout_ms)),
                concurrency: args.concurrency.unwrap_or(file.bench.concurrency),
                warmup: args.warmup.unwrap_or(file.bench.warmup),
                cdf_file: args.cdf_file,
                summary_file: args.summary_file.unwrap_or(file.bench.summary_file),
            }),
            Command::Throughput(args) => {
                let duration = Duration::try_from_secs_f64(args.duration)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "duration must be a positive number of seconds, got {}",
                            args.duration
                        ))
                    })?;
                if args.batch == 0 {
                    return Err(ConfigError::Invalid("batch must be at least 1 word".into()));
                }
                let timeout_ms = args.timeout_ms.unwrap_or(file.bench.throughput_timeout_ms);
                if timeout_ms == 0 {
                    return Err(ConfigError::Invalid("timeout must be positive".into()));
                }
                Mode::Throughput(ThroughputSettings {
                    labels: RunLabels {
                        engine: args.engine,
                        tokenizer: args.tokenizer,
                    },
                    duration,
                    batch: args.batch,
                    timeout: Duration::from_millis(timeout_ms),
                    results_file: args.results_file.unwrap_or(file.bench.results_file),
                })
            }
        };

        let config = Config {
            log_level: cli.log_level.unwrap_or(file.logging.level),
            link,
            client_port: cli.client_port.unwrap_or(file.ports.client_port),
            service_port: cli.service_port.unwrap_or(file.ports.service_port),
            mode,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Mode::Latency(ref latency) = self.mode {
            if latency.concurrency == 0 {
                return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
            }
            if latency.timeout.is_zero() {
                return Err(ConfigError::Invalid("timeout must be positive".into()));
            }
            // Parallel attempts use client_port .. client_port + concurrency.
            let first = usize::from(self.client_port);
            let last = first + latency.concurrency - 1;
            if last > usize::from(u16::MAX) {
                return Err(ConfigError::Invalid(format!(
                    "client ports {first}..={last} exceed 65535"
                )));
            }
            if (first..=last).contains(&usize::from(self.service_port)) {
                return Err(ConfigError::Invalid(format!(
                    "service port {} overlaps client ports {first}..={last}",
                    self.service_port
                )));
            }
        } else if self.client_port == self.service_port {
            return Err(ConfigError::Invalid(format!(
                "client and service ports are both {}",
                self.client_port
            )));
        }
        Ok(())
    }

    /// This host's hardware address, read from the interface when not configured.
    pub fn local_mac(&self) -> Result<MacAddr, ConfigError> {
        match self.link.local_mac {
            Some(mac) => Ok(mac),
            None => raw::interface_mac(&self.link.interface).map_err(|e| {
                ConfigError::Invalid(format!(
                    "cannot read hardware address of '{}' ({e}); set [link] local_mac",
                    self.link.interface
                ))
            }),
        }
    }

    /// Interface MTU: configured, else read from the interface, else 1500.
    pub fn mtu(&self) -> usize {
        if let Some(mtu) = self.link.mtu {
            return mtu;
        }
        match raw::interface_mtu(&self.link.interface) {
            Ok(mtu) => mtu,
            Err(e) => {
                warn!(
                    interface = %self.link.interface,
                    error = %e,
                    mtu = FALLBACK_MTU,
                    "Cannot read interface MTU, using fallback"
                );
                FALLBACK_MTU
            }
        }
    }

    /// Client-side addressing toward the service.
    pub fn addressing(&self) -> Result<Addressing, ConfigError> {
        let remote_mac = self.link.remote_mac.ok_or_else(|| {
            ConfigError::Invalid("no service address given (--remote-mac or [link] remote_mac)".into())
        })?;
        Ok(Addressing {
            local_mac: self.local_mac()?,
            remote_mac,
            protocol_id: self.link.protocol_id,
            client_port: self.client_port,
            service_port: self.service_port,
        })
    }
}

fn resolve_tokenizer(
    args: ServeArgs,
    file: TokenizerConfig,
) -> Result<TokenizerSettings, ConfigError> {
    if args.byte_level {
        return Ok(TokenizerSettings::Bytes);
    }
    let special = SpecialTokens {
        cls_id: Some(file.cls_id),
        sep_id: Some(file.sep_id),
        unk_id: (!file.strict).then_some(file.unk_id),
    };
    if let Some(path) = args.vocab {
        return Ok(TokenizerSettings::Vocab { path, special });
    }
    match (file.kind, file.vocab) {
        (Some(TokenizerKind::Bytes), _) => Ok(TokenizerSettings::Bytes),
        (_, Some(path)) => Ok(TokenizerSettings::Vocab { path, special }),
        (Some(TokenizerKind::Vocab), None) => Err(ConfigError::Invalid(
            "tokenizer kind is 'vocab' but no vocabulary path is set".into(),
        )),
        (None, None) => {
            warn!("No vocabulary configured, using byte-level tokenizer");
            Ok(TokenizerSettings::Bytes)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
