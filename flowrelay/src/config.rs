use clap::ValueEnum;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use flowrelay_common::{DecodeOptions, HEADER_LEN, MAX_RECORDS, NETFLOW_V5_VERSION, RECORD_LEN};

/// How each decoded record is written to the delivery channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated field values in wire order.
    #[default]
    Text,
    /// One JSON object per record with resolved addresses and timestamps.
    Json,
}

/// Where the sink writes forwarded records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    #[default]
    Stdout,
    /// Emit each record as an `info` event on the `flowrelay::flows` target.
    Log,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP address to receive NetFlow datagrams on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Do not start the HTTP API.
    #[serde(default)]
    pub disable_api: bool,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default)]
    pub output: OutputTarget,

    /// Capacity of the channel between listener and sink.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Receive buffer size; longer datagrams are cut by the kernel.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Drop datagrams whose header version is not 5.
    #[serde(default = "default_true")]
    pub strict_version: bool,

    /// Drop datagrams declaring more than 30 records.
    #[serde(default = "default_true")]
    pub enforce_max_count: bool,

    /// Drop datagrams with bytes after the last declared record.
    #[serde(default)]
    pub reject_trailing_bytes: bool,

    /// Seconds of silence after which an exporter is forgotten.
    #[serde(default = "default_exporter_timeout")]
    pub exporter_timeout: u64,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:2055".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_channel_capacity() -> usize {
    10000
}

fn default_max_datagram_size() -> usize {
    65535
}

fn default_exporter_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            disable_api: false,
            quiet: false,
            output_format: OutputFormat::default(),
            output: OutputTarget::default(),
            channel_capacity: default_channel_capacity(),
            max_datagram_size: default_max_datagram_size(),
            strict_version: true,
            enforce_max_count: true,
            reject_trailing_bytes: false,
            exporter_timeout: default_exporter_timeout(),
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.listen != default_listen() {
            self.listen = cli.listen.clone();
        }
        if cli.port != default_port() {
            self.port = cli.port;
        }
        if cli.disable_api {
            self.disable_api = true;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if let Some(format) = cli.output_format {
            self.output_format = format;
        }
        if let Some(output) = cli.output {
            self.output = output;
        }
        if cli.channel_capacity != default_channel_capacity() {
            self.channel_capacity = cli.channel_capacity;
        }
        if cli.lenient {
            self.strict_version = false;
            self.enforce_max_count = false;
        }
        if cli.reject_trailing_bytes {
            self.reject_trailing_bytes = true;
        }
        if cli.exporter_timeout != default_exporter_timeout() {
            self.exporter_timeout = cli.exporter_timeout;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    /// Reject values that would make the collector panic or drop every
    /// datagram.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.channel_capacity > 0,
            "channel_capacity must be at least 1"
        );
        let min_datagram = HEADER_LEN + usize::from(MAX_RECORDS) * RECORD_LEN;
        anyhow::ensure!(
            self.max_datagram_size >= min_datagram,
            "max_datagram_size {} is below the largest v5 datagram ({} bytes)",
            self.max_datagram_size,
            min_datagram
        );
        Ok(())
    }

    /// Decode policy the listener applies to every datagram.
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            require_version: self.strict_version.then_some(NETFLOW_V5_VERSION),
            max_records: self.enforce_max_count.then_some(MAX_RECORDS),
            allow_trailing_bytes: !self.reject_trailing_bytes,
        }
    }
}

use clap::Parser;

/// flowrelay: NetFlow v5 collector that republishes flows as text
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// UDP address to listen on for NetFlow datagrams.
    #[arg(short, long, default_value = "0.0.0.0:2055")]
    pub listen: String,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Do not start the HTTP API.
    #[arg(long)]
    pub disable_api: bool,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Record output format.
    #[arg(long, value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Record output destination.
    #[arg(long, value_enum)]
    pub output: Option<OutputTarget>,

    /// Capacity of the listener to sink channel.
    #[arg(
        long,
        default_value_t = 10000,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub channel_capacity: usize,

    /// Accept any header version and any record count.
    #[arg(long)]
    pub lenient: bool,

    /// Drop datagrams carrying bytes after the last record.
    #[arg(long)]
    pub reject_trailing_bytes: bool,

    /// Seconds after which a silent exporter is dropped from stats.
    #[arg(long, default_value_t = 300)]
    pub exporter_timeout: u64,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
