//! Configuration management for proxmark
//!
//! Values are layered, lowest precedence first:
//! 1. built-in defaults
//! 2. `~/.config/proxmark/config.toml` (override the location with `PROXMARK_CONFIG_PATH`)
//! 3. `PROXMARK_*` environment variables
//! 4. command-line flags
//! 5. `--quick`, which always wins for the four benchmark durations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::Cli;

/// Durations forced by `--quick`.
pub const QUICK_DURATIONS: Durations = Durations {
    cpu_multi_secs: 20,
    cpu_single_secs: 10,
    memory_secs: 10,
    disk_secs: 20,
};

pub const DEFAULT_IPERF_PORT: u16 = 5201;
pub const DEFAULT_API_URL: &str = "https://api.proxmark.io/v1";

/// Benchmark durations in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Durations {
    pub cpu_multi_secs: u64,
    pub cpu_single_secs: u64,
    pub memory_secs: u64,
    pub disk_secs: u64,
}

impl Default for Durations {
    fn default() -> Self {
        Self {
            cpu_multi_secs: 60,
            cpu_single_secs: 30,
            memory_secs: 30,
            disk_secs: 60,
        }
    }
}

/// On-disk configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub benchmark: BenchmarkFileConfig,

    #[serde(default)]
    pub output: OutputFileConfig,

    #[serde(default)]
    pub upload: UploadFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkFileConfig {
    pub cpu_multi_secs: Option<u64>,
    pub cpu_single_secs: Option<u64>,
    pub memory_secs: Option<u64>,
    pub disk_secs: Option<u64>,
    pub disk_size_mb: Option<u64>,
    pub disk_path: Option<PathBuf>,

    /// Seconds to wait for the storage selection prompt
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,

    /// Power sampling interval in seconds
    #[serde(default = "default_power_interval")]
    pub power_interval_secs: u64,
}

impl Default for BenchmarkFileConfig {
    fn default() -> Self {
        Self {
            cpu_multi_secs: None,
            cpu_single_secs: None,
            memory_secs: None,
            disk_secs: None,
            disk_size_mb: None,
            disk_path: None,
            prompt_timeout_secs: default_prompt_timeout(),
            power_interval_secs: default_power_interval(),
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputFileConfig {
    /// Directory for result files when `--output` is not given
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for UploadFileConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

impl BenchmarkFileConfig {
    /// sysbench `--time=0` and fio `--runtime=0` mean "no limit", so a zero
    /// duration or size from the file is dropped in favour of the default.
    fn without_zero_values(&self) -> Self {
        let positive = |name: &str, value: Option<u64>| match value {
            Some(0) => {
                warn!(setting = name, "zero value in config file ignored");
                None
            }
            other => other,
        };
        Self {
            cpu_multi_secs: positive("cpu_multi_secs", self.cpu_multi_secs),
            cpu_single_secs: positive("cpu_single_secs", self.cpu_single_secs),
            memory_secs: positive("memory_secs", self.memory_secs),
            disk_secs: positive("disk_secs", self.disk_secs),
            disk_size_mb: positive("disk_size_mb", self.disk_size_mb),
            ..self.clone()
        }
    }
}

fn default_prompt_timeout() -> u64 {
    30
}

fn default_power_interval() -> u64 {
    5
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_disk_size_mb() -> u64 {
    4096
}

impl FileConfig {
    /// Load configuration from file, or defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let Some(config_path) = Self::config_path() else {
            return Ok(Self::default());
        };
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))
    }

    /// Get the configuration file path
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PROXMARK_CONFIG_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        ProjectDirs::from("io", "proxmark", "proxmark")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// `host[:port]` target for the optional network benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for NetworkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
pub fn parse_network_target(value: &str) -> Result<NetworkTarget, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("target host must not be empty".to_string());
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{value}'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port),
            None if tail.is_empty() => None,
            None => return Err(format!("unexpected text after ']' in '{value}'")),
        };
        (host, port)
    } else if value.matches(':').count() == 1 {
        let (host, port) = value.split_once(':').unwrap_or((value, ""));
        (host, Some(port))
    } else {
        // Bare host name, or an unbracketed IPv6 address without a port.
        (value, None)
    };

    if host.is_empty() {
        return Err(format!("missing host in '{value}'"));
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| format!("invalid port '{port}'"))?,
        None => DEFAULT_IPERF_PORT,
    };

    Ok(NetworkTarget {
        host: host.to_string(),
        port,
    })
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub durations: Durations,
    pub disk_size_mb: u64,
    pub disk_path: PathBuf,
    pub all_disks: bool,
    pub quick: bool,
    pub network_target: Option<NetworkTarget>,
    pub auto_install: bool,
    pub upload: bool,
    #[serde(skip)]
    pub quiet: bool,
    #[serde(skip)]
    pub debug: bool,
    #[serde(skip)]
    pub json_only: bool,
    #[serde(skip)]
    pub color: bool,
    #[serde(skip)]
    pub interactive: bool,
    #[serde(skip)]
    pub output_path: PathBuf,
    #[serde(skip)]
    pub api_url: String,
    #[serde(skip)]
    pub prompt_timeout: Duration,
    #[serde(skip)]
    pub power_interval: Duration,
    #[serde(skip)]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub notes: String,
}

impl RunConfig {
    /// Merge flags, environment (already folded into `cli` by clap) and the
    /// config file into one record. `--quick` is applied last.
    pub fn resolve(
        cli: &Cli,
        file: &FileConfig,
        stdin_is_tty: bool,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let bench = &file.benchmark.without_zero_values();
        let defaults = Durations::default();
        let durations = Durations {
            cpu_multi_secs: cli
                .cpu_multi_time
                .or(bench.cpu_multi_secs)
                .unwrap_or(defaults.cpu_multi_secs),
            cpu_single_secs: cli
                .cpu_single_time
                .or(bench.cpu_single_secs)
                .unwrap_or(defaults.cpu_single_secs),
            memory_secs: cli
                .memory_time
                .or(bench.memory_secs)
                .unwrap_or(defaults.memory_secs),
            disk_secs: cli
                .disk_time
                .or(bench.disk_secs)
                .unwrap_or(defaults.disk_secs),
        };

        let disk_path = cli
            .disk_path
            .clone()
            .or_else(|| bench.disk_path.clone())
            .unwrap_or_else(default_disk_path);

        let output_path = cli.output.clone().unwrap_or_else(|| {
            let dir = file
                .output
                .dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            default_output_path(&dir, hostname, now)
        });

        let tags = normalize_tags(&cli.tag);

        let mut config = Self {
            durations,
            disk_size_mb: cli
                .disk_size
                .or(bench.disk_size_mb)
                .unwrap_or_else(default_disk_size_mb)
                .max(1),
            disk_path,
            all_disks: cli.all_disks,
            quick: false,
            network_target: cli.iperf.clone(),
            auto_install: !cli.no_install,
            upload: cli.upload && !cli.no_upload,
            quiet: cli.quiet,
            debug: cli.debug,
            json_only: cli.json,
            color: !cli.no_color && std::env::var_os("NO_COLOR").is_none(),
            interactive: stdin_is_tty && !cli.non_interactive,
            output_path,
            api_url: cli
                .api_url
                .clone()
                .unwrap_or_else(|| file.upload.api_url.clone()),
            prompt_timeout: Duration::from_secs(bench.prompt_timeout_secs.max(1)),
            power_interval: Duration::from_secs(bench.power_interval_secs.max(1)),
            tags,
            notes: cli.notes.clone().unwrap_or_default(),
        };

        if cli.quick {
            config.apply_quick();
        }
        config
    }

    /// Idempotent; always leaves the durations at [`QUICK_DURATIONS`].
    pub fn apply_quick(&mut self) {
        self.quick = true;
        self.durations = QUICK_DURATIONS;
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_path.with_extension("log")
    }

    pub fn debug_path(&self) -> PathBuf {
        self.output_path.with_extension("debug")
    }
}

#[cfg(test)]
impl RunConfig {
    /// Defaults as if run with no flags on a non-interactive terminal.
    pub fn for_tests() -> Self {
        use clap::Parser;
        let cli = Cli::try_parse_from(["proxmark"]).expect("no arguments always parse");
        Self::resolve(&cli, &FileConfig::default(), false, "test-host", Utc::now())
    }
}

fn default_disk_path() -> PathBuf {
    // Proxmox "local" storage; falls back to the temp dir off-platform.
    let pve_local = PathBuf::from("/var/lib/vz");
    if pve_local.is_dir() {
        pve_local
    } else {
        std::env::temp_dir()
    }
}

fn default_output_path(dir: &Path, hostname: &str, now: DateTime<Utc>) -> PathBuf {
    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let host = if host.is_empty() { "host".to_string() } else { host };
    dir.join(format!(
        "proxmark-{}-{}.json",
        host,
        now.format("%Y%m%d-%H%M%S")
    ))
}

/// Split comma-joined tags, trim, and drop empties and duplicates.
fn normalize_tags(raw: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.iter().flat_map(|value| value.split(',')) {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}
