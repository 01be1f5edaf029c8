//! Proxmark - Proxmox VE host benchmark
//!
//! A single sequential run that:
//! - Installs sysbench and fio when they are missing
//! - Inventories CPU, memory, the benchmarked disk and Proxmox VE details
//! - Benchmarks CPU, memory, disk and (optionally) network throughput
//! - Computes a fixed-formula composite score
//! - Writes a JSON result file, a plaintext log and an optional debug dump

mod benchmark;
mod config;
mod console;
mod context;
mod deps;
mod error;
mod exec;
mod hardware;
mod interrupt;
mod logging;
mod report;
mod score;
mod storage;

use chrono::Utc;
use clap::error::ErrorKind;
use clap::Parser;
use std::collections::BTreeSet;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

use crate::benchmark::BenchmarkResults;
use crate::config::{parse_network_target, FileConfig, NetworkTarget, RunConfig};
use crate::console::Console;
use crate::context::{CleanupRegistry, RunContext};
use crate::error::RunError;
use crate::hardware::disk::DiskInfo;
use crate::hardware::SystemInventory;
use crate::logging::Verbosity;
use crate::report::RunReport;

/// Proxmark - benchmark a Proxmox VE host
#[derive(Parser, Debug)]
#[command(name = "proxmark")]
#[command(version)]
#[command(about = "Benchmark CPU, memory, disk and network on a Proxmox VE host")]
pub struct Cli {
    /// Print only errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Print diagnostic progress
    #[arg(short, long)]
    pub verbose: bool,

    /// Write raw tool output and system dumps to a .debug file
    #[arg(long)]
    pub debug: bool,

    /// Print only the JSON result document on stdout
    #[arg(long)]
    pub json: bool,

    /// Shorter runs: CPU 20s/10s, memory 10s, disk 20s
    #[arg(long)]
    pub quick: bool,

    /// Disable coloured output
    #[arg(long)]
    pub no_color: bool,

    /// Upload results (not available in this version)
    #[arg(long)]
    pub upload: bool,

    /// Never upload results
    #[arg(long)]
    pub no_upload: bool,

    /// Fail instead of installing missing tools
    #[arg(long)]
    pub no_install: bool,

    /// Directory to benchmark [default: /var/lib/vz]
    #[arg(long, value_name = "PATH", env = "PROXMARK_DISK_PATH")]
    pub disk_path: Option<PathBuf>,

    /// Benchmark every discovered storage location without prompting
    #[arg(long)]
    pub all_disks: bool,

    /// Result file path
    #[arg(long, value_name = "FILE", env = "PROXMARK_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Tag the run (repeatable, comma-separated values allowed)
    #[arg(long, value_name = "TAG")]
    pub tag: Vec<String>,

    /// Free-text notes stored with the results
    #[arg(long, value_name = "TEXT")]
    pub notes: Option<String>,

    /// iperf3 server for the network benchmark
    #[arg(long, value_name = "HOST[:PORT]", value_parser = parse_network_target)]
    pub iperf: Option<NetworkTarget>,

    /// Never prompt
    #[arg(long)]
    pub non_interactive: bool,

    /// CPU multi-thread duration in seconds
    #[arg(
        long,
        value_name = "SECS",
        env = "PROXMARK_CPU_MULTI_DURATION",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub cpu_multi_time: Option<u64>,

    /// CPU single-thread duration in seconds
    #[arg(
        long,
        value_name = "SECS",
        env = "PROXMARK_CPU_SINGLE_DURATION",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub cpu_single_time: Option<u64>,

    /// Memory benchmark duration in seconds
    #[arg(
        long,
        value_name = "SECS",
        env = "PROXMARK_MEMORY_DURATION",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub memory_time: Option<u64>,

    /// Duration of each disk job in seconds
    #[arg(
        long,
        value_name = "SECS",
        env = "PROXMARK_DISK_DURATION",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub disk_time: Option<u64>,

    /// Disk test file size in MiB
    #[arg(
        long,
        value_name = "MIB",
        env = "PROXMARK_DISK_SIZE_MB",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub disk_size: Option<u64>,

    /// Results API base URL
    #[arg(long, hide = true, env = "PROXMARK_API_URL")]
    pub api_url: Option<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout; everything else is a usage error.
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(RunError::Usage(err.to_string()).exit_code()),
            };
        }
    };

    let color = !cli.no_color && std::env::var_os("NO_COLOR").is_none();
    logging::init(
        Verbosity {
            quiet: cli.quiet,
            verbose: cli.verbose,
            debug: cli.debug,
        },
        color && io::stderr().is_terminal(),
    );

    let cleanup = CleanupRegistry::default();
    interrupt::install(cleanup.clone());

    match run(&cli, cleanup) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            Console::new(cli.quiet, cli.json, color).error(&err.to_string());
            ExitCode::from(err.exit_code())
        }
    }
}

fn load_file_config(console: &Console) -> FileConfig {
    match FileConfig::load() {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "config file ignored");
            console.warn(&format!("{err:#}; using defaults"));
            FileConfig::default()
        }
    }
}

fn run(cli: &Cli, cleanup: CleanupRegistry) -> Result<(), RunError> {
    let early_console = Console::new(cli.quiet, cli.json, !cli.no_color);
    let file_config = load_file_config(&early_console);

    let hostname = hardware::hostname();
    let mut config = RunConfig::resolve(
        cli,
        &file_config,
        io::stdin().is_terminal(),
        &hostname,
        Utc::now(),
    );
    if !io::stdout().is_terminal() {
        config.color = false;
    }
    info!(?config, "configuration resolved");

    let mut ctx = RunContext::new(config, cleanup);
    ctx.console.banner(env!("CARGO_PKG_VERSION"));

    let environment = deps::probe_environment();
    if !environment.is_proxmox {
        ctx.console
            .warn("pveversion not found: this does not look like a Proxmox VE host");
    }
    if !environment.is_root {
        ctx.console
            .warn("not running as root: memory and CPU details from dmidecode will be incomplete");
    }
    if !environment.missing_inspection_tools.is_empty() {
        info!(
            missing = ?environment.missing_inspection_tools,
            "optional inspection tools unavailable"
        );
    }

    ctx.console.section("Checking dependencies");
    deps::ensure_tools(&mut ctx, deps::REQUIRED_TOOLS)?;
    ctx.console.success("sysbench and fio available");

    ctx.console.section("Detecting hardware");
    let primary = ctx.config.disk_path.clone();
    let disk = detect_disk(&mut ctx, &primary);
    let system = SystemInventory::detect(disk, &mut ctx.debug);
    ctx.console.success(&format!(
        "{} ({} cores / {} threads), {:.1} GB RAM",
        system.cpu.model,
        system.cpu.cores,
        system.cpu.threads,
        system.memory.total_mb as f64 / 1024.0
    ));

    let active_pools: BTreeSet<String> = system
        .proxmox
        .iter()
        .flat_map(|pve| pve.storage_pools.iter())
        .filter(|pool| pool.status == "active")
        .map(|pool| pool.name.clone())
        .collect();
    let candidates = storage::discover(&primary, &active_pools);
    let extras = storage::select_additional(&ctx, &candidates);

    ctx.console.section("CPU benchmark");
    let cpu = benchmark::cpu::run(&mut ctx);

    ctx.console.section("Memory benchmark");
    let memory = benchmark::memory::run(&mut ctx);

    ctx.console.section("Disk benchmark");
    let disk = benchmark::disk::run(&mut ctx, &primary, None);
    let mut additional_disks = Vec::with_capacity(extras.len());
    for candidate in &extras {
        let device = detect_disk(&mut ctx, &candidate.path);
        additional_disks.push(benchmark::disk::run(&mut ctx, &candidate.path, Some(device)));
    }

    if ctx.config.network_target.is_some() {
        ctx.console.section("Network benchmark");
    }
    let network = benchmark::network::run(&mut ctx);

    let results = BenchmarkResults {
        cpu,
        memory,
        disk,
        additional_disks,
        network,
    };
    let scores = score::calculate(&results);
    info!(composite = scores.composite, "run complete");

    let RunContext {
        config,
        console,
        debug,
        ..
    } = ctx;
    let output_path = config.output_path.clone();
    let log_path = config.log_path();
    let debug_path = config.debug_path();
    let json_only = config.json_only;
    let upload = config.upload;
    let api_url = config.api_url.clone();

    let report = RunReport::new(config, system, results, scores);
    let json = report.to_json()?;
    RunReport::write_json(&output_path, &json)?;

    if json_only {
        println!("{json}");
    } else if console.chatty() {
        report.print_summary();
    }

    if let Err(err) = report.append_log(&log_path) {
        console.warn(&format!("{err:#}"));
    }
    if let Err(err) = report::write_debug(&debug_path, &debug) {
        console.warn(&format!("{err:#}"));
    }

    if upload {
        console.warn(&format!(
            "uploading to {api_url} is not available in this version; results were saved locally"
        ));
    }

    console.success(&format!("Results saved to {}", output_path.display()));
    if debug.enabled() {
        console.success(&format!("Debug dump saved to {}", debug_path.display()));
    }
    Ok(())
}

/// `df` the path, then resolve its mount source to a physical disk.
fn detect_disk(ctx: &mut RunContext, path: &std::path::Path) -> DiskInfo {
    let usage = storage::probe(path);
    DiskInfo::detect(
        path,
        usage.as_ref().map(|u| u.source.as_str()),
        usage.as_ref().map(|u| u.fs_type.as_str()),
        &mut ctx.debug,
    )
}
