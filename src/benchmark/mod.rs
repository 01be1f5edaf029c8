//! Benchmark module
//!
//! Runners for each category plus the raw-metric records they produce. Every
//! metric defaults to zero; a failed or unparseable run degrades only that
//! metric and the pipeline keeps going.

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;
pub mod parse;
pub mod power;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;

use crate::context::RunContext;
use crate::exec::{first_output_line, run_tracked};
use crate::hardware::disk::DiskInfo;

pub use power::PowerSummary;

/// Extra time allowed beyond a tool's own `--time`/`--runtime` before it is killed.
const TOOL_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuRun {
    pub events_per_sec: f64,
    pub threads: usize,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuBenchmark {
    pub multi_thread: CpuRun,
    pub single_thread: CpuRun,
    /// Package power while the CPU runs were active
    pub power: Option<PowerSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryBenchmark {
    pub threads: usize,
    pub duration_secs: u64,
    pub write_mb_s: f64,
    pub read_mb_s: f64,
    pub latency_ns: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomIo {
    pub read_iops: f64,
    pub write_iops: f64,
    pub read_latency_us: f64,
    pub write_latency_us: f64,
}

impl RandomIo {
    pub fn total_iops(&self) -> f64 {
        self.read_iops + self.write_iops
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskBenchmark {
    pub path: std::path::PathBuf,
    pub engine: String,
    pub ram_backed: bool,
    pub file_size_mb: u64,
    pub duration_secs: u64,
    pub random_rw: RandomIo,
    pub seq_read_mb_s: f64,
    pub seq_write_mb_s: f64,
    /// Why nothing was measured, when the run was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// Device details for additional (non-primary) disks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DiskInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkBenchmark {
    /// `host:port`, absent when no target was configured
    pub target: Option<String>,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    /// "iperf3" or "ping"
    pub latency_source: Option<String>,
}

/// Raw metrics for every category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub cpu: CpuBenchmark,
    pub memory: MemoryBenchmark,
    pub disk: DiskBenchmark,
    pub additional_disks: Vec<DiskBenchmark>,
    pub network: NetworkBenchmark,
}

/// Run a benchmark tool to completion and hand back its stdout.
///
/// The raw output is kept in the debug dump whether or not the tool succeeded.
pub(crate) fn run_tool(
    ctx: &mut RunContext,
    label: &str,
    command: &mut Command,
    runtime: Duration,
) -> Result<String> {
    let output = run_tracked(command, runtime + TOOL_GRACE, label, &ctx.cleanup)?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    ctx.debug.record(label, &stdout);
    if !output.stderr.is_empty() {
        ctx.debug
            .record(format!("{label} (stderr)"), String::from_utf8_lossy(&output.stderr));
    }

    if !output.status.success() {
        let detail = first_output_line(&output).unwrap_or_default();
        bail!("{label} failed ({}): {detail}", output.status);
    }
    Ok(stdout)
}

/// Run + parse, for parsers returning [`crate::error::ParseError`].
pub(crate) fn measure<T>(
    ctx: &mut RunContext,
    label: &str,
    command: &mut Command,
    runtime: Duration,
    parse: impl FnOnce(&str) -> Result<T, crate::error::ParseError>,
) -> Result<T> {
    let stdout = run_tool(ctx, label, command, runtime)?;
    parse(&stdout).with_context(|| format!("could not parse {label} output"))
}

/// Unwrap a measurement, degrading to the zero value with a warning.
pub(crate) fn or_zero<T: Default>(ctx: &RunContext, what: &str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            ctx.degrade(what, format!("{err:#}"));
            T::default()
        }
    }
}

/// Logical core count, used as the thread count for CPU and memory runs.
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
