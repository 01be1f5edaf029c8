//! sysbench memory runs: sequential write and read bandwidth on all cores,
//! then a single-threaded random-access run for latency.

use anyhow::anyhow;
use std::process::Command;
use std::time::Duration;
use tracing::info;

use super::parse::{parse_sysbench_memory, SysbenchMemory};
use super::{logical_cores, measure, or_zero, MemoryBenchmark};
use crate::context::RunContext;

/// Upper bound on the latency run, independent of the bandwidth duration.
const LATENCY_MAX_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Write,
    Read,
}

impl MemoryOp {
    fn as_str(&self) -> &'static str {
        match self {
            MemoryOp::Write => "write",
            MemoryOp::Read => "read",
        }
    }
}

pub fn bandwidth_args(op: MemoryOp, threads: usize, secs: u64) -> Vec<String> {
    vec![
        "memory".to_string(),
        "--memory-block-size=1M".to_string(),
        "--memory-total-size=100T".to_string(),
        format!("--memory-oper={}", op.as_str()),
        "--memory-access-mode=seq".to_string(),
        format!("--threads={threads}"),
        format!("--time={secs}"),
        "run".to_string(),
    ]
}

pub fn latency_args(secs: u64) -> Vec<String> {
    vec![
        "memory".to_string(),
        "--memory-block-size=4K".to_string(),
        "--memory-total-size=100T".to_string(),
        "--memory-oper=read".to_string(),
        "--memory-access-mode=rnd".to_string(),
        "--threads=1".to_string(),
        format!("--time={secs}"),
        "run".to_string(),
    ]
}

/// Nanoseconds per operation: from the operation rate when present, else
/// from sysbench's average latency (ms).
pub fn latency_ns(parsed: &SysbenchMemory) -> Option<f64> {
    parsed
        .ops_per_sec
        .filter(|ops| *ops > 0.0)
        .map(|ops| 1e9 / ops)
        .or_else(|| parsed.avg_latency_ms.filter(|ms| *ms > 0.0).map(|ms| ms * 1e6))
}

fn bandwidth(ctx: &mut RunContext, op: MemoryOp, threads: usize, secs: u64) -> f64 {
    let what = format!("Memory {}", op.as_str());
    ctx.console
        .step(&format!("{what}: sysbench memory, {threads} thread(s), {secs}s"));
    let mut cmd = Command::new("sysbench");
    cmd.args(bandwidth_args(op, threads, secs));
    let label = format!("sysbench memory {}", op.as_str());
    let result = measure(ctx, &label, &mut cmd, Duration::from_secs(secs), parse_sysbench_memory)
        .map(|parsed| parsed.mib_per_sec);
    let mb_s = or_zero(ctx, &what, result);
    if mb_s > 0.0 {
        ctx.console.success(&format!("{what}: {mb_s:.2} MB/s"));
    }
    mb_s
}

pub fn run(ctx: &mut RunContext) -> MemoryBenchmark {
    let threads = logical_cores();
    let secs = ctx.config.durations.memory_secs;

    let write_mb_s = bandwidth(ctx, MemoryOp::Write, threads, secs);
    let read_mb_s = bandwidth(ctx, MemoryOp::Read, threads, secs);

    let latency_secs = secs.min(LATENCY_MAX_SECS).max(1);
    ctx.console
        .step(&format!("Memory latency: random 4K reads, 1 thread, {latency_secs}s"));
    let mut cmd = Command::new("sysbench");
    cmd.args(latency_args(latency_secs));
    let result = measure(
        ctx,
        "sysbench memory latency",
        &mut cmd,
        Duration::from_secs(latency_secs),
        parse_sysbench_memory,
    )
    .and_then(|parsed| {
        latency_ns(&parsed).ok_or_else(|| anyhow!("neither operation rate nor average latency reported"))
    });
    let latency = or_zero(ctx, "Memory latency", result);
    if latency > 0.0 {
        ctx.console
            .success(&format!("Memory latency: {latency:.1} ns"));
    }

    info!(write_mb_s, read_mb_s, latency_ns = latency, "memory benchmark finished");
    MemoryBenchmark {
        threads,
        duration_secs: secs,
        write_mb_s,
        read_mb_s,
        latency_ns: latency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_prefers_operation_rate() {
        let parsed = SysbenchMemory {
            mib_per_sec: 1.0,
            ops_per_sec: Some(10_000_000.0),
            avg_latency_ms: Some(0.01),
        };
        assert_eq!(latency_ns(&parsed), Some(100.0));
    }

    #[test]
    fn latency_falls_back_to_average() {
        let parsed = SysbenchMemory {
            mib_per_sec: 1.0,
            ops_per_sec: None,
            avg_latency_ms: Some(0.00008),
        };
        let ns = latency_ns(&parsed).unwrap();
        assert!((ns - 80.0).abs() < 1e-9);

        let nothing = SysbenchMemory {
            mib_per_sec: 1.0,
            ops_per_sec: Some(0.0),
            avg_latency_ms: None,
        };
        assert_eq!(latency_ns(&nothing), None);
    }

    #[test]
    fn bandwidth_arguments() {
        let args = bandwidth_args(MemoryOp::Read, 8, 30);
        assert!(args.contains(&"--memory-oper=read".to_string()));
        assert!(args.contains(&"--threads=8".to_string()));
        assert!(latency_args(10).contains(&"--memory-access-mode=rnd".to_string()));
    }
}
