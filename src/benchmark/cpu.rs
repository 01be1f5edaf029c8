//! sysbench CPU runs (all logical cores, then one thread).

use std::process::Command;
use std::time::Duration;
use tracing::info;

use super::parse::parse_sysbench_cpu;
use super::power::{EnergyCounter, PowerSampler};
use super::{logical_cores, measure, or_zero, CpuBenchmark, CpuRun};
use crate::context::RunContext;

const MAX_PRIME: u32 = 20_000;

pub fn sysbench_cpu_args(threads: usize, secs: u64) -> Vec<String> {
    vec![
        "cpu".to_string(),
        format!("--cpu-max-prime={MAX_PRIME}"),
        format!("--threads={threads}"),
        format!("--time={secs}"),
        "run".to_string(),
    ]
}

fn run_once(ctx: &mut RunContext, what: &str, threads: usize, secs: u64) -> CpuRun {
    ctx.console
        .step(&format!("{what}: sysbench cpu, {threads} thread(s), {secs}s"));
    let mut cmd = Command::new("sysbench");
    cmd.args(sysbench_cpu_args(threads, secs));
    let label = format!("sysbench cpu ({threads} threads)");
    let result = measure(ctx, &label, &mut cmd, Duration::from_secs(secs), parse_sysbench_cpu);
    let events_per_sec = or_zero(ctx, what, result);
    info!(threads, secs, events_per_sec, "cpu run finished");
    if events_per_sec > 0.0 {
        ctx.console
            .success(&format!("{what}: {events_per_sec:.2} events/s"));
    }
    CpuRun {
        events_per_sec,
        threads,
        duration_secs: secs,
    }
}

pub fn run(ctx: &mut RunContext) -> CpuBenchmark {
    let threads = logical_cores();
    let durations = ctx.config.durations;

    let sampler = EnergyCounter::detect()
        .map(|counter| PowerSampler::start(counter, ctx.config.power_interval));
    if sampler.is_none() {
        info!("no readable RAPL energy counter; power not sampled");
    }

    let multi_thread = run_once(ctx, "CPU multi-thread", threads, durations.cpu_multi_secs);
    let single_thread = run_once(ctx, "CPU single-thread", 1, durations.cpu_single_secs);

    let power = sampler.map(PowerSampler::finish);
    if let Some(power) = &power {
        info!(avg_watts = power.avg_watts, samples = power.samples, "power sampling finished");
        if power.samples > 0 {
            ctx.console
                .success(&format!("Package power under load: {:.1} W", power.avg_watts));
        }
    }

    CpuBenchmark {
        multi_thread,
        single_thread,
        power,
    }
}
