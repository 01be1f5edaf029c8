//! Proxmark score calculation.
//!
//! Raw metrics map onto points with fixed factors (no baselines or
//! normalization curves), so a score can be recomputed from any stored report:
//!
//! - CPU: 1 event/s = 1 point, multi + single
//! - Memory: 1 MB/s = 1 point, bandwidth subtotal divided by 100, plus
//!   `10,000,000 / latency_ns`
//! - Disk: 1 IOPS = 1 point, sequential MB/s × 10
//! - Network: 1 Mbps = 1 point, `10,000 / latency_ms` (reported, not weighted)
//!
//! The composite weighs CPU 20%, memory 20% and disk 60%. Its disk term divides
//! the sequential points by 20; the standalone disk subtotal divides by 10.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::benchmark::BenchmarkResults;

/// Bump when the formula changes.
pub const SCORE_VERSION: u32 = 1;

pub const CPU_WEIGHT: f64 = 0.20;
pub const MEMORY_WEIGHT: f64 = 0.20;
pub const DISK_WEIGHT: f64 = 0.60;

const MEMORY_LATENCY_NUMERATOR: f64 = 10_000_000.0;
const NETWORK_LATENCY_NUMERATOR: f64 = 10_000.0;
const MEMORY_BANDWIDTH_DIVISOR: f64 = 100.0;
const SEQ_BANDWIDTH_MULTIPLIER: f64 = 10.0;
/// Sequential divisor in the standalone disk subtotal.
pub const DISK_SUBTOTAL_SEQ_DIVISOR: f64 = 10.0;
/// Sequential divisor in the composite's disk term.
pub const COMPOSITE_SEQ_DIVISOR: f64 = 20.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSet {
    pub cpu_multi: u64,
    pub cpu_single: u64,
    pub memory_write: u64,
    pub memory_read: u64,
    pub memory_latency: u64,
    pub disk_random_iops: u64,
    pub disk_seq_read: u64,
    pub disk_seq_write: u64,
    pub network_bandwidth: u64,
    pub network_latency: u64,

    pub cpu_total: u64,
    pub memory_total: u64,
    pub disk_total: u64,

    pub composite: u64,
    pub version: u32,
}

/// Negative, NaN and infinite metrics count as unmeasured.
fn measured(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// `numerator / value`, or 0 when `value` was not measured.
fn inverse(numerator: f64, value: f64) -> f64 {
    let value = measured(value);
    if value == 0.0 {
        0.0
    } else {
        numerator / value
    }
}

fn points(value: f64) -> u64 {
    value.round() as u64
}

/// Pure function of the raw metrics.
pub fn calculate(results: &BenchmarkResults) -> ScoreSet {
    let cpu_multi = measured(results.cpu.multi_thread.events_per_sec);
    let cpu_single = measured(results.cpu.single_thread.events_per_sec);

    let memory_write = measured(results.memory.write_mb_s);
    let memory_read = measured(results.memory.read_mb_s);
    let memory_latency = inverse(MEMORY_LATENCY_NUMERATOR, results.memory.latency_ns);

    let disk = &results.disk;
    let disk_random = measured(disk.random_rw.read_iops) + measured(disk.random_rw.write_iops);
    let disk_seq_read = measured(disk.seq_read_mb_s) * SEQ_BANDWIDTH_MULTIPLIER;
    let disk_seq_write = measured(disk.seq_write_mb_s) * SEQ_BANDWIDTH_MULTIPLIER;

    let network_bandwidth = measured(results.network.bandwidth_mbps);
    let network_latency = inverse(NETWORK_LATENCY_NUMERATOR, results.network.latency_ms);

    let cpu_total = cpu_multi + cpu_single;
    let memory_total = (memory_write + memory_read) / MEMORY_BANDWIDTH_DIVISOR + memory_latency;
    let disk_total = disk_random + (disk_seq_read + disk_seq_write) / DISK_SUBTOTAL_SEQ_DIVISOR;
    let composite_disk = disk_random + (disk_seq_read + disk_seq_write) / COMPOSITE_SEQ_DIVISOR;

    let composite =
        CPU_WEIGHT * cpu_total + MEMORY_WEIGHT * memory_total + DISK_WEIGHT * composite_disk;

    debug!(
        cpu_total,
        memory_total,
        disk_total,
        composite_disk,
        composite,
        "score calculated"
    );

    ScoreSet {
        cpu_multi: points(cpu_multi),
        cpu_single: points(cpu_single),
        memory_write: points(memory_write),
        memory_read: points(memory_read),
        memory_latency: points(memory_latency),
        disk_random_iops: points(disk_random),
        disk_seq_read: points(disk_seq_read),
        disk_seq_write: points(disk_seq_write),
        network_bandwidth: points(network_bandwidth),
        network_latency: points(network_latency),
        cpu_total: points(cpu_total),
        memory_total: points(memory_total),
        disk_total: points(disk_total),
        composite: points(composite),
        version: SCORE_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{CpuRun, RandomIo};

    fn scenario_a() -> BenchmarkResults {
        let mut results = BenchmarkResults::default();
        results.cpu.multi_thread = CpuRun {
            events_per_sec: 10_000.0,
            threads: 16,
            duration_secs: 60,
        };
        results.cpu.single_thread = CpuRun {
            events_per_sec: 1_000.0,
            threads: 1,
            duration_secs: 30,
        };
        results.memory.write_mb_s = 5_000.0;
        results.memory.read_mb_s = 5_000.0;
        results.disk.random_rw = RandomIo {
            read_iops: 37_500.0,
            write_iops: 12_500.0,
            ..Default::default()
        };
        results.disk.seq_read_mb_s = 1_000.0;
        results.disk.seq_write_mb_s = 1_000.0;
        results
    }

    #[test]
    fn scenario_a_composite() {
        let scores = calculate(&scenario_a());
        assert_eq!(scores.cpu_total, 11_000);
        assert_eq!(scores.memory_total, 100);
        assert_eq!(scores.disk_random_iops, 50_000);
        assert_eq!(scores.disk_seq_read, 10_000);
        assert_eq!(scores.disk_seq_write, 10_000);
        assert_eq!(scores.disk_total, 52_000);
        assert_eq!(scores.composite, 32_820);
    }

    #[test]
    fn identical_inputs_give_identical_scores() {
        let mut results = scenario_a();
        results.memory.latency_ns = 87.3;
        results.network.bandwidth_mbps = 9412.7;
        results.network.latency_ms = 0.21;
        assert_eq!(calculate(&results), calculate(&results.clone()));
    }

    #[test]
    fn latency_scores_are_inverse() {
        let mut results = BenchmarkResults::default();
        results.memory.latency_ns = 100.0;
        results.network.latency_ms = 0.5;
        let scores = calculate(&results);
        assert_eq!(scores.memory_latency, 100_000);
        assert_eq!(scores.memory_total, 100_000);
        assert_eq!(scores.network_latency, 20_000);
    }

    #[test]
    fn unmeasured_metrics_score_zero() {
        let scores = calculate(&BenchmarkResults::default());
        assert_eq!(
            scores,
            ScoreSet {
                version: SCORE_VERSION,
                ..Default::default()
            }
        );

        let mut results = BenchmarkResults::default();
        results.memory.latency_ns = f64::NAN;
        results.network.latency_ms = -1.0;
        results.cpu.multi_thread.events_per_sec = f64::INFINITY;
        let scores = calculate(&results);
        assert_eq!(scores.memory_latency, 0);
        assert_eq!(scores.network_latency, 0);
        assert_eq!(scores.composite, 0);
    }

    #[test]
    fn network_does_not_affect_composite() {
        let base = calculate(&scenario_a());
        let mut results = scenario_a();
        results.network.bandwidth_mbps = 10_000.0;
        results.network.latency_ms = 0.1;
        let with_network = calculate(&results);
        assert_eq!(base.composite, with_network.composite);
        assert_eq!(with_network.network_bandwidth, 10_000);
        assert_eq!(with_network.network_latency, 100_000);
    }
}
