//! Tool output parsers.
//!
//! One `parse_*` function per tool. Text tools (sysbench, ping) are matched
//! line by line; fio and iperf3 are run in JSON mode and read through
//! `serde_json::Value`.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::ParseError;

fn number(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    let value = raw.trim();
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() && parsed >= 0.0 => Ok(parsed),
        _ => Err(ParseError::InvalidNumber {
            field,
            value: value.to_string(),
        }),
    }
}

fn non_empty(output: &str) -> Result<&str, ParseError> {
    if output.trim().is_empty() {
        Err(ParseError::Empty)
    } else {
        Ok(output)
    }
}

/// `sysbench cpu run`: `events per second:  1234.56`
pub fn parse_sysbench_cpu(output: &str) -> Result<f64, ParseError> {
    let output = non_empty(output)?;
    let rest = output
        .lines()
        .find_map(|line| line.split("events per second:").nth(1))
        .ok_or(ParseError::MissingField("events per second"))?;
    number("events per second", rest)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SysbenchMemory {
    pub mib_per_sec: f64,
    pub ops_per_sec: Option<f64>,
    /// Average per-event latency in ms
    pub avg_latency_ms: Option<f64>,
}

/// `sysbench memory run`.
///
/// Throughput comes from `102400.00 MiB transferred (10234.56 MiB/sec)`
/// (sysbench 1.0) or `transferred (MiB/sec):  10234.56` (newer builds).
pub fn parse_sysbench_memory(output: &str) -> Result<SysbenchMemory, ParseError> {
    static TRANSFERRED: OnceLock<Option<Regex>> = OnceLock::new();
    static OPERATIONS: OnceLock<Option<Regex>> = OnceLock::new();
    let output = non_empty(output)?;

    let transferred = TRANSFERRED
        .get_or_init(|| Regex::new(r"\(([0-9]+(?:\.[0-9]+)?) MiB/sec\)").ok())
        .as_ref()
        .and_then(|re| re.captures(output))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            output
                .lines()
                .find_map(|line| line.split("transferred (MiB/sec):").nth(1))
                .map(str::to_string)
        })
        .ok_or(ParseError::MissingField("MiB/sec"))?;
    let mib_per_sec = number("MiB/sec", &transferred)?;

    let ops_per_sec = OPERATIONS
        .get_or_init(|| Regex::new(r"Total operations:\s*[0-9]+\s*\(\s*([0-9]+(?:\.[0-9]+)?) per second\)").ok())
        .as_ref()
        .and_then(|re| re.captures(output))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let avg_latency_ms = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("avg:"))
        .and_then(|rest| rest.trim().parse::<f64>().ok());

    Ok(SysbenchMemory {
        mib_per_sec,
        ops_per_sec,
        avg_latency_ms,
    })
}

/// Per-direction numbers from one fio run, summed over jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FioMetrics {
    pub read_iops: f64,
    pub write_iops: f64,
    /// KiB/s, as fio reports `bw`
    pub read_bw_kib: f64,
    pub write_bw_kib: f64,
    /// Mean completion latency in microseconds
    pub read_lat_us: f64,
    pub write_lat_us: f64,
}

impl FioMetrics {
    pub fn read_mb_s(&self) -> f64 {
        self.read_bw_kib / 1024.0
    }

    pub fn write_mb_s(&self) -> f64 {
        self.write_bw_kib / 1024.0
    }
}

/// Strip anything fio prints before the JSON document (warnings, notes).
fn json_document(output: &str) -> Result<Value, ParseError> {
    let output = non_empty(output)?;
    let start = output
        .find('{')
        .ok_or_else(|| ParseError::InvalidJson("no JSON object in output".to_string()))?;
    serde_json::from_str(&output[start..]).map_err(|err| ParseError::InvalidJson(err.to_string()))
}

/// `fio --output-format=json`: `jobs[].read|write.{iops,bw,clat_ns.mean}`.
pub fn parse_fio(output: &str) -> Result<FioMetrics, ParseError> {
    let json = json_document(output)?;
    let jobs = json
        .get("jobs")
        .and_then(Value::as_array)
        .filter(|jobs| !jobs.is_empty())
        .ok_or(ParseError::MissingField("jobs"))?;

    let mut metrics = FioMetrics::default();
    let mut read_lat = Vec::new();
    let mut write_lat = Vec::new();
    for job in jobs {
        if let Some(read) = job.get("read") {
            metrics.read_iops += read.get("iops").and_then(Value::as_f64).unwrap_or(0.0);
            metrics.read_bw_kib += read.get("bw").and_then(Value::as_f64).unwrap_or(0.0);
            read_lat.extend(fio_latency_us(read));
        }
        if let Some(write) = job.get("write") {
            metrics.write_iops += write.get("iops").and_then(Value::as_f64).unwrap_or(0.0);
            metrics.write_bw_kib += write.get("bw").and_then(Value::as_f64).unwrap_or(0.0);
            write_lat.extend(fio_latency_us(write));
        }
    }
    metrics.read_lat_us = mean(&read_lat);
    metrics.write_lat_us = mean(&write_lat);

    if metrics.read_iops == 0.0 && metrics.write_iops == 0.0 && metrics.read_bw_kib == 0.0 && metrics.write_bw_kib == 0.0 {
        return Err(ParseError::MissingField("jobs[].read/write"));
    }
    Ok(metrics)
}

/// fio 3.x reports `clat_ns`; older builds `clat` in microseconds.
fn fio_latency_us(direction: &Value) -> Option<f64> {
    let ns = direction
        .get("clat_ns")
        .or_else(|| direction.get("lat_ns"))
        .and_then(|lat| lat.get("mean"))
        .and_then(Value::as_f64)
        .map(|ns| ns / 1000.0);
    ns.or_else(|| direction.get("clat")?.get("mean")?.as_f64())
        .filter(|us| *us > 0.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IperfMetrics {
    pub bandwidth_mbps: f64,
    /// Mean TCP round trip in milliseconds, when the sender reports it
    pub rtt_ms: Option<f64>,
}

/// `iperf3 -J`: receiver throughput and the sender's `mean_rtt` (µs).
pub fn parse_iperf3(output: &str) -> Result<IperfMetrics, ParseError> {
    let json = json_document(output)?;
    if let Some(error) = json.get("error").and_then(Value::as_str) {
        return Err(ParseError::ToolReported(error.to_string()));
    }
    let end = json.get("end").ok_or(ParseError::MissingField("end"))?;
    let bits = end
        .get("sum_received")
        .or_else(|| end.get("sum_sent"))
        .or_else(|| end.get("sum"))
        .and_then(|sum| sum.get("bits_per_second"))
        .and_then(Value::as_f64)
        .ok_or(ParseError::MissingField("end.sum_received.bits_per_second"))?;

    let rtt_ms = end
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| streams.first())
        .and_then(|stream| stream.get("sender"))
        .and_then(|sender| sender.get("mean_rtt"))
        .and_then(Value::as_f64)
        .filter(|us| *us > 0.0)
        .map(|us| us / 1000.0);

    Ok(IperfMetrics {
        bandwidth_mbps: bits / 1_000_000.0,
        rtt_ms,
    })
}

/// `ping` summary: `rtt min/avg/max/mdev = 0.123/0.456/0.789/0.012 ms`
/// (`round-trip min/avg/max` on busybox).
pub fn parse_ping_avg(output: &str) -> Result<f64, ParseError> {
    let output = non_empty(output)?;
    let line = output
        .lines()
        .find(|line| line.contains("min/avg/max"))
        .ok_or(ParseError::MissingField("min/avg/max"))?;
    let values = line
        .split('=')
        .nth(1)
        .ok_or(ParseError::MissingField("min/avg/max"))?;
    let avg = values
        .trim()
        .split('/')
        .nth(1)
        .ok_or(ParseError::MissingField("avg"))?;
    number("avg", avg)
}
