//! Run report: the JSON document, the terminal summary and the log/debug files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::benchmark::{BenchmarkResults, DiskBenchmark};
use crate::config::RunConfig;
use crate::context::DebugDump;
use crate::hardware::SystemInventory;
use crate::score::ScoreSet;

/// One complete run. The field names and nesting are the public JSON layout.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: String,
    pub run_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub system: SystemInventory,
    pub config: RunConfig,
    pub benchmarks: BenchmarkResults,
    pub scores: ScoreSet,
    pub tags: Vec<String>,
    pub notes: String,
}

impl RunReport {
    pub fn new(
        config: RunConfig,
        system: SystemInventory,
        benchmarks: BenchmarkResults,
        scores: ScoreSet,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: Uuid::new_v4().to_string(),
            timestamp_utc: Utc::now(),
            tags: config.tags.clone(),
            notes: config.notes.clone(),
            system,
            config,
            benchmarks,
            scores,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize run report")
    }

    /// Write `json` to `path`, creating the parent directory when needed.
    pub fn write_json(path: &Path, json: &str) -> Result<()> {
        ensure_parent(path)?;
        fs::write(path, format!("{json}\n"))
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        info!(path = %path.display(), "result file written");
        Ok(())
    }

    /// Score table as plain text (no ANSI codes), for the log file.
    pub fn render_summary(&self) -> String {
        summary_rows(self)
            .iter()
            .map(|row| row.plain())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    /// Inventory box plus the score table, coloured when colour is enabled.
    pub fn print_summary(&self) {
        println!("{}", self.system.display());
        for row in summary_rows(self) {
            println!("{}", row.styled());
        }
    }

    /// Append the plaintext summary to the log file.
    pub fn append_log(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        writeln!(
            file,
            "Proxmark {} run {} at {}",
            self.version,
            self.run_id,
            self.timestamp_utc.to_rfc3339()
        )?;
        write!(file, "{}", self.system.display())?;
        write!(file, "{}", self.render_summary())?;
        writeln!(file)?;
        Ok(())
    }
}

/// Write the `--debug` dump. Does nothing when debug mode is off.
pub fn write_debug(path: &Path, dump: &DebugDump) -> Result<()> {
    if !dump.enabled() {
        return Ok(());
    }
    ensure_parent(path)?;
    fs::write(path, dump.render())
        .with_context(|| format!("Failed to write debug dump to {}", path.display()))?;
    info!(path = %path.display(), "debug dump written");
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display())),
        _ => Ok(()),
    }
}

const TABLE_WIDTH: usize = 62;
const LABEL_WIDTH: usize = 22;
const RAW_WIDTH: usize = 24;

enum Row {
    Rule(char, char),
    Title(String),
    Metric { label: String, raw: String, points: String },
    Total { label: String, points: u64 },
    Composite(u64),
}

impl Row {
    fn metric(label: impl Into<String>, raw: String, points: u64) -> Self {
        Row::Metric {
            label: label.into(),
            raw,
            points: points.to_string(),
        }
    }

    fn cells(&self) -> Option<String> {
        let points_width = TABLE_WIDTH - 2 - LABEL_WIDTH - RAW_WIDTH;
        match self {
            Row::Rule(..) => None,
            Row::Title(title) => Some(format!("{title:^TABLE_WIDTH$}")),
            Row::Metric { label, raw, points } => Some(format!(
                " {:<LABEL_WIDTH$}{:>RAW_WIDTH$}{:>points_width$} ",
                truncate(label, LABEL_WIDTH),
                truncate(raw, RAW_WIDTH),
                points
            )),
            Row::Total { label, points } => Some(format!(
                " {:<w$}{:>points_width$} ",
                label,
                points,
                w = LABEL_WIDTH + RAW_WIDTH
            )),
            Row::Composite(points) => Some(format!(
                " {:<w$}{:>points_width$} ",
                "PROXMARK SCORE",
                points,
                w = LABEL_WIDTH + RAW_WIDTH
            )),
        }
    }

    fn plain(&self) -> String {
        match self {
            Row::Rule(left, right) => format!("{left}{}{right}", "═".repeat(TABLE_WIDTH)),
            _ => format!("║{}║", self.cells().unwrap_or_default()),
        }
    }

    fn styled(&self) -> String {
        let text = match self {
            Row::Rule(..) => return self.plain().bright_cyan().to_string(),
            _ => self.cells().unwrap_or_default(),
        };
        let text = match self {
            Row::Title(_) => text.bright_white().bold().to_string(),
            Row::Total { .. } => text.bold().to_string(),
            Row::Composite(_) => text.bright_green().bold().to_string(),
            _ => text,
        };
        format!("{}{}{}", "║".bright_cyan(), text, "║".bright_cyan())
    }
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

fn disk_rows(rows: &mut Vec<Row>, label: &str, disk: &DiskBenchmark) {
    if let Some(reason) = &disk.skipped {
        rows.push(Row::Metric {
            label: label.to_string(),
            raw: format!("skipped: {reason}"),
            points: "-".to_string(),
        });
        return;
    }
    rows.push(Row::Metric {
        label: label.to_string(),
        raw: format!("{:.0} IOPS", disk.random_rw.total_iops()),
        points: "-".to_string(),
    });
    rows.push(Row::Metric {
        label: String::new(),
        raw: format!("{:.0}/{:.0} MB/s r/w", disk.seq_read_mb_s, disk.seq_write_mb_s),
        points: "-".to_string(),
    });
}

fn summary_rows(report: &RunReport) -> Vec<Row> {
    let bench = &report.benchmarks;
    let scores = &report.scores;
    let mut rows = vec![
        Row::Rule('╔', '╗'),
        Row::Title("PROXMARK RESULTS".to_string()),
        Row::Rule('╠', '╣'),
        Row::metric(
            "CPU multi-thread",
            format!("{:.2} ev/s", bench.cpu.multi_thread.events_per_sec),
            scores.cpu_multi,
        ),
        Row::metric(
            "CPU single-thread",
            format!("{:.2} ev/s", bench.cpu.single_thread.events_per_sec),
            scores.cpu_single,
        ),
    ];
    if let Some(power) = &bench.cpu.power {
        rows.push(Row::Metric {
            label: "CPU package power".to_string(),
            raw: format!("{:.1} W avg / {:.1} W peak", power.avg_watts, power.peak_watts),
            points: "-".to_string(),
        });
    }
    rows.push(Row::Total {
        label: "CPU subtotal".to_string(),
        points: scores.cpu_total,
    });
    rows.push(Row::Rule('╠', '╣'));

    rows.push(Row::metric(
        "Memory write",
        format!("{:.1} MB/s", bench.memory.write_mb_s),
        scores.memory_write,
    ));
    rows.push(Row::metric(
        "Memory read",
        format!("{:.1} MB/s", bench.memory.read_mb_s),
        scores.memory_read,
    ));
    rows.push(Row::metric(
        "Memory latency",
        format!("{:.1} ns", bench.memory.latency_ns),
        scores.memory_latency,
    ));
    rows.push(Row::Total {
        label: "Memory subtotal".to_string(),
        points: scores.memory_total,
    });
    rows.push(Row::Rule('╠', '╣'));

    let disk = &bench.disk;
    if let Some(reason) = &disk.skipped {
        rows.push(Row::Metric {
            label: "Disk".to_string(),
            raw: format!("skipped: {reason}"),
            points: "0".to_string(),
        });
    }
    rows.push(Row::metric(
        "Disk random 4K",
        format!("{:.0} IOPS", disk.random_rw.total_iops()),
        scores.disk_random_iops,
    ));
    rows.push(Row::metric(
        "Disk seq read",
        format!("{:.1} MB/s", disk.seq_read_mb_s),
        scores.disk_seq_read,
    ));
    rows.push(Row::metric(
        "Disk seq write",
        format!("{:.1} MB/s", disk.seq_write_mb_s),
        scores.disk_seq_write,
    ));
    rows.push(Row::Total {
        label: "Disk subtotal".to_string(),
        points: scores.disk_total,
    });

    if !bench.additional_disks.is_empty() {
        rows.push(Row::Rule('╠', '╣'));
        for extra in &bench.additional_disks {
            disk_rows(&mut rows, &extra.path.display().to_string(), extra);
        }
    }

    if let Some(target) = &bench.network.target {
        rows.push(Row::Rule('╠', '╣'));
        rows.push(Row::metric(
            format!("Net {target}"),
            format!("{:.0} Mbps", bench.network.bandwidth_mbps),
            scores.network_bandwidth,
        ));
        rows.push(Row::metric(
            "Net latency",
            format!("{:.3} ms", bench.network.latency_ms),
            scores.network_latency,
        ));
    }

    rows.push(Row::Rule('╠', '╣'));
    rows.push(Row::Composite(scores.composite));
    rows.push(Row::Rule('╚', '╝'));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{CpuRun, NetworkBenchmark};
    use crate::score;

    fn sample_report() -> RunReport {
        let mut config = RunConfig::for_tests();
        config.tags = vec!["prod".into(), "nvme".into()];
        config.notes = "after firmware update".into();

        let mut benchmarks = BenchmarkResults::default();
        benchmarks.cpu.multi_thread = CpuRun {
            events_per_sec: 10_000.0,
            threads: 16,
            duration_secs: 60,
        };
        benchmarks.disk.seq_read_mb_s = 1_000.0;
        benchmarks.network = NetworkBenchmark {
            target: Some("10.0.0.5:5201".into()),
            bandwidth_mbps: 9_400.0,
            latency_ms: 0.2,
            latency_source: Some("iperf3".into()),
        };
        let scores = score::calculate(&benchmarks);
        RunReport::new(config, SystemInventory::default(), benchmarks, scores)
    }

    #[test]
    fn json_has_stable_top_level_keys() {
        let report = sample_report();
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "version",
            "run_id",
            "timestamp_utc",
            "system",
            "config",
            "benchmarks",
            "scores",
            "tags",
            "notes",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(value["tags"], serde_json::json!(["prod", "nvme"]));
        assert_eq!(value["notes"], "after firmware update");
        assert_eq!(value["config"]["cpu_multi_secs"], 60);
        assert_eq!(value["scores"]["cpu_multi"], 10_000);
        assert!(value["config"].get("output_path").is_none());
    }

    #[test]
    fn json_contains_no_ansi_codes() {
        let json = sample_report().to_json().unwrap();
        assert!(!json.contains('\u{1b}'));
    }

    #[test]
    fn files_are_written_under_new_directories() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();
        let json_path = dir.path().join("nested").join("run.json");
        let json = report.to_json().unwrap();
        RunReport::write_json(&json_path, &json).unwrap();
        let written = fs::read_to_string(&json_path).unwrap();
        assert_eq!(written.trim_end(), json);

        let log_path = json_path.with_extension("log");
        report.append_log(&log_path).unwrap();
        report.append_log(&log_path).unwrap();
        let log = fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.matches("PROXMARK SCORE").count(), 2);
        assert!(!log.contains('\u{1b}'));
    }

    #[test]
    fn debug_dump_only_written_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.debug");
        write_debug(&path, &DebugDump::new(false)).unwrap();
        assert!(!path.exists());

        let mut dump = DebugDump::new(true);
        dump.record("sysbench cpu", "events per second: 1234.56");
        write_debug(&path, &dump).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("1234.56"));
    }

    #[test]
    fn summary_rows_share_one_width() {
        let summary = sample_report().render_summary();
        let widths: Vec<usize> = summary.lines().map(|l| l.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == widths[0]), "{summary}");
        assert!(summary.contains("Net 10.0.0.5:5201"));
    }
}
