//! fio runs against one storage path: 4K random read/write, then 1M
//! sequential write and read.

use anyhow::Result;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::parse::{parse_fio, FioMetrics};
use super::{measure, or_zero, DiskBenchmark, RandomIo};
use crate::context::{RunContext, ScratchFile};
use crate::hardware::disk::DiskInfo;
use crate::storage::{self, FsUsage};

/// Smallest test file worth running fio against.
pub const MIN_FILE_MB: u64 = 64;
/// Space left free on the target after the test file is written.
pub const RESERVE_MB: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSizePlan {
    Full(u64),
    Shrunk { requested_mb: u64, size_mb: u64 },
    Skip { available_mb: u64 },
}

/// Fit the test file into the free space, keeping [`RESERVE_MB`] spare.
pub fn plan_file_size(requested_mb: u64, available_bytes: Option<u64>) -> FileSizePlan {
    let Some(available_bytes) = available_bytes else {
        return FileSizePlan::Full(requested_mb);
    };
    let available_mb = available_bytes / (1024 * 1024);
    let usable_mb = available_mb.saturating_sub(RESERVE_MB);
    if usable_mb >= requested_mb {
        FileSizePlan::Full(requested_mb)
    } else if usable_mb >= MIN_FILE_MB {
        FileSizePlan::Shrunk {
            requested_mb,
            size_mb: usable_mb,
        }
    } else {
        FileSizePlan::Skip { available_mb }
    }
}

/// I/O engine and O_DIRECT choice. RAM-backed filesystems support neither
/// libaio nor O_DIRECT reliably.
pub fn io_engine(ram_backed: bool) -> (&'static str, bool) {
    if ram_backed {
        ("sync", false)
    } else {
        ("libaio", true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FioJob {
    pub name: &'static str,
    pub rw: &'static str,
    pub block_size: &'static str,
    pub iodepth: u32,
    pub rwmixread: Option<u32>,
}

pub const RANDOM_RW: FioJob = FioJob {
    name: "randrw",
    rw: "randrw",
    block_size: "4k",
    iodepth: 64,
    rwmixread: Some(75),
};

pub const SEQ_WRITE: FioJob = FioJob {
    name: "seqwrite",
    rw: "write",
    block_size: "1M",
    iodepth: 16,
    rwmixread: None,
};

pub const SEQ_READ: FioJob = FioJob {
    name: "seqread",
    rw: "read",
    block_size: "1M",
    iodepth: 16,
    rwmixread: None,
};

pub fn fio_args(
    job: &FioJob,
    file: &Path,
    size_mb: u64,
    engine: &str,
    direct: bool,
    secs: u64,
) -> Vec<String> {
    let mut args = vec![
        format!("--name=proxmark-{}", job.name),
        format!("--filename={}", file.display()),
        format!("--size={size_mb}M"),
        format!("--rw={}", job.rw),
        format!("--bs={}", job.block_size),
        format!("--iodepth={}", job.iodepth),
        format!("--ioengine={engine}"),
        format!("--direct={}", u8::from(direct)),
        "--numjobs=1".to_string(),
        "--group_reporting".to_string(),
        "--time_based".to_string(),
        format!("--runtime={secs}"),
        "--output-format=json".to_string(),
    ];
    if let Some(mix) = job.rwmixread {
        args.push(format!("--rwmixread={mix}"));
    }
    args
}

struct JobSetup<'a> {
    file: &'a Path,
    size_mb: u64,
    engine: &'static str,
    direct: bool,
    secs: u64,
}

/// Run one fio job; a failing O_DIRECT run is retried with buffered I/O.
fn run_job(ctx: &mut RunContext, job: &FioJob, setup: &JobSetup<'_>) -> Result<FioMetrics> {
    let attempt = |ctx: &mut RunContext, direct: bool| {
        let mut cmd = Command::new("fio");
        cmd.args(fio_args(job, setup.file, setup.size_mb, setup.engine, direct, setup.secs));
        let label = format!("fio {}", job.name);
        measure(ctx, &label, &mut cmd, Duration::from_secs(setup.secs), parse_fio)
    };

    match attempt(ctx, setup.direct) {
        Err(err) if setup.direct => {
            warn!(job = job.name, error = %format!("{err:#}"), "fio with O_DIRECT failed; retrying buffered");
            attempt(ctx, false)
        }
        other => other,
    }
}

pub fn run(ctx: &mut RunContext, path: &Path, device: Option<DiskInfo>) -> DiskBenchmark {
    let secs = ctx.config.durations.disk_secs;
    let mut result = DiskBenchmark {
        path: path.to_path_buf(),
        duration_secs: secs,
        device,
        ..Default::default()
    };

    if !path.is_dir() {
        let reason = format!("{} is not a directory", path.display());
        ctx.degrade(&format!("Disk benchmark for {}", path.display()), &reason);
        result.skipped = Some(reason);
        return result;
    }

    let usage: Option<FsUsage> = storage::probe(path);
    result.ram_backed = usage.as_ref().is_some_and(FsUsage::is_ram_backed);
    let (engine, direct) = io_engine(result.ram_backed);
    result.engine = engine.to_string();
    if result.ram_backed {
        let fs_type = usage.as_ref().map(|u| u.fs_type.as_str()).unwrap_or("tmpfs");
        warn!(path = %path.display(), fs_type, "benchmark path is RAM-backed");
        let location = format!("{} is on {fs_type}.", path.display());
        ctx.console.loud_warn(
            "RAM-BACKED BENCHMARK PATH",
            &[
                location.as_str(),
                "Disk results will reflect memory speed, not storage speed.",
                "Using the synchronous I/O engine without O_DIRECT.",
            ],
        );
    }

    let requested_mb = ctx.config.disk_size_mb;
    let size_mb = match plan_file_size(requested_mb, usage.as_ref().map(FsUsage::available_bytes)) {
        FileSizePlan::Full(size) => size,
        FileSizePlan::Shrunk {
            requested_mb,
            size_mb,
        } => {
            ctx.console.warn(&format!(
                "Low free space on {}: test file shrunk from {requested_mb} MiB to {size_mb} MiB",
                path.display()
            ));
            size_mb
        }
        FileSizePlan::Skip { available_mb } => {
            let reason = format!("only {available_mb} MiB free on {}", path.display());
            ctx.degrade(&format!("Disk benchmark for {}", path.display()), &reason);
            result.skipped = Some(reason);
            return result;
        }
    };
    result.file_size_mb = size_mb;

    let scratch = ScratchFile::new(
        path.join(format!(".proxmark-{}.fio", Uuid::new_v4().simple())),
        &ctx.cleanup,
    );
    debug!(file = %scratch.path().display(), size_mb, engine, "disk test file");
    let setup = JobSetup {
        file: scratch.path(),
        size_mb,
        engine,
        direct,
        secs,
    };

    ctx.console.step(&format!(
        "Disk random 4K read/write on {} ({size_mb} MiB, {engine}, {secs}s)",
        path.display()
    ));
    let random = run_job(ctx, &RANDOM_RW, &setup);
    let random = or_zero(ctx, "Disk random read/write", random);
    result.random_rw = RandomIo {
        read_iops: random.read_iops,
        write_iops: random.write_iops,
        read_latency_us: random.read_lat_us,
        write_latency_us: random.write_lat_us,
    };

    ctx.console.step(&format!("Disk sequential 1M write ({secs}s)"));
    let seq_write = run_job(ctx, &SEQ_WRITE, &setup);
    result.seq_write_mb_s = or_zero(ctx, "Disk sequential write", seq_write).write_mb_s();

    ctx.console.step(&format!("Disk sequential 1M read ({secs}s)"));
    let seq_read = run_job(ctx, &SEQ_READ, &setup);
    result.seq_read_mb_s = or_zero(ctx, "Disk sequential read", seq_read).read_mb_s();

    drop(scratch);

    info!(
        path = %path.display(),
        iops = result.random_rw.total_iops(),
        seq_read_mb_s = result.seq_read_mb_s,
        seq_write_mb_s = result.seq_write_mb_s,
        "disk benchmark finished"
    );
    ctx.console.success(&format!(
        "Disk: {:.0} IOPS, {:.1} MB/s read, {:.1} MB/s write",
        result.random_rw.total_iops(),
        result.seq_read_mb_s,
        result.seq_write_mb_s
    ));
    result
}
