//! Benchmark storage discovery
//!
//! Finds places worth benchmarking besides the primary path:
//! - Proxmox storage pools from /etc/pve/storage.cfg (dir, nfs, cifs, zfspool, lvm)
//! - external mounts under /mnt and /media
//!
//! RAM-backed filesystems and anything with less than 2 GiB free are dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::exec::capture_stdout;

pub const MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const RAM_FILESYSTEMS: &[&str] = &["tmpfs", "ramfs", "devtmpfs"];
const STORAGE_CFG: &str = "/etc/pve/storage.cfg";
const EXTERNAL_MOUNT_ROOTS: &[&str] = &["/mnt/", "/media/"];

/// One line of `df -P -T -k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    pub source: String,
    pub fs_type: String,
    pub total_kb: u64,
    pub available_kb: u64,
    pub mount_point: PathBuf,
}

impl FsUsage {
    pub fn is_ram_backed(&self) -> bool {
        RAM_FILESYSTEMS.contains(&self.fs_type.as_str())
    }

    pub fn available_bytes(&self) -> u64 {
        self.available_kb.saturating_mul(1024)
    }
}

/// Filesystem facts for `path`, or `None` when df cannot answer.
pub fn probe(path: &Path) -> Option<FsUsage> {
    let target = path.to_string_lossy();
    let text = capture_stdout("df", &["-P", "-T", "-k", target.as_ref()])?;
    parse_df(&text)
}

pub(crate) fn parse_df(text: &str) -> Option<FsUsage> {
    let line = text.lines().skip(1).find(|line| !line.trim().is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 7 {
        return None;
    }
    Some(FsUsage {
        source: fields[0].to_string(),
        fs_type: fields[1].to_string(),
        total_kb: fields[2].parse().ok()?,
        available_kb: fields[4].parse().ok()?,
        mount_point: PathBuf::from(fields[6..].join(" ")),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum CandidateOrigin {
    Primary,
    ProxmoxPool(String),
    ExternalMount,
}

impl std::fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateOrigin::Primary => write!(f, "primary"),
            CandidateOrigin::ProxmoxPool(name) => write!(f, "pool {name}"),
            CandidateOrigin::ExternalMount => write!(f, "mount"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCandidate {
    pub path: PathBuf,
    pub origin: CandidateOrigin,
    pub usage: Option<FsUsage>,
}

impl StorageCandidate {
    pub fn describe(&self) -> String {
        match &self.usage {
            Some(usage) => format!(
                "{} ({}, {}, {:.1} GB free)",
                self.path.display(),
                self.origin,
                usage.fs_type,
                usage.available_kb as f64 / 1024.0 / 1024.0
            ),
            None => format!("{} ({})", self.path.display(), self.origin),
        }
    }
}

/// A section of `/etc/pve/storage.cfg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PveStorage {
    pub storage_type: String,
    pub name: String,
    pub path: Option<String>,
    pub pool: Option<String>,
    pub vgname: Option<String>,
    pub disabled: bool,
}

pub(crate) fn parse_storage_cfg(text: &str) -> Vec<PveStorage> {
    let mut entries = Vec::new();
    let mut current: Option<PveStorage> = None;

    for line in text.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            if let Some((ty, name)) = line.split_once(':') {
                entries.extend(current.take());
                current = Some(PveStorage {
                    storage_type: ty.trim().to_string(),
                    name: name.trim().to_string(),
                    ..Default::default()
                });
            }
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default();
        let value = parts.next().map(|v| v.trim().to_string());
        match key {
            "path" => entry.path = value,
            "pool" => entry.pool = value,
            "vgname" => entry.vgname = value,
            "disable" => entry.disabled = true,
            _ => {}
        }
    }
    entries.extend(current);
    entries
}

/// Mount point of a ZFS dataset, unless it is unmounted or legacy.
fn zfs_mountpoint(dataset: &str) -> Option<PathBuf> {
    let text = capture_stdout("zfs", &["get", "-H", "-o", "value", "mountpoint", dataset])?;
    let value = text.trim();
    match value {
        "" | "-" | "none" | "legacy" => None,
        path => Some(PathBuf::from(path)),
    }
}

/// `(source, mount point, fs type)` triples from `/proc/mounts`.
pub(crate) fn parse_mounts(text: &str) -> Vec<(String, PathBuf, String)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount = fields.next()?;
            let fs_type = fields.next()?;
            Some((
                source.to_string(),
                PathBuf::from(unescape_mount(mount)),
                fs_type.to_string(),
            ))
        })
        .collect()
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Filesystem paths behind the configured Proxmox pools. `active` limits the
/// result to pools `pvesm status` reports as active (empty means no filter).
pub(crate) fn pool_paths(
    storages: &[PveStorage],
    active: &BTreeSet<String>,
    mounts: &[(String, PathBuf, String)],
    zfs_lookup: impl Fn(&str) -> Option<PathBuf>,
) -> Vec<(PathBuf, CandidateOrigin)> {
    let mut paths = Vec::new();
    for storage in storages {
        if storage.disabled || (!active.is_empty() && !active.contains(&storage.name)) {
            continue;
        }
        let origin = CandidateOrigin::ProxmoxPool(storage.name.clone());
        match storage.storage_type.as_str() {
            "dir" | "nfs" | "cifs" | "glusterfs" | "cephfs" => {
                if let Some(path) = &storage.path {
                    paths.push((PathBuf::from(path), origin));
                }
            }
            "zfspool" => {
                if let Some(path) = storage.pool.as_deref().and_then(&zfs_lookup) {
                    paths.push((path, origin));
                }
            }
            "lvm" | "lvmthin" => {
                // Block storage; only benchmarkable where one of its LVs is mounted.
                let Some(vg) = &storage.vgname else {
                    continue;
                };
                let mapper_prefix = format!("/dev/mapper/{}-", vg.replace('-', "--"));
                let lv_prefix = format!("/dev/{vg}/");
                for (source, mount, _) in mounts {
                    if source.starts_with(&mapper_prefix) || source.starts_with(&lv_prefix) {
                        paths.push((mount.clone(), origin.clone()));
                    }
                }
            }
            other => debug!(storage = %storage.name, kind = other, "storage type not benchmarkable"),
        }
    }
    paths
}

pub(crate) fn external_mounts(mounts: &[(String, PathBuf, String)]) -> Vec<(PathBuf, CandidateOrigin)> {
    mounts
        .iter()
        .filter(|(_, mount, fs_type)| {
            let mount = mount.to_string_lossy();
            EXTERNAL_MOUNT_ROOTS.iter().any(|root| mount.starts_with(root))
                && !RAM_FILESYSTEMS.contains(&fs_type.as_str())
        })
        .map(|(_, mount, _)| (mount.clone(), CandidateOrigin::ExternalMount))
        .collect()
}

/// Probe, filter and de-duplicate candidate paths. The primary path is always
/// first and never filtered; extras sharing its filesystem are dropped.
pub(crate) fn filter_candidates(
    primary: &Path,
    extras: Vec<(PathBuf, CandidateOrigin)>,
    probe: impl Fn(&Path) -> Option<FsUsage>,
) -> Vec<StorageCandidate> {
    let primary_usage = probe(primary);
    let mut seen_mounts = BTreeSet::new();
    let mut seen_paths = BTreeSet::new();
    if let Some(usage) = &primary_usage {
        seen_mounts.insert(usage.mount_point.clone());
    }
    seen_paths.insert(primary.to_path_buf());

    let mut candidates = vec![StorageCandidate {
        path: primary.to_path_buf(),
        origin: CandidateOrigin::Primary,
        usage: primary_usage,
    }];

    for (path, origin) in extras {
        if !seen_paths.insert(path.clone()) {
            continue;
        }
        let Some(usage) = probe(&path) else {
            debug!(path = %path.display(), "no filesystem information; skipping");
            continue;
        };
        if usage.is_ram_backed() {
            debug!(path = %path.display(), fs = %usage.fs_type, "RAM-backed; skipping");
            continue;
        }
        if usage.available_bytes() < MIN_FREE_BYTES {
            debug!(path = %path.display(), available_kb = usage.available_kb, "less than 2 GiB free; skipping");
            continue;
        }
        if !seen_mounts.insert(usage.mount_point.clone()) {
            continue;
        }
        candidates.push(StorageCandidate {
            path,
            origin,
            usage: Some(usage),
        });
    }
    candidates
}

/// Every benchmarkable location, primary first.
pub fn discover(primary: &Path, active_pools: &BTreeSet<String>) -> Vec<StorageCandidate> {
    let mounts = fs::read_to_string("/proc/mounts")
        .map(|text| parse_mounts(&text))
        .unwrap_or_default();
    let storages = fs::read_to_string(STORAGE_CFG)
        .map(|text| parse_storage_cfg(&text))
        .unwrap_or_default();

    let mut extras = pool_paths(&storages, active_pools, &mounts, zfs_mountpoint);
    extras.extend(external_mounts(&mounts));
    let candidates = filter_candidates(primary, extras, probe);
    info!(count = candidates.len(), "storage candidates discovered");
    candidates
}

/// Parse a selection answer against `count` options: "1,3", "2 4", "all",
/// "none" or empty. Numbers are 1-based.
pub fn parse_selection(input: &str, count: usize) -> Result<Vec<usize>, String> {
    let input = input.trim().to_lowercase();
    match input.as_str() {
        "" | "none" | "n" => return Ok(Vec::new()),
        "all" | "a" => return Ok((0..count).collect()),
        _ => {}
    }

    let mut picked = BTreeSet::new();
    for token in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        let number: usize = token
            .parse()
            .map_err(|_| format!("'{token}' is not a number"))?;
        if number == 0 || number > count {
            return Err(format!("{number} is out of range (1-{count})"));
        }
        picked.insert(number - 1);
    }
    Ok(picked.into_iter().collect())
}

/// Read one line from stdin, giving up after `timeout`.
fn read_line_with_timeout(timeout: Duration) -> Option<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            let _ = tx.send(line);
        }
    });
    rx.recv_timeout(timeout).ok()
}

/// Pick the extra (non-primary) candidates to benchmark.
pub fn select_additional(
    ctx: &RunContext,
    candidates: &[StorageCandidate],
) -> Vec<StorageCandidate> {
    let extras: Vec<StorageCandidate> = candidates
        .iter()
        .filter(|c| c.origin != CandidateOrigin::Primary)
        .cloned()
        .collect();
    if extras.is_empty() {
        return extras;
    }
    if ctx.config.all_disks {
        info!(count = extras.len(), "benchmarking all discovered storage");
        return extras;
    }
    if !ctx.config.interactive {
        info!(
            count = extras.len(),
            "non-interactive run; additional storage skipped (use --all-disks)"
        );
        return Vec::new();
    }

    let options: Vec<String> = extras
        .iter()
        .enumerate()
        .map(|(idx, candidate)| format!("[{}] {}", idx + 1, candidate.describe()))
        .collect();
    let timeout = ctx.config.prompt_timeout;
    ctx.console.prompt(
        &options,
        &format!(
            "Benchmark additional storage? (e.g. 1,3 / all / Enter for none, {}s timeout):",
            timeout.as_secs()
        ),
    );

    let Some(answer) = read_line_with_timeout(timeout) else {
        ctx.console.warn("no answer; skipping additional storage");
        return Vec::new();
    };
    match parse_selection(&answer, extras.len()) {
        Ok(indices) => indices.into_iter().map(|i| extras[i].clone()).collect(),
        Err(reason) => {
            ctx.console
                .warn(&format!("invalid selection ({reason}); skipping additional storage"));
            Vec::new()
        }
    }
}
