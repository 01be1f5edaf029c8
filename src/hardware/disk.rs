//! Storage device detection
//!
//! Maps a benchmark path to the physical block device underneath it:
//! mount source -> device-mapper node -> slave chain -> base disk, then reads
//! the model, size and rotational flag of that disk from sysfs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::fill;
use crate::context::DebugDump;
use crate::exec::capture_stdout;

/// Upper bound on layers followed, on top of the visited set.
const MAX_LAYERS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Nvme,
    Ssd,
    Hdd,
    #[default]
    Unknown,
}

impl DiskType {
    /// Take `detected` only while the type is still unknown.
    pub fn merge(&mut self, detected: DiskType) {
        if *self == DiskType::Unknown {
            *self = detected;
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DiskType::Nvme => "NVMe",
            DiskType::Ssd => "SSD",
            DiskType::Hdd => "HDD",
            DiskType::Unknown => "Unknown",
        }
    }
}

/// Storage information for one benchmark path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Base block device, e.g. "/dev/nvme0n1"
    pub device: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    pub size_gb: Option<u64>,
    pub filesystem: Option<String>,
    pub benchmark_path: PathBuf,
}

/// Walk "slave" links from `start` until a node has none.
///
/// The first slave (in lexical order, as `slaves_of` returns it) is followed at
/// each layer. A node seen twice ends the walk and is returned as physical.
pub fn follow_slave_chain(start: &str, mut slaves_of: impl FnMut(&str) -> Vec<String>) -> String {
    let mut visited = HashSet::new();
    let mut current = start.to_string();

    for _ in 0..MAX_LAYERS {
        if !visited.insert(current.clone()) {
            debug!(device = %current, "device chain revisits a node; stopping");
            return current;
        }
        match slaves_of(&current).into_iter().next() {
            Some(next) => {
                debug!(from = %current, to = %next, "following slave device");
                current = next;
            }
            None => return current,
        }
    }

    debug!(device = %current, "device chain too deep; stopping");
    current
}

/// Strip a partition suffix: `nvme0n1p3` -> `nvme0n1`, `mmcblk0p1` -> `mmcblk0`,
/// `sda3` -> `sda`. Names without a partition suffix are returned unchanged.
pub fn base_device(name: &str) -> String {
    let has_namespace_marker =
        name.starts_with("nvme") || name.starts_with("mmcblk") || name.starts_with("loop");
    if has_namespace_marker {
        if let Some(idx) = name.rfind('p') {
            let (head, tail) = name.split_at(idx);
            let number = &tail[1..];
            let head_ends_in_digit = head.chars().last().is_some_and(|c| c.is_ascii_digit());
            if head_ends_in_digit && !number.is_empty() && number.chars().all(|c| c.is_ascii_digit())
            {
                return head.to_string();
            }
        }
        return name.to_string();
    }

    let traditional = ["sd", "vd", "xvd", "hd"]
        .iter()
        .any(|prefix| name.starts_with(prefix));
    if traditional {
        let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    name.to_string()
}

/// Reads block-device topology from a sysfs tree (normally `/sys`).
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    sys_root: PathBuf,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl DeviceResolver {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    /// Slave devices of `name`, sorted so "first" is stable.
    pub fn slaves(&self, name: &str) -> Vec<String> {
        let dir = self.sys_root.join("class/block").join(name).join("slaves");
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Physical (partition-level) device behind a mount source such as
    /// `/dev/mapper/pve-root` or `/dev/sda1`.
    pub fn physical_from_source(&self, source: &str) -> Option<String> {
        if !source.starts_with("/dev/") {
            return None;
        }
        // /dev/mapper/* and /dev/<vg>/<lv> are symlinks to /dev/dm-N.
        let node = fs::canonicalize(source).unwrap_or_else(|_| PathBuf::from(source));
        let name = node.file_name()?.to_string_lossy().into_owned();
        let physical = follow_slave_chain(&name, |n| self.slaves(n));
        // `/dev/root` and friends have no sysfs node; leave them to lsblk/dmsetup.
        self.is_block_device(&physical).then_some(physical)
    }

    fn is_block_device(&self, name: &str) -> bool {
        self.sys_root.join("class/block").join(name).exists()
    }

    fn block_attr(&self, device: &str, attr: &str) -> Option<String> {
        let value = fs::read_to_string(self.sys_root.join("block").join(device).join(attr)).ok()?;
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Model, size and type of a base device.
    pub fn describe(&self, base: &str, info: &mut DiskInfo) {
        fill(&mut info.model, || self.block_attr(base, "device/model"));
        fill(&mut info.size_gb, || {
            let sectors: u64 = self.block_attr(base, "size")?.parse().ok()?;
            Some(sectors * 512 / 1_000_000_000).filter(|gb| *gb > 0)
        });

        if base.starts_with("nvme") {
            info.disk_type.merge(DiskType::Nvme);
        }
        match self.block_attr(base, "queue/rotational").as_deref() {
            Some("0") => info.disk_type.merge(DiskType::Ssd),
            Some("1") => info.disk_type.merge(DiskType::Hdd),
            _ => {}
        }
    }
}

impl DiskInfo {
    /// Resolve `path` (mounted from `source`, as reported by `df`) down to its
    /// physical disk.
    pub fn detect(
        path: &Path,
        source: Option<&str>,
        filesystem: Option<&str>,
        debug: &mut DebugDump,
    ) -> Self {
        let mut info = DiskInfo {
            benchmark_path: path.to_path_buf(),
            filesystem: filesystem.map(str::to_string),
            ..Default::default()
        };
        let resolver = DeviceResolver::default();

        let mut physical = source.and_then(|src| resolver.physical_from_source(src));
        fill(&mut physical, || {
            let src = source?;
            let text = capture_stdout("lsblk", &["-no", "PKNAME", src])?;
            debug.record(format!("lsblk -no PKNAME {src}"), &text);
            parse_lsblk_pkname(&text)
        });
        fill(&mut physical, || {
            let src = source?;
            let text = capture_stdout("dmsetup", &["deps", "-o", "devname", src])?;
            debug.record(format!("dmsetup deps {src}"), &text);
            parse_dmsetup_deps(&text)
        });
        fill(&mut physical, || {
            let pool = source?.split('/').next()?;
            if filesystem != Some("zfs") {
                return None;
            }
            let text = capture_stdout("zpool", &["list", "-v", "-H", "-P", pool])?;
            debug.record(format!("zpool list -v -H -P {pool}"), &text);
            let vdev = first_zpool_vdev(&text)?;
            let node = fs::canonicalize(&vdev).unwrap_or_else(|_| PathBuf::from(vdev));
            Some(node.file_name()?.to_string_lossy().into_owned())
        });

        let Some(physical) = physical else {
            debug!(path = %path.display(), ?source, "could not resolve physical device");
            return info;
        };

        let base = base_device(&physical);
        debug!(path = %path.display(), %physical, %base, "resolved physical device");
        resolver.describe(&base, &mut info);
        info.device = Some(format!("/dev/{base}"));
        info
    }
}

/// `lsblk -no PKNAME /dev/sda1` prints the parent kernel name.
pub(crate) fn parse_lsblk_pkname(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// `1 dependencies\t: (sda3)` -> `sda3`
pub(crate) fn parse_dmsetup_deps(text: &str) -> Option<String> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let name = text[start + 1..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// First leaf vdev path from `zpool list -v -H -P`.
pub(crate) fn first_zpool_vdev(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.split('\t').map(str::trim).find(|f| !f.is_empty()))
        .find(|field| field.starts_with("/dev/"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(map: &'a HashMap<&'a str, Vec<&'a str>>) -> impl FnMut(&str) -> Vec<String> + 'a {
        move |name: &str| {
            map.get(name)
                .map(|slaves| slaves.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn three_layer_chain_reaches_physical() {
        let map = HashMap::from([
            ("dm-2", vec!["dm-1"]),
            ("dm-1", vec!["dm-0"]),
            ("dm-0", vec!["sdb2"]),
        ]);
        assert_eq!(follow_slave_chain("dm-2", lookup(&map)), "sdb2");
    }

    #[test]
    fn cyclic_chain_terminates() {
        let map = HashMap::from([("dm-0", vec!["dm-1"]), ("dm-1", vec!["dm-0"])]);
        assert_eq!(follow_slave_chain("dm-0", lookup(&map)), "dm-0");

        let self_loop = HashMap::from([("dm-5", vec!["dm-5"])]);
        assert_eq!(follow_slave_chain("dm-5", lookup(&self_loop)), "dm-5");
    }

    #[test]
    fn unbounded_fresh_names_still_terminate() {
        let mut calls = 0;
        let end = follow_slave_chain("dm-0", |_| {
            calls += 1;
            vec![format!("dm-{calls}")]
        });
        assert!(calls <= MAX_LAYERS);
        assert!(end.starts_with("dm-"));
    }

    #[test]
    fn physical_device_has_no_slaves() {
        assert_eq!(follow_slave_chain("sda", |_| Vec::new()), "sda");
    }

    #[test]
    fn partition_suffixes_are_stripped() {
        assert_eq!(base_device("nvme0n1p3"), "nvme0n1");
        assert_eq!(base_device("nvme0n1"), "nvme0n1");
        assert_eq!(base_device("mmcblk0p1"), "mmcblk0");
        assert_eq!(base_device("sda3"), "sda");
        assert_eq!(base_device("sdaa12"), "sdaa");
        assert_eq!(base_device("vdb"), "vdb");
        assert_eq!(base_device("xvda1"), "xvda");
        assert_eq!(base_device("dm-0"), "dm-0");
        assert_eq!(base_device("md0"), "md0");
    }

    #[test]
    fn disk_type_never_regresses() {
        let detections = [DiskType::Unknown, DiskType::Nvme, DiskType::Unknown, DiskType::Ssd];
        let mut ty = DiskType::Unknown;
        for detected in detections {
            ty.merge(detected);
        }
        assert_eq!(ty, DiskType::Nvme);

        let mut hdd = DiskType::Hdd;
        hdd.merge(DiskType::Unknown);
        hdd.merge(DiskType::Ssd);
        assert_eq!(hdd, DiskType::Hdd);
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn resolver_walks_fake_sysfs_tree() {
        let sys = tempfile::tempdir().unwrap();
        let root = sys.path();
        // LVM on LUKS on a SATA partition.
        fs::create_dir_all(root.join("class/block/dm-1/slaves/dm-0")).unwrap();
        fs::create_dir_all(root.join("class/block/dm-0/slaves/sda3")).unwrap();
        fs::create_dir_all(root.join("class/block/sda3")).unwrap();
        write(&root.join("block/sda/device/model"), "Samsung SSD 870\n");
        write(&root.join("block/sda/size"), "1953525168\n");
        write(&root.join("block/sda/queue/rotational"), "0\n");

        let resolver = DeviceResolver::new(root);
        assert_eq!(resolver.slaves("dm-1"), vec!["dm-0"]);
        assert_eq!(follow_slave_chain("dm-1", |n| resolver.slaves(n)), "sda3");

        let mut info = DiskInfo::default();
        resolver.describe(&base_device("sda3"), &mut info);
        assert_eq!(info.model.as_deref(), Some("Samsung SSD 870"));
        assert_eq!(info.size_gb, Some(1000));
        assert_eq!(info.disk_type, DiskType::Ssd);
    }

    #[test]
    fn mapper_symlink_is_resolved() {
        let sys = tempfile::tempdir().unwrap();
        let dev = tempfile::tempdir().unwrap();
        fs::create_dir_all(sys.path().join("class/block/dm-3/slaves/nvme0n1p3")).unwrap();
        fs::create_dir_all(sys.path().join("class/block/nvme0n1p3")).unwrap();
        fs::write(dev.path().join("dm-3"), b"").unwrap();
        let link = dev.path().join("pve-root");
        std::os::unix::fs::symlink(dev.path().join("dm-3"), &link).unwrap();

        let resolver = DeviceResolver::new(sys.path());
        let source = format!("/dev/../{}", link.display());
        assert_eq!(
            resolver.physical_from_source(&source).as_deref(),
            Some("nvme0n1p3")
        );
        assert_eq!(resolver.physical_from_source("rpool/ROOT/pve-1"), None);
    }

    #[test]
    fn source_without_sysfs_node_is_unresolved() {
        let sys = tempfile::tempdir().unwrap();
        let resolver = DeviceResolver::new(sys.path());
        assert_eq!(resolver.physical_from_source("/dev/root"), None);

        fs::create_dir_all(sys.path().join("class/block/sda1")).unwrap();
        assert_eq!(
            resolver.physical_from_source("/dev/sda1").as_deref(),
            Some("sda1")
        );
    }

    #[test]
    fn nvme_name_beats_missing_rotational_flag() {
        let sys = tempfile::tempdir().unwrap();
        let resolver = DeviceResolver::new(sys.path());
        let mut info = DiskInfo::default();
        resolver.describe("nvme0n1", &mut info);
        assert_eq!(info.disk_type, DiskType::Nvme);
        assert_eq!(info.model, None);
    }

    #[test]
    fn fallback_command_parsers() {
        assert_eq!(parse_lsblk_pkname("\nsda\n").as_deref(), Some("sda"));
        assert_eq!(parse_lsblk_pkname("  \n"), None);
        assert_eq!(
            parse_dmsetup_deps(" 1 dependencies\t: (nvme0n1p3)\n").as_deref(),
            Some("nvme0n1p3")
        );
        assert_eq!(parse_dmsetup_deps("0 dependencies\n"), None);
        let zpool = "rpool\t928G\t12.3G\t916G\t-\t-\t0%\t1%\t1.00x\tONLINE\t-\n\t/dev/disk/by-id/nvme-Samsung_SSD-part3\t928G\t12.3G\t916G\t-\t-\t0%\t1.33%\t-\tONLINE\n";
        assert_eq!(
            first_zpool_vdev(zpool).as_deref(),
            Some("/dev/disk/by-id/nvme-Samsung_SSD-part3")
        );
    }
}
