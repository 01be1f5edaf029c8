//! CPU detection module
//!
//! Sources, highest confidence first:
//! - dmidecode processor records (socket, clocks, sockets)
//! - /proc/cpuinfo and sysinfo (model, vendor, topology)
//! - cpufreq and cache sysfs, lscpu
//! - the model string itself ("@ 3.50GHz") as a last-resort base clock

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use sysinfo::System;

use super::{field_value, fill, is_dmi_placeholder};
use crate::context::DebugDump;
use crate::exec::capture_stdout;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";
const RAPL_PACKAGE: &str = "/sys/class/powercap/intel-rapl:0";

/// CPU information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Model string (e.g., "AMD EPYC 7302P 16-Core Processor")
    pub model: String,
    pub vendor: String,
    /// Socket type from SMBIOS (e.g., "AM4", "LGA1700")
    pub socket_type: Option<String>,
    /// Machine architecture (e.g., "x86_64")
    pub architecture: String,
    /// Address width in bits (32/64)
    pub architecture_bits: Option<u32>,
    /// Physical cores across all sockets
    pub cores: usize,
    /// Logical threads across all sockets
    pub threads: usize,
    pub sockets: usize,
    pub base_frequency_mhz: Option<u64>,
    pub max_frequency_mhz: Option<u64>,
    /// Package power limit from RAPL
    pub tdp_watts: Option<u64>,
    pub l1_cache_kb: Option<u64>,
    pub l2_cache_kb: Option<u64>,
    pub l3_cache_kb: Option<u64>,
}

/// Fields lifted from `dmidecode -t processor`.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DmiProcessor {
    pub socket_type: Option<String>,
    pub sockets: usize,
    pub current_speed_mhz: Option<u64>,
    pub max_speed_mhz: Option<u64>,
    pub core_count: Option<usize>,
    pub thread_count: Option<usize>,
    pub version: Option<String>,
}

/// Fields lifted from `/proc/cpuinfo`.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ProcCpuinfo {
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub logical: usize,
    pub sockets: usize,
    pub cores_per_socket: Option<usize>,
    pub hypervisor: bool,
}

impl CpuInfo {
    pub fn detect(debug: &mut DebugDump) -> Self {
        let mut info = CpuInfo::default();

        let dmi = capture_stdout("dmidecode", &["-t", "processor"]).map(|text| {
            debug.record("dmidecode -t processor", &text);
            parse_dmidecode_processor(&text)
        });
        debug.record_file("/proc/cpuinfo");
        let proc_info = fs::read_to_string("/proc/cpuinfo")
            .map(|text| parse_proc_cpuinfo(&text))
            .unwrap_or_default();

        let mut sys = System::new();
        sys.refresh_cpu_all();
        let first_cpu = sys.cpus().first();

        let mut model = proc_info.model.clone();
        fill(&mut model, || {
            first_cpu
                .map(|cpu| cpu.brand().trim().to_string())
                .filter(|brand| !brand.is_empty())
        });
        fill(&mut model, || dmi.as_ref().and_then(|d| d.version.clone()));
        info.model = model.unwrap_or_else(|| "Unknown CPU".to_string());

        let mut vendor = proc_info.vendor.clone();
        fill(&mut vendor, || {
            first_cpu
                .map(|cpu| cpu.vendor_id().to_string())
                .filter(|v| !v.is_empty())
        });
        info.vendor = vendor.unwrap_or_else(|| "Unknown".to_string());

        info.socket_type = dmi.as_ref().and_then(|d| d.socket_type.clone());

        let mut sockets = dmi.as_ref().map(|d| d.sockets).filter(|n| *n > 0);
        fill(&mut sockets, || Some(proc_info.sockets).filter(|n| *n > 0));
        info.sockets = sockets.unwrap_or(1);

        let mut threads = Some(proc_info.logical).filter(|n| *n > 0);
        fill(&mut threads, || Some(sys.cpus().len()).filter(|n| *n > 0));
        fill(&mut threads, || {
            std::thread::available_parallelism().ok().map(|n| n.get())
        });
        info.threads = threads.unwrap_or(1);

        let mut cores = proc_info
            .cores_per_socket
            .map(|per_socket| per_socket * info.sockets);
        fill(&mut cores, || sys.physical_core_count());
        fill(&mut cores, || {
            dmi.as_ref()
                .and_then(|d| d.core_count)
                .map(|per_socket| per_socket * info.sockets)
        });
        info.cores = cores.unwrap_or(info.threads);

        let cpufreq = Path::new(CPU_SYSFS).join("cpu0/cpufreq");
        info.base_frequency_mhz = dmi.as_ref().and_then(|d| d.current_speed_mhz);
        fill(&mut info.base_frequency_mhz, || {
            read_khz_as_mhz(&cpufreq.join("base_frequency"))
        });
        fill(&mut info.base_frequency_mhz, || frequency_from_model(&info.model));

        info.max_frequency_mhz = dmi.as_ref().and_then(|d| d.max_speed_mhz);
        fill(&mut info.max_frequency_mhz, || {
            read_khz_as_mhz(&cpufreq.join("cpuinfo_max_freq"))
        });
        fill(&mut info.max_frequency_mhz, || {
            read_khz_as_mhz(&cpufreq.join("scaling_max_freq"))
        });

        let lscpu = capture_stdout("lscpu", &[]);
        if let Some(text) = &lscpu {
            debug.record("lscpu", text);
        }
        info.architecture = lscpu
            .as_deref()
            .and_then(|text| text.lines().find_map(|line| field_value(line, "Architecture")))
            .unwrap_or(std::env::consts::ARCH)
            .to_string();
        info.architecture_bits = lscpu.as_deref().and_then(parse_lscpu_width);
        fill(&mut info.architecture_bits, || {
            Some(if cfg!(target_pointer_width = "64") { 64 } else { 32 })
        });

        let caches = read_cache_sizes(&Path::new(CPU_SYSFS).join("cpu0/cache"));
        info.l1_cache_kb = caches.l1_kb;
        info.l2_cache_kb = caches.l2_kb;
        info.l3_cache_kb = caches.l3_kb;

        info.tdp_watts = read_u64(&Path::new(RAPL_PACKAGE).join("constraint_0_power_limit_uw"))
            .map(|uw| uw / 1_000_000)
            .filter(|w| *w > 0);

        info
    }
}

pub(crate) fn parse_dmidecode_processor(text: &str) -> DmiProcessor {
    let mut dmi = DmiProcessor::default();
    let mut in_block = false;
    let mut populated = false;

    for line in text.lines() {
        if line.starts_with("Processor Information") {
            in_block = true;
            populated = true;
            continue;
        }
        if !line.starts_with('\t') && !line.trim().is_empty() {
            in_block = false;
        }
        if !in_block {
            continue;
        }

        if let Some(status) = field_value(line, "Status") {
            if status.contains("Unpopulated") {
                populated = false;
            } else if populated {
                dmi.sockets += 1;
            }
        }
        if let Some(upgrade) = field_value(line, "Upgrade") {
            if dmi.socket_type.is_none() && !is_dmi_placeholder(upgrade) {
                let socket = upgrade.strip_prefix("Socket ").unwrap_or(upgrade);
                dmi.socket_type = Some(socket.to_string());
            }
        }
        if let Some(speed) = field_value(line, "Current Speed") {
            fill(&mut dmi.current_speed_mhz, || parse_mhz(speed));
        }
        if let Some(speed) = field_value(line, "Max Speed") {
            fill(&mut dmi.max_speed_mhz, || parse_mhz(speed));
        }
        if let Some(count) = field_value(line, "Core Count") {
            fill(&mut dmi.core_count, || count.parse().ok());
        }
        if let Some(count) = field_value(line, "Thread Count") {
            fill(&mut dmi.thread_count, || count.parse().ok());
        }
        if let Some(version) = field_value(line, "Version") {
            if !is_dmi_placeholder(version) {
                fill(&mut dmi.version, || Some(version.to_string()));
            }
        }
    }

    dmi
}

pub(crate) fn parse_proc_cpuinfo(text: &str) -> ProcCpuinfo {
    let mut info = ProcCpuinfo::default();
    let mut physical_ids = BTreeSet::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => info.logical += 1,
            "model name" | "Model" if info.model.is_none() && !value.is_empty() => {
                info.model = Some(value.to_string());
            }
            "vendor_id" if info.vendor.is_none() => info.vendor = Some(value.to_string()),
            "physical id" => {
                physical_ids.insert(value.to_string());
            }
            "cpu cores" if info.cores_per_socket.is_none() => {
                info.cores_per_socket = value.parse().ok();
            }
            "flags" => {
                if value.split_whitespace().any(|flag| flag == "hypervisor") {
                    info.hypervisor = true;
                }
            }
            _ => {}
        }
    }

    info.sockets = physical_ids.len();
    info
}

/// "Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz" -> 2400
pub(crate) fn frequency_from_model(model: &str) -> Option<u64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(?i)@\s*([0-9]+(?:\.[0-9]+)?)\s*([GM])Hz").ok())
        .as_ref()?;
    let caps = pattern.captures(model)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let mhz = if caps.get(2)?.as_str().eq_ignore_ascii_case("G") {
        value * 1000.0
    } else {
        value
    };
    Some(mhz.round() as u64).filter(|mhz| *mhz > 0)
}

/// "CPU op-mode(s): 32-bit, 64-bit" -> 64
pub(crate) fn parse_lscpu_width(text: &str) -> Option<u32> {
    let modes = text
        .lines()
        .find_map(|line| field_value(line, "CPU op-mode(s)"))?;
    modes
        .split(',')
        .filter_map(|mode| mode.trim().trim_end_matches("-bit").parse::<u32>().ok())
        .max()
}

fn parse_mhz(value: &str) -> Option<u64> {
    value
        .trim()
        .trim_end_matches("MHz")
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|mhz| *mhz > 0)
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct CacheSizes {
    pub l1_kb: Option<u64>,
    pub l2_kb: Option<u64>,
    pub l3_kb: Option<u64>,
}

/// Sum cache sizes per level from `cpuN/cache/index*` (L1 = data + instruction).
pub(crate) fn read_cache_sizes(cache_dir: &Path) -> CacheSizes {
    let mut sizes = CacheSizes::default();
    let Ok(entries) = fs::read_dir(cache_dir) else {
        return sizes;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("index") {
            continue;
        }
        let dir = entry.path();
        let level = fs::read_to_string(dir.join("level"))
            .ok()
            .and_then(|l| l.trim().parse::<u32>().ok());
        let size = fs::read_to_string(dir.join("size"))
            .ok()
            .and_then(|s| parse_cache_size_kb(&s));
        let (Some(level), Some(size)) = (level, size) else {
            continue;
        };
        let slot = match level {
            1 => &mut sizes.l1_kb,
            2 => &mut sizes.l2_kb,
            3 => &mut sizes.l3_kb,
            _ => continue,
        };
        *slot = Some(slot.unwrap_or(0) + size);
    }

    sizes
}

/// "32K" -> 32, "16M" -> 16384, "512" (bytes) -> 0 is rejected.
pub(crate) fn parse_cache_size_kb(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, multiplier) = if let Some(n) = value.strip_suffix('K') {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('M') {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix('G') {
        (n, 1024 * 1024)
    } else {
        return value.parse::<u64>().ok().map(|bytes| bytes / 1024).filter(|kb| *kb > 0);
    };
    number.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_khz_as_mhz(path: &Path) -> Option<u64> {
    read_u64(path).map(|khz| khz / 1000).filter(|mhz| *mhz > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DMIDECODE_PROCESSOR: &str = "\
# dmidecode 3.4
Getting SMBIOS data from sysfs.
SMBIOS 3.3.0 present.

Handle 0x0004, DMI type 4, 48 bytes
Processor Information
\tSocket Designation: CPU1
\tType: Central Processor
\tVersion: AMD Ryzen 9 5950X 16-Core Processor
\tMax Speed: 4950 MHz
\tCurrent Speed: 3400 MHz
\tStatus: Populated, Enabled
\tUpgrade: Socket AM4
\tCore Count: 16
\tThread Count: 32

Handle 0x0005, DMI type 4, 48 bytes
Processor Information
\tSocket Designation: CPU2
\tVersion: Not Specified
\tMax Speed: Unknown
\tStatus: Unpopulated
\tUpgrade: Other
";

    const PROC_CPUINFO: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
physical id\t: 0
cpu cores\t: 14
flags\t\t: fpu vme de pse hypervisor

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
physical id\t: 1
cpu cores\t: 14
flags\t\t: fpu vme de pse hypervisor
";

    #[test]
    fn dmidecode_counts_only_populated_sockets() {
        let dmi = parse_dmidecode_processor(DMIDECODE_PROCESSOR);
        assert_eq!(dmi.sockets, 1);
        assert_eq!(dmi.socket_type.as_deref(), Some("AM4"));
        assert_eq!(dmi.current_speed_mhz, Some(3400));
        assert_eq!(dmi.max_speed_mhz, Some(4950));
        assert_eq!(dmi.core_count, Some(16));
        assert_eq!(dmi.thread_count, Some(32));
        assert_eq!(
            dmi.version.as_deref(),
            Some("AMD Ryzen 9 5950X 16-Core Processor")
        );
    }

    #[test]
    fn dmidecode_empty_output_yields_defaults() {
        assert_eq!(parse_dmidecode_processor(""), DmiProcessor::default());
    }

    #[test]
    fn proc_cpuinfo_topology() {
        let info = parse_proc_cpuinfo(PROC_CPUINFO);
        assert_eq!(info.logical, 2);
        assert_eq!(info.sockets, 2);
        assert_eq!(info.cores_per_socket, Some(14));
        assert_eq!(info.vendor.as_deref(), Some("GenuineIntel"));
        assert!(info.hypervisor);
        assert!(info.model.unwrap().contains("E5-2680"));
    }

    #[test]
    fn model_string_frequency_fallback() {
        assert_eq!(
            frequency_from_model("Intel(R) Core(TM) i7-4770K CPU @ 3.50GHz"),
            Some(3500)
        );
        assert_eq!(frequency_from_model("Some CPU @ 800MHz"), Some(800));
        assert_eq!(
            frequency_from_model("AMD EPYC 7302P 16-Core Processor"),
            None
        );
    }

    #[test]
    fn lscpu_width_picks_widest_mode() {
        let text = "Architecture:            x86_64\n  CPU op-mode(s):        32-bit, 64-bit\n";
        assert_eq!(parse_lscpu_width(text), Some(64));
        assert_eq!(parse_lscpu_width("Architecture: aarch64\n"), None);
    }

    #[test]
    fn cache_size_units() {
        assert_eq!(parse_cache_size_kb("32K\n"), Some(32));
        assert_eq!(parse_cache_size_kb("16M"), Some(16384));
        assert_eq!(parse_cache_size_kb("2048"), Some(2));
        assert_eq!(parse_cache_size_kb("garbage"), None);
    }

    #[test]
    fn cache_sizes_are_summed_per_level() {
        let dir = tempfile::tempdir().unwrap();
        let entries = [
            ("index0", "1", "32K"),
            ("index1", "1", "32K"),
            ("index2", "2", "512K"),
            ("index3", "3", "16384K"),
        ];
        for (name, level, size) in entries {
            let idx = dir.path().join(name);
            fs::create_dir_all(&idx).unwrap();
            fs::write(idx.join("level"), level).unwrap();
            fs::write(idx.join("size"), size).unwrap();
        }
        let sizes = read_cache_sizes(dir.path());
        assert_eq!(
            sizes,
            CacheSizes {
                l1_kb: Some(64),
                l2_kb: Some(512),
                l3_kb: Some(16384),
            }
        );
    }
}
