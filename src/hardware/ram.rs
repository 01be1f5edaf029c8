//! RAM detection module
//!
//! Detects memory information using:
//! - dmidecode type 17 (per-slot records) and type 16 (ECC)
//! - lshw for the memory type when dmidecode is unavailable
//! - /proc/meminfo and sysinfo for the total

use serde::{Deserialize, Serialize};
use std::fs;
use sysinfo::System;

use super::{field_value, fill, is_dmi_placeholder};
use crate::context::DebugDump;
use crate::exec::capture_stdout;

/// One populated memory slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryBank {
    pub locator: String,
    pub size_mb: u64,
    pub mem_type: Option<String>,
    pub speed_mts: Option<u64>,
    pub manufacturer: Option<String>,
    pub part_number: Option<String>,
    pub form_factor: Option<String>,
}

/// Memory information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Total usable memory in MB
    pub total_mb: u64,
    /// DDR4, DDR5, ...
    pub mem_type: Option<String>,
    pub form_factor: Option<String>,
    pub speed_mts: Option<u64>,
    /// "Dual Channel", "Quad Channel", ...
    pub channels: Option<String>,
    pub slots_used: usize,
    pub slots_total: usize,
    pub ecc: Option<bool>,
    pub banks: Vec<MemoryBank>,
}

/// Result of parsing `dmidecode -t 17`.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DmiMemoryDevices {
    pub banks: Vec<MemoryBank>,
    pub slots_total: usize,
    /// Total width wider than data width on a populated slot.
    pub wide_bus: bool,
}

impl MemoryInfo {
    pub fn detect(debug: &mut DebugDump) -> Self {
        let mut info = MemoryInfo::default();

        debug.record_file("/proc/meminfo");
        let mut total_mb = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo_total_mb(&text));
        fill(&mut total_mb, || {
            let mut sys = System::new();
            sys.refresh_memory();
            Some(sys.total_memory() / (1024 * 1024)).filter(|mb| *mb > 0)
        });
        info.total_mb = total_mb.unwrap_or(0);

        let devices = capture_stdout("dmidecode", &["-t", "17"]).map(|text| {
            debug.record("dmidecode -t 17", &text);
            parse_dmidecode_memory(&text)
        });
        if let Some(devices) = &devices {
            info.slots_total = devices.slots_total;
            info.slots_used = devices.banks.len();
            info.banks = devices.banks.clone();
            let first = devices.banks.first();
            info.mem_type = first.and_then(|bank| bank.mem_type.clone());
            info.form_factor = first.and_then(|bank| bank.form_factor.clone());
            info.speed_mts = devices.banks.iter().filter_map(|bank| bank.speed_mts).min();
        }

        fill(&mut info.mem_type, || {
            let text = capture_stdout("lshw", &["-short", "-class", "memory"])?;
            debug.record("lshw -short -class memory", &text);
            memory_type_from_text(&text)
        });

        info.ecc = capture_stdout("dmidecode", &["-t", "16"]).and_then(|text| {
            debug.record("dmidecode -t 16", &text);
            parse_ecc(&text)
        });
        fill(&mut info.ecc, || {
            devices.as_ref().filter(|d| !d.banks.is_empty()).map(|d| d.wide_bus)
        });

        if info.slots_used > 0 {
            info.channels = Some(channel_label(info.slots_used));
        }

        info
    }
}

/// `MemTotal:  65843212 kB` -> MB
pub(crate) fn parse_meminfo_total_mb(text: &str) -> Option<u64> {
    let line = text.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

pub(crate) fn parse_dmidecode_memory(text: &str) -> DmiMemoryDevices {
    let mut devices = DmiMemoryDevices::default();

    for block in text.split("\n\n") {
        if !block.lines().any(|line| line.trim() == "Memory Device") {
            continue;
        }
        devices.slots_total += 1;

        let mut bank = MemoryBank::default();
        let mut size_mb = None;
        let mut rated_speed = None;
        let mut configured_speed = None;
        let mut total_width = None;
        let mut data_width = None;

        for line in block.lines() {
            if let Some(value) = field_value(line, "Size") {
                size_mb = parse_module_size_mb(value);
            } else if let Some(value) = field_value(line, "Locator") {
                bank.locator = value.to_string();
            } else if let Some(value) = field_value(line, "Type") {
                bank.mem_type = known(value);
            } else if let Some(value) = field_value(line, "Form Factor") {
                bank.form_factor = known(value);
            } else if let Some(value) = field_value(line, "Speed") {
                rated_speed = parse_speed_mts(value);
            } else if let Some(value) = field_value(line, "Configured Memory Speed")
                .or_else(|| field_value(line, "Configured Clock Speed"))
            {
                configured_speed = parse_speed_mts(value);
            } else if let Some(value) = field_value(line, "Manufacturer") {
                bank.manufacturer = known(value);
            } else if let Some(value) = field_value(line, "Part Number") {
                bank.part_number = known(value);
            } else if let Some(value) = field_value(line, "Total Width") {
                total_width = parse_bits(value);
            } else if let Some(value) = field_value(line, "Data Width") {
                data_width = parse_bits(value);
            }
        }

        let Some(size_mb) = size_mb else {
            continue;
        };
        bank.size_mb = size_mb;
        bank.speed_mts = configured_speed.or(rated_speed);
        if let (Some(total), Some(data)) = (total_width, data_width) {
            if total > data {
                devices.wide_bus = true;
            }
        }
        devices.banks.push(bank);
    }

    devices
}

/// ECC from `dmidecode -t 16` (Physical Memory Array).
pub(crate) fn parse_ecc(text: &str) -> Option<bool> {
    let value = text
        .lines()
        .find_map(|line| field_value(line, "Error Correction Type"))?;
    match value {
        "None" => Some(false),
        "Unknown" => None,
        other => Some(other.contains("ECC") || other.contains("Parity") || other == "CRC"),
    }
}

/// Channel label from the number of populated slots.
pub fn channel_label(slots_used: usize) -> String {
    match slots_used {
        1 => "Single Channel".to_string(),
        2 => "Dual Channel".to_string(),
        3 => "Triple Channel".to_string(),
        4 => "Quad Channel".to_string(),
        6 => "Hexa Channel".to_string(),
        8 => "Octa Channel".to_string(),
        n => format!("{n}-slot"),
    }
}

/// First DDR generation mentioned in free text (lshw descriptions).
pub(crate) fn memory_type_from_text(text: &str) -> Option<String> {
    const TYPES: [&str; 6] = ["LPDDR5", "LPDDR4", "DDR5", "DDR4", "DDR3", "DDR2"];
    let upper = text.to_uppercase();
    TYPES
        .iter()
        .find(|ddr| upper.contains(*ddr))
        .map(|ddr| ddr.to_string())
}

/// "32 GB" / "16384 MB" / "No Module Installed"
fn parse_module_size_mb(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: u64 = parts.next()?.parse().ok()?;
    let mb = match parts.next()? {
        "kB" | "KB" => number / 1024,
        "MB" => number,
        "GB" => number * 1024,
        "TB" => number * 1024 * 1024,
        _ => return None,
    };
    Some(mb).filter(|mb| *mb > 0)
}

/// "3200 MT/s" or "2400 MHz"
fn parse_speed_mts(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .filter(|speed| *speed > 0)
}

fn parse_bits(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse().ok()
}

fn known(value: &str) -> Option<String> {
    if is_dmi_placeholder(value) {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DMIDECODE_17: &str = "\
# dmidecode 3.4
SMBIOS 3.2.0 present.

Handle 0x0040, DMI type 17, 84 bytes
Memory Device
\tArray Handle: 0x003F
\tTotal Width: 72 bits
\tData Width: 64 bits
\tSize: 32 GB
\tForm Factor: DIMM
\tLocator: DIMM_A1
\tType: DDR4
\tSpeed: 3200 MT/s
\tManufacturer: Samsung
\tPart Number: M393A4K40DB3-CWE
\tConfigured Memory Speed: 2933 MT/s

Handle 0x0041, DMI type 17, 84 bytes
Memory Device
\tTotal Width: Unknown
\tData Width: Unknown
\tSize: No Module Installed
\tForm Factor: Unknown
\tLocator: DIMM_A2
\tType: Unknown
\tSpeed: Unknown

Handle 0x0042, DMI type 17, 84 bytes
Memory Device
\tTotal Width: 72 bits
\tData Width: 64 bits
\tSize: 32768 MB
\tForm Factor: DIMM
\tLocator: DIMM_B1
\tType: DDR4
\tSpeed: 3200 MT/s
\tManufacturer: Samsung
\tPart Number: M393A4K40DB3-CWE
\tConfigured Memory Speed: 2933 MT/s
";

    #[test]
    fn dmidecode_banks_skip_empty_slots() {
        let devices = parse_dmidecode_memory(DMIDECODE_17);
        assert_eq!(devices.slots_total, 3);
        assert_eq!(devices.banks.len(), 2);
        assert!(devices.wide_bus);

        let first = &devices.banks[0];
        assert_eq!(first.locator, "DIMM_A1");
        assert_eq!(first.size_mb, 32768);
        assert_eq!(first.mem_type.as_deref(), Some("DDR4"));
        assert_eq!(first.speed_mts, Some(2933));
        assert_eq!(first.form_factor.as_deref(), Some("DIMM"));
        assert_eq!(devices.banks[1].size_mb, 32768);
    }

    #[test]
    fn dmidecode_without_devices() {
        let devices = parse_dmidecode_memory("# dmidecode 3.4\n/sys/firmware/dmi/tables/DMI: Permission denied\n");
        assert_eq!(devices, DmiMemoryDevices::default());
    }

    #[test]
    fn ecc_from_physical_memory_array() {
        let text = "Physical Memory Array\n\tLocation: System Board Or Motherboard\n\tError Correction Type: Multi-bit ECC\n";
        assert_eq!(parse_ecc(text), Some(true));
        assert_eq!(parse_ecc("\tError Correction Type: None\n"), Some(false));
        assert_eq!(parse_ecc(""), None);
    }

    #[test]
    fn channel_labels() {
        assert_eq!(channel_label(1), "Single Channel");
        assert_eq!(channel_label(2), "Dual Channel");
        assert_eq!(channel_label(6), "Hexa Channel");
        assert_eq!(channel_label(8), "Octa Channel");
        assert_eq!(channel_label(5), "5-slot");
        assert_eq!(channel_label(12), "12-slot");
    }

    #[test]
    fn meminfo_total() {
        let text = "MemTotal:       65843212 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total_mb(text), Some(64300));
        assert_eq!(parse_meminfo_total_mb("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn memory_type_from_lshw_description() {
        let text = "/0/1f/0  memory  16GiB DIMM DDR5 Synchronous 4800 MHz (0.2 ns)\n";
        assert_eq!(memory_type_from_text(text).as_deref(), Some("DDR5"));
        assert_eq!(memory_type_from_text("/0/0 memory 64KiB BIOS").as_deref(), None);
    }
}
