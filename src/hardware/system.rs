//! System information aggregator

use serde::{Deserialize, Serialize};
use std::fs;
use std::process::Command;
use sysinfo::System;

use super::cpu::{parse_proc_cpuinfo, CpuInfo};
use super::disk::DiskInfo;
use super::fill;
use super::proxmox::ProxmoxInfo;
use super::ram::MemoryInfo;
use crate::context::DebugDump;
use crate::exec::{run_capture, INSPECT_TIMEOUT};

/// Complete host inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInventory {
    pub hostname: String,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    pub kernel: String,
    pub os: String,
    /// "bare-metal", "kvm", "vmware", "virtualized", ...
    pub virtualization: String,
    /// Present only on Proxmox VE hosts
    pub proxmox: Option<ProxmoxInfo>,
}

impl SystemInventory {
    /// Detect everything except the disk, which the caller resolves from the
    /// benchmark path.
    pub fn detect(disk: DiskInfo, debug: &mut DebugDump) -> Self {
        let hostname = hostname();
        let cpu = CpuInfo::detect(debug);
        let memory = MemoryInfo::detect(debug);

        let mut kernel = fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|release| release.trim().to_string())
            .filter(|release| !release.is_empty());
        fill(&mut kernel, System::kernel_version);

        debug.record_file("/etc/os-release");
        let mut os = fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|text| parse_os_release(&text));
        fill(&mut os, System::long_os_version);

        let proxmox = ProxmoxInfo::detect(&hostname, debug);

        SystemInventory {
            hostname,
            cpu,
            memory,
            disk,
            kernel: kernel.unwrap_or_else(|| "Unknown".to_string()),
            os: os.unwrap_or_else(|| "Unknown".to_string()),
            virtualization: detect_virtualization(),
            proxmox,
        }
    }

    /// Display inventory as a boxed table
    pub fn display(&self) -> String {
        const WIDTH: usize = 62;
        let mut output = String::new();
        let rule = |left: char, right: char| format!("{left}{}{right}\n", "═".repeat(WIDTH));

        let format_line = |label: &str, content: &str| -> String {
            let content_width = WIDTH.saturating_sub(2 + label.chars().count());
            let content: String = content.chars().take(content_width).collect();
            format!("║ {label}{content:<content_width$} ║\n")
        };

        output.push_str(&rule('╔', '╗'));
        output.push_str(&format!("║{:^WIDTH$}║\n", "SYSTEM INFORMATION"));
        output.push_str(&rule('╠', '╣'));

        output.push_str(&format_line("Host:   ", &self.hostname));
        output.push_str(&format_line("OS:     ", &self.os));
        output.push_str(&format_line("Kernel: ", &self.kernel));
        output.push_str(&format_line("Virt:   ", &self.virtualization));

        output.push_str(&rule('╠', '╣'));

        let cpu = &self.cpu;
        output.push_str(&format_line("CPU:    ", &cpu.model));
        output.push_str(&format_line(
            "        ",
            &format!(
                "{} cores / {} threads / {} socket(s)",
                cpu.cores, cpu.threads, cpu.sockets
            ),
        ));
        match (cpu.base_frequency_mhz, cpu.max_frequency_mhz) {
            (Some(base), Some(max)) => output.push_str(&format_line(
                "        ",
                &format!("{base} MHz base / {max} MHz max"),
            )),
            (Some(mhz), None) | (None, Some(mhz)) => {
                output.push_str(&format_line("        ", &format!("{mhz} MHz")))
            }
            (None, None) => {}
        }
        if let Some(tdp) = cpu.tdp_watts {
            output.push_str(&format_line("        ", &format!("TDP: {tdp} W")));
        }

        output.push_str(&rule('╠', '╣'));

        let mem = &self.memory;
        let mut ram = format!("{:.1} GB", mem.total_mb as f64 / 1024.0);
        if let Some(ty) = &mem.mem_type {
            ram.push_str(&format!(" {ty}"));
        }
        if let Some(speed) = mem.speed_mts {
            ram.push_str(&format!(" @ {speed} MT/s"));
        }
        output.push_str(&format_line("RAM:    ", &ram));
        if mem.slots_total > 0 {
            let mut slots = format!("{}/{} slots", mem.slots_used, mem.slots_total);
            if let Some(channels) = &mem.channels {
                slots.push_str(&format!(", {channels}"));
            }
            if mem.ecc == Some(true) {
                slots.push_str(", ECC");
            }
            output.push_str(&format_line("        ", &slots));
        }

        output.push_str(&rule('╠', '╣'));

        let disk = &self.disk;
        let device = disk.device.as_deref().unwrap_or("unresolved");
        output.push_str(&format_line(
            "Disk:   ",
            &format!("{device} ({})", disk.disk_type.label()),
        ));
        if let Some(model) = &disk.model {
            output.push_str(&format_line("        ", model));
        }
        if let Some(size) = disk.size_gb {
            output.push_str(&format_line("        ", &format!("{size} GB")));
        }
        output.push_str(&format_line(
            "        ",
            &format!("Path: {}", disk.benchmark_path.display()),
        ));

        if let Some(pve) = &self.proxmox {
            output.push_str(&rule('╠', '╣'));
            output.push_str(&format_line(
                "PVE:    ",
                pve.version.as_deref().unwrap_or("unknown version"),
            ));
            if let Some(cluster) = &pve.cluster_name {
                let nodes = pve.cluster_nodes.unwrap_or(0);
                output.push_str(&format_line(
                    "        ",
                    &format!("Cluster {cluster} ({nodes} nodes)"),
                ));
            }
            output.push_str(&format_line(
                "        ",
                &format!(
                    "{} VMs / {} containers / {} storage pools",
                    pve.vm_count.unwrap_or(0),
                    pve.container_count.unwrap_or(0),
                    pve.storage_pools.len()
                ),
            ));
        }

        output.push_str(&rule('╚', '╝'));
        output
    }
}

pub fn hostname() -> String {
    let mut name = System::host_name().filter(|name| !name.is_empty());
    fill(&mut name, || {
        fs::read_to_string("/etc/hostname")
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|name| !name.is_empty())
    });
    name.unwrap_or_else(|| "localhost".to_string())
}

/// `PRETTY_NAME="Debian GNU/Linux 12 (bookworm)"`
pub(crate) fn parse_os_release(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

fn detect_virtualization() -> String {
    // systemd-detect-virt prints "none" and exits 1 on bare metal.
    let mut cmd = Command::new("systemd-detect-virt");
    let answer = run_capture(&mut cmd, INSPECT_TIMEOUT, "systemd-detect-virt")
        .ok()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string());
    let hypervisor_flag = fs::read_to_string("/proc/cpuinfo")
        .map(|text| parse_proc_cpuinfo(&text).hypervisor)
        .unwrap_or(false);
    virtualization_label(answer.as_deref(), hypervisor_flag)
}

pub(crate) fn virtualization_label(detect_virt: Option<&str>, hypervisor_flag: bool) -> String {
    match detect_virt {
        Some("none") => "bare-metal".to_string(),
        Some(platform) if !platform.is_empty() => platform.to_string(),
        _ if hypervisor_flag => "virtualized".to_string(),
        _ => "bare-metal".to_string(),
    }
}
