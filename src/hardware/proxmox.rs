//! Proxmox VE details, gathered from the pve* / qm / pct command line tools.
//!
//! Only populated when `pveversion` is on the PATH.

use serde::{Deserialize, Serialize};

use super::field_value;
use crate::context::DebugDump;
use crate::exec::{capture_stdout, is_command_available};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: String,
    pub status: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxmoxInfo {
    pub version: Option<String>,
    pub node_name: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_nodes: Option<u32>,
    pub subscription: Option<String>,
    pub vm_count: Option<usize>,
    pub container_count: Option<usize>,
    pub storage_pools: Vec<StoragePool>,
}

impl ProxmoxInfo {
    /// `None` when this is not a Proxmox VE host.
    pub fn detect(hostname: &str, debug: &mut DebugDump) -> Option<Self> {
        if !is_command_available("pveversion") {
            return None;
        }

        let mut run = |program: &str, args: &[&str]| {
            let text = capture_stdout(program, args)?;
            debug.record(format!("{program} {}", args.join(" ")), &text);
            Some(text)
        };

        let mut info = ProxmoxInfo {
            node_name: Some(hostname.to_string()).filter(|h| !h.is_empty()),
            ..Default::default()
        };
        info.version = run("pveversion", &[]).and_then(|text| parse_pveversion(&text));
        if let Some(text) = run("pvecm", &["status"]) {
            let (name, nodes) = parse_pvecm_status(&text);
            info.cluster_name = name;
            info.cluster_nodes = nodes;
        }
        info.subscription =
            run("pvesubscription", &["get"]).and_then(|text| parse_subscription(&text));
        info.vm_count = run("qm", &["list"]).map(|text| count_list_rows(&text));
        info.container_count = run("pct", &["list"]).map(|text| count_list_rows(&text));
        info.storage_pools = run("pvesm", &["status"])
            .map(|text| parse_pvesm_status(&text))
            .unwrap_or_default();

        Some(info)
    }
}

/// `pve-manager/8.1.4/ec5affc9e41f1d79 (running kernel: 6.5.11-8-pve)` -> `8.1.4`
pub(crate) fn parse_pveversion(text: &str) -> Option<String> {
    let line = text.lines().find(|line| line.starts_with("pve-manager/"))?;
    line.split('/').nth(1).map(str::to_string)
}

/// Cluster name and member count; standalone nodes report neither.
pub(crate) fn parse_pvecm_status(text: &str) -> (Option<String>, Option<u32>) {
    let name = text
        .lines()
        .find_map(|line| field_value(line, "Name"))
        .map(str::to_string);
    let nodes = text
        .lines()
        .find_map(|line| field_value(line, "Nodes"))
        .and_then(|value| value.parse().ok());
    (name, nodes)
}

pub(crate) fn parse_subscription(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| field_value(line, "status"))
        .map(str::to_string)
}

/// Rows of `qm list` / `pct list`, minus the header.
pub(crate) fn count_list_rows(text: &str) -> usize {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .skip(1)
        .count()
}

/// `pvesm status` table; sizes are KiB.
pub(crate) fn parse_pvesm_status(text: &str) -> Vec<StoragePool> {
    const KIB_PER_GB: f64 = 1024.0 * 1024.0;
    let kib_to_gb = |value: &str| {
        value
            .parse::<f64>()
            .map(|kib| (kib / KIB_PER_GB * 10.0).round() / 10.0)
            .unwrap_or(0.0)
    };

    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            Some(StoragePool {
                name: fields[0].to_string(),
                pool_type: fields[1].to_string(),
                status: fields[2].to_string(),
                total_gb: kib_to_gb(fields[3]),
                used_gb: kib_to_gb(fields[4]),
                available_gb: kib_to_gb(fields[5]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pveversion_manager_version() {
        let text = "pve-manager/8.1.4/ec5affc9e41f1d79 (running kernel: 6.5.11-8-pve)\n";
        assert_eq!(parse_pveversion(text).as_deref(), Some("8.1.4"));
        assert_eq!(parse_pveversion("bash: pveversion: not found"), None);
    }

    #[test]
    fn pvecm_cluster_fields() {
        let text = "\
Cluster information
-------------------
Name:             homelab
Config Version:   3
Transport:        knet

Quorum information
------------------
Date:             Fri Mar  1 12:30:00 2024
Nodes:            3
Quorate:          Yes
";
        assert_eq!(
            parse_pvecm_status(text),
            (Some("homelab".to_string()), Some(3))
        );
        assert_eq!(parse_pvecm_status(""), (None, None));
    }

    #[test]
    fn subscription_status() {
        let text = "message: There is no subscription key\nserverid: ABC\nstatus: notfound\n";
        assert_eq!(parse_subscription(text).as_deref(), Some("notfound"));
    }

    #[test]
    fn list_rows_skip_header() {
        let qm = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n       100 web                  running    4096              32.00 1234\n       101 db                   stopped    8192              64.00 0\n";
        assert_eq!(count_list_rows(qm), 2);
        assert_eq!(count_list_rows(""), 0);
        assert_eq!(count_list_rows("VMID Status Lock Name\n"), 0);
    }

    #[test]
    fn pvesm_status_pools() {
        let text = "\
Name             Type     Status           Total            Used       Available        %
local             dir     active        98497780        12582912        80880356   12.77%
local-lvm     lvmthin     active       832888832        41644441       791244391    5.00%
backup            nfs   inactive               0               0               0    0.00%
";
        let pools = parse_pvesm_status(text);
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[0].name, "local");
        assert_eq!(pools[0].pool_type, "dir");
        assert_eq!(pools[0].used_gb, 12.0);
        assert_eq!(pools[1].pool_type, "lvmthin");
        assert_eq!(pools[2].status, "inactive");
        assert_eq!(pools[2].total_gb, 0.0);
    }
}
