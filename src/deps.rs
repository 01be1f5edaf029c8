//! External tool dependencies.
//!
//! sysbench and fio are required; a missing one is installed through the
//! host's package manager or, with `--no-install`, fails the run before any
//! benchmark starts.

use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::DependencyError;
use crate::exec::{first_output_line, is_command_available, run_capture};

const UPDATE_TIMEOUT: Duration = Duration::from_secs(600);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

/// Benchmark tools that must be present before anything runs.
pub const REQUIRED_TOOLS: &[&str] = &["sysbench", "fio"];

/// Inspection helpers that improve the inventory but are never installed.
pub const INSPECTION_TOOLS: &[&str] = &["dmidecode", "lshw", "lsblk", "systemd-detect-virt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
}

impl PackageManager {
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Pacman,
        PackageManager::Zypper,
    ];

    pub fn detect() -> Option<Self> {
        Self::detect_with(is_command_available)
    }

    /// First manager whose binary `available` reports as present.
    pub fn detect_with(available: impl Fn(&str) -> bool) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|manager| available(manager.binary()))
    }

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
        }
    }

    /// Package providing `tool` for this manager family.
    pub fn package_for(&self, tool: &str) -> String {
        match (self, tool) {
            (PackageManager::Zypper, "iperf3") => "iperf".to_string(),
            (_, "lsblk") => "util-linux".to_string(),
            (_, "systemd-detect-virt") => "systemd".to_string(),
            (_, other) => other.to_string(),
        }
    }

    /// Repository metadata refresh. Allowed to fail.
    pub fn update_args(&self) -> Option<Vec<&'static str>> {
        match self {
            PackageManager::Apt => Some(vec!["update"]),
            PackageManager::Pacman => Some(vec!["-Sy", "--noconfirm"]),
            PackageManager::Zypper => Some(vec!["--non-interactive", "refresh"]),
            // dnf/yum refresh metadata as part of install.
            PackageManager::Dnf | PackageManager::Yum => None,
        }
    }

    pub fn install_args(&self, packages: &[String]) -> Vec<String> {
        let mut args: Vec<String> = match self {
            PackageManager::Apt => vec!["install".into(), "-y".into()],
            PackageManager::Dnf | PackageManager::Yum => vec!["install".into(), "-y".into()],
            PackageManager::Pacman => vec!["-S".into(), "--needed".into(), "--noconfirm".into()],
            PackageManager::Zypper => vec!["--non-interactive".into(), "install".into()],
        };
        args.extend(packages.iter().cloned());
        args
    }
}

/// What needs to happen to make the missing tools available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub manager: PackageManager,
    pub tools: Vec<String>,
    pub packages: Vec<String>,
}

/// Decide how to obtain `missing` tools, or fail fast.
pub fn plan_installation(
    missing: &[String],
    manager: Option<PackageManager>,
    allow_install: bool,
) -> Result<Option<InstallPlan>, DependencyError> {
    if missing.is_empty() {
        return Ok(None);
    }
    if !allow_install {
        return Err(DependencyError::InstallDisabled {
            missing: missing.to_vec(),
        });
    }
    let Some(manager) = manager else {
        return Err(DependencyError::NoPackageManager {
            missing: missing.to_vec(),
        });
    };

    let mut packages: Vec<String> = missing.iter().map(|tool| manager.package_for(tool)).collect();
    packages.sort_unstable();
    packages.dedup();

    Ok(Some(InstallPlan {
        manager,
        tools: missing.to_vec(),
        packages,
    }))
}

pub fn missing_tools(tools: &[&str], available: impl Fn(&str) -> bool) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| !available(tool))
        .map(|tool| tool.to_string())
        .collect()
}

/// Make sure every tool in `tools` is on the PATH, installing when allowed.
pub fn ensure_tools(ctx: &mut RunContext, tools: &[&str]) -> Result<(), DependencyError> {
    let missing = missing_tools(tools, is_command_available);
    let Some(plan) =
        plan_installation(&missing, PackageManager::detect(), ctx.config.auto_install)?
    else {
        debug!(?tools, "all tools present");
        return Ok(());
    };

    ctx.console.step(&format!(
        "Installing {} via {}",
        plan.packages.join(" "),
        plan.manager.label()
    ));
    execute_plan(ctx, &plan)?;

    for tool in &plan.tools {
        if !is_command_available(tool) {
            return Err(DependencyError::StillMissing(tool.clone()));
        }
    }
    ctx.console
        .success(&format!("Installed {}", plan.tools.join(", ")));
    Ok(())
}

/// Best-effort variant for optional tools; failure is a warning.
pub fn ensure_optional_tool(ctx: &mut RunContext, tool: &str) -> bool {
    match ensure_tools(ctx, &[tool]) {
        Ok(()) => true,
        Err(err) => {
            ctx.console
                .warn(&format!("optional tool '{tool}' unavailable: {err}"));
            false
        }
    }
}

fn execute_plan(ctx: &mut RunContext, plan: &InstallPlan) -> Result<(), DependencyError> {
    let manager = plan.manager;

    if let Some(args) = manager.update_args() {
        let mut cmd = Command::new(manager.binary());
        cmd.args(&args).env("DEBIAN_FRONTEND", "noninteractive");
        match run_capture(&mut cmd, UPDATE_TIMEOUT, manager.binary()) {
            Ok(output) if output.status.success() => {
                info!(manager = manager.label(), "package index updated");
            }
            Ok(output) => {
                // Unreachable enterprise repos are common on Proxmox hosts
                // without a subscription; the install may still succeed.
                let summary = first_output_line(&output).unwrap_or_default();
                warn!(manager = manager.label(), status = %output.status, %summary, "package index update failed");
                ctx.console.warn(&format!(
                    "{} update reported errors ({summary}); continuing with install",
                    manager.label()
                ));
            }
            Err(err) => {
                warn!(manager = manager.label(), error = %err, "package index update did not run");
            }
        }
    }

    let args = manager.install_args(&plan.packages);
    let mut cmd = Command::new(manager.binary());
    cmd.args(&args).env("DEBIAN_FRONTEND", "noninteractive");
    let output = run_capture(&mut cmd, INSTALL_TIMEOUT, manager.binary()).map_err(|err| {
        DependencyError::InstallFailed {
            manager: manager.label(),
            packages: plan.packages.join(" "),
            detail: format!("{err:#}"),
        }
    })?;
    ctx.debug.record(
        format!("{} {}", manager.binary(), args.join(" ")),
        String::from_utf8_lossy(&output.stdout),
    );

    if !output.status.success() {
        return Err(DependencyError::InstallFailed {
            manager: manager.label(),
            packages: plan.packages.join(" "),
            detail: first_output_line(&output)
                .unwrap_or_else(|| format!("exit status {}", output.status)),
        });
    }
    Ok(())
}

/// Host facts gathered before inventory: platform, privileges, tooling.
#[derive(Debug, Clone)]
pub struct EnvironmentProbe {
    pub is_proxmox: bool,
    pub is_root: bool,
    pub missing_inspection_tools: Vec<String>,
}

pub fn probe_environment() -> EnvironmentProbe {
    EnvironmentProbe {
        is_proxmox: is_command_available("pveversion"),
        is_root: current_uid() == Some(0),
        missing_inspection_tools: missing_tools(INSPECTION_TOOLS, is_command_available),
    }
}

fn current_uid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_uid(&status)
}

fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_with_install_disabled_fails_for_every_family() {
        let missing = vec!["fio".to_string()];
        for manager in PackageManager::ALL {
            let err = plan_installation(&missing, Some(manager), false)
                .expect_err("install disabled must fail");
            assert!(matches!(err, DependencyError::InstallDisabled { .. }));
        }
        assert!(matches!(
            plan_installation(&missing, None, false),
            Err(DependencyError::InstallDisabled { .. })
        ));
    }

    #[test]
    fn nothing_missing_needs_no_plan() {
        assert_eq!(plan_installation(&[], None, false).unwrap(), None);
    }

    #[test]
    fn no_package_manager_is_fatal() {
        let missing = vec!["sysbench".to_string()];
        assert!(matches!(
            plan_installation(&missing, None, true),
            Err(DependencyError::NoPackageManager { .. })
        ));
    }

    #[test]
    fn plan_maps_packages_per_family() {
        let missing = vec!["lsblk".to_string(), "fio".to_string()];
        let plan = plan_installation(&missing, Some(PackageManager::Dnf), true)
            .unwrap()
            .unwrap();
        assert_eq!(plan.packages, vec!["fio", "util-linux"]);
        assert_eq!(plan.tools, missing);
    }

    #[test]
    fn detection_prefers_apt_family() {
        let manager = PackageManager::detect_with(|bin| bin == "apt-get" || bin == "dnf");
        assert_eq!(manager, Some(PackageManager::Apt));
        let manager = PackageManager::detect_with(|bin| bin == "pacman");
        assert_eq!(manager, Some(PackageManager::Pacman));
        assert_eq!(PackageManager::detect_with(|_| false), None);
    }

    #[test]
    fn install_arguments_are_non_interactive() {
        let pkgs = vec!["fio".to_string()];
        assert_eq!(
            PackageManager::Apt.install_args(&pkgs),
            vec!["install", "-y", "fio"]
        );
        assert_eq!(
            PackageManager::Pacman.install_args(&pkgs),
            vec!["-S", "--needed", "--noconfirm", "fio"]
        );
        assert!(PackageManager::Dnf.update_args().is_none());
        assert_eq!(PackageManager::Apt.update_args(), Some(vec!["update"]));
    }

    #[test]
    fn missing_tools_filters_available() {
        let missing = missing_tools(&["sysbench", "fio"], |tool| tool == "fio");
        assert_eq!(missing, vec!["sysbench"]);
    }

    #[test]
    fn uid_is_parsed_from_proc_status() {
        let status = "Name:\tproxmark\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\n";
        assert_eq!(parse_uid(status), Some(0));
        assert_eq!(parse_uid("Name:\tx\n"), None);
    }
}
