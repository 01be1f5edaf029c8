//! Hardware inventory
//!
//! Detects CPU, RAM, storage, virtualization and Proxmox VE details using
//! sysinfo, `/proc`, `/sys` and (when present) dmidecode, lshw, lsblk and the
//! Proxmox CLI. Every field is filled by the highest-confidence source that
//! answers; lower tiers only run for fields that are still empty.

pub mod cpu;
pub mod disk;
pub mod proxmox;
pub mod ram;
mod system;

pub use system::{hostname, SystemInventory};

/// Run `probe` only while `slot` is still empty, so an earlier tier always wins.
pub(crate) fn fill<T>(slot: &mut Option<T>, probe: impl FnOnce() -> Option<T>) {
    if slot.is_none() {
        *slot = probe();
    }
}

/// Value of a `Key: value` line, as printed by dmidecode, lscpu and pvecm.
pub(crate) fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (name, value) = line.split_once(':')?;
    if name.trim() != key {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// dmidecode placeholders that mean "no data".
pub(crate) fn is_dmi_placeholder(value: &str) -> bool {
    matches!(
        value.trim(),
        "" | "Unknown"
            | "Not Specified"
            | "Not Provided"
            | "None"
            | "To Be Filled By O.E.M."
            | "<OUT OF SPEC>"
            | "Other"
    )
}
