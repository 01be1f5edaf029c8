//! Error types shared across the benchmark pipeline.

use thiserror::Error;

/// Failure to pull a metric out of an external tool's output.
///
/// Parse failures are never fatal; callers degrade the metric to zero and warn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("tool produced no output")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid number for {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("tool reported an error: {0}")]
    ToolReported(String),
}

/// Failure to provide a required external tool.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("no supported package manager found (need apt, dnf, yum, pacman or zypper) to install: {}", .missing.join(", "))]
    NoPackageManager { missing: Vec<String> },
    #[error("required tools missing and auto-install is disabled: {}", .missing.join(", "))]
    InstallDisabled { missing: Vec<String> },
    #[error("{manager} failed to install {packages}: {detail}")]
    InstallFailed {
        manager: &'static str,
        packages: String,
        detail: String,
    },
    #[error("'{0}' is still not available after installation")]
    StillMissing(String),
}

/// Top-level outcome classification, mapped onto the process exit code.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error("{0:#}")]
    Fatal(#[from] anyhow::Error),
    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Usage(_) | RunError::Dependency(_) | RunError::Fatal(_) => 1,
            RunError::Interrupted(signal) => (128 + signal).clamp(1, 255) as u8,
        }
    }
}
