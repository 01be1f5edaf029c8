//! Subprocess helpers.
//!
//! Every external tool goes through these so that a failing or hanging
//! command shows up as a value instead of tearing the run down.

use anyhow::{Context, Result};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::context::{CleanupRegistry, SharedChild};

/// Default deadline for short inspection commands (`lsblk`, `pvesm`, ...).
pub const INSPECT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn is_command_available(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Run `command`, capturing stdout/stderr, and kill it once `timeout` elapses.
pub fn run_capture(command: &mut Command, timeout: Duration, label: &str) -> Result<Output> {
    capture(command, timeout, label, None)
}

/// Like [`run_capture`], but the child is registered with `cleanup` while it
/// runs so the signal listener can kill it.
pub fn run_tracked(
    command: &mut Command,
    timeout: Duration,
    label: &str,
    cleanup: &CleanupRegistry,
) -> Result<Output> {
    capture(command, timeout, label, Some(cleanup))
}

fn capture(
    command: &mut Command,
    timeout: Duration,
    label: &str,
    cleanup: Option<&CleanupRegistry>,
) -> Result<Output> {
    debug!(label, ?timeout, "spawning command");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to launch {label}"))?;

    let stdout_handle = child.stdout.take().map(|mut stream| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = std::io::Read::read_to_end(&mut stream, &mut buf);
            buf
        })
    });
    let stderr_handle = child.stderr.take().map(|mut stream| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = std::io::Read::read_to_end(&mut stream, &mut buf);
            buf
        })
    });

    let pid = child.id();
    let child: SharedChild = Arc::new(Mutex::new(child));
    if let Some(cleanup) = cleanup {
        cleanup.track_child(pid, &child);
    }

    let started = Instant::now();
    let waited = wait_with_deadline(&child, started, timeout, label);
    if let Some(cleanup) = cleanup {
        cleanup.release_child(pid);
    }

    let status = match waited {
        Ok(Some(status)) => status,
        other => {
            if let Some(handle) = stdout_handle {
                let _ = handle.join();
            }
            if let Some(handle) = stderr_handle {
                let _ = handle.join();
            }
            other?;
            anyhow::bail!("{label} timed out after {}s", timeout.as_secs());
        }
    };

    let stdout = stdout_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = stderr_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    debug!(label, %status, elapsed_ms = started.elapsed().as_millis() as u64, "command finished");
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Poll until the child exits (`Some`) or the deadline passes (`None`, child
/// killed).
fn wait_with_deadline(
    child: &SharedChild,
    started: Instant,
    timeout: Duration,
    label: &str,
) -> Result<Option<ExitStatus>> {
    loop {
        {
            let mut child = child
                .lock()
                .map_err(|_| anyhow::anyhow!("{label} child handle poisoned"))?;
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("Failed while waiting on {label}"))?
            {
                return Ok(Some(status));
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Run a short inspection command and return its stdout when it exits zero.
///
/// Missing binaries, non-zero exits and timeouts all collapse to `None`.
pub fn capture_stdout(program: &str, args: &[&str]) -> Option<String> {
    if !is_command_available(program) {
        return None;
    }
    let mut command = Command::new(program);
    command.args(args);
    match run_capture(&mut command, INSPECT_TIMEOUT, program) {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!(
                program,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "inspection command failed"
            );
            None
        }
        Err(err) => {
            debug!(program, error = %err, "inspection command could not run");
            None
        }
    }
}

/// First non-empty line of stderr (or stdout), for error summaries.
pub fn first_output_line(output: &Output) -> Option<String> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}
