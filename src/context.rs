//! Per-run state threaded through every pipeline stage.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::console::Console;

/// Everything a stage needs to know about the current run.
pub struct RunContext {
    pub config: RunConfig,
    pub console: Console,
    pub debug: DebugDump,
    pub cleanup: CleanupRegistry,
}

impl RunContext {
    pub fn new(config: RunConfig, cleanup: CleanupRegistry) -> Self {
        let console = Console::new(config.quiet, config.json_only, config.color);
        let debug = DebugDump::new(config.debug);
        Self {
            config,
            console,
            debug,
            cleanup,
        }
    }

    /// Record a parse/detection problem: user-visible warning plus a log event.
    pub fn degrade(&self, what: &str, reason: impl std::fmt::Display) {
        warn!(what, %reason, "metric degraded to zero");
        self.console
            .warn(&format!("{what}: {reason} (reported as 0)"));
    }
}

/// A running benchmark tool, shared between its waiter and the signal listener.
pub type SharedChild = Arc<Mutex<Child>>;

/// Temporary paths and running tools that must not survive the process,
/// shared with the signal listener.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
    children: Arc<Mutex<BTreeMap<u32, SharedChild>>>,
}

impl CleanupRegistry {
    pub fn track_child(&self, pid: u32, child: &SharedChild) {
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, Arc::clone(child));
        }
    }

    pub fn release_child(&self, pid: u32) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(&pid);
        }
    }

    /// Kill every tracked tool. Runs before [`Self::purge`] so fio cannot
    /// recreate its file afterwards.
    pub fn kill_children(&self) -> usize {
        let Ok(children) = self.children.lock() else {
            return 0;
        };
        let mut killed = 0;
        for (pid, child) in children.iter() {
            let Ok(mut child) = child.lock() else {
                continue;
            };
            match child.kill() {
                Ok(()) => {
                    debug!(pid, "killed running tool");
                    killed += 1;
                }
                Err(err) => warn!(pid, error = %err, "could not kill running tool"),
            }
        }
        killed
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().map(|children| children.len()).unwrap_or(0)
    }

    pub fn register(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path.to_path_buf());
        }
    }

    pub fn release(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.remove(path);
        }
    }

    /// Remove every registered path that still exists.
    pub fn purge(&self) -> usize {
        let Ok(mut paths) = self.paths.lock() else {
            return 0;
        };
        let mut removed = 0;
        for path in std::mem::take(&mut *paths) {
            if remove_quietly(&path) {
                removed += 1;
            }
        }
        removed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.paths.lock().map(|paths| paths.len()).unwrap_or(0)
    }
}

fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed temporary file");
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not remove temporary file");
            false
        }
    }
}

/// A benchmark scratch file, deleted when dropped (success, error or panic
/// unwinding) and by the signal listener on interruption.
pub struct ScratchFile {
    path: PathBuf,
    registry: CleanupRegistry,
}

impl ScratchFile {
    pub fn new(path: PathBuf, registry: &CleanupRegistry) -> Self {
        registry.register(&path);
        Self {
            path,
            registry: registry.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        remove_quietly(&self.path);
        self.registry.release(&self.path);
    }
}

/// Raw tool output and pseudo-file dumps collected in `--debug` mode.
#[derive(Debug, Default)]
pub struct DebugDump {
    enabled: bool,
    sections: Vec<(String, String)>,
}

impl DebugDump {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sections: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, label: impl Into<String>, content: impl AsRef<str>) {
        if self.enabled {
            self.sections
                .push((label.into(), content.as_ref().to_string()));
        }
    }

    pub fn record_file(&mut self, path: &str) {
        if !self.enabled {
            return;
        }
        let content = fs::read_to_string(path)
            .unwrap_or_else(|err| format!("<unreadable: {err}>"));
        self.record(path, content);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, content) in &self.sections {
            out.push_str(&format!("===== {label} =====\n"));
            out.push_str(content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}
