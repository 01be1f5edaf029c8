//! SIGINT/SIGTERM handling.
//!
//! A listener thread owns a small current-thread runtime. The first signal
//! kills the running tool and removes every registered scratch file before
//! the process exits. No report is written for an interrupted run.

use colored::*;
use tracing::warn;

use crate::context::CleanupRegistry;
use crate::error::RunError;

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

pub fn install(cleanup: CleanupRegistry) {
    #[cfg(unix)]
    {
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            let Ok(runtime) = runtime else {
                warn!("signal listener runtime could not start");
                return;
            };

            runtime.block_on(async move {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(sig) => sig,
                    Err(_) => return,
                };
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sig) => sig,
                    Err(_) => return,
                };

                let signo = tokio::select! {
                    _ = sigint.recv() => SIGINT,
                    _ = sigterm.recv() => SIGTERM,
                };
                shut_down(&cleanup, signo);
            });
        });
    }
}

fn shut_down(cleanup: &CleanupRegistry, signo: i32) -> ! {
    let killed = cleanup.kill_children();
    let removed = cleanup.purge();
    warn!(signal = signo, killed, removed, "run interrupted");
    eprintln!(
        "\n{} {}",
        "✗ INTERRUPTED:".bright_red().bold(),
        notice(signo, removed).bright_red()
    );
    std::process::exit(i32::from(RunError::Interrupted(signo).exit_code()));
}

fn notice(signo: i32, removed: usize) -> String {
    let name = match signo {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    };
    format!("received {name}; removed {removed} temporary file(s), no report written")
}
