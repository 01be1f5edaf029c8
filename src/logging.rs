//! Diagnostic logging setup.
//!
//! Diagnostics always go to stderr so `--json` output on stdout stays clean.
//! `RUST_LOG` (or `PROXMARK_LOG`) overrides the level derived from flags.

use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "PROXMARK_LOG";

/// Verbosity flags, lowest precedence first: quiet < default < verbose < debug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub quiet: bool,
    pub verbose: bool,
    pub debug: bool,
}

impl Verbosity {
    pub fn level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        }
    }
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    for var in ["RUST_LOG", LOG_ENV] {
        if let Ok(value) = std::env::var(var) {
            if let Ok(filter) = EnvFilter::try_new(&value) {
                return filter;
            }
        }
    }
    EnvFilter::new(format!("proxmark={}", verbosity.level()))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbosity: Verbosity, color: bool) {
    let _ = fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(verbosity.debug)
        .with_ansi(color)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_follows_flag_precedence() {
        assert_eq!(Verbosity::default().level(), "warn");
        let quiet = Verbosity {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(quiet.level(), "error");
        let verbose = Verbosity {
            verbose: true,
            quiet: true,
            ..Default::default()
        };
        assert_eq!(verbose.level(), "info");
        let debug = Verbosity {
            debug: true,
            verbose: true,
            quiet: false,
        };
        assert_eq!(debug.level(), "debug");
    }
}
