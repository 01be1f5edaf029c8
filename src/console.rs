//! User-facing terminal output.
//!
//! Progress goes to stdout in the normal mode. In `--json` mode stdout carries
//! only the result document, so progress is dropped and warnings/errors go to
//! stderr like always.

use colored::*;
use std::io::Write;

#[derive(Debug, Clone, Copy)]
pub struct Console {
    quiet: bool,
    json: bool,
}

impl Console {
    pub fn new(quiet: bool, json: bool, color: bool) -> Self {
        if !color {
            colored::control::set_override(false);
        }
        Self { quiet, json }
    }

    /// Whether human-oriented progress lines are printed at all.
    pub fn chatty(&self) -> bool {
        !self.quiet && !self.json
    }

    pub fn banner(&self, version: &str) {
        if !self.chatty() {
            return;
        }
        println!(
            "\n{}",
            format!("⚡ Proxmark {version} - Proxmox VE host benchmark")
                .bright_cyan()
                .bold()
        );
    }

    pub fn section(&self, title: &str) {
        if self.chatty() {
            println!("\n{}", title.bright_white().bold());
        }
    }

    pub fn step(&self, message: &str) {
        if self.chatty() {
            println!("   {} {}", "→".bright_cyan(), message);
        }
    }

    pub fn success(&self, message: &str) {
        if self.chatty() {
            println!("   {} {}", "✓".bright_green(), message);
        }
    }

    /// Print a question (and its options) without a trailing newline. Goes to
    /// stderr when stdout is reserved for JSON.
    pub fn prompt(&self, options: &[String], question: &str) {
        let mut text = String::new();
        for option in options {
            text.push_str(&format!("   {option}\n"));
        }
        text.push_str(&format!("{} ", question.bright_white().bold()));
        if self.json {
            eprint!("{text}");
            let _ = std::io::stderr().flush();
        } else {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {}", "⚠ WARNING:".bright_yellow().bold(), message.yellow());
    }

    /// Multi-line, hard-to-miss warning (RAM-backed targets and the like).
    pub fn loud_warn(&self, title: &str, lines: &[&str]) {
        let rule = "═".repeat(62);
        eprintln!("{}", rule.bright_yellow());
        eprintln!("{} {}", "⚠".bright_yellow().bold(), title.bright_yellow().bold());
        for line in lines {
            eprintln!("  {}", line.yellow());
        }
        eprintln!("{}", rule.bright_yellow());
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "✗ ERROR:".bright_red().bold(), message.bright_red());
    }
}
