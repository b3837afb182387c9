// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Terminal output helpers shared by the subcommands.
//!
//! Global flags are exported as `TAGWATCH_*` environment variables by
//! `main` so every command can read them without threading them through.

use serde::Serialize;
use std::io::IsTerminal;

pub fn is_json() -> bool {
    flag("TAGWATCH_JSON")
}

pub fn is_quiet() -> bool {
    flag("TAGWATCH_QUIET")
}

pub fn is_verbose() -> bool {
    flag("TAGWATCH_VERBOSE")
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  failed to serialize output: {e}"),
    }
}

/// ANSI styling that degrades to plain text when disabled or not a TTY.
pub struct Styled {
    color: bool,
}

impl Styled {
    pub fn new() -> Self {
        let color = !flag("TAGWATCH_NO_COLOR")
            && std::env::var_os("NO_COLOR").is_none()
            && std::io::stderr().is_terminal();
        Self { color }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn ok_sym(&self) -> String {
        self.paint("32", "✓")
    }

    pub fn warn_sym(&self) -> String {
        self.paint("33", "!")
    }

    pub fn err_sym(&self) -> String {
        self.paint("31", "✗")
    }

    pub fn bold(&self, text: &str) -> String {
        self.paint("1", text)
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    /// Colour a status word by outcome.
    pub fn status(&self, status: &str) -> String {
        match status {
            "passed" | "completed" | "resolved" => self.paint("32", status),
            "timeout" | "running" | "pending" | "retrying" | "cancelled" => {
                self.paint("33", status)
            }
            _ => self.paint("31", status),
        }
    }
}

impl Default for Styled {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_when_color_disabled() {
        let s = Styled { color: false };
        assert_eq!(s.bold("x"), "x");
        assert_eq!(s.status("passed"), "passed");
    }

    #[test]
    fn test_status_colors() {
        let s = Styled { color: true };
        assert!(s.status("passed").starts_with("\x1b[32m"));
        assert!(s.status("failed").starts_with("\x1b[31m"));
        assert!(s.status("timeout").starts_with("\x1b[33m"));
    }
}
