//! A plain diagnostic record shared by the lexer, compiler, and CLI.
//!
//! Language-level errors are not `std::error::Error` values: they are
//! VM-domain outcomes (see `nox-vm::InterpretResult`), reported in the
//! `[line L] Error <where>: <message>` shape. `Diagnostic` is the
//! in-memory carrier for that shape before it is formatted.

use std::fmt;

/// Severity of a reported diagnostic. Only `Error` is produced today;
/// `Warning` exists so future lints have somewhere to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "Error"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

/// A single compile-time diagnostic: a source line, an optional
/// "where" clause (`at end` / `at '<lexeme>'` / empty), and a message.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: u32,
    pub location: String,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, location: impl Into<String>, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            line,
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] {}{}: {}",
            self.line, self.severity, self.location, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_location() {
        let d = Diagnostic::error(3, " at 'x'", "Unexpected token.");
        assert_eq!(d.to_string(), "[line 3] Error at 'x': Unexpected token.");
    }

    #[test]
    fn formats_without_location() {
        let d = Diagnostic::error(1, "", "Unterminated string.");
        assert_eq!(d.to_string(), "[line 1] Error: Unterminated string.");
    }
}
