//! Error handling for the noxt CLI.
//!
//! Compile and runtime faults are VM-domain outcomes (`InterpretResult`),
//! not `std::error::Error` values — they're reported in their own
//! `[line L] ...` shape and mapped straight to an exit code. `NoxtError`
//! covers the CLI's own boundary: config loading and file I/O.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NoxtError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not read source file '{path}': {source}")]
    ReadSource {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NoxtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = NoxtError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "configuration error: missing field");
    }

    #[test]
    fn read_source_error_includes_path() {
        let err = NoxtError::ReadSource {
            path: "missing.nox".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("missing.nox"));
    }
}
