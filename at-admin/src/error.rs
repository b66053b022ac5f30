// Error taxonomy

//! Typed errors carried inside `anyhow::Error`
//!
//! Most failures propagate as plain `anyhow` chains. The variants here are the
//! ones a caller needs to tell apart: validation problems go back to the form,
//! everything else becomes a generic failure.

use std::path::PathBuf;
use thiserror::Error;

/// User input rejected before any state was mutated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Form area the message belongs to
    pub field: &'static str,
    /// Message shown next to the offending input
    pub message: String,
}

impl ValidationError {
    /// Build an error for `field`
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// An external command ran but reported failure
#[derive(Debug, Error)]
#[error("{program} exited with status {code}")]
pub struct ExecError {
    /// Program that was run
    pub program: String,
    /// Its exit status
    pub code: i32,
}

/// A configuration file that must exist was missing or empty
#[derive(Debug, Error)]
#[error("configuration not found: {}", .0.display())]
pub struct NotFound(pub PathBuf);

/// Returns the validation error inside `err`, if that is what it is
pub fn as_validation(err: &anyhow::Error) -> Option<&ValidationError> {
    err.downcast_ref::<ValidationError>()
}
