//! Error taxonomy of the sync subsystem.
//!
//! Nothing here is fatal: network errors are retried by the fallback poll or the reconnect loop,
//! decode and validation errors discard the single offending unit.

use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// A JSON document (fetch response, push frame or frame element) that did not match its model.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub context: String,
    pub path: String,
    pub message: String,
}

impl DecodeError {
    pub fn from_path_error(context: &str, err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        DecodeError {
            context: context.to_string(),
            path: err.path().to_string(),
            message: err.into_inner().to_string(),
        }
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: invalid JSON at {}: {}", self.context, self.path, self.message)
    }
}

impl Error for DecodeError {}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Transport failure talking to the controller (fetch or push channel).
    Network(String),
    /// Malformed payload; the offending unit was discarded.
    Decode(DecodeError),
    /// Well-formed payload that would break a collection invariant; rejected.
    Validation(String),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Network(s) => write!(f, "network error: {}", s),
            SyncError::Decode(e) => write!(f, "decode error: {}", e),
            SyncError::Validation(s) => write!(f, "validation error: {}", s),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for SyncError {
    fn from(value: DecodeError) -> Self {
        SyncError::Decode(value)
    }
}
