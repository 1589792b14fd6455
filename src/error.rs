//! Unified error handling for dynfw.
//!
//! The engine-level taxonomy distinguishes input rejection, packet-filter
//! mutation failures, and durable-store failures, with metric labeling.

use crate::db::DbError;
use crate::firewall::BackendError;
use thiserror::Error;

/// Errors surfaced by the block orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed address, rejected before any side effect.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The packet-filter mutation failed (timeout, privilege, lock contention).
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// Durable storage unavailable.
    #[error("store failure: {0}")]
    Store(#[from] DbError),
}

impl EngineError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "invalid_address",
            Self::Backend(_) => "backend_error",
            Self::Store(_) => "store_error",
        }
    }
}
