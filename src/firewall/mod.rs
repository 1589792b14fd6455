//! Rule backend adapters for the host packet filter.
//!
//! The engine owns exactly one dedicated chain and never touches rules
//! outside it. [`RuleBackend`] is the seam the reconciler mutates through;
//! the production implementation shells out to iptables/ip6tables.

pub mod rule;

mod iptables;

pub use iptables::IptablesBackend;
pub use rule::ChainRule;

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Packet-filter mutation failures.
///
/// Every variant names the operation that failed so callers can log and
/// retry selectively. The reconciler decides whether a failure is fatal.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op}: command timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op}: failed to run {command}: {source}")]
    Io {
        op: &'static str,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op}: command exited with {status}: {stderr}")]
    Command {
        op: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{op}: unparsable rule in dedicated chain: {line}")]
    Unparsable { op: &'static str, line: String },
}

/// Mutating view of the dedicated packet-filter chain.
///
/// All methods may fail with [`BackendError`]; none of them deduplicate.
/// Callers (the reconciler) serialize mutations and guarantee an
/// intervening removal before re-applying the same `(address, port)` key.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Guarantee the dedicated chain exists and the primary inbound chain
    /// jumps into it. Safe to call repeatedly.
    async fn ensure_chain(&self) -> Result<(), BackendError>;

    /// Append one drop rule for the source (and tcp destination port, when
    /// given), tagged with a truncated attribution comment.
    async fn apply_block(
        &self,
        address: IpAddr,
        port: Option<u16>,
        comment: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Delete every rule matching the source (and port, when given).
    /// Returns the count removed; zero matches is success.
    async fn remove_block(&self, address: IpAddr, port: Option<u16>) -> Result<u64, BackendError>;

    /// Delete one exact rule previously returned by [`Self::list_rules`].
    async fn delete_rule(&self, rule: &ChainRule) -> Result<(), BackendError>;

    /// Reconstruct the chain's current rule set as structured records.
    async fn list_rules(&self) -> Result<Vec<ChainRule>, BackendError>;

    /// Source addresses currently enforced by the chain.
    async fn list_blocked_addresses(&self) -> Result<HashSet<IpAddr>, BackendError> {
        Ok(self.list_rules().await?.into_iter().map(|r| r.source).collect())
    }
}
