//! The rule reconciler: the only place that sequences store writes and
//! backend mutations, and the only place that defines what "consistent"
//! means.
//!
//! Per `(address, port)` key the engine moves between three states:
//! unblocked (no intent, no rule), blocked (intent and rule present), and a
//! transient pending-removal state resolved by the periodic orphan pass.
//! Ordering policy:
//! - `block` is backend-first: never claim a block that was not enforced.
//! - `unblock` is store-first: a stale rule that still drops traffic beats
//!   a missing rule the store believes exists.

use crate::db::{BlockIntent, Database};
use crate::detector::BlockSink;
use crate::error::EngineError;
use crate::firewall::RuleBackend;
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Counts returned by [`Reconciler::sweep_expired`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Expired intents removed from the store.
    pub removed: usize,
    /// Backend removals that failed and were left for the orphan pass.
    pub backend_errors: usize,
}

/// Counts returned by [`Reconciler::reconcile_orphans`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Rules deleted because no intent covers them.
    pub orphan_rules_removed: usize,
    /// Intents whose missing rule was re-applied.
    pub intents_reapplied: usize,
    /// Individual backend failures during the pass.
    pub backend_errors: usize,
}

/// The block orchestration engine.
pub struct Reconciler {
    backend: Arc<dyn RuleBackend>,
    db: Database,
    comment_tag: String,
    /// The packet filter's rule table is globally shared mutable state.
    /// Every mutating sequence (block, unblock, sweep, orphan pass) holds
    /// this lock for its whole duration; interleaved mutations are the
    /// primary source of lost or duplicated rules.
    mutation_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn RuleBackend>, db: Database, comment_tag: impl Into<String>) -> Self {
        Self {
            backend,
            db,
            comment_tag: comment_tag.into(),
            mutation_lock: Mutex::new(()),
        }
    }

    fn parse_address(address: &str) -> Result<IpAddr, EngineError> {
        address
            .parse()
            .map_err(|_| EngineError::InvalidAddress(address.to_string()))
    }

    /// Delete the rule(s) for exactly one `(address, port)` key.
    ///
    /// Unlike `remove_block` with no port, this never touches port-scoped
    /// siblings of a whole-address key. Caller holds the mutation lock.
    async fn clear_key_rules(&self, address: IpAddr, port: Option<u16>) -> Result<u64, EngineError> {
        let rules = self.backend.list_rules().await?;
        let mut removed = 0;
        for rule in rules {
            if rule.source == address && rule.port == port {
                self.backend.delete_rule(&rule).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Block a source, optionally scoped to one destination port.
    ///
    /// Backend-first: the intent is recorded only once the rule is live. A
    /// prior rule for the same key is cleared first, so replacement never
    /// duplicates rules. If the store write fails after the rule was
    /// applied, the rule is rolled back and nothing is recorded.
    pub async fn block(
        &self,
        address: &str,
        port: Option<u16>,
        reason: Option<&str>,
        ttl: Option<i64>,
    ) -> Result<BlockIntent, EngineError> {
        let addr = Self::parse_address(address)?;
        let _guard = self.mutation_lock.lock().await;

        let cleared = self.clear_key_rules(addr, port).await?;
        if cleared > 0 {
            debug!(address = %addr, port = ?port, cleared, "replaced existing rule for key");
        }

        let comment = reason.unwrap_or(&self.comment_tag);
        self.backend.apply_block(addr, port, Some(comment)).await?;

        match self.db.blocks().upsert(addr, port, reason, ttl).await {
            Ok(intent) => {
                metrics::inc(&metrics::BLOCKS_APPLIED);
                info!(address = %addr, port = ?port, reason = ?reason, ttl = ?ttl, "source blocked");
                Ok(intent)
            }
            Err(e) => {
                warn!(address = %addr, error = %e, "store write failed after rule was applied, rolling back rule");
                if let Err(be) = self.clear_key_rules(addr, port).await {
                    metrics::inc(&metrics::DISCREPANCIES);
                    warn!(address = %addr, error = %be, "rollback failed, orphan pass will collect the rule");
                }
                Err(e.into())
            }
        }
    }

    /// Unblock a source. Omitting the port removes every intent and rule
    /// for the address.
    ///
    /// Store-first: the caller-visible contract is the intent removal. A
    /// failed backend removal is logged as a discrepancy and left for the
    /// next orphan pass; the operation still succeeds. Returns the count
    /// of rules removed; zero means "already absent" and is not an error.
    pub async fn unblock(&self, address: &str, port: Option<u16>) -> Result<u64, EngineError> {
        let addr = Self::parse_address(address)?;
        let _guard = self.mutation_lock.lock().await;

        self.db.blocks().remove(addr, port).await?;

        match self.backend.remove_block(addr, port).await {
            Ok(removed) => {
                metrics::inc(&metrics::UNBLOCKS);
                info!(address = %addr, port = ?port, removed, "source unblocked");
                Ok(removed)
            }
            Err(e) => {
                metrics::inc(&metrics::DISCREPANCIES);
                warn!(
                    address = %addr,
                    port = ?port,
                    error = %e,
                    "reconciliation discrepancy: rule removal failed, stale rule remains until the next orphan pass"
                );
                Ok(0)
            }
        }
    }

    /// All current intents, most recent first.
    pub async fn list_all(&self) -> Result<Vec<BlockIntent>, EngineError> {
        Ok(self.db.blocks().list_all().await?)
    }

    /// Remove every intent whose TTL has passed at `now`.
    ///
    /// Backend removal targets the intent's exact `(address, port)` key,
    /// never a wildcard: a live port-scoped sibling of an expired
    /// whole-address intent must keep its rule. Removal is best-effort per
    /// intent; the store row is always dropped, since a past-TTL intent is
    /// never re-extended. Individual backend failures are logged and left
    /// for the orphan pass.
    pub async fn sweep_expired(&self, now: i64) -> Result<SweepOutcome, EngineError> {
        let _guard = self.mutation_lock.lock().await;

        let expired = self.db.blocks().list_expired(now).await?;
        let mut outcome = SweepOutcome::default();

        for intent in expired {
            if let Err(e) = self.clear_key_rules(intent.address, intent.port).await {
                outcome.backend_errors += 1;
                metrics::inc(&metrics::DISCREPANCIES);
                warn!(
                    address = %intent.address,
                    port = ?intent.port,
                    error = %e,
                    "expiry sweep could not remove rule, continuing"
                );
            }
            self.db
                .blocks()
                .remove_key(intent.address, intent.port)
                .await?;
            outcome.removed += 1;
        }

        if outcome.removed > 0 {
            metrics::add(&metrics::SWEEP_REMOVED, outcome.removed as u64);
            info!(
                removed = outcome.removed,
                backend_errors = outcome.backend_errors,
                "expired blocks swept"
            );
        }
        Ok(outcome)
    }

    /// Defensive consistency pass, safe to run on any schedule.
    ///
    /// Rules with no covering intent are deleted (self-healing of the
    /// backend-first bias); intents with no live rule are re-applied.
    pub async fn reconcile_orphans(&self) -> Result<ReconcileOutcome, EngineError> {
        let _guard = self.mutation_lock.lock().await;

        let rules = self.backend.list_rules().await?;
        let intents = self.db.blocks().list_all().await?;
        let intent_keys: HashSet<_> = intents.iter().map(BlockIntent::key).collect();
        let rule_keys: HashSet<_> = rules.iter().map(|r| (r.source, r.port)).collect();

        let mut outcome = ReconcileOutcome::default();

        for rule in &rules {
            if intent_keys.contains(&(rule.source, rule.port)) {
                continue;
            }
            match self.backend.delete_rule(rule).await {
                Ok(()) => {
                    outcome.orphan_rules_removed += 1;
                    info!(address = %rule.source, port = ?rule.port, "removed orphan rule with no recorded intent");
                }
                Err(e) => {
                    outcome.backend_errors += 1;
                    warn!(address = %rule.source, error = %e, "failed to remove orphan rule");
                }
            }
        }

        for intent in &intents {
            if rule_keys.contains(&intent.key()) {
                continue;
            }
            let comment = intent.reason.as_deref().unwrap_or(&self.comment_tag);
            match self
                .backend
                .apply_block(intent.address, intent.port, Some(comment))
                .await
            {
                Ok(()) => {
                    outcome.intents_reapplied += 1;
                    info!(address = %intent.address, port = ?intent.port, "re-applied missing rule for recorded intent");
                }
                Err(e) => {
                    outcome.backend_errors += 1;
                    warn!(address = %intent.address, error = %e, "failed to re-apply rule for intent");
                }
            }
        }

        if outcome != ReconcileOutcome::default() {
            info!(
                orphan_rules_removed = outcome.orphan_rules_removed,
                intents_reapplied = outcome.intents_reapplied,
                backend_errors = outcome.backend_errors,
                "orphan reconciliation completed"
            );
        }
        Ok(outcome)
    }
}

#[async_trait]
impl BlockSink for Reconciler {
    async fn submit_block(
        &self,
        address: IpAddr,
        reason: &str,
        ttl: Option<i64>,
    ) -> Result<(), EngineError> {
        self.block(&address.to_string(), None, Some(reason), ttl)
            .await?;
        Ok(())
    }
}
