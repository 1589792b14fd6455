//! iptables/ip6tables backend adapter.
//!
//! Every mutation is one external command invocation under a timeout; there
//! is no multi-step transaction, so a call either fully applies or fails
//! outright. The binary is chosen by address family.

use super::rule::{self, ChainRule};
use super::{BackendError, RuleBackend};
use crate::config::FirewallConfig;
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// iptables rejects rule comments longer than 256 bytes; stay under it.
const MAX_COMMENT_LEN: usize = 255;

/// Adapter driving the host's iptables/ip6tables binaries.
pub struct IptablesBackend {
    ipv4_cmd: String,
    ipv6_cmd: String,
    table: String,
    chain: String,
    input_chain: String,
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            ipv4_cmd: config.iptables_path.clone(),
            ipv6_cmd: config.ip6tables_path.clone(),
            table: config.table.clone(),
            chain: config.chain.clone(),
            input_chain: config.input_chain.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    fn command_for(&self, address: IpAddr) -> &str {
        match address {
            IpAddr::V4(_) => &self.ipv4_cmd,
            IpAddr::V6(_) => &self.ipv6_cmd,
        }
    }

    /// Run a filter command and capture its output without checking the
    /// exit status. Timeouts and spawn failures still convert to errors.
    async fn run_raw(
        &self,
        op: &'static str,
        command: &str,
        args: &[&str],
    ) -> Result<Output, BackendError> {
        debug!(command, ?args, "executing filter command");
        let fut = Command::new(command)
            .arg("-t")
            .arg(&self.table)
            .args(args)
            .output();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(BackendError::Io {
                op,
                command: command.to_string(),
                source,
            }),
            Err(_) => Err(BackendError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }

    /// Run a filter command; non-zero exit converts to [`BackendError`].
    async fn run(
        &self,
        op: &'static str,
        command: &str,
        args: &[&str],
    ) -> Result<Output, BackendError> {
        let output = self.run_raw(op, command, args).await?;
        if !output.status.success() {
            return Err(BackendError::Command {
                op,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !output.stderr.is_empty() {
            warn!(
                command,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "filter command succeeded with stderr output"
            );
        }
        Ok(output)
    }

    /// Checks-before-create for one address family.
    ///
    /// An existence check that fails for any reason other than "chain does
    /// not exist" is a configuration error and is surfaced, not retried.
    async fn ensure_family_chain(&self, command: &str) -> Result<(), BackendError> {
        const OP: &str = "ensure_chain";

        let check = self.run_raw(OP, command, &["-n", "-L", &self.chain]).await?;
        if !check.status.success() {
            let stderr = String::from_utf8_lossy(&check.stderr);
            if !chain_missing(&stderr) {
                return Err(BackendError::Command {
                    op: OP,
                    status: check.status,
                    stderr: stderr.trim().to_string(),
                });
            }
            info!(chain = %self.chain, command, "creating dedicated chain");
            self.run(OP, command, &["-N", &self.chain]).await?;
        }

        // Exactly one jump from the inbound chain, inserted at the top.
        let jump = self
            .run_raw(OP, command, &["-C", &self.input_chain, "-j", &self.chain])
            .await?;
        if !jump.status.success() {
            info!(
                from = %self.input_chain,
                to = %self.chain,
                command,
                "inserting jump into dedicated chain"
            );
            self.run(
                OP,
                command,
                &["-I", &self.input_chain, "1", "-j", &self.chain],
            )
            .await?;
        }

        Ok(())
    }

    async fn list_family_rules(
        &self,
        op: &'static str,
        command: &str,
    ) -> Result<Vec<ChainRule>, BackendError> {
        let output = self.run(op, command, &["-S", &self.chain]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut rules = Vec::new();
        for line in stdout.lines().map(str::trim) {
            match rule::parse_rule(line, &self.chain) {
                Some(r) => rules.push(r),
                // A rule in our own chain that we cannot structure would be
                // invisible to reconciliation; surface it instead.
                None if line.starts_with("-A") => {
                    return Err(BackendError::Unparsable {
                        op,
                        line: line.to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(rules)
    }
}

#[async_trait]
impl RuleBackend for IptablesBackend {
    async fn ensure_chain(&self) -> Result<(), BackendError> {
        self.ensure_family_chain(&self.ipv4_cmd).await?;
        self.ensure_family_chain(&self.ipv6_cmd).await?;
        Ok(())
    }

    async fn apply_block(
        &self,
        address: IpAddr,
        port: Option<u16>,
        comment: Option<&str>,
    ) -> Result<(), BackendError> {
        const OP: &str = "apply_block";
        let command = self.command_for(address);
        self.ensure_family_chain(command).await?;

        let source = address.to_string();
        let port_str = port.map(|p| p.to_string());
        let comment = comment.map(truncate_comment);

        let mut args: Vec<&str> = vec!["-A", &self.chain, "-s", &source];
        if let Some(p) = port_str.as_deref() {
            args.extend(["-p", "tcp", "--dport", p]);
        }
        if let Some(c) = comment.as_deref() {
            args.extend(["-m", "comment", "--comment", c]);
        }
        args.extend(["-j", "DROP"]);

        self.run(OP, command, &args).await?;
        info!(address = %address, port = ?port, "drop rule appended");
        Ok(())
    }

    async fn remove_block(&self, address: IpAddr, port: Option<u16>) -> Result<u64, BackendError> {
        const OP: &str = "remove_block";
        let command = self.command_for(address);

        let rules = self.list_family_rules(OP, command).await?;
        let mut removed = 0;
        for r in rules {
            if r.source != address {
                continue;
            }
            if port.is_some() && r.port != port {
                continue;
            }
            let args = r.delete_args();
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.run(OP, command, &args).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(address = %address, port = ?port, removed, "drop rules removed");
        } else {
            debug!(address = %address, port = ?port, "no matching rules to remove");
        }
        Ok(removed)
    }

    async fn delete_rule(&self, rule: &ChainRule) -> Result<(), BackendError> {
        const OP: &str = "delete_rule";
        let command = self.command_for(rule.source);
        let args = rule.delete_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(OP, command, &args).await?;
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<ChainRule>, BackendError> {
        const OP: &str = "list_rules";
        let mut rules = self.list_family_rules(OP, &self.ipv4_cmd).await?;
        rules.extend(self.list_family_rules(OP, &self.ipv6_cmd).await?);
        Ok(rules)
    }
}

/// Recognize the "chain does not exist" family of listing failures.
fn chain_missing(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name") || stderr.contains("does not exist")
}

/// Truncation to the backend's maximum comment length. The limit is in
/// bytes, so the cut backs up to the nearest character boundary.
fn truncate_comment(comment: &str) -> String {
    if comment.len() <= MAX_COMMENT_LEN {
        return comment.to_string();
    }
    let mut end = MAX_COMMENT_LEN;
    while !comment.is_char_boundary(end) {
        end -= 1;
    }
    comment[..end].to_string()
}
