//! Structured parsing of packet-filter chain listings.
//!
//! `iptables -S <chain>` prints one rule per line in append syntax
//! (`-A CHAIN -s 1.2.3.4/32 ... -j DROP`). This module reconstructs each
//! line into a [`ChainRule`] record once per listing call so matching never
//! happens against raw text, and keeps the original tokens so a rule can be
//! deleted by replaying them with `-D`. This is the one place textual
//! fragility can silently drop or over-match rules, hence the test weight.

use std::net::IpAddr;

/// A live rule in the dedicated chain, reconstructed from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRule {
    /// Source address the rule matches.
    pub source: IpAddr,
    /// Destination port match, when the rule is port-scoped.
    pub port: Option<u16>,
    /// Attribution comment carried by the rule, if any.
    pub comment: Option<String>,
    /// Original tokens of the `-S` line, starting with `-A`.
    pub raw_args: Vec<String>,
}

impl ChainRule {
    /// Arguments that delete this exact rule (`-A` swapped for `-D`).
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = self.raw_args.clone();
        if let Some(first) = args.first_mut() {
            *first = "-D".to_string();
        }
        args
    }
}

/// Split a listing line into tokens, honoring double quotes and backslash
/// escapes the way iptables emits comments.
pub fn split_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut pending = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            pending = true;
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                pending = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

/// Strip a host-sized CIDR suffix (`/32` for v4, `/128` for v6) and parse
/// the remainder as an address. Real ranges are rejected: the engine only
/// ever creates single-host rules.
fn parse_source(token: &str) -> Option<IpAddr> {
    let bare = token
        .strip_suffix("/32")
        .or_else(|| token.strip_suffix("/128"))
        .unwrap_or(token);
    bare.parse().ok()
}

/// Parse one `-S` output line into a [`ChainRule`].
///
/// Returns `None` for lines that are not append rules for `chain` (chain
/// declarations, policies, rules in other chains) or whose source is not a
/// single host address.
pub fn parse_rule(line: &str, chain: &str) -> Option<ChainRule> {
    let tokens = split_tokens(line);
    if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != chain {
        return None;
    }

    let mut source = None;
    let mut port = None;
    let mut comment = None;

    let mut iter = tokens.iter().skip(2);
    while let Some(tok) = iter.next() {
        match tok.as_str() {
            "-s" | "--source" => {
                source = parse_source(iter.next()?)?.into();
            }
            "--dport" => {
                port = iter.next()?.parse::<u16>().ok();
            }
            "--comment" => {
                comment = iter.next().cloned();
            }
            _ => {}
        }
    }

    Some(ChainRule {
        source: source?,
        port,
        comment,
        raw_args: tokens,
    })
}
