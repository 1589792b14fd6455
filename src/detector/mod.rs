//! Threshold detector: turns a raw log stream into block intents.
//!
//! A strictly sequential consumer: each line is fully processed, including
//! any outbound block call, before the next is read, because the ordering
//! of window mutations depends on it. The detector knows nothing about the
//! rule backend or the store; it only speaks to a [`BlockSink`].

pub mod tail;

use crate::config::DetectorConfig;
use crate::error::EngineError;
use crate::metrics;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Matches IPv4 dotted quads and rough IPv6 shapes; candidates are then
/// strictly validated with an `IpAddr` parse.
const IP_PATTERN: &str = r"(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)|(?:[0-9a-fA-F]{0,4}:){2,7}[0-9a-fA-F]{0,4}";

/// Outbound side of the detector: whoever accepts block intents.
///
/// Implemented by the reconciler; tests substitute a recorder.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn submit_block(
        &self,
        address: IpAddr,
        reason: &str,
        ttl: Option<i64>,
    ) -> Result<(), EngineError>;
}

/// Sliding-window bruteforce detector.
///
/// Windows are exclusively owned by this detector and never persisted.
pub struct ThresholdDetector {
    config: DetectorConfig,
    /// Lowercased trigger patterns for case-insensitive matching.
    patterns: Vec<String>,
    ip_regex: Regex,
    /// Per-address recent failure timestamps, bounded by the window.
    windows: HashMap<IpAddr, VecDeque<i64>>,
    sink: Arc<dyn BlockSink>,
    last_idle_prune: i64,
}

impl ThresholdDetector {
    pub fn new(config: DetectorConfig, sink: Arc<dyn BlockSink>) -> Self {
        let patterns = config.patterns.iter().map(|p| p.to_lowercase()).collect();
        Self {
            config,
            patterns,
            // the pattern is a vetted constant
            ip_regex: Regex::new(IP_PATTERN).expect("ip regex"),
            windows: HashMap::new(),
            sink,
            last_idle_prune: 0,
        }
    }

    /// First address-shaped token in the line that survives strict parsing.
    fn extract_address(&self, line: &str) -> Option<IpAddr> {
        for m in self.ip_regex.find_iter(line) {
            if let Ok(addr) = m.as_str().parse() {
                return Some(addr);
            }
        }
        None
    }

    fn matches_trigger(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p))
    }

    /// Process one line observed at time `now` (Unix seconds).
    ///
    /// Lines arrive in non-decreasing time order, so evicting from the
    /// front of the window is sufficient.
    pub async fn handle_line(&mut self, line: &str, now: i64) {
        if line.is_empty() || !self.matches_trigger(line) {
            return;
        }
        let Some(address) = self.extract_address(line) else {
            return;
        };

        let window = self.windows.entry(address).or_default();
        window.push_back(now);

        let cutoff = now - self.config.window_secs;
        while window.front().is_some_and(|&t| t < cutoff) {
            window.pop_front();
        }

        let failures = window.len();
        if failures < self.config.threshold {
            debug!(
                address = %address,
                failures,
                threshold = self.config.threshold,
                "failure recorded"
            );
            return;
        }

        warn!(
            address = %address,
            failures,
            window_secs = self.config.window_secs,
            "bruteforce pattern detected"
        );
        match self
            .sink
            .submit_block(
                address,
                &self.config.reason,
                Some(self.config.block_ttl_secs),
            )
            .await
        {
            Ok(()) => {
                metrics::inc(&metrics::DETECTOR_TRIGGERS);
                // prevent an immediate re-trigger once the block expires
                // and the address resumes failing
                if let Some(w) = self.windows.get_mut(&address) {
                    w.clear();
                }
            }
            Err(e) => {
                metrics::record_engine_error(e.error_code());
                // window kept intact so the next qualifying line retries
                error!(address = %address, error = %e, "block submission failed");
            }
        }
    }

    /// Drop windows with no failure newer than the sliding window.
    ///
    /// Bounds memory against drive-by scanners that appear once and never
    /// return. Returns the number of windows evicted.
    pub fn prune_idle(&mut self, now: i64) -> usize {
        let cutoff = now - self.config.window_secs;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.back().is_some_and(|&t| t >= cutoff));
        before - self.windows.len()
    }

    /// Number of addresses with a live window. Test observability.
    #[cfg(test)]
    fn tracked_addresses(&self) -> usize {
        self.windows.len()
    }

    /// Consume the tailed stream until it fails.
    pub async fn run(mut self, mut source: tail::LogTail) -> std::io::Result<()> {
        info!(
            threshold = self.config.threshold,
            window_secs = self.config.window_secs,
            block_ttl_secs = self.config.block_ttl_secs,
            "threshold detector started"
        );
        loop {
            let line = source.next_line().await?;
            let now = chrono::Utc::now().timestamp();
            self.handle_line(&line, now).await;

            if now - self.last_idle_prune >= self.config.window_secs {
                let evicted = self.prune_idle(now);
                if evicted > 0 {
                    debug!(evicted, "idle failure windows pruned");
                }
                self.last_idle_prune = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        calls: StdMutex<Vec<(IpAddr, String, Option<i64>)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BlockSink for RecordingSink {
        async fn submit_block(
            &self,
            address: IpAddr,
            reason: &str,
            ttl: Option<i64>,
        ) -> Result<(), EngineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::InvalidAddress("injected".into()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((address, reason.to_string(), ttl));
            Ok(())
        }
    }

    fn test_config() -> DetectorConfig {
        DetectorConfig {
            threshold: 3,
            window_secs: 300,
            block_ttl_secs: 7200,
            ..DetectorConfig::default()
        }
    }

    fn detector() -> (Arc<RecordingSink>, ThresholdDetector) {
        let sink = Arc::new(RecordingSink::default());
        let det = ThresholdDetector::new(test_config(), sink.clone());
        (sink, det)
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_non_matching_lines_ignored() {
        let (sink, mut det) = detector();
        for t in 0..10 {
            det.handle_line("GET /health 200 OK from 1.2.3.4", t).await;
        }
        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(det.tracked_addresses(), 0);
    }

    #[tokio::test]
    async fn test_matching_line_without_address_ignored() {
        let (sink, mut det) = detector();
        det.handle_line("authentication failed for unknown peer", 0)
            .await;
        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(det.tracked_addresses(), 0);
    }

    #[tokio::test]
    async fn test_window_eviction() {
        let sink = Arc::new(RecordingSink::default());
        let mut cfg = test_config();
        cfg.window_secs = 2;
        cfg.threshold = 10;
        let mut det = ThresholdDetector::new(cfg, sink);

        // failures at 0, 1, 2 with W=2; the append at t=3 evicts the first
        for t in [0, 1, 2, 3] {
            det.handle_line("Failed password for root from 5.6.7.8", t)
                .await;
        }
        assert_eq!(det.windows[&addr("5.6.7.8")].len(), 3);
        assert_eq!(*det.windows[&addr("5.6.7.8")].front().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_threshold_fires_exactly_once_and_clears() {
        let (sink, mut det) = detector();
        let line = "sshd: Failed password for admin from 1.2.3.4 port 22";

        det.handle_line(line, 0).await;
        det.handle_line(line, 10).await;
        assert!(sink.calls.lock().unwrap().is_empty());

        det.handle_line(line, 20).await;
        {
            let calls = sink.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0], (addr("1.2.3.4"), "auth_bruteforce".into(), Some(7200)));
        }

        // window cleared: the next failures rebuild from zero
        det.handle_line(line, 30).await;
        det.handle_line(line, 40).await;
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_retrigger_after_window_decay() {
        let (sink, mut det) = detector();
        let line = "Invalid user pi from 9.9.9.9";

        det.handle_line(line, 0).await;
        det.handle_line(line, 100).await;
        // window is W=300: by t=400 the first two entries are evicted
        det.handle_line(line, 400).await;
        det.handle_line(line, 410).await;
        assert!(sink.calls.lock().unwrap().is_empty());

        // a third failure inside the window finally fires
        det.handle_line(line, 420).await;
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_window_for_retry() {
        let (sink, mut det) = detector();
        let line = "Unauthorized request from 8.8.4.4";
        sink.fail.store(true, Ordering::SeqCst);

        for t in [0, 1, 2] {
            det.handle_line(line, t).await;
        }
        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(det.windows[&addr("8.8.4.4")].len(), 3);

        // next qualifying line retries and succeeds
        sink.fail.store(false, Ordering::SeqCst);
        det.handle_line(line, 3).await;
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_address_in_line_wins() {
        let (sink, mut det) = detector();
        let line = "authentication failed for 10.1.1.1 proxied via 10.2.2.2";
        for t in [0, 1, 2] {
            det.handle_line(line, t).await;
        }
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0].0, addr("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_ipv6_candidate() {
        let (sink, mut det) = detector();
        let line = "Failed password for root from 2001:db8::beef";
        for t in [0, 1, 2] {
            det.handle_line(line, t).await;
        }
        assert_eq!(sink.calls.lock().unwrap()[0].0, addr("2001:db8::beef"));
    }

    #[tokio::test]
    async fn test_prune_idle_bounds_memory() {
        let (_, mut det) = detector();
        det.handle_line("Invalid user a from 10.0.0.1", 0).await;
        det.handle_line("Invalid user b from 10.0.0.2", 100).await;
        assert_eq!(det.tracked_addresses(), 2);

        // at t=350 the cutoff is 50: 10.0.0.1's newest failure (0) is past
        // the 300s window, 10.0.0.2's (100) is still inside it
        assert_eq!(det.prune_idle(350), 1);
        assert_eq!(det.tracked_addresses(), 1);
        assert!(det.windows.contains_key(&addr("10.0.0.2")));
    }
}
