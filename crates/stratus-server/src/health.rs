//! Node-manager connectivity probing.
//!
//! When `--local_nodemanager_url` is set, the daemon probes the node
//! manager by TCP connect on a fixed cadence. Enough consecutive failures
//! flip the daemon offline (new queries are refused with a retryable
//! error); recovery flips it back. Executor-side work continues either
//! way.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::parse_nodemanager_address;
use crate::server::ControlServer;

/// Consecutive missed heartbeats before a peer counts as failed.
const MAX_MISSED_HEARTBEATS: u32 = 5;
/// Probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// Per-probe connect timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Healthy,
    Suspected,
    Failed,
}

/// A missed-heartbeat failure detector: failed after `max_missed`
/// consecutive misses, suspected at half that, healthy on any success.
pub struct MissedHeartbeatFailureDetector {
    max_missed: u32,
    consecutive_missed: u32,
}

impl MissedHeartbeatFailureDetector {
    pub fn new(max_missed: u32) -> Self {
        MissedHeartbeatFailureDetector { max_missed, consecutive_missed: 0 }
    }

    pub fn record_heartbeat(&mut self, success: bool) {
        if success {
            self.consecutive_missed = 0;
        } else {
            self.consecutive_missed = self.consecutive_missed.saturating_add(1);
        }
    }

    pub fn state(&self) -> PeerState {
        if self.consecutive_missed >= self.max_missed {
            PeerState::Failed
        } else if self.consecutive_missed >= self.max_missed / 2 {
            PeerState::Suspected
        } else {
            PeerState::Healthy
        }
    }
}

impl ControlServer {
    /// Probe loop driving the offline flag from node-manager reachability.
    pub(crate) async fn detect_nodemanager_failures(self: Arc<Self>) {
        let address = match parse_nodemanager_address(&self.flags.local_nodemanager_url) {
            Ok(address) => address,
            Err(e) => {
                error!("No node-manager failure detection started: {}", e);
                return;
            }
        };
        info!(address = %address, "Starting node-manager failure-detection");

        let mut detector = MissedHeartbeatFailureDetector::new(MAX_MISSED_HEARTBEATS);
        let mut last_failure_state = false;
        loop {
            let target = format!("{}:{}", address.host, address.port);
            let reachable = matches!(
                tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(&target)).await,
                Ok(Ok(_))
            );
            detector.record_heartbeat(reachable);

            let is_failed = detector.state() == PeerState::Failed;
            if is_failed != last_failure_state {
                if is_failed {
                    warn!("Going offline while node-manager connectivity is bad");
                } else {
                    warn!("Node-manager connectivity restored, back online");
                }
                self.set_offline(is_failed);
            }
            last_failure_state = is_failed;
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_fails_after_max_misses() {
        let mut detector = MissedHeartbeatFailureDetector::new(5);
        assert_eq!(detector.state(), PeerState::Healthy);

        detector.record_heartbeat(false);
        detector.record_heartbeat(false);
        assert_eq!(detector.state(), PeerState::Suspected);

        for _ in 0..3 {
            detector.record_heartbeat(false);
        }
        assert_eq!(detector.state(), PeerState::Failed);
    }

    #[test]
    fn test_detector_recovers_on_success() {
        let mut detector = MissedHeartbeatFailureDetector::new(5);
        for _ in 0..10 {
            detector.record_heartbeat(false);
        }
        assert_eq!(detector.state(), PeerState::Failed);
        detector.record_heartbeat(true);
        assert_eq!(detector.state(), PeerState::Healthy);
    }
}
