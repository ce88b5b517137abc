//! Cluster membership tracking and failure-driven cancellation.
//!
//! The membership topic carries the set of live backends. Whenever a
//! backend disappears from it, every query known (via `query_locations`)
//! to run a fragment there is doomed: its coordinator would wait forever
//! for reports that will never come. Such queries are cancelled through
//! the cancellation pool with a cause naming the unreachable peers, and
//! cached connections to those peers are closed.

use std::collections::{BTreeMap, HashSet};

use serde_json::from_slice;
use tracing::{debug, warn};

use stratus_common::wire::{BackendDescriptor, HostPort, QueryId, TopicDelta, MEMBERSHIP_TOPIC};
use stratus_common::QueryStatus;

use crate::cancellation::CancellationWork;
use crate::metrics;
use crate::server::{ControlServer, MAX_CANCELLATION_QUEUE_SIZE};

impl ControlServer {
    /// The network addresses of the currently known backends.
    pub fn current_membership(&self) -> HashSet<HostPort> {
        self.known_backends.lock().values().cloned().collect()
    }

    /// Apply one membership topic delta.
    pub fn membership_callback(&self, delta: &TopicDelta) {
        if delta.topic_name != MEMBERSHIP_TOPIC {
            return;
        }

        let current_membership = {
            let mut backends = self.known_backends.lock();
            // A non-delta update carries the full topic state.
            if !delta.is_delta {
                backends.clear();
            }
            for item in &delta.topic_entries {
                let descriptor: BackendDescriptor = match from_slice(&item.value) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        debug!(key = %item.key, "Error deserializing membership topic item: {}", e);
                        continue;
                    }
                };
                backends.insert(item.key.clone(), descriptor.address);
            }
            for backend_id in &delta.topic_deletions {
                backends.remove(backend_id);
            }
            metrics::NUM_KNOWN_BACKENDS.set(backends.len() as i64);
            backends.values().cloned().collect::<HashSet<_>>()
        };

        // Queries to cancel, keyed by query id, with the failed peers that
        // doomed them. BTreeMap keeps the cause message deterministic.
        let mut queries_to_cancel: BTreeMap<QueryId, Vec<HostPort>> = BTreeMap::new();
        {
            let mut locations = self.query_locations.lock();
            locations.retain(|host, query_ids| {
                if current_membership.contains(host) {
                    return true;
                }
                for query_id in query_ids.iter() {
                    queries_to_cancel
                        .entry(*query_id)
                        .or_default()
                        .push(host.clone());
                }
                self.env.client_cache.close_connections(host);
                // The whole entry goes once the backend is known dead.
                false
            });
        }

        if queries_to_cancel.is_empty() {
            return;
        }
        if self.cancellation_queue_len() + queries_to_cancel.len() > MAX_CANCELLATION_QUEUE_SIZE {
            // Drop the batch; the next heartbeat re-derives the same
            // conclusions from query_locations.
            warn!("Cancellation queue is full");
            return;
        }
        for (query_id, mut failed_hosts) in queries_to_cancel {
            failed_hosts.sort();
            let hosts = failed_hosts
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let cause = format!("Cancelled due to unreachable impalad(s): {}", hosts);
            self.offer_cancellation(CancellationWork::cancel(query_id, QueryStatus::error(cause)));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{backend_entry, membership_delta, TestDaemon};
    use stratus_common::wire::HostPort;

    #[tokio::test]
    async fn test_full_state_replaces_membership() {
        let daemon = TestDaemon::builder().build();
        daemon.server.membership_callback(&membership_delta(
            false,
            vec![backend_entry("A", "a", 1), backend_entry("B", "b", 1)],
            vec![],
        ));
        assert_eq!(daemon.server.current_membership().len(), 2);

        // A later full-state update replaces everything.
        daemon
            .server
            .membership_callback(&membership_delta(false, vec![backend_entry("C", "c", 1)], vec![]));
        let membership = daemon.server.current_membership();
        assert_eq!(membership.len(), 1);
        assert!(membership.contains(&HostPort::new("c", 1)));
    }

    #[tokio::test]
    async fn test_delta_applies_additions_and_deletions() {
        let daemon = TestDaemon::builder().build();
        daemon.server.membership_callback(&membership_delta(
            false,
            vec![backend_entry("A", "a", 1)],
            vec![],
        ));
        daemon.server.membership_callback(&membership_delta(
            true,
            vec![backend_entry("B", "b", 1)],
            vec!["A".to_string()],
        ));
        let membership = daemon.server.current_membership();
        assert!(membership.contains(&HostPort::new("b", 1)));
        assert!(!membership.contains(&HostPort::new("a", 1)));
    }

    // Membership loss: a vanished backend dooms the queries that ran
    // fragments on it. Its query_locations entry is dropped, connections
    // to it are closed, and a cancellation naming it is enqueued.
    #[tokio::test]
    async fn test_vanished_backend_cancels_its_queries() {
        let daemon = TestDaemon::builder().build();
        // Known backends {A -> a:1, B -> b:1}; the fake coordinator places
        // fragments on both.
        daemon.set_executor_hosts(vec![HostPort::new("a", 1), HostPort::new("b", 1)]);
        daemon.server.membership_callback(&membership_delta(
            false,
            vec![backend_entry("A", "a", 1), backend_entry("B", "b", 1)],
            vec![],
        ));

        let (state, _session) = daemon.start_query("select 1").await;
        let b = HostPort::new("b", 1);
        daemon.server.env().client_cache.note_connection(&b);

        // B vanishes.
        daemon
            .server
            .membership_callback(&membership_delta(true, vec![], vec!["B".to_string()]));

        assert!(!daemon.server.query_locations.lock().contains_key(&b));
        assert_eq!(daemon.server.env().client_cache.open_connections(&b), 0);

        let work = daemon.server.cancellation_rx.try_recv().unwrap();
        assert_eq!(work.query_id, state.query_id());
        assert!(!work.unregister);
        assert_eq!(
            work.cause.message(),
            "Cancelled due to unreachable impalad(s): b:1"
        );

        // The healthy backend's entry survives.
        assert!(daemon
            .server
            .query_locations
            .lock()
            .contains_key(&HostPort::new("a", 1)));
    }

    #[tokio::test]
    async fn test_multiple_failed_hosts_render_sorted() {
        let daemon = TestDaemon::builder().build();
        daemon.set_executor_hosts(vec![HostPort::new("b", 1), HostPort::new("a", 1)]);
        daemon.server.membership_callback(&membership_delta(
            false,
            vec![backend_entry("A", "a", 1), backend_entry("B", "b", 1)],
            vec![],
        ));
        let (_state, _session) = daemon.start_query("select 1").await;

        // Everything vanishes at once.
        daemon
            .server
            .membership_callback(&membership_delta(false, vec![], vec![]));

        let work = daemon.server.cancellation_rx.try_recv().unwrap();
        assert_eq!(
            work.cause.message(),
            "Cancelled due to unreachable impalad(s): a:1, b:1"
        );
    }

    #[tokio::test]
    async fn test_losing_a_backend_without_queries_is_quiet() {
        let daemon = TestDaemon::builder().build();
        daemon.server.membership_callback(&membership_delta(
            false,
            vec![backend_entry("A", "a", 1)],
            vec![],
        ));
        daemon
            .server
            .membership_callback(&membership_delta(true, vec![], vec!["A".to_string()]));
        assert!(daemon.server.cancellation_rx.try_recv().is_err());
    }
}
