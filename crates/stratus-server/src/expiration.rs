//! Idle-query expiration.
//!
//! Registered queries with a positive effective timeout sit in a deadline
//! queue ordered by `(deadline_ms, query_id)`. Deadlines only ever move
//! forward: client activity advances a query's `last_active` timestamp,
//! and the sweep re-keys the entry lazily when it notices the stored
//! deadline is stale. That keeps the common case cheap: the sweep stops
//! at the first entry whose stored deadline is both in the future and
//! accurate.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use stratus_common::units::pretty_duration_ms;
use stratus_common::wire::QueryId;
use stratus_common::QueryStatus;

use crate::cancellation::CancellationWork;
use crate::metrics;
use crate::server::ControlServer;

impl ControlServer {
    /// Effective idle timeout for a query, in seconds. When both the
    /// daemon default and the per-query option are positive the smaller
    /// wins; otherwise whichever is set wins. 0 disables expiration.
    pub(crate) fn effective_timeout_s(&self, query_timeout_s: i32) -> i32 {
        let default = self.flags.idle_query_timeout;
        if default > 0 && query_timeout_s > 0 {
            default.min(query_timeout_s)
        } else {
            default.max(query_timeout_s)
        }
    }

    /// Add a freshly registered query to the deadline queue. Caller has
    /// already established that `timeout_s > 0`.
    pub(crate) fn queue_query_expiration(&self, query_id: QueryId, timeout_s: i32) {
        debug!(
            query_id = %query_id,
            timeout = %pretty_duration_ms(timeout_s as i64 * 1000),
            "Query registered with idle timeout"
        );
        let deadline = Utc::now().timestamp_millis() + timeout_s as i64 * 1000;
        self.queries_by_timestamp.lock().insert((deadline, query_id));
    }

    /// One expiration sweep. Walks the queue in deadline order and, for
    /// each entry with a stored deadline at or before `now_ms`:
    ///
    /// - drops it if the query is already gone;
    /// - stops if the entry's recomputed deadline is in the future and
    ///   matches the stored key (the queue is ordered, so nothing later
    ///   can be due either);
    /// - re-keys it if the recomputed deadline moved;
    /// - expires the query if it is due and not actively being used by a
    ///   client. Active queries are skipped; their activity will re-key
    ///   the entry on a later pass.
    pub(crate) fn sweep_expired_queries(&self, now_ms: i64) {
        let mut queue = self.queries_by_timestamp.lock();
        let mut cursor: Option<(i64, QueryId)> = None;
        loop {
            let entry = match cursor {
                None => queue.iter().next().copied(),
                Some(c) => queue
                    .range((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded))
                    .next()
                    .copied(),
            };
            let Some((deadline, query_id)) = entry else { break };
            if deadline > now_ms {
                break;
            }

            let state = match self.get_query_exec_state(&query_id) {
                Some(state) => state,
                None => {
                    // Unregistered some other way.
                    queue.remove(&(deadline, query_id));
                    cursor = Some((deadline, query_id));
                    continue;
                }
            };

            let timeout_s = self.effective_timeout_s(state.options().query_timeout_s);
            let expiration = state.last_active_ms() + timeout_s as i64 * 1000;
            if now_ms < expiration {
                if expiration == deadline {
                    // Inserted in expiration order and unchanged since, so
                    // this is the next query to expire. Nothing to do yet.
                    break;
                }
                queue.remove(&(deadline, query_id));
                queue.insert((expiration, query_id));
                cursor = Some((deadline, query_id));
            } else if !state.is_active() {
                let cause = format!(
                    "Query {} expired due to client inactivity (timeout is {})",
                    query_id,
                    pretty_duration_ms(timeout_s as i64 * 1000)
                );
                debug!(query_id = %query_id, "Expiring query due to client inactivity");
                self.offer_cancellation(CancellationWork::cancel(
                    query_id,
                    QueryStatus::error(cause),
                ));
                queue.remove(&(deadline, query_id));
                metrics::NUM_QUERIES_EXPIRED.inc();
                cursor = Some((deadline, query_id));
            } else {
                // Deadline exhausted but a client request is in flight;
                // leave the entry for the activity update to re-key.
                cursor = Some((deadline, query_id));
            }
        }
    }

    /// Expiration timer. Timeouts have 1 s granularity, so a 1 s sleep
    /// bounds the slack at 1 s without waking the daemon more than needed.
    pub(crate) async fn expire_queries_loop(self: Arc<Self>) {
        loop {
            self.sweep_expired_queries(Utc::now().timestamp_millis());
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestDaemon;
    use chrono::Utc;

    #[test]
    fn test_effective_timeout_rule() {
        let daemon = TestDaemon::builder().idle_query_timeout(10).build();
        // Both positive: min wins.
        assert_eq!(daemon.server.effective_timeout_s(5), 5);
        assert_eq!(daemon.server.effective_timeout_s(20), 10);
        // Only one set: it wins.
        assert_eq!(daemon.server.effective_timeout_s(0), 10);

        let daemon = TestDaemon::builder().build();
        assert_eq!(daemon.server.effective_timeout_s(7), 7);
        assert_eq!(daemon.server.effective_timeout_s(0), 0);
    }

    #[tokio::test]
    async fn test_idle_query_expires_with_rendered_cause() {
        // Scenario: idle_query_timeout=2, a query with QUERY_TIMEOUT_S=0
        // registered at t=0 and never touched expires at t~2s.
        let daemon = TestDaemon::builder().idle_query_timeout(2).build();
        let (state, _session) = daemon.start_query("select 1").await;

        let expired_before = crate::metrics::NUM_QUERIES_EXPIRED.get();
        daemon
            .server
            .sweep_expired_queries(Utc::now().timestamp_millis() + 2_500);

        let work = daemon.server.cancellation_rx.try_recv().unwrap();
        assert_eq!(work.query_id, state.query_id());
        assert!(!work.unregister);
        assert_eq!(
            work.cause.message(),
            format!(
                "Query {} expired due to client inactivity (timeout is 2s000ms)",
                state.query_id()
            )
        );
        assert_eq!(crate::metrics::NUM_QUERIES_EXPIRED.get(), expired_before + 1);
        // The queue entry is consumed.
        assert!(daemon.server.queries_by_timestamp.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_rekeys_entries_after_activity() {
        let daemon = TestDaemon::builder().idle_query_timeout(2).build();
        let (state, _session) = daemon.start_query("select 1").await;

        // Touch the query, pushing its true deadline past the stored one.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state.mark_active();
        state.mark_inactive();

        // A moment where the stored deadline has passed but the recomputed
        // one has not.
        daemon
            .server
            .sweep_expired_queries(state.last_active_ms() + 1_990);

        // Not expired: the entry was re-keyed to the new deadline instead.
        assert!(daemon.server.cancellation_rx.try_recv().is_err());
        let queue = daemon.server.queries_by_timestamp.lock();
        assert_eq!(queue.len(), 1);
        let (deadline, query_id) = *queue.iter().next().unwrap();
        assert_eq!(query_id, state.query_id());
        assert_eq!(deadline, state.last_active_ms() + 2_000);
    }

    #[tokio::test]
    async fn test_active_queries_are_not_expired() {
        let daemon = TestDaemon::builder().idle_query_timeout(2).build();
        let (state, _session) = daemon.start_query("select 1").await;

        state.mark_active();
        let last_active = state.last_active_ms();
        daemon.server.sweep_expired_queries(last_active + 10_000);

        assert!(daemon.server.cancellation_rx.try_recv().is_err());
        // Entry stays queued for a later pass.
        assert_eq!(daemon.server.queries_by_timestamp.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_entries_for_gone_queries_are_dropped() {
        let daemon = TestDaemon::builder().idle_query_timeout(2).build();
        let (state, _session) = daemon.start_query("select 1").await;
        daemon.server.unregister_query(&state.query_id(), None).await;

        daemon
            .server
            .sweep_expired_queries(Utc::now().timestamp_millis() + 10_000);
        assert!(daemon.server.queries_by_timestamp.lock().is_empty());
        assert!(daemon.server.cancellation_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_timeout_queries_never_enter_the_queue() {
        let daemon = TestDaemon::builder().build();
        let (_state, _session) = daemon.start_query("select 1").await;
        assert!(daemon.server.queries_by_timestamp.lock().is_empty());
    }
}
