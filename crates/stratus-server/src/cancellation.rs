//! The asynchronous cancellation pool.
//!
//! Session expiry, idle-query expiry and membership loss all need to tear
//! queries down without blocking the thread that noticed the event. They
//! enqueue `CancellationWork` here; a small pool of workers drains the
//! queue. Offering never blocks: on a full queue the work is dropped,
//! which is safe because cancellation is idempotent and every producer
//! re-derives its conclusions (the membership handler on the next
//! heartbeat, the expiration sweep on its next pass).

use std::sync::Arc;

use tracing::{debug, warn};

use stratus_common::wire::QueryId;
use stratus_common::QueryStatus;

use crate::metrics;
use crate::server::ControlServer;

/// One unit of asynchronous query teardown.
#[derive(Debug, Clone)]
pub struct CancellationWork {
    pub query_id: QueryId,
    /// The cause wrapped around the query's sticky status.
    pub cause: QueryStatus,
    /// Unregister (fatal events: session close/expiry) rather than just
    /// cancel (recoverable events: idle-query expiry, peer loss).
    /// Unregistering also cancels, then tears down and archives.
    pub unregister: bool,
}

impl CancellationWork {
    pub fn cancel(query_id: QueryId, cause: QueryStatus) -> Self {
        CancellationWork { query_id, cause, unregister: false }
    }

    pub fn unregister(query_id: QueryId, cause: QueryStatus) -> Self {
        CancellationWork { query_id, cause, unregister: true }
    }
}

impl ControlServer {
    /// Non-blocking offer. Returns false when the queue was full and the
    /// work was dropped.
    pub(crate) fn offer_cancellation(&self, work: CancellationWork) -> bool {
        match self.cancellation_tx.try_send(work) {
            Ok(()) => {
                metrics::CANCELLATION_QUEUE_DEPTH.set(self.cancellation_tx.len() as i64);
                true
            }
            Err(flume::TrySendError::Full(work)) => {
                warn!(
                    query_id = %work.query_id,
                    "Cancellation queue is full, dropping request"
                );
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Work items currently waiting in the pool.
    pub(crate) fn cancellation_queue_len(&self) -> usize {
        self.cancellation_tx.len()
    }

    /// One pool worker. Runs until the server is dropped.
    pub(crate) async fn cancellation_worker(
        self: Arc<Self>,
        worker_id: usize,
        rx: flume::Receiver<CancellationWork>,
    ) {
        debug!(worker_id, "Cancellation worker started");
        while let Ok(work) = rx.recv_async().await {
            metrics::CANCELLATION_QUEUE_DEPTH.set(rx.len() as i64);
            self.cancel_from_pool(work).await;
        }
    }

    pub(crate) async fn cancel_from_pool(&self, work: CancellationWork) {
        if work.unregister {
            if !self.unregister_query(&work.query_id, Some(&work.cause)).await {
                debug!(query_id = %work.query_id, "Query de-registration failed");
            }
        } else if let Err(e) = self.cancel_internal(&work.query_id, Some(&work.cause)).await {
            debug!(query_id = %work.query_id, "Query cancellation did not succeed: {}", e);
        }
    }
}
