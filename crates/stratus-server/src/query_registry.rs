//! Coordinator-side query lifecycle: registration, execution kick-off,
//! cancellation, unregistration and archival.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use stratus_common::wire::{QueryCtx, QueryId};
use stratus_common::{ControlError, QueryStatus};

use crate::audit::is_authorization_error;
use crate::metrics;
use crate::query::{QueryExecState, QueryLifecycle, QueryStateRecord};
use crate::server::ControlServer;
use crate::session::Session;

/// Ring of completed queries, newest first, with an id index. A size bound
/// of -1 means unbounded; 0 disables archival entirely (the profile log
/// file is still written).
#[derive(Default)]
pub struct QueryLog {
    order: VecDeque<QueryId>,
    records: HashMap<QueryId, QueryStateRecord>,
}

impl QueryLog {
    fn insert(&mut self, record: QueryStateRecord, bound: i64) {
        self.order.push_front(record.id);
        self.records.insert(record.id, record);
        if bound > -1 && self.records.len() as i64 > bound {
            debug_assert_eq!(self.records.len() as i64 - bound, 1);
            if let Some(evicted) = self.order.pop_back() {
                self.records.remove(&evicted);
            }
        }
    }

    pub fn get(&self, query_id: &QueryId) -> Option<&QueryStateRecord> {
        self.records.get(query_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records newest-first, for the debug pages.
    pub fn iter(&self) -> impl Iterator<Item = &QueryStateRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }
}

impl ControlServer {
    /// Fill in the coordinator-side fields of a query context and assign a
    /// fresh globally-unique query id.
    pub fn prepare_query_context(&self, ctx: &mut QueryCtx) {
        ctx.query_id = uuid::Uuid::new_v4();
        ctx.pid = std::process::id();
        ctx.now_string = Utc::now().to_rfc3339();
        ctx.coord_address = Some(self.flags.backend_address());
    }

    /// Run a client statement: prepare the context, register, plan, start
    /// execution. On failure after registration the query is unregistered
    /// with the failure as cause.
    pub async fn execute(
        &self,
        mut ctx: QueryCtx,
        session: Arc<Session>,
    ) -> Result<Arc<QueryExecState>, ControlError> {
        self.prepare_query_context(&mut ctx);
        metrics::NUM_QUERIES.inc();

        let mut registered_exec_state = None;
        match self.execute_internal(&ctx, &session, &mut registered_exec_state).await {
            Ok(exec_state) => Ok(exec_state),
            Err(e) => {
                if let Some(exec_state) = registered_exec_state {
                    let cause = QueryStatus::error(e.to_string());
                    self.unregister_query(&exec_state.query_id(), Some(&cause)).await;
                }
                Err(e)
            }
        }
    }

    async fn execute_internal(
        &self,
        ctx: &QueryCtx,
        session: &Arc<Session>,
        registered_exec_state: &mut Option<Arc<QueryExecState>>,
    ) -> Result<Arc<QueryExecState>, ControlError> {
        if self.is_offline() {
            return Err(ControlError::Internal(
                "This server is offline. Please retry your query later.".to_string(),
            ));
        }
        if let Some(requested) = ctx.result_cache_size {
            if requested > self.flags.max_result_cache_size {
                return Err(ControlError::Internal(format!(
                    "Requested result cache size of {} exceeds the maximum allowed value of {}",
                    requested, self.flags.max_result_cache_size
                )));
            }
        }

        let options = session.lock().default_query_options.clone();
        let exec_state = Arc::new(QueryExecState::new(ctx, session, options));

        let exec_request = {
            // Hold the exec state's own lock so that registration and
            // recording of the planning result are atomic. This acquires
            // the exec-state lock before the registry lock, the opposite
            // of the lookup path. No deadlock is possible because a lookup
            // cannot find this state until RegisterQuery has finished, by
            // which point the registry lock has been released.
            let mut inner = exec_state.inner().lock().await;

            // Register as early as possible so slow-planning queries are
            // visible and incoming status reports can be routed.
            self.register_query(session, &exec_state)?;
            *registered_exec_state = Some(exec_state.clone());
            exec_state.set_lifecycle(QueryLifecycle::Planning);

            let request = match self.env.frontend.get_exec_request(ctx, exec_state.options()).await
            {
                Ok(request) => request,
                Err(status) => {
                    let merged = exec_state.update_query_status(&status);
                    return Err(ControlError::Internal(merged.message()));
                }
            };
            if let Some(metadata) = &request.result_metadata {
                inner.result_metadata = metadata.clone();
            }
            inner.exec_request = Some(request.clone());
            request
        };

        if self.audit_logger.is_some() {
            self.log_audit_record(&exec_state, &exec_request);
        }

        // Start execution; fragment status reports begin arriving once the
        // coordinator has dispatched.
        let coordinator = match self.env.coordinator_factory.execute(ctx, &exec_request).await {
            Ok(coordinator) => coordinator,
            Err(status) => {
                let merged = exec_state.update_query_status(&status);
                return Err(ControlError::Internal(merged.message()));
            }
        };
        exec_state.set_lifecycle(QueryLifecycle::Running);

        if exec_request.stmt_type == stratus_common::wire::StmtType::Ddl {
            if let Err(e) = self.update_catalog_metrics().await {
                debug!("Couldn't update catalog metrics: {}", e.message());
            }
        }

        if let Some(coordinator) = coordinator {
            let unique_hosts = coordinator.unique_hosts();
            exec_state.inner().lock().await.coordinator = Some(coordinator);
            if !unique_hosts.is_empty() {
                let mut locations = self.query_locations.lock();
                for host in unique_hosts {
                    locations.entry(host).or_default().insert(exec_state.query_id());
                }
            }
        }

        Ok(exec_state)
    }

    /// Insert a query into the registry and its session's in-flight set.
    /// Lock order: session -> query registry -> expiration queue.
    pub(crate) fn register_query(
        &self,
        session: &Arc<Session>,
        exec_state: &Arc<QueryExecState>,
    ) -> Result<(), ControlError> {
        let mut session_inner = session.lock();
        // The session was checked out by the caller and cannot expire
        // while checked out; it may have been closed since, though.
        debug_assert!(session_inner.ref_count > 0 && !session_inner.expired);
        if session_inner.closed {
            return Err(ControlError::SessionClosed);
        }

        let query_id = exec_state.query_id();
        {
            let mut map = self.query_exec_state_map.lock();
            if map.contains_key(&query_id) {
                // query_id is globally unique; a collision is a bug.
                return Err(ControlError::Internal(format!(
                    "query id {} already exists",
                    query_id
                )));
            }
            session_inner.inflight_queries.insert(query_id);
            map.insert(query_id, exec_state.clone());
        }

        let timeout_s = self.effective_timeout_s(exec_state.options().query_timeout_s);
        if timeout_s > 0 {
            self.queue_query_expiration(query_id, timeout_s);
        }
        Ok(())
    }

    /// Tear a query down: cancel it, remove it from the registry and its
    /// session, clear its peer locations, and archive it. Returns false if
    /// the query was not registered.
    pub async fn unregister_query(&self, query_id: &QueryId, cause: Option<&QueryStatus>) -> bool {
        debug!(query_id = %query_id, "UnregisterQuery");

        // Cancel first so the coordinator stops producing work.
        let _ = self.cancel_internal(query_id, cause).await;

        let exec_state = {
            let mut map = self.query_exec_state_map.lock();
            match map.remove(query_id) {
                Some(exec_state) => exec_state,
                None => {
                    debug!(query_id = %query_id, "unknown query id");
                    return false;
                }
            }
        };

        // Only authorization failures are audited at teardown; everything
        // else was audited when planning finished.
        if self.audit_logger.is_some() && is_authorization_error(&exec_state.query_status()) {
            let request = exec_state.inner().lock().await.exec_request.clone();
            if let Some(request) = request {
                self.log_audit_record(&exec_state, &request);
            }
        }

        exec_state.done();

        if let Ok(session) = self.get_session_state(&exec_state.session_id(), false) {
            session.lock().inflight_queries.remove(query_id);
        }

        let unique_hosts = {
            let inner = exec_state.inner().lock().await;
            inner.coordinator.as_ref().map(|c| c.unique_hosts()).unwrap_or_default()
        };
        if !unique_hosts.is_empty() {
            let mut locations = self.query_locations.lock();
            for host in unique_hosts {
                // The membership failure path may have removed the entry
                // already; the two paths harmlessly race to clean up.
                if let Some(queries) = locations.get_mut(&host) {
                    queries.remove(query_id);
                }
            }
        }

        self.archive_query(&exec_state).await;
        true
    }

    /// Cancel a query in place. Fails with an invalid-handle error when the
    /// query is not registered; cancelling an already-cancelled query is a
    /// no-op.
    pub async fn cancel_internal(
        &self,
        query_id: &QueryId,
        cause: Option<&QueryStatus>,
    ) -> Result<(), ControlError> {
        debug!(query_id = %query_id, "Cancel");
        let exec_state = self.get_query_exec_state(query_id).ok_or_else(|| {
            ControlError::InvalidHandle("Invalid or unknown query handle".to_string())
        })?;
        exec_state.cancel(cause).await;
        Ok(())
    }

    /// Write the profile-log line and add the record to the query log.
    async fn archive_query(&self, exec_state: &Arc<QueryExecState>) {
        let encoded_profile = exec_state.encoded_profile_text();

        if let Some(logger) = &self.profile_logger {
            let line = format!(
                "{} {} {}",
                Utc::now().timestamp_millis(),
                exec_state.query_id(),
                encoded_profile
            );
            if let Err(e) = logger.append_entry(&line) {
                warn!("Could not write to profile log file: {}", e);
            }
        }

        if self.flags.query_log_size == 0 {
            return;
        }
        let record = exec_state.state_record(Some(encoded_profile)).await;
        self.query_log.lock().insert(record, self.flags.query_log_size);
    }

    /// The profile of a query, live or archived. `base64_encoded` selects
    /// the archive encoding over the pretty form.
    pub async fn get_runtime_profile_str(
        &self,
        query_id: &QueryId,
        base64_encoded: bool,
    ) -> Result<String, ControlError> {
        if let Some(exec_state) = self.get_query_exec_state(query_id) {
            return Ok(if base64_encoded {
                exec_state.encoded_profile_text()
            } else {
                exec_state.profile_text()
            });
        }
        let log = self.query_log.lock();
        let record = log
            .get(query_id)
            .ok_or_else(|| ControlError::InvalidHandle(format!("Query id {} not found.", query_id)))?;
        Ok(if base64_encoded {
            record.encoded_profile_str.clone()
        } else {
            record.profile_str.clone()
        })
    }

    /// The execution summary of a completed query. Only archived queries
    /// have one.
    pub fn get_exec_summary(&self, query_id: &QueryId) -> Result<String, ControlError> {
        let log = self.query_log.lock();
        let record = log
            .get(query_id)
            .ok_or_else(|| ControlError::InvalidHandle(format!("Query id {} not found.", query_id)))?;
        Ok(record.exec_summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDaemon;
    use base64::Engine;
    use stratus_common::status::StatusCode;

    #[tokio::test]
    async fn test_execute_registers_and_runs() {
        let daemon = TestDaemon::builder().build();
        let (state, session) = daemon.start_query("select 1").await;

        assert!(state.query_status().is_ok());
        assert_eq!(state.lifecycle(), QueryLifecycle::Running);
        // Session containment: registry and session agree.
        assert!(session.lock().inflight_queries.contains(&state.query_id()));
        assert!(daemon.server.get_query_exec_state(&state.query_id()).is_some());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_ids() {
        let daemon = TestDaemon::builder().build();
        let (state, session) = daemon.start_query("select 1").await;

        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();
        let err = daemon.server.register_query(&held, &state).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("already exists"));
        daemon.server.release_session(&held);
    }

    #[tokio::test]
    async fn test_register_rejects_closed_session() {
        let daemon = TestDaemon::builder().build();
        let (state, session) = daemon.start_query("select 1").await;
        daemon.server.unregister_query(&state.query_id(), None).await;

        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();
        held.lock().closed = true;
        let err = daemon.server.register_query(&held, &state).unwrap_err();
        assert_eq!(err.code(), "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn test_planning_failure_unregisters() {
        let daemon = TestDaemon::builder().build();
        daemon.frontend.fail_planning("AnalysisException: table missing");
        let session = daemon.open_test_session();
        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();

        let err = daemon
            .server
            .execute(QueryCtx::new("select * from missing"), held.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("AnalysisException"));
        daemon.server.release_session(&held);

        // Nothing left registered, and the session's in-flight set is clean.
        assert!(daemon.server.query_exec_state_map.lock().is_empty());
        assert!(session.lock().inflight_queries.is_empty());
    }

    // Register / cancel / unregister, end to end: the cancel cause becomes
    // the sticky status, unregistration removes the query, and a late
    // status report is answered with the unknown-query error.
    #[tokio::test]
    async fn test_register_cancel_unregister_round_trip() {
        let daemon = TestDaemon::builder().build();
        let (state, _session) = daemon.start_query("select 1").await;
        let query_id = state.query_id();

        let cause = QueryStatus::error("user cancel");
        daemon.server.cancel_internal(&query_id, Some(&cause)).await.unwrap();
        assert_eq!(state.query_status().message(), "user cancel");
        assert_eq!(daemon.coordinator_cancel_count(&query_id), 1);

        assert!(daemon.server.unregister_query(&query_id, None).await);
        assert!(daemon.server.get_query_exec_state(&query_id).is_none());

        let report = daemon.report_for(&query_id);
        let result = daemon.server.report_exec_status(&report).await;
        assert_eq!(result.status_code, StatusCode::InternalError);
        assert!(result.error_msgs[0]
            .starts_with("ReportExecStatus(): Received report for unknown query ID"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_query_fails() {
        let daemon = TestDaemon::builder().build();
        let err = daemon
            .server
            .cancel_internal(&uuid::Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_HANDLE");
    }

    #[tokio::test]
    async fn test_unregister_clears_query_locations() {
        let daemon = TestDaemon::builder().build();
        let (state, _session) = daemon.start_query("select 1").await;

        let host = daemon.executor_host();
        assert!(daemon.server.query_locations.lock()[&host].contains(&state.query_id()));

        daemon.server.unregister_query(&state.query_id(), None).await;
        let locations = daemon.server.query_locations.lock();
        assert!(!locations
            .get(&host)
            .map(|queries| queries.contains(&state.query_id()))
            .unwrap_or(false));
    }

    // Session close cascade: the session disappears from the registry,
    // every in-flight query is unregistered with cause "Session closed",
    // and the open-sessions gauge drops by one.
    #[tokio::test]
    async fn test_close_session_cascades_to_queries() {
        let daemon = TestDaemon::builder().build();
        let session = daemon.open_test_session();
        let (q1, _) = daemon.start_query_on(&session, "select 1").await;
        let (q2, _) = daemon.start_query_on(&session, "select 2").await;

        let open_before = crate::metrics::NUM_OPEN_HS2_SESSIONS.get();
        daemon.server.close_session(&session.session_id, false).await.unwrap();

        assert!(session.lock().closed);
        assert!(daemon
            .server
            .get_session_state(&session.session_id, false)
            .is_err());
        assert_eq!(crate::metrics::NUM_OPEN_HS2_SESSIONS.get(), open_before - 1);

        for state in [&q1, &q2] {
            assert!(daemon.server.get_query_exec_state(&state.query_id()).is_none());
            assert_eq!(state.query_status().message(), "Session closed");
        }

        // Closing again without ignore_if_absent is an error; with it, a
        // no-op.
        assert!(daemon.server.close_session(&session.session_id, false).await.is_err());
        assert!(daemon.server.close_session(&session.session_id, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_log_is_bounded() {
        let daemon = TestDaemon::builder().query_log_size(2).build();
        let mut ids = Vec::new();
        for i in 0..4 {
            let (state, _session) = daemon.start_query(&format!("select {}", i)).await;
            ids.push(state.query_id());
            daemon.server.unregister_query(&state.query_id(), None).await;
        }

        let log = daemon.server.query_log.lock();
        assert_eq!(log.len(), 2);
        // Newest two survive, oldest two were evicted with their index.
        assert!(log.get(&ids[3]).is_some());
        assert!(log.get(&ids[2]).is_some());
        assert!(log.get(&ids[1]).is_none());
        assert!(log.get(&ids[0]).is_none());
        let order: Vec<_> = log.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn test_query_log_size_zero_disables_archival() {
        let daemon = TestDaemon::builder().query_log_size(0).build();
        let (state, _session) = daemon.start_query("select 1").await;
        daemon.server.unregister_query(&state.query_id(), None).await;
        assert!(daemon.server.query_log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_profile_retrieval_live_and_archived() {
        let daemon = TestDaemon::builder().build();
        let (state, _session) = daemon.start_query("select 1").await;
        let query_id = state.query_id();

        let live = daemon
            .server
            .get_runtime_profile_str(&query_id, false)
            .await
            .unwrap();
        assert!(live.contains(&query_id.to_string()));

        daemon.server.unregister_query(&query_id, None).await;
        let archived = daemon
            .server
            .get_runtime_profile_str(&query_id, true)
            .await
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(archived)
            .unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("select 1"));

        let err = daemon
            .server
            .get_runtime_profile_str(&uuid::Uuid::new_v4(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_exec_summary_only_after_archival() {
        let daemon = TestDaemon::builder().build();
        let (state, _session) = daemon.start_query("select 1").await;
        let query_id = state.query_id();

        assert!(daemon.server.get_exec_summary(&query_id).is_err());
        daemon.server.unregister_query(&query_id, None).await;
        let summary = daemon.server.get_exec_summary(&query_id).unwrap();
        assert!(!summary.is_empty());
    }

    #[tokio::test]
    async fn test_offline_server_refuses_queries() {
        let daemon = TestDaemon::builder().build();
        daemon.server.set_offline(true);
        let session = daemon.open_test_session();
        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();
        let err = daemon
            .server
            .execute(QueryCtx::new("select 1"), held)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[tokio::test]
    async fn test_result_cache_request_is_bounded() {
        let daemon = TestDaemon::builder().build();
        let session = daemon.open_test_session();
        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();
        let mut ctx = QueryCtx::new("select 1");
        ctx.result_cache_size = Some(daemon.server.flags().max_result_cache_size + 1);
        let err = daemon.server.execute(ctx, held).await.unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    // Drives the execute / cancel / unregister / sweep paths from many
    // tasks at once. Catches lock-order mistakes (as deadlocks) and
    // registry/session containment violations.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lifecycle_stress() {
        let daemon = std::sync::Arc::new(TestDaemon::builder().idle_query_timeout(1).build());
        daemon.server.clone().start().await.unwrap();
        let session = daemon.open_test_session();

        let mut handles = Vec::new();
        for task in 0..8u32 {
            let daemon = std::sync::Arc::clone(&daemon);
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..15u32 {
                    let (state, _) = daemon
                        .start_query_on(&session, &format!("select {}", task * 100 + i))
                        .await;
                    let query_id = state.query_id();
                    if i % 2 == 0 {
                        let cause = QueryStatus::error("stress cancel");
                        let _ = daemon.server.cancel_internal(&query_id, Some(&cause)).await;
                    }
                    daemon
                        .server
                        .sweep_expired_queries(chrono::Utc::now().timestamp_millis());
                    daemon.server.unregister_query(&query_id, None).await;
                    assert!(daemon.server.get_query_exec_state(&query_id).is_none());
                    assert!(!session.lock().inflight_queries.contains(&query_id));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        daemon.server.close_session(&session.session_id, false).await.unwrap();
        assert!(daemon.server.query_exec_state_map.lock().is_empty());
    }

    #[tokio::test]
    async fn test_session_lookup_for_query() {
        let daemon = TestDaemon::builder().build();
        let (state, session) = daemon.start_query("select 1").await;
        assert_eq!(
            daemon.server.get_session_id_for_query(&state.query_id()),
            Some(session.session_id)
        );
        daemon.server.unregister_query(&state.query_id(), None).await;
        assert_eq!(daemon.server.get_session_id_for_query(&state.query_id()), None);
    }
}
