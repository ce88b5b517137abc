//! Coordinator-side query execution state.
//!
//! One `QueryExecState` exists per query this daemon coordinates, from
//! registration until unregistration. The registry shares ownership with
//! any RPC handler that resolved the state, so a concurrent unregister
//! never frees it mid-call.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use stratus_common::wire::{
    ExecRequest, QueryCtx, QueryId, ResultSetMetadata, SessionId, StmtType,
};
use stratus_common::QueryStatus;

use crate::env::Coordinator;
use crate::options::QueryOptions;
use crate::session::Session;

/// Query lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLifecycle {
    Created,
    Planning,
    Running,
    Finished,
    Exception,
}

impl QueryLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLifecycle::Created => "CREATED",
            QueryLifecycle::Planning => "PLANNING",
            QueryLifecycle::Running => "RUNNING",
            QueryLifecycle::Finished => "FINISHED",
            QueryLifecycle::Exception => "EXCEPTION",
        }
    }
}

/// Fields guarded by the exec state's own lock. The lock is held across
/// planning so that registration and recording of the planning result are
/// atomic with respect to incoming status reports.
#[derive(Default)]
pub struct QueryInner {
    pub coordinator: Option<Arc<dyn Coordinator>>,
    pub exec_request: Option<ExecRequest>,
    pub result_metadata: ResultSetMetadata,
}

pub struct QueryExecState {
    query_id: QueryId,
    session_id: SessionId,
    sql_stmt: String,
    options: QueryOptions,
    start_time: DateTime<Utc>,

    connected_user: String,
    do_as_user: Option<String>,
    default_db: String,
    network_address: String,

    inner: AsyncMutex<QueryInner>,

    // Terminal-fault accumulator; non-OK is sticky until unregistration.
    query_status: Mutex<QueryStatus>,
    lifecycle: Mutex<QueryLifecycle>,
    end_time: Mutex<Option<DateTime<Utc>>>,

    last_active_ms: AtomicI64,
    // Number of client requests currently operating on this query. While
    // positive the query counts as active and cannot be expired.
    client_refs: AtomicI32,
    num_rows_fetched: AtomicI64,
    is_cancelled: AtomicBool,
    done_called: AtomicBool,
}

impl std::fmt::Debug for QueryExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecState")
            .field("query_id", &self.query_id)
            .field("session_id", &self.session_id)
            .field("sql_stmt", &self.sql_stmt)
            .field("options", &self.options)
            .field("start_time", &self.start_time)
            .field("connected_user", &self.connected_user)
            .field("do_as_user", &self.do_as_user)
            .field("default_db", &self.default_db)
            .field("network_address", &self.network_address)
            .field("query_status", &self.query_status)
            .field("lifecycle", &self.lifecycle)
            .field("end_time", &self.end_time)
            .field("last_active_ms", &self.last_active_ms)
            .field("client_refs", &self.client_refs)
            .field("num_rows_fetched", &self.num_rows_fetched)
            .field("is_cancelled", &self.is_cancelled)
            .field("done_called", &self.done_called)
            .finish_non_exhaustive()
    }
}

impl QueryExecState {
    pub fn new(ctx: &QueryCtx, session: &Arc<Session>, options: QueryOptions) -> Self {
        let (connected_user, do_as_user, default_db) = {
            let inner = session.lock();
            (
                inner.connected_user.clone(),
                inner.do_as_user.clone(),
                inner.database.clone(),
            )
        };
        QueryExecState {
            query_id: ctx.query_id,
            session_id: session.session_id,
            sql_stmt: ctx.sql_stmt.clone(),
            options,
            start_time: Utc::now(),
            connected_user,
            do_as_user,
            default_db,
            network_address: session.network_address.clone(),
            inner: AsyncMutex::new(QueryInner::default()),
            query_status: Mutex::new(QueryStatus::ok()),
            lifecycle: Mutex::new(QueryLifecycle::Created),
            end_time: Mutex::new(None),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            client_refs: AtomicI32::new(0),
            num_rows_fetched: AtomicI64::new(0),
            is_cancelled: AtomicBool::new(false),
            done_called: AtomicBool::new(false),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sql_stmt(&self) -> &str {
        &self.sql_stmt
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.lock()
    }

    pub fn connected_user(&self) -> &str {
        &self.connected_user
    }

    pub fn do_as_user(&self) -> Option<&str> {
        self.do_as_user.as_deref()
    }

    /// The user the query runs as: the delegated user when set, otherwise
    /// the connected user.
    pub fn effective_user(&self) -> &str {
        self.do_as_user.as_deref().unwrap_or(&self.connected_user)
    }

    pub fn default_db(&self) -> &str {
        &self.default_db
    }

    pub fn network_address(&self) -> &str {
        &self.network_address
    }

    pub(crate) fn inner(&self) -> &AsyncMutex<QueryInner> {
        &self.inner
    }

    pub fn lifecycle(&self) -> QueryLifecycle {
        *self.lifecycle.lock()
    }

    pub fn set_lifecycle(&self, state: QueryLifecycle) {
        *self.lifecycle.lock() = state;
    }

    /// Current aggregated status. Callers that branch on a non-OK result
    /// must re-read under this same lock; the status never transitions
    /// back to OK, so a stale OK read is the only harmless race.
    pub fn query_status(&self) -> QueryStatus {
        self.query_status.lock().clone()
    }

    /// Sticky merge of a terminal fault. Returns the merged status so
    /// error propagation can chain on it.
    pub fn update_query_status(&self, status: &QueryStatus) -> QueryStatus {
        let mut current = self.query_status.lock();
        current.update(status);
        if !current.is_ok() {
            *self.lifecycle.lock() = QueryLifecycle::Exception;
        }
        current.clone()
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Acquire)
    }

    /// True while a client request is operating on this query. Active
    /// queries are never expired.
    pub fn is_active(&self) -> bool {
        self.client_refs.load(Ordering::Acquire) > 0
    }

    /// A client request started operating on this query.
    pub fn mark_active(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.client_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// A client request finished; the idle clock restarts now.
    pub fn mark_inactive(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.client_refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn num_rows_fetched(&self) -> i64 {
        self.num_rows_fetched.load(Ordering::Relaxed)
    }

    pub fn add_rows_fetched(&self, n: i64) {
        self.num_rows_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }

    /// Cooperative cancellation: record the cause (sticky), then signal the
    /// coordinator. Repeated calls are no-ops.
    pub async fn cancel(&self, cause: Option<&QueryStatus>) {
        if self.is_cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cause) = cause {
            self.update_query_status(cause);
        }
        let inner = self.inner.lock().await;
        if let Some(coordinator) = &inner.coordinator {
            coordinator.cancel(&self.query_status());
        }
    }

    /// Terminal hook, called exactly once by unregistration.
    pub fn done(&self) {
        if self.done_called.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "Done() called twice for query {}", self.query_id);
            return;
        }
        *self.end_time.lock() = Some(Utc::now());
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != QueryLifecycle::Exception {
            *lifecycle = QueryLifecycle::Finished;
        }
    }

    /// Render the profile tree. Line-oriented so the pretty and archived
    /// (base64) forms share one source.
    pub fn profile_text(&self) -> String {
        let status = self.query_status();
        let mut out = String::new();
        out.push_str(&format!("Query (id={}):\n", self.query_id));
        out.push_str(&format!("  Session: {}\n", self.session_id));
        out.push_str(&format!("  SQL: {}\n", self.sql_stmt.replace('\n', " ")));
        out.push_str(&format!("  User: {}\n", self.effective_user()));
        out.push_str(&format!("  Default Db: {}\n", self.default_db));
        out.push_str(&format!("  State: {}\n", self.lifecycle().as_str()));
        out.push_str(&format!(
            "  Status: {}\n",
            if status.is_ok() { "OK".to_string() } else { status.message() }
        ));
        out.push_str(&format!("  Start Time: {}\n", self.start_time.to_rfc3339()));
        if let Some(end) = self.end_time() {
            out.push_str(&format!("  End Time: {}\n", end.to_rfc3339()));
        }
        out.push_str(&format!("  Rows Fetched: {}\n", self.num_rows_fetched()));
        out
    }

    /// The archived (base64) form of the profile.
    pub fn encoded_profile_text(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.profile_text())
    }

    /// Snapshot this state into an archival record.
    pub async fn state_record(&self, encoded_profile: Option<String>) -> QueryStateRecord {
        let inner = self.inner.lock().await;
        let (has_coord, progress, exec_summary) = match &inner.coordinator {
            Some(coordinator) => (true, coordinator.progress(), coordinator.exec_summary()),
            None => (false, (0, 0), String::new()),
        };
        QueryStateRecord {
            id: self.query_id,
            stmt: self.sql_stmt.clone(),
            stmt_type: inner.exec_request.as_ref().map(|r| r.stmt_type),
            effective_user: self.effective_user().to_string(),
            default_db: self.default_db.clone(),
            start_time: self.start_time,
            end_time: self.end_time(),
            has_coord,
            num_complete_fragments: progress.0,
            total_fragments: progress.1,
            query_state: self.lifecycle(),
            num_rows_fetched: self.num_rows_fetched(),
            query_status: self.query_status(),
            exec_summary,
            profile_str: self.profile_text(),
            encoded_profile_str: encoded_profile.unwrap_or_else(|| self.encoded_profile_text()),
        }
    }
}

/// Everything worth keeping about a completed query, archived in the
/// query-log ring.
#[derive(Debug, Clone)]
pub struct QueryStateRecord {
    pub id: QueryId,
    pub stmt: String,
    pub stmt_type: Option<StmtType>,
    pub effective_user: String,
    pub default_db: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub has_coord: bool,
    pub num_complete_fragments: i64,
    pub total_fragments: i64,
    pub query_state: QueryLifecycle,
    pub num_rows_fetched: i64,
    pub query_status: QueryStatus,
    pub exec_summary: String,
    pub profile_str: String,
    pub encoded_profile_str: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_session;
    use stratus_common::wire::SessionKind;
    use uuid::Uuid;

    fn test_state() -> QueryExecState {
        let session = test_session(SessionKind::Legacy, "alice");
        let mut ctx = QueryCtx::new("select 1");
        ctx.query_id = Uuid::new_v4();
        QueryExecState::new(&ctx, &session, QueryOptions::default())
    }

    #[test]
    fn test_status_is_sticky() {
        let state = test_state();
        assert!(state.query_status().is_ok());

        state.update_query_status(&QueryStatus::error("first failure"));
        assert_eq!(state.query_status().message(), "first failure");
        assert_eq!(state.lifecycle(), QueryLifecycle::Exception);

        state.update_query_status(&QueryStatus::error("second failure"));
        assert_eq!(state.query_status().message(), "first failure");

        state.update_query_status(&QueryStatus::ok());
        assert_eq!(state.query_status().message(), "first failure");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let state = test_state();
        state.cancel(Some(&QueryStatus::error("user cancel"))).await;
        assert!(state.is_cancelled());
        assert_eq!(state.query_status().message(), "user cancel");

        // A second cancel with a different cause changes nothing.
        state.cancel(Some(&QueryStatus::error("other cause"))).await;
        assert_eq!(state.query_status().message(), "user cancel");
    }

    #[test]
    fn test_activity_tracking() {
        let state = test_state();
        assert!(!state.is_active());
        state.mark_active();
        assert!(state.is_active());
        state.mark_inactive();
        assert!(!state.is_active());
    }

    #[test]
    fn test_done_finishes_clean_queries() {
        let state = test_state();
        state.done();
        assert_eq!(state.lifecycle(), QueryLifecycle::Finished);
        assert!(state.end_time().is_some());
    }

    #[test]
    fn test_done_preserves_exception_state() {
        let state = test_state();
        state.update_query_status(&QueryStatus::error("boom"));
        state.done();
        assert_eq!(state.lifecycle(), QueryLifecycle::Exception);
    }

    #[test]
    fn test_profile_text_round_trips_base64() {
        let state = test_state();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(state.encoded_profile_text())
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), state.profile_text());
    }
}
