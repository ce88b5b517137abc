//! Client sessions and the session registry.
//!
//! Legacy-protocol transports allow one session per connection, so a
//! session is created implicitly on connect and shares the connection id.
//! HS2 transports open sessions explicitly. Either way the registry owns
//! the session; every in-flight client request additionally holds a
//! reference acquired through `get_session_state(.., mark_active)`, which
//! is what keeps the idle-session expirer honest: a session with
//! `ref_count > 0` is never expired.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use stratus_common::wire::{QueryId, SessionId, SessionKind, SessionSnapshot};
use stratus_common::{ControlError, QueryStatus};

use crate::cancellation::CancellationWork;
use crate::metrics;
use crate::options::QueryOptions;
use crate::server::ControlServer;

/// Context a transport hands to the connection lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: stratus_common::wire::ConnectionId,
    pub kind: SessionKind,
    pub network_address: String,
    /// Identity established by the transport (e.g. from SASL), if any.
    pub username: String,
}

/// Session fields guarded by the per-session lock.
#[derive(Debug)]
pub struct SessionInner {
    pub connected_user: String,
    /// Set when a proxy user was authorized to delegate as another user.
    pub do_as_user: Option<String>,
    pub database: String,
    pub default_query_options: QueryOptions,
    pub last_accessed_ms: i64,
    /// Number of client requests currently holding this session.
    pub ref_count: u32,
    /// Once closed, no query can be added to `inflight_queries`.
    pub closed: bool,
    /// Once expired, no reference can be acquired any more.
    pub expired: bool,
    pub inflight_queries: HashSet<QueryId>,
}

/// One client login context.
#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub network_address: String,
    pub start_time: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        session_id: SessionId,
        kind: SessionKind,
        network_address: String,
        connected_user: String,
        database: String,
        default_query_options: QueryOptions,
    ) -> Arc<Self> {
        Arc::new(Session {
            session_id,
            kind,
            network_address,
            start_time: Utc::now(),
            inner: Mutex::new(SessionInner {
                connected_user,
                do_as_user: None,
                database,
                default_query_options,
                last_accessed_ms: Utc::now().timestamp_millis(),
                ref_count: 0,
                closed: false,
                expired: false,
                inflight_queries: HashSet::new(),
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    /// Wire snapshot of this session, taken under its lock.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            session_id: self.session_id,
            kind: self.kind,
            database: inner.database.clone(),
            connected_user: inner.connected_user.clone(),
            delegated_user: inner.do_as_user.clone(),
            network_address: self.network_address.clone(),
        }
    }
}

impl ControlServer {
    /// Connection established. Legacy transports get an implicit session
    /// that shares the connection id; HS2 sessions are created explicitly
    /// via [`ControlServer::open_session`].
    pub fn on_connect(&self, ctx: &ConnectionContext) {
        if ctx.kind != SessionKind::Legacy {
            return;
        }
        let session = Session::new(
            ctx.connection_id,
            SessionKind::Legacy,
            ctx.network_address.clone(),
            ctx.username.clone(),
            "default".to_string(),
            self.default_query_options.clone(),
        );
        {
            let mut map = self.session_state_map.lock();
            let existed = map.insert(ctx.connection_id, session).is_some();
            debug_assert!(!existed, "connection id reused for a live session");
        }
        self.connection_to_sessions_map
            .lock()
            .entry(ctx.connection_id)
            .or_default()
            .push(ctx.connection_id);
        metrics::NUM_OPEN_LEGACY_SESSIONS.inc();
    }

    /// Open an explicit (HS2) session bound to `ctx`'s connection. A
    /// delegated user is only honored after the proxy-user authorization
    /// check; the failure is audited by the caller and returned to the
    /// client.
    pub fn open_session(
        &self,
        ctx: &ConnectionContext,
        connected_user: &str,
        delegated_user: Option<&str>,
        database: Option<String>,
    ) -> Result<Arc<Session>, ControlError> {
        let do_as_user = match delegated_user {
            Some(do_as) => {
                self.authorize_proxy_user(connected_user, do_as)?;
                Some(do_as.to_string())
            }
            None => None,
        };
        let session_id = uuid::Uuid::new_v4();
        let session = Session::new(
            session_id,
            SessionKind::Hs2,
            ctx.network_address.clone(),
            connected_user.to_string(),
            database.unwrap_or_else(|| "default".to_string()),
            self.default_query_options.clone(),
        );
        session.lock().do_as_user = do_as_user;
        self.session_state_map
            .lock()
            .insert(session_id, session.clone());
        self.connection_to_sessions_map
            .lock()
            .entry(ctx.connection_id)
            .or_default()
            .push(session_id);
        metrics::NUM_OPEN_HS2_SESSIONS.inc();
        Ok(session)
    }

    /// Connection dropped: close every session it carried.
    pub async fn on_disconnect(&self, ctx: &ConnectionContext) {
        let session_ids = match self.connection_to_sessions_map.lock().remove(&ctx.connection_id) {
            Some(ids) => ids,
            None => return, // not every connection has a session
        };
        info!(
            address = %ctx.network_address,
            sessions = session_ids.len(),
            "Connection closed, closing associated sessions"
        );
        for session_id in session_ids {
            if let Err(e) = self.close_session(&session_id, true).await {
                warn!("Error closing session {}: {}", session_id, e);
            }
        }
    }

    /// Look a session up. With `mark_active` the session's reference count
    /// is incremented under its lock, after rejecting closed and expired
    /// sessions; the caller must pair this with
    /// [`ControlServer::release_session`].
    pub fn get_session_state(
        &self,
        session_id: &SessionId,
        mark_active: bool,
    ) -> Result<Arc<Session>, ControlError> {
        let map = self.session_state_map.lock();
        let session = map
            .get(session_id)
            .ok_or_else(|| ControlError::InvalidHandle("Invalid session id".to_string()))?;
        if mark_active {
            let mut inner = session.lock();
            if inner.expired {
                let last = Utc
                    .timestamp_millis_opt(inner.last_accessed_ms)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| inner.last_accessed_ms.to_string());
                return Err(ControlError::SessionExpired(format!(
                    "Client session expired due to more than {}s of inactivity (last activity was at: {}).",
                    self.flags.idle_session_timeout, last
                )));
            }
            if inner.closed {
                return Err(ControlError::SessionClosed);
            }
            inner.ref_count += 1;
        }
        Ok(session.clone())
    }

    /// Drop a reference acquired with `mark_active`, restarting the
    /// session's idle clock.
    pub fn release_session(&self, session: &Arc<Session>) {
        let mut inner = session.lock();
        debug_assert!(inner.ref_count > 0, "releasing a session that was never marked active");
        inner.ref_count = inner.ref_count.saturating_sub(1);
        inner.last_accessed_ms = Utc::now().timestamp_millis();
    }

    /// Close a session: remove it from the registry, freeze its in-flight
    /// query set, and unregister every such query with cause
    /// "Session closed".
    pub async fn close_session(
        &self,
        session_id: &SessionId,
        ignore_if_absent: bool,
    ) -> Result<(), ControlError> {
        let session = {
            let mut map = self.session_state_map.lock();
            match map.remove(session_id) {
                Some(session) => session,
                None if ignore_if_absent => return Ok(()),
                None => return Err(ControlError::InvalidHandle("Invalid session ID".to_string())),
            }
        };
        match session.kind {
            SessionKind::Legacy => metrics::NUM_OPEN_LEGACY_SESSIONS.dec(),
            SessionKind::Hs2 => metrics::NUM_OPEN_HS2_SESSIONS.dec(),
        }
        let inflight_queries: Vec<QueryId> = {
            let mut inner = session.lock();
            debug_assert!(!inner.closed);
            inner.closed = true;
            // closed is now set, so nothing can be added to the in-flight
            // set; this snapshot is complete.
            inner.inflight_queries.iter().copied().collect()
        };
        let cause = QueryStatus::error("Session closed");
        for query_id in inflight_queries {
            self.unregister_query(&query_id, Some(&cause)).await;
        }
        Ok(())
    }

    /// The session a query belongs to, if the query is still registered.
    pub fn get_session_id_for_query(&self, query_id: &QueryId) -> Option<SessionId> {
        self.get_query_exec_state(query_id).map(|s| s.session_id())
    }

    /// Delegation check: `user` (shortened to the prefix before the first
    /// `/` or `@`) must be configured to delegate as `do_as_user`, either
    /// explicitly or via `*`.
    pub fn authorize_proxy_user(&self, user: &str, do_as_user: &str) -> Result<(), ControlError> {
        if user.is_empty() {
            return Err(ControlError::NotAuthorized(
                "Unable to delegate using empty proxy username.".to_string(),
            ));
        }
        if do_as_user.is_empty() {
            return Err(ControlError::NotAuthorized(
                "Unable to delegate using empty doAs username.".to_string(),
            ));
        }

        let error_msg = format!(
            "User '{}' is not authorized to delegate to '{}'.",
            user, do_as_user
        );
        if self.authorized_proxy_users.is_empty() {
            return Err(ControlError::NotAuthorized(format!(
                "{} User delegation is disabled.",
                error_msg
            )));
        }

        // Short user: the principal up to the first '/' or '@', unless the
        // separator is missing or leading.
        let end_idx = [user.find('/'), user.find('@')]
            .into_iter()
            .flatten()
            .min();
        let short_user = match end_idx {
            Some(0) | None => user,
            Some(idx) => &user[..idx],
        };

        if let Some(allowed) = self.authorized_proxy_users.get(short_user) {
            if allowed.contains("*") || allowed.contains(do_as_user) {
                return Ok(());
            }
        }
        Err(ControlError::NotAuthorized(error_msg))
    }

    /// One pass of the idle-session expirer. The per-session predicate is
    /// evaluated under the session lock so a concurrent `mark_active`
    /// cannot race with expiration.
    pub(crate) fn sweep_idle_sessions(&self, now_ms: i64) {
        let timeout_ms = self.flags.idle_session_timeout * 1000;
        let map = self.session_state_map.lock();
        for (session_id, session) in map.iter() {
            let inflight_queries: Vec<QueryId>;
            {
                let mut inner = session.lock();
                if inner.ref_count > 0 {
                    continue;
                }
                // A closed session is mid-removal; an expired one is done.
                if inner.closed || inner.expired {
                    continue;
                }
                if now_ms - inner.last_accessed_ms <= timeout_ms {
                    continue;
                }
                info!(
                    session_id = %session_id,
                    user = %inner.connected_user,
                    last_accessed_ms = inner.last_accessed_ms,
                    "Expiring session due to inactivity"
                );
                inner.expired = true;
                metrics::NUM_SESSIONS_EXPIRED.inc();
                // expired is now set, so the in-flight set is frozen.
                inflight_queries = inner.inflight_queries.iter().copied().collect();
            }
            let cause = QueryStatus::error("Session expired due to inactivity");
            for query_id in inflight_queries {
                self.offer_cancellation(CancellationWork::unregister(query_id, cause.clone()));
            }
        }
    }

    /// Idle-session timer: wakes at half the timeout, so the maximum delay
    /// between a session expiring and being picked up equals the sleep.
    pub(crate) async fn expire_sessions_loop(self: Arc<Self>) {
        let sleep_ms = (self.flags.idle_session_timeout * 500).max(1) as u64;
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            self.sweep_idle_sessions(Utc::now().timestamp_millis());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDaemon;

    #[test]
    fn test_legacy_connect_creates_session() {
        let daemon = TestDaemon::builder().build();
        let ctx = daemon.legacy_connection("alice");
        daemon.server.on_connect(&ctx);

        // The session shares the connection id.
        let session = daemon
            .server
            .get_session_state(&ctx.connection_id, false)
            .unwrap();
        assert_eq!(session.kind, SessionKind::Legacy);
        let inner = session.lock();
        assert_eq!(inner.connected_user, "alice");
        assert_eq!(inner.database, "default");
    }

    #[test]
    fn test_get_unknown_session_is_invalid_handle() {
        let daemon = TestDaemon::builder().build();
        let err = daemon
            .server
            .get_session_state(&uuid::Uuid::new_v4(), true)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_HANDLE");
    }

    #[test]
    fn test_mark_active_and_release() {
        let daemon = TestDaemon::builder().build();
        let session = daemon.open_test_session();

        let held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();
        assert_eq!(held.lock().ref_count, 1);
        daemon.server.release_session(&held);
        assert_eq!(held.lock().ref_count, 0);
    }

    #[test]
    fn test_closed_session_rejects_mark_active() {
        let daemon = TestDaemon::builder().build();
        let session = daemon.open_test_session();
        session.lock().closed = true;

        let err = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection_sessions() {
        let daemon = TestDaemon::builder().build();
        let ctx = daemon.legacy_connection("alice");
        daemon.server.on_connect(&ctx);
        // Disconnect closes every session the connection carried.
        daemon.server.on_disconnect(&ctx).await;

        let err = daemon
            .server
            .get_session_state(&ctx.connection_id, true)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_HANDLE");
        // A second disconnect finds nothing to do.
        daemon.server.on_disconnect(&ctx).await;
    }

    #[test]
    fn test_expired_session_rejects_mark_active() {
        let daemon = TestDaemon::builder().idle_session_timeout(1).build();
        let session = daemon.open_test_session();
        session.lock().expired = true;

        let err = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");
        assert!(err.to_string().contains("inactivity"));
    }

    #[test]
    fn test_sweep_skips_referenced_sessions() {
        let daemon = TestDaemon::builder().idle_session_timeout(1).build();
        let session = daemon.open_test_session();
        let _held = daemon
            .server
            .get_session_state(&session.session_id, true)
            .unwrap();

        // Far future: would expire if not referenced.
        daemon
            .server
            .sweep_idle_sessions(Utc::now().timestamp_millis() + 10_000);
        assert!(!session.lock().expired);
    }

    #[test]
    fn test_sweep_expires_idle_sessions_and_enqueues_unregister() {
        let daemon = TestDaemon::builder().idle_session_timeout(1).build();
        let session = daemon.open_test_session();
        let query_id = uuid::Uuid::new_v4();
        session.lock().inflight_queries.insert(query_id);

        daemon
            .server
            .sweep_idle_sessions(Utc::now().timestamp_millis() + 10_000);

        assert!(session.lock().expired);
        let work = daemon.server.cancellation_rx.try_recv().unwrap();
        assert_eq!(work.query_id, query_id);
        assert!(work.unregister);
        assert_eq!(work.cause.message(), "Session expired due to inactivity");
    }

    #[test]
    fn test_proxy_authorization() {
        let daemon = TestDaemon::builder()
            .proxy_config("hue=alice,bob;oozie=*")
            .build();
        let server = &daemon.server;

        assert!(server.authorize_proxy_user("hue", "alice").is_ok());
        assert!(server.authorize_proxy_user("hue", "mallory").is_err());
        // Principals are shortened to the part before '/' or '@'.
        assert!(server.authorize_proxy_user("hue/host.example.com", "bob").is_ok());
        assert!(server.authorize_proxy_user("hue@REALM", "alice").is_ok());
        // '*' authorizes anyone.
        assert!(server.authorize_proxy_user("oozie", "whoever").is_ok());
        // Empty inputs are rejected outright.
        assert!(server.authorize_proxy_user("", "alice").is_err());
        assert!(server.authorize_proxy_user("hue", "").is_err());
    }

    #[test]
    fn test_proxy_authorization_disabled_without_config() {
        let daemon = TestDaemon::builder().build();
        let err = daemon
            .server
            .authorize_proxy_user("hue", "alice")
            .unwrap_err();
        assert!(err.to_string().contains("User delegation is disabled"));
    }

    #[test]
    fn test_open_session_with_delegation() {
        let daemon = TestDaemon::builder().proxy_config("hue=bob").build();
        let ctx = daemon.legacy_connection("hue");

        let session = daemon
            .server
            .open_session(&ctx, "hue", Some("bob"), Some("sales".to_string()))
            .unwrap();
        let inner = session.lock();
        assert_eq!(inner.do_as_user.as_deref(), Some("bob"));
        assert_eq!(inner.database, "sales");
        drop(inner);

        let err = daemon
            .server
            .open_session(&ctx, "hue", Some("mallory"), None)
            .unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[test]
    fn test_session_snapshot() {
        let daemon = TestDaemon::builder().build();
        let session = daemon.open_test_session();
        session.lock().do_as_user = Some("bob".to_string());

        let snapshot = session.snapshot();
        assert_eq!(snapshot.session_id, session.session_id);
        assert_eq!(snapshot.delegated_user.as_deref(), Some("bob"));
        assert_eq!(snapshot.database, "default");
    }
}
