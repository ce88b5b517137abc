//! The daemon control-plane server.
//!
//! `ControlServer` owns every in-memory registry of the daemon: sessions,
//! coordinator-side query exec states, executor-side fragment exec states,
//! the query log, the expiration queue, the peer/query location index, the
//! catalog view and the membership view. Each registry is protected by its
//! own lock; the operations on them live in the topical modules
//! ([`crate::session`], [`crate::query_registry`], [`crate::fragment`],
//! [`crate::catalog`], [`crate::membership`], ...) as further `impl` blocks
//! on this type.
//!
//! Lock order, where multiple registries are involved: session -> query
//! registry -> expiration queue; query registry -> query exec state (the
//! execute path orders exec state -> registry instead, see
//! `query_registry`); session registry -> session when iterating.
//! `query_locations` and the fragment registry are leaf locks. Never
//! acquire in the reverse direction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

use stratus_common::wire::{
    ConfigVariable, ConnectionId, FragmentInstanceId, HostPort, QueryId, SessionId,
};
use stratus_common::ControlError;

use crate::audit::{RotatingLogger, AUDIT_EVENT_LOG_FILE_PREFIX, PROFILE_LOG_FILE_PREFIX};
use crate::cancellation::CancellationWork;
use crate::catalog::CatalogState;
use crate::config::{parse_authorized_proxy_config, DaemonFlags, ProxyUserMap};
use crate::env::ExecEnv;
use crate::fragment::FragmentExecState;
use crate::metrics;
use crate::options::{default_config_variables, parse_query_options, QueryOptions};
use crate::query::QueryExecState;
use crate::query_registry::QueryLog;
use crate::session::Session;

/// Capacity of the cancellation pool's queue. Deliberately set so high it
/// should never fill; if it does, dropped work is re-derived on the next
/// membership heartbeat.
pub const MAX_CANCELLATION_QUEUE_SIZE: usize = 65536;

pub struct ControlServer {
    pub(crate) flags: DaemonFlags,
    pub(crate) env: ExecEnv,
    pub(crate) default_query_options: QueryOptions,
    pub(crate) default_configs: Vec<ConfigVariable>,
    pub(crate) authorized_proxy_users: ProxyUserMap,

    pub(crate) session_state_map: Mutex<HashMap<SessionId, Arc<Session>>>,
    pub(crate) connection_to_sessions_map: Mutex<HashMap<ConnectionId, Vec<SessionId>>>,

    pub(crate) query_exec_state_map: Mutex<HashMap<QueryId, Arc<QueryExecState>>>,
    pub(crate) query_log: Mutex<QueryLog>,
    // Deadline queue: (deadline-ms, query id), ordered by deadline.
    pub(crate) queries_by_timestamp: Mutex<BTreeSet<(i64, QueryId)>>,
    // Executor host -> queries known to run a fragment there.
    pub(crate) query_locations: Mutex<HashMap<HostPort, HashSet<QueryId>>>,

    pub(crate) fragment_exec_state_map: Arc<DashMap<FragmentInstanceId, Arc<FragmentExecState>>>,

    pub(crate) catalog_tx: watch::Sender<CatalogState>,
    pub(crate) known_backends: Mutex<HashMap<String, HostPort>>,

    pub(crate) cancellation_tx: flume::Sender<CancellationWork>,
    pub(crate) cancellation_rx: flume::Receiver<CancellationWork>,

    pub(crate) is_offline: Mutex<bool>,

    pub(crate) profile_logger: Option<RotatingLogger>,
    pub(crate) audit_logger: Option<RotatingLogger>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("flags", &self.flags)
            .field("default_query_options", &self.default_query_options)
            .field("default_configs", &self.default_configs)
            .finish_non_exhaustive()
    }
}

impl ControlServer {
    /// Build the server from validated flags. Configuration errors here are
    /// fatal: the daemon binary maps them to exit code 1.
    pub fn try_new(flags: DaemonFlags, env: ExecEnv) -> Result<Arc<Self>, ControlError> {
        let mut default_query_options = QueryOptions::default();
        parse_query_options(&flags.default_query_options, &mut default_query_options).map_err(
            |e| {
                ControlError::Config(format!(
                    "Invalid default query options. Please check --default_query_options.\n{}",
                    e
                ))
            },
        )?;
        info!(options = %flags.default_query_options, "Default query options parsed");
        let default_configs = default_config_variables(&default_query_options);

        let authorized_proxy_users =
            parse_authorized_proxy_config(&flags.authorized_proxy_user_config)?;

        let audit_logger = if flags.audit_event_log_dir.is_empty() {
            info!("Audit event logging is disabled");
            None
        } else {
            let logger = RotatingLogger::new(
                &flags.audit_event_log_dir,
                AUDIT_EVENT_LOG_FILE_PREFIX,
                flags.max_audit_event_log_file_size,
            )
            .map_err(|e| {
                ControlError::Config(format!("Failure initializing audit event logging: {}", e))
            })?;
            Some(logger)
        };

        // Profile archival failure only disables archival, it is not fatal.
        let profile_logger = if flags.log_query_to_file {
            let dir = if flags.profile_log_dir.is_empty() {
                format!("{}/profiles", flags.log_dir)
            } else {
                flags.profile_log_dir.clone()
            };
            match RotatingLogger::new(&dir, PROFILE_LOG_FILE_PREFIX, flags.max_profile_log_file_size)
            {
                Ok(logger) => Some(logger),
                Err(e) => {
                    error!("Query profile archival is disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (cancellation_tx, cancellation_rx) = flume::bounded(MAX_CANCELLATION_QUEUE_SIZE);

        metrics::init_metrics();

        Ok(Arc::new(ControlServer {
            flags,
            env,
            default_query_options,
            default_configs,
            authorized_proxy_users,
            session_state_map: Mutex::new(HashMap::new()),
            connection_to_sessions_map: Mutex::new(HashMap::new()),
            query_exec_state_map: Mutex::new(HashMap::new()),
            query_log: Mutex::new(QueryLog::default()),
            queries_by_timestamp: Mutex::new(BTreeSet::new()),
            query_locations: Mutex::new(HashMap::new()),
            fragment_exec_state_map: Arc::new(DashMap::new()),
            catalog_tx: watch::channel(CatalogState::default()).0,
            known_backends: Mutex::new(HashMap::new()),
            cancellation_tx,
            cancellation_rx,
            is_offline: Mutex::new(false),
            profile_logger,
            audit_logger,
        }))
    }

    /// Validate collaborator settings and start the background engines:
    /// cancellation workers, the two expiration timers, log flushing and
    /// (when configured) node-manager failure detection.
    pub async fn start(self: Arc<Self>) -> Result<(), ControlError> {
        let settings = self.env.frontend.validate_settings().await;
        if !settings.is_ok() {
            error!("Frontend settings are invalid: {}", settings.message());
            if self.flags.abort_on_config_error {
                return Err(ControlError::Config(format!(
                    "Aborting startup due to improper configuration: {}",
                    settings.message()
                )));
            }
        }

        if let Err(e) = self.update_catalog_metrics().await {
            error!("Could not initialize catalog metrics: {}", e.message());
        }

        for worker_id in 0..self.flags.cancellation_thread_pool_size {
            let server = Arc::clone(&self);
            let rx = self.cancellation_rx.clone();
            tokio::spawn(async move { server.cancellation_worker(worker_id, rx).await });
        }

        if self.flags.idle_session_timeout > 0 {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.expire_sessions_loop().await });
        }

        {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.expire_queries_loop().await });
        }

        {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.flush_logs_loop().await });
        }

        if !self.flags.local_nodemanager_url.is_empty() {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.detect_nodemanager_failures().await });
        }

        info!(
            beeswax_port = self.flags.beeswax_port,
            hs2_port = self.flags.hs2_port,
            be_port = self.flags.be_port,
            "Control server started"
        );
        Ok(())
    }

    pub fn flags(&self) -> &DaemonFlags {
        &self.flags
    }

    pub fn env(&self) -> &ExecEnv {
        &self.env
    }

    pub fn default_query_options(&self) -> &QueryOptions {
        &self.default_query_options
    }

    /// The `(key, value)` configuration list surfaced to clients.
    pub fn default_configs(&self) -> &[ConfigVariable] {
        &self.default_configs
    }

    /// Resolve a query exec state. The registry lock is released before
    /// the caller touches the state's own lock, which is what breaks the
    /// potential deadlock with the execute path (exec state -> registry).
    pub fn get_query_exec_state(&self, query_id: &QueryId) -> Option<Arc<QueryExecState>> {
        self.query_exec_state_map.lock().get(query_id).cloned()
    }

    pub fn get_fragment_exec_state(
        &self,
        instance_id: &FragmentInstanceId,
    ) -> Option<Arc<FragmentExecState>> {
        self.fragment_exec_state_map
            .get(instance_id)
            .map(|e| e.value().clone())
    }

    /// While offline the daemon refuses new queries; executor-side work is
    /// unaffected.
    pub fn is_offline(&self) -> bool {
        *self.is_offline.lock()
    }

    pub fn set_offline(&self, offline: bool) {
        *self.is_offline.lock() = offline;
        metrics::SERVER_ONLINE.set(if offline { 0 } else { 1 });
    }
}
