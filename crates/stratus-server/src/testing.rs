//! Test doubles for the collaborator seams and a small harness that wires
//! a `ControlServer` to them. Used by the unit and scenario tests; kept in
//! the crate so downstream components can drive the control plane without
//! a real engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use stratus_common::wire::{
    BackendDescriptor, CatalogCacheResponse, CatalogCacheUpdate, CatalogObject, CatalogObjectKind,
    ExecPlanFragmentParams, ExecRequest, FragmentInstanceCtx, FragmentInstanceId, HostPort,
    OutputSinkDesc, PlanFragmentDesc, QueryCtx, QueryId, ReportExecStatusParams, ResultSetMetadata,
    RowBatch, SessionKind, StmtType, TopicDelta, TopicItem, TransmitDataParams, CATALOG_TOPIC,
    MEMBERSHIP_TOPIC,
};
use stratus_common::QueryStatus;

use crate::config::DaemonFlags;
use crate::env::{
    ClientCache, Coordinator, CoordinatorFactory, ExecEnv, FragmentExec, FragmentExecFactory,
    Frontend, LibraryCache, StreamManager,
};
use crate::query::QueryExecState;
use crate::server::ControlServer;
use crate::session::{ConnectionContext, Session};

/// A standalone session, for tests that do not need a server.
pub fn test_session(kind: SessionKind, user: &str) -> Arc<Session> {
    Session::new(
        Uuid::new_v4(),
        kind,
        "10.0.0.7:54321".to_string(),
        user.to_string(),
        "default".to_string(),
        crate::options::QueryOptions::default(),
    )
}

/// Scripted frontend bridge.
pub struct FakeFrontend {
    service_id: Uuid,
    planning_error: Mutex<Option<String>>,
    catalog_error: Mutex<Option<String>>,
    catalog_updates: Mutex<Vec<CatalogCacheUpdate>>,
    // Objects returned by get_catalog_object, keyed by entry key.
    stashed_objects: Mutex<HashMap<String, CatalogObject>>,
}

impl FakeFrontend {
    pub fn new() -> Self {
        FakeFrontend {
            service_id: Uuid::new_v4(),
            planning_error: Mutex::new(None),
            catalog_error: Mutex::new(None),
            catalog_updates: Mutex::new(Vec::new()),
            stashed_objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog_service_id(&self) -> Uuid {
        self.service_id
    }

    /// Make every subsequent planning call fail with `message`.
    pub fn fail_planning(&self, message: &str) {
        *self.planning_error.lock() = Some(message.to_string());
    }

    /// Make every subsequent catalog cache update fail with `message`.
    pub fn fail_catalog_updates(&self, message: &str) {
        *self.catalog_error.lock() = Some(message.to_string());
    }

    /// Stash the object `get_catalog_object` returns for `entry_key`.
    pub fn stash_catalog_object(&self, entry_key: &str, library_path: &str, version: i64) {
        let object = CatalogObject::from_entry_key(entry_key).unwrap();
        self.stashed_objects.lock().insert(
            entry_key.to_string(),
            CatalogObject {
                catalog_version: version,
                library_path: Some(library_path.to_string()),
                ..object
            },
        );
    }

    pub fn catalog_update_count(&self) -> usize {
        self.catalog_updates.lock().len()
    }

    pub fn last_catalog_update(&self) -> Option<CatalogCacheUpdate> {
        self.catalog_updates.lock().last().cloned()
    }
}

impl Default for FakeFrontend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Frontend for FakeFrontend {
    async fn validate_settings(&self) -> QueryStatus {
        QueryStatus::ok()
    }

    async fn get_exec_request(
        &self,
        _ctx: &QueryCtx,
        _options: &crate::options::QueryOptions,
    ) -> Result<ExecRequest, QueryStatus> {
        if let Some(message) = self.planning_error.lock().clone() {
            return Err(QueryStatus::error(message));
        }
        Ok(ExecRequest {
            stmt_type: StmtType::Query,
            ddl_type: None,
            result_metadata: Some(ResultSetMetadata {
                columns: vec![stratus_common::wire::ColumnDesc {
                    name: "_c0".to_string(),
                    type_name: "INT".to_string(),
                }],
            }),
            access_events: Vec::new(),
        })
    }

    async fn update_catalog_cache(
        &self,
        req: &CatalogCacheUpdate,
    ) -> Result<CatalogCacheResponse, QueryStatus> {
        if let Some(message) = self.catalog_error.lock().clone() {
            return Err(QueryStatus::error(message));
        }
        self.catalog_updates.lock().push(req.clone());
        Ok(CatalogCacheResponse { catalog_service_id: self.service_id })
    }

    async fn get_catalog_object(&self, obj: &CatalogObject) -> Result<CatalogObject, QueryStatus> {
        self.stashed_objects
            .lock()
            .get(&obj.entry_key())
            .cloned()
            .ok_or_else(|| QueryStatus::error(format!("unknown catalog object {}", obj.entry_key())))
    }

    async fn get_db_names(&self) -> Result<Vec<String>, QueryStatus> {
        Ok(vec!["default".to_string()])
    }

    async fn get_table_names(&self, _db: &str) -> Result<Vec<String>, QueryStatus> {
        Ok(Vec::new())
    }
}

/// Coordinator double that records the calls routed to it.
pub struct FakeCoordinator {
    hosts: Vec<HostPort>,
    cancel_count: AtomicUsize,
    report_count: AtomicUsize,
}

impl Coordinator for FakeCoordinator {
    fn update_fragment_exec_status(&self, _params: &ReportExecStatusParams) -> QueryStatus {
        self.report_count.fetch_add(1, Ordering::SeqCst);
        QueryStatus::ok()
    }

    fn cancel(&self, _cause: &QueryStatus) {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
    }

    fn unique_hosts(&self) -> Vec<HostPort> {
        self.hosts.clone()
    }

    fn progress(&self) -> (i64, i64) {
        (1, 1)
    }

    fn exec_summary(&self) -> String {
        "00:SCAN [1 instance] 1 row".to_string()
    }
}

/// Factory producing [`FakeCoordinator`]s placed on a configurable host
/// set, retrievable afterwards by query id.
#[derive(Default)]
pub struct FakeCoordinatorFactory {
    executor_hosts: Mutex<Vec<HostPort>>,
    coordinators: Mutex<HashMap<QueryId, Arc<FakeCoordinator>>>,
}

impl FakeCoordinatorFactory {
    pub fn set_executor_hosts(&self, hosts: Vec<HostPort>) {
        *self.executor_hosts.lock() = hosts;
    }

    pub fn coordinator(&self, query_id: &QueryId) -> Option<Arc<FakeCoordinator>> {
        self.coordinators.lock().get(query_id).cloned()
    }
}

#[async_trait]
impl CoordinatorFactory for FakeCoordinatorFactory {
    async fn execute(
        &self,
        ctx: &QueryCtx,
        _request: &ExecRequest,
    ) -> Result<Option<Arc<dyn Coordinator>>, QueryStatus> {
        let coordinator = Arc::new(FakeCoordinator {
            hosts: self.executor_hosts.lock().clone(),
            cancel_count: AtomicUsize::new(0),
            report_count: AtomicUsize::new(0),
        });
        self.coordinators
            .lock()
            .insert(ctx.query_id, coordinator.clone());
        Ok(Some(coordinator))
    }
}

/// A fragment runtime that runs until released or cancelled.
pub struct FakeFragmentExec {
    prepare_error: Option<String>,
    released: AtomicBool,
    cancelled: AtomicBool,
}

#[async_trait]
impl FragmentExec for FakeFragmentExec {
    async fn prepare(&self, _params: &ExecPlanFragmentParams) -> QueryStatus {
        match &self.prepare_error {
            Some(message) => QueryStatus::error(message.clone()),
            None => QueryStatus::ok(),
        }
    }

    async fn exec(&self) -> QueryStatus {
        while !self.released.load(Ordering::SeqCst) && !self.cancelled.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        QueryStatus::ok()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeFragmentExecFactory {
    prepare_error: Mutex<Option<String>>,
    instances: Mutex<HashMap<FragmentInstanceId, Arc<FakeFragmentExec>>>,
}

impl FakeFragmentExecFactory {
    pub fn fail_prepare(&self, message: &str) {
        *self.prepare_error.lock() = Some(message.to_string());
    }

    /// Let a running fragment finish normally.
    pub fn release(&self, instance_id: &FragmentInstanceId) {
        if let Some(instance) = self.instances.lock().get(instance_id) {
            instance.released.store(true, Ordering::SeqCst);
        }
    }
}

impl FragmentExecFactory for FakeFragmentExecFactory {
    fn create(&self, ctx: &FragmentInstanceCtx) -> Arc<dyn FragmentExec> {
        let instance = Arc::new(FakeFragmentExec {
            prepare_error: self.prepare_error.lock().clone(),
            released: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        self.instances
            .lock()
            .insert(ctx.fragment_instance_id, instance.clone());
        instance
    }
}

/// Stream manager double counting appended batches and closed senders.
#[derive(Default)]
pub struct FakeStreamManager {
    error: Mutex<Option<String>>,
    batches: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeStreamManager {
    pub fn fail_with(&self, message: &str) {
        *self.error.lock() = Some(message.to_string());
    }

    pub fn batches_added(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn senders_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamManager for FakeStreamManager {
    async fn add_data(
        &self,
        _dest: FragmentInstanceId,
        _node_id: i32,
        _sender_id: i32,
        _batch: &RowBatch,
    ) -> QueryStatus {
        if let Some(message) = self.error.lock().clone() {
            return QueryStatus::error(message);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        QueryStatus::ok()
    }

    async fn close_sender(
        &self,
        _dest: FragmentInstanceId,
        _node_id: i32,
        _sender_id: i32,
    ) -> QueryStatus {
        if let Some(message) = self.error.lock().clone() {
            return QueryStatus::error(message);
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        QueryStatus::ok()
    }
}

/// An [`ExecEnv`] wired to fresh fakes.
pub fn test_env() -> ExecEnv {
    ExecEnv {
        frontend: Arc::new(FakeFrontend::new()),
        coordinator_factory: Arc::new(FakeCoordinatorFactory::default()),
        fragment_exec_factory: Arc::new(FakeFragmentExecFactory::default()),
        stream_mgr: Arc::new(FakeStreamManager::default()),
        lib_cache: Arc::new(LibraryCache::new()),
        client_cache: Arc::new(ClientCache::new()),
    }
}

/// Builder for [`TestDaemon`].
pub struct TestDaemonBuilder {
    flags: DaemonFlags,
}

impl TestDaemonBuilder {
    pub fn idle_session_timeout(mut self, seconds: i64) -> Self {
        self.flags.idle_session_timeout = seconds;
        self
    }

    pub fn idle_query_timeout(mut self, seconds: i32) -> Self {
        self.flags.idle_query_timeout = seconds;
        self
    }

    pub fn query_log_size(mut self, size: i64) -> Self {
        self.flags.query_log_size = size;
        self
    }

    pub fn proxy_config(mut self, config: &str) -> Self {
        self.flags.authorized_proxy_user_config = config.to_string();
        self
    }

    pub fn audit_log_dir(mut self, dir: &str) -> Self {
        self.flags.audit_event_log_dir = dir.to_string();
        self
    }

    pub fn profile_log_dir(mut self, dir: &str) -> Self {
        self.flags.profile_log_dir = dir.to_string();
        self.flags.log_query_to_file = true;
        self
    }

    pub fn build(self) -> TestDaemon {
        let frontend = Arc::new(FakeFrontend::new());
        let coordinators = Arc::new(FakeCoordinatorFactory::default());
        coordinators.set_executor_hosts(vec![HostPort::new("executor-1", 22000)]);
        let fragments = Arc::new(FakeFragmentExecFactory::default());
        let streams = Arc::new(FakeStreamManager::default());
        let env = ExecEnv {
            frontend: frontend.clone(),
            coordinator_factory: coordinators.clone(),
            fragment_exec_factory: fragments.clone(),
            stream_mgr: streams.clone(),
            lib_cache: Arc::new(LibraryCache::new()),
            client_cache: Arc::new(ClientCache::new()),
        };
        let server = ControlServer::try_new(self.flags, env).expect("test flags must be valid");
        TestDaemon { server, frontend, coordinators, fragments, streams }
    }
}

/// A control server wired to fakes, plus handles to all of them.
pub struct TestDaemon {
    pub server: Arc<ControlServer>,
    pub frontend: Arc<FakeFrontend>,
    pub coordinators: Arc<FakeCoordinatorFactory>,
    pub fragments: Arc<FakeFragmentExecFactory>,
    pub streams: Arc<FakeStreamManager>,
}

impl TestDaemon {
    pub fn builder() -> TestDaemonBuilder {
        let mut flags = DaemonFlags::defaults();
        // Tests opt into file logging explicitly.
        flags.log_query_to_file = false;
        TestDaemonBuilder { flags }
    }

    pub fn legacy_connection(&self, username: &str) -> ConnectionContext {
        ConnectionContext {
            connection_id: Uuid::new_v4(),
            kind: SessionKind::Legacy,
            network_address: "10.0.0.7:54321".to_string(),
            username: username.to_string(),
        }
    }

    /// Open an HS2 session for user "alice".
    pub fn open_test_session(&self) -> Arc<Session> {
        let ctx = ConnectionContext {
            connection_id: Uuid::new_v4(),
            kind: SessionKind::Hs2,
            network_address: "10.0.0.7:54321".to_string(),
            username: "alice".to_string(),
        };
        self.server
            .open_session(&ctx, "alice", None, None)
            .expect("test session must open")
    }

    /// Open a session and run one statement on it.
    pub async fn start_query(&self, sql: &str) -> (Arc<QueryExecState>, Arc<Session>) {
        let session = self.open_test_session();
        self.start_query_on(&session, sql).await
    }

    /// Run one statement on an existing session, holding the session
    /// reference only for the duration of the call.
    pub async fn start_query_on(
        &self,
        session: &Arc<Session>,
        sql: &str,
    ) -> (Arc<QueryExecState>, Arc<Session>) {
        let held = self
            .server
            .get_session_state(&session.session_id, true)
            .expect("test session must be usable");
        let state = self
            .server
            .execute(QueryCtx::new(sql), held.clone())
            .await
            .expect("test query must start");
        self.server.release_session(&held);
        (state, session.clone())
    }

    /// The host the fake coordinator places fragments on by default.
    pub fn executor_host(&self) -> HostPort {
        HostPort::new("executor-1", 22000)
    }

    pub fn set_executor_hosts(&self, hosts: Vec<HostPort>) {
        self.coordinators.set_executor_hosts(hosts);
    }

    pub fn coordinator_cancel_count(&self, query_id: &QueryId) -> usize {
        self.coordinators
            .coordinator(query_id)
            .map(|c| c.cancel_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn coordinator_report_count(&self, query_id: &QueryId) -> usize {
        self.coordinators
            .coordinator(query_id)
            .map(|c| c.report_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// A status report for one fragment of `query_id`.
    pub fn report_for(&self, query_id: &QueryId) -> ReportExecStatusParams {
        ReportExecStatusParams {
            query_id: *query_id,
            backend_num: 0,
            fragment_instance_id: Uuid::new_v4(),
            done: false,
            status: QueryStatus::ok().to_wire(),
        }
    }

    /// A well-formed ExecPlanFragment request.
    pub fn fragment_params(&self) -> ExecPlanFragmentParams {
        ExecPlanFragmentParams {
            fragment: PlanFragmentDesc {
                display_name: "F00".to_string(),
                output_sink: Some(OutputSinkDesc { kind: "EXCHANGE".to_string() }),
            },
            instance_ctx: FragmentInstanceCtx {
                query_id: Uuid::new_v4(),
                fragment_instance_id: Uuid::new_v4(),
                backend_num: 0,
                coord_address: Some(HostPort::new("coordinator-1", 22000)),
            },
        }
    }

    pub fn release_fragment(&self, instance_id: &FragmentInstanceId) {
        self.fragments.release(instance_id);
    }

    /// Wait until the fragment worker has erased its registry entry.
    pub async fn wait_for_fragment_removal(&self, instance_id: &FragmentInstanceId) {
        for _ in 0..400 {
            if self.server.get_fragment_exec_state(instance_id).is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("fragment {} was never removed from the registry", instance_id);
    }

    /// A TransmitData request carrying `rows` rows.
    pub fn transmit_params(&self, rows: i64) -> TransmitDataParams {
        TransmitDataParams {
            dest_fragment_instance_id: Uuid::new_v4(),
            dest_node_id: 1,
            sender_id: 0,
            eos: false,
            row_batch: RowBatch { num_rows: rows, data: vec![0u8; 16] },
        }
    }
}

/// A catalog topic delta. `min_subscriber_topic_version` follows
/// `to_version`, which is what a single-subscriber cluster reports.
pub fn catalog_delta(
    to_version: i64,
    entries: Vec<TopicItem>,
    deletions: Vec<String>,
) -> TopicDelta {
    TopicDelta {
        topic_name: CATALOG_TOPIC.to_string(),
        is_delta: true,
        topic_entries: entries,
        topic_deletions: deletions,
        from_version: None,
        to_version,
        min_subscriber_topic_version: to_version,
    }
}

/// The CATALOG object entry announcing `version` under `service_id`.
pub fn catalog_object_entry(service_id: Uuid, version: i64) -> TopicItem {
    let object = CatalogObject {
        object_type: CatalogObjectKind::Catalog,
        name: "catalog".to_string(),
        catalog_version: version,
        catalog_service_id: Some(service_id),
        library_path: None,
    };
    TopicItem {
        key: object.entry_key(),
        value: serde_json::to_vec(&object).unwrap(),
    }
}

/// A FUNCTION entry whose native library lives at `library_path`.
pub fn function_entry(name: &str, library_path: &str, version: i64) -> TopicItem {
    let object = CatalogObject {
        object_type: CatalogObjectKind::Function,
        name: name.to_string(),
        catalog_version: version,
        catalog_service_id: None,
        library_path: Some(library_path.to_string()),
    };
    TopicItem {
        key: object.entry_key(),
        value: serde_json::to_vec(&object).unwrap(),
    }
}

/// A membership topic delta.
pub fn membership_delta(
    is_delta: bool,
    entries: Vec<TopicItem>,
    deletions: Vec<String>,
) -> TopicDelta {
    TopicDelta {
        topic_name: MEMBERSHIP_TOPIC.to_string(),
        is_delta,
        topic_entries: entries,
        topic_deletions: deletions,
        from_version: None,
        to_version: 0,
        min_subscriber_topic_version: 0,
    }
}

/// A membership entry binding backend `key` to `host:port`.
pub fn backend_entry(key: &str, host: &str, port: u16) -> TopicItem {
    let descriptor = BackendDescriptor { address: HostPort::new(host, port) };
    TopicItem {
        key: key.to_string(),
        value: serde_json::to_vec(&descriptor).unwrap(),
    }
}
