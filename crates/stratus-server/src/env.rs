//! The daemon-wide environment handle.
//!
//! `ExecEnv` bundles the handles to the components the control plane
//! consumes but does not own: the SQL frontend (planner bridge), the
//! coordinator and fragment execution engines, and the inter-fragment
//! stream manager. It also owns two process-wide caches the control plane
//! mutates on catalog and membership changes: the native library cache and
//! the peer-connection cache. Leaf code never reaches for globals; every
//! collaborator arrives through this handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use stratus_common::wire::{
    CatalogCacheResponse, CatalogCacheUpdate, CatalogObject, ExecPlanFragmentParams, ExecRequest,
    FragmentInstanceCtx, FragmentInstanceId, HostPort, QueryCtx, ReportExecStatusParams, RowBatch,
};
use stratus_common::QueryStatus;

use crate::options::QueryOptions;

/// Bridge to the SQL frontend: planning and the local catalog cache.
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Sanity-check frontend configuration at startup.
    async fn validate_settings(&self) -> QueryStatus;

    /// Plan a statement into an executable request.
    async fn get_exec_request(
        &self,
        ctx: &QueryCtx,
        options: &QueryOptions,
    ) -> Result<ExecRequest, QueryStatus>;

    /// Apply a catalog update to the local catalog cache.
    async fn update_catalog_cache(
        &self,
        req: &CatalogCacheUpdate,
    ) -> Result<CatalogCacheResponse, QueryStatus>;

    /// Fetch the locally cached form of a catalog object, including the
    /// metadata the topic delta does not carry.
    async fn get_catalog_object(&self, obj: &CatalogObject) -> Result<CatalogObject, QueryStatus>;

    /// Database names in the local catalog replica.
    async fn get_db_names(&self) -> Result<Vec<String>, QueryStatus>;

    /// Table names of one database in the local catalog replica.
    async fn get_table_names(&self, db: &str) -> Result<Vec<String>, QueryStatus>;
}

/// The per-query object owning fragment dispatch and result aggregation.
/// Produced by the execution engine once a distributed query starts.
pub trait Coordinator: Send + Sync {
    /// Apply a fragment status report from an executor.
    fn update_fragment_exec_status(&self, params: &ReportExecStatusParams) -> QueryStatus;

    /// Ask the coordinator to tear down its fragments. Idempotent.
    fn cancel(&self, cause: &QueryStatus);

    /// The distinct executor hosts this query runs fragments on.
    fn unique_hosts(&self) -> Vec<HostPort>;

    /// `(complete, total)` fragment progress.
    fn progress(&self) -> (i64, i64);

    /// Human-readable execution summary for archival.
    fn exec_summary(&self) -> String;
}

/// Starts coordinator-side execution of a planned request.
#[async_trait]
pub trait CoordinatorFactory: Send + Sync {
    /// Begin execution. Returns `None` for requests with no distributed
    /// part (e.g. pure metadata operations).
    async fn execute(
        &self,
        ctx: &QueryCtx,
        request: &ExecRequest,
    ) -> Result<Option<Arc<dyn Coordinator>>, QueryStatus>;
}

/// Executor-side runtime of one fragment instance.
#[async_trait]
pub trait FragmentExec: Send + Sync {
    /// Set the instance up. Must complete before `cancel` can be observed;
    /// the registry guarantees that by preparing before registering.
    async fn prepare(&self, params: &ExecPlanFragmentParams) -> QueryStatus;

    /// Run the instance to completion (or until cancelled).
    async fn exec(&self) -> QueryStatus;

    /// Request cooperative teardown. Idempotent.
    fn cancel(&self);
}

/// Creates fragment runtimes for incoming ExecPlanFragment requests.
pub trait FragmentExecFactory: Send + Sync {
    fn create(&self, ctx: &FragmentInstanceCtx) -> Arc<dyn FragmentExec>;
}

/// Routes row batches between fragment instances on this node.
#[async_trait]
pub trait StreamManager: Send + Sync {
    async fn add_data(
        &self,
        dest_fragment_instance_id: FragmentInstanceId,
        dest_node_id: i32,
        sender_id: i32,
        batch: &RowBatch,
    ) -> QueryStatus;

    async fn close_sender(
        &self,
        dest_fragment_instance_id: FragmentInstanceId,
        dest_node_id: i32,
        sender_id: i32,
    ) -> QueryStatus;
}

/// Process-wide cache of native library files referenced by functions and
/// data sources. Catalog deltas invalidate entries; the frontend bridge
/// reads them concurrently.
#[derive(Default)]
pub struct LibraryCache {
    entries: Mutex<HashMap<String, LibCacheEntry>>,
}

#[derive(Debug, Clone, Default)]
struct LibCacheEntry {
    needs_refresh: bool,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a library as stale so the next load re-fetches it.
    pub fn set_needs_refresh(&self, path: &str) {
        self.entries
            .lock()
            .entry(path.to_string())
            .or_default()
            .needs_refresh = true;
    }

    /// Forget one library entirely.
    pub fn remove_entry(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    /// Drop everything, as if every function and data source were dropped.
    pub fn drop_cache(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn needs_refresh(&self, path: &str) -> Option<bool> {
        self.entries.lock().get(path).map(|e| e.needs_refresh)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Cache of RPC connections to peer daemons. The control plane only closes
/// connections (on membership loss); the transport layer opens them.
#[derive(Default)]
pub struct ClientCache {
    connections: Mutex<HashMap<HostPort, usize>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open connection to `addr`.
    pub fn note_connection(&self, addr: &HostPort) {
        *self.connections.lock().entry(addr.clone()).or_insert(0) += 1;
    }

    /// Close all cached connections to `addr`. Returns how many were open.
    pub fn close_connections(&self, addr: &HostPort) -> usize {
        self.connections.lock().remove(addr).unwrap_or(0)
    }

    pub fn open_connections(&self, addr: &HostPort) -> usize {
        self.connections.lock().get(addr).copied().unwrap_or(0)
    }
}

/// Handles to everything the control plane consumes.
#[derive(Clone)]
pub struct ExecEnv {
    pub frontend: Arc<dyn Frontend>,
    pub coordinator_factory: Arc<dyn CoordinatorFactory>,
    pub fragment_exec_factory: Arc<dyn FragmentExecFactory>,
    pub stream_mgr: Arc<dyn StreamManager>,
    pub lib_cache: Arc<LibraryCache>,
    pub client_cache: Arc<ClientCache>,
}
