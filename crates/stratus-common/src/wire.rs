//! Wire-form structs shared between daemons.
//!
//! These are the payloads of the fragment-control RPC surface and of the
//! shared-state topics. Field names and the topic/key encodings are part of
//! the fleet compatibility contract; the transport that carries them is not
//! specified here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::StatusWire;

/// Globally-unique query id.
pub type QueryId = Uuid;
/// Session id. For legacy-protocol sessions this equals the connection id.
pub type SessionId = Uuid;
/// Fragment-instance id: one execution of one plan fragment on one backend.
pub type FragmentInstanceId = Uuid;
/// Transport connection id.
pub type ConnectionId = Uuid;
/// Identity of a catalog service incarnation.
pub type CatalogServiceId = Uuid;

/// Topic carrying catalog deltas from the shared state service.
pub const CATALOG_TOPIC: &str = "impala-catalog";
/// Topic carrying cluster membership from the shared state service.
pub const MEMBERSHIP_TOPIC: &str = "impala-membership";

/// A network endpoint, rendered as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort { host: host.into(), port }
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for HostPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", s))?;
        if host.is_empty() {
            return Err(format!("expected host:port, got '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{}'", s))?;
        Ok(HostPort::new(host, port))
    }
}

/// Session protocol kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionKind {
    /// Single-session-per-connection legacy protocol.
    Legacy,
    /// HiveServer2-style protocol with explicit session management.
    Hs2,
}

/// Wire snapshot of a session, exchanged with peers that need the client
/// identity of a query (e.g. for fragment-level authorization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub database: String,
    pub connected_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_user: Option<String>,
    pub network_address: String,
}

/// Statement class of a planned request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StmtType {
    Query,
    Dml,
    Ddl,
    Explain,
}

impl StmtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StmtType::Query => "QUERY",
            StmtType::Dml => "DML",
            StmtType::Ddl => "DDL",
            StmtType::Explain => "EXPLAIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub type_name: String,
}

/// Shape of a query's result set, produced by planning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSetMetadata {
    pub columns: Vec<ColumnDesc>,
}

/// A catalog object touched by a statement, recorded for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub name: String,
    pub object_type: String,
    pub privilege: String,
}

/// Context of one client query, prepared by the coordinator daemon before
/// planning and carried to every fragment instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCtx {
    pub query_id: QueryId,
    pub sql_stmt: String,
    /// Coordinator process id, for log correlation.
    pub pid: u32,
    /// Wall-clock time at the coordinator when the query was accepted.
    pub now_string: String,
    pub coord_address: Option<HostPort>,
    /// Client-requested result cache size, bounded by the daemon flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_cache_size: Option<i64>,
}

impl QueryCtx {
    pub fn new(sql_stmt: impl Into<String>) -> Self {
        QueryCtx {
            query_id: Uuid::nil(),
            sql_stmt: sql_stmt.into(),
            pid: 0,
            now_string: String::new(),
            coord_address: None,
            result_cache_size: None,
        }
    }
}

/// Planning output consumed by the control plane. The plan itself is opaque
/// here; only the pieces the query lifecycle touches are modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub stmt_type: StmtType,
    /// Specific DDL operation name, when `stmt_type` is DDL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddl_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_metadata: Option<ResultSetMetadata>,
    #[serde(default)]
    pub access_events: Vec<AccessEvent>,
}

impl ExecRequest {
    /// Statement type as rendered into audit records.
    pub fn statement_type(&self) -> &str {
        match (&self.stmt_type, &self.ddl_type) {
            (StmtType::Ddl, Some(ddl)) => ddl.as_str(),
            (other, _) => other.as_str(),
        }
    }
}

/// Sink of a plan fragment. Fragments without one cannot produce output and
/// are rejected at ExecPlanFragment time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSinkDesc {
    pub kind: String,
}

/// One plan fragment as shipped to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragmentDesc {
    pub display_name: String,
    pub output_sink: Option<OutputSinkDesc>,
}

/// Per-instance context of a fragment execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentInstanceCtx {
    pub query_id: QueryId,
    pub fragment_instance_id: FragmentInstanceId,
    /// Index of this backend within the query's schedule.
    pub backend_num: i32,
    pub coord_address: Option<HostPort>,
}

/// ExecPlanFragment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPlanFragmentParams {
    pub fragment: PlanFragmentDesc,
    pub instance_ctx: FragmentInstanceCtx,
}

/// ReportExecStatus request: an executor reporting fragment progress back to
/// the coordinator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportExecStatusParams {
    pub query_id: QueryId,
    pub backend_num: i32,
    pub fragment_instance_id: FragmentInstanceId,
    pub done: bool,
    pub status: StatusWire,
}

/// CancelPlanFragment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPlanFragmentParams {
    pub fragment_instance_id: FragmentInstanceId,
}

/// A batch of rows in transit between fragment instances. The row encoding
/// is opaque to the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowBatch {
    pub num_rows: i64,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// TransmitData request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitDataParams {
    pub dest_fragment_instance_id: FragmentInstanceId,
    pub dest_node_id: i32,
    pub sender_id: i32,
    pub eos: bool,
    pub row_batch: RowBatch,
}

/// One entry of a topic delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicItem {
    pub key: String,
    pub value: Vec<u8>,
}

/// An incremental (or, when `is_delta` is false, full-state) update from the
/// shared state service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDelta {
    pub topic_name: String,
    pub is_delta: bool,
    #[serde(default)]
    pub topic_entries: Vec<TopicItem>,
    #[serde(default)]
    pub topic_deletions: Vec<String>,
    /// Set by a subscriber to request retransmission from this version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<i64>,
    pub to_version: i64,
    /// Minimum topic version observed across all subscribers.
    pub min_subscriber_topic_version: i64,
}

impl TopicDelta {
    /// A subscriber-originated request to resend the topic from `version`.
    pub fn resend_request(topic_name: &str, version: i64) -> Self {
        TopicDelta {
            topic_name: topic_name.to_string(),
            is_delta: false,
            topic_entries: Vec::new(),
            topic_deletions: Vec::new(),
            from_version: Some(version),
            to_version: 0,
            min_subscriber_topic_version: 0,
        }
    }
}

/// Kind of a replicated catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogObjectKind {
    Catalog,
    Database,
    Table,
    View,
    Function,
    DataSource,
}

impl CatalogObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogObjectKind::Catalog => "CATALOG",
            CatalogObjectKind::Database => "DATABASE",
            CatalogObjectKind::Table => "TABLE",
            CatalogObjectKind::View => "VIEW",
            CatalogObjectKind::Function => "FUNCTION",
            CatalogObjectKind::DataSource => "DATA_SOURCE",
        }
    }

    fn from_str_upper(s: &str) -> Option<Self> {
        Some(match s {
            "CATALOG" => CatalogObjectKind::Catalog,
            "DATABASE" => CatalogObjectKind::Database,
            "TABLE" => CatalogObjectKind::Table,
            "VIEW" => CatalogObjectKind::View,
            "FUNCTION" => CatalogObjectKind::Function,
            "DATA_SOURCE" => CatalogObjectKind::DataSource,
            _ => return None,
        })
    }
}

/// A replicated catalog object as carried in catalog-topic entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogObject {
    pub object_type: CatalogObjectKind,
    pub name: String,
    pub catalog_version: i64,
    /// Present only on the CATALOG object itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_service_id: Option<CatalogServiceId>,
    /// Native library location, for FUNCTION/DATA_SOURCE objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<String>,
}

impl CatalogObject {
    /// Parse a topic deletion key of the form `KIND:name` back into an
    /// object descriptor. Only the kind and name are known to the deleter.
    pub fn from_entry_key(key: &str) -> Result<Self, String> {
        let (kind, name) = key
            .split_once(':')
            .ok_or_else(|| format!("malformed catalog entry key '{}'", key))?;
        let object_type = CatalogObjectKind::from_str_upper(kind)
            .ok_or_else(|| format!("unknown catalog object kind in key '{}'", key))?;
        Ok(CatalogObject {
            object_type,
            name: name.to_string(),
            catalog_version: 0,
            catalog_service_id: None,
            library_path: None,
        })
    }

    /// The topic key this object is stored under.
    pub fn entry_key(&self) -> String {
        format!("{}:{}", self.object_type.as_str(), self.name)
    }
}

/// Request applied to the local catalog cache via the Frontend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogCacheUpdate {
    pub is_delta: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_service_id: Option<CatalogServiceId>,
    #[serde(default)]
    pub updated_objects: Vec<CatalogObject>,
    #[serde(default)]
    pub removed_objects: Vec<CatalogObject>,
}

/// Frontend response to a catalog cache update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogCacheResponse {
    pub catalog_service_id: CatalogServiceId,
}

/// Outcome of a catalog-service operation (e.g. a DDL), used to decide
/// whether the originating daemon must wait for replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogUpdateResult {
    pub catalog_service_id: CatalogServiceId,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_catalog_object: Option<CatalogObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_catalog_object: Option<CatalogObject>,
}

/// One cluster member as carried in membership-topic entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub address: HostPort,
}

/// A key/value configuration pair surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVariable {
    pub key: String,
    pub value: String,
}
