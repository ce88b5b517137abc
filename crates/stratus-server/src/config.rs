//! Daemon configuration.
//!
//! Flag names and defaults are the external contract of the daemon; the
//! outer binary parses them with clap and hands the result to
//! [`crate::server::ControlServer::try_new`]. Validation failures at
//! startup are fatal: the binary maps them to exit code 1.

use std::collections::{HashMap, HashSet};

use clap::Parser;
use stratus_common::wire::HostPort;
use stratus_common::ControlError;

/// Allowed delegated users per proxy user. The literal `*` grants any.
pub type ProxyUserMap = HashMap<String, HashSet<String>>;

// Flag names stay snake_case: they are parsed by fleet tooling.
#[derive(Debug, Clone, Parser)]
#[command(name = "stratusd")]
#[command(about = "Stratus per-node daemon")]
#[command(rename_all = "snake_case")]
pub struct DaemonFlags {
    /// Port on which legacy-protocol client requests are served
    #[arg(long, env = "STRATUS_BEESWAX_PORT", default_value_t = 21000)]
    pub beeswax_port: u16,

    /// Port on which HiveServer2-protocol client requests are served
    #[arg(long, env = "STRATUS_HS2_PORT", default_value_t = 21050)]
    pub hs2_port: u16,

    /// Port on which backend fragment-control requests are served
    #[arg(long, env = "STRATUS_BE_PORT", default_value_t = 22000)]
    pub be_port: u16,

    /// Hostname advertised to peers as the coordinator address
    #[arg(long, env = "STRATUS_HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Number of threads available to serve client requests
    #[arg(long, default_value_t = 64)]
    pub fe_service_threads: usize,

    /// Number of threads available to serve backend execution requests
    #[arg(long, default_value_t = 64)]
    pub be_service_threads: usize,

    /// key=value pairs of default query options, separated by ','
    #[arg(long, env = "STRATUS_DEFAULT_QUERY_OPTIONS", default_value = "")]
    pub default_query_options: String,

    /// Number of queries to retain in the query log. -1 means unbounded,
    /// 0 disables the in-memory log entirely.
    #[arg(long, default_value_t = 25)]
    pub query_log_size: i64,

    /// If true, log completed query profiles to file
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub log_query_to_file: bool,

    /// Directory for profile log files. Blank disables profile logging.
    #[arg(long, env = "STRATUS_PROFILE_LOG_DIR", default_value = "")]
    pub profile_log_dir: String,

    /// Maximum size (in queries) of a profile log file before rotation
    #[arg(long, default_value_t = 5000)]
    pub max_profile_log_file_size: u32,

    /// Directory for audit event log files. Setting this enables auditing.
    #[arg(long, env = "STRATUS_AUDIT_EVENT_LOG_DIR", default_value = "")]
    pub audit_event_log_dir: String,

    /// Maximum size (in queries) of an audit log file before rotation
    #[arg(long, default_value_t = 5000)]
    pub max_audit_event_log_file_size: u32,

    /// Shut the daemon down if an audit event cannot be recorded
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub abort_on_failed_audit_event: bool,

    /// Abort startup on configuration errors instead of limping on
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub abort_on_config_error: bool,

    /// Size of the thread pool processing cancellations due to node failure
    /// and expiration
    #[arg(long, default_value_t = 5)]
    pub cancellation_thread_pool_size: usize,

    /// SSL certificate presented to clients; enables SSL on both client
    /// ports when set
    #[arg(long, default_value = "")]
    pub ssl_server_certificate: String,

    /// Private key counterpart of --ssl-server-certificate
    #[arg(long, default_value = "")]
    pub ssl_private_key: String,

    /// CA certificate clients use to validate the server certificate
    #[arg(long, default_value = "")]
    pub ssl_client_ca_certificate: String,

    /// Seconds a session may be idle before it is expired (with all its
    /// queries cancelled). 0 disables session expiration.
    #[arg(long, default_value_t = 0)]
    pub idle_session_timeout: i64,

    /// Seconds a query may be idle before it is cancelled. 0 disables
    /// query expiration. The QUERY_TIMEOUT_S query option lowers this
    /// per query but never raises it.
    #[arg(long, default_value_t = 0)]
    pub idle_query_timeout: i32,

    /// proxy=user1,user2;proxy2=*;... pairs of users allowed to delegate
    #[arg(long, env = "STRATUS_AUTHORIZED_PROXY_USER_CONFIG", default_value = "")]
    pub authorized_proxy_user_config: String,

    /// host:port of the local node manager's HTTP interface, optionally
    /// prefixed with http(s)://. Used to detect node-manager failure.
    #[arg(long, default_value = "")]
    pub local_nodemanager_url: String,

    /// Maximum number of results a client may ask to be cached per query
    /// to support restarting fetches
    #[arg(long, default_value_t = 100_000)]
    pub max_result_cache_size: i64,

    /// Base directory for daemon log output
    #[arg(long, env = "STRATUS_LOG_DIR", default_value = "logs")]
    pub log_dir: String,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, env = "STRATUS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl DaemonFlags {
    /// Flags with every default applied, as the contract documents them.
    pub fn defaults() -> Self {
        DaemonFlags::parse_from(["stratusd"])
    }

    /// The address peers use to reach this daemon's fragment-control port.
    pub fn backend_address(&self) -> HostPort {
        HostPort::new(self.hostname.clone(), self.be_port)
    }
}

/// Parse `--authorized_proxy_user_config`. Format:
/// `<proxy user>=<comma separated list of users they may delegate as>`
/// entries separated by `;`. A `*` value authorizes any delegated user.
/// An empty proxy user or an empty user list is a startup error.
pub fn parse_authorized_proxy_config(config: &str) -> Result<ProxyUserMap, ControlError> {
    let mut map = ProxyUserMap::new();
    for entry in config.split(';').filter(|e| !e.trim().is_empty()) {
        let (proxy_user, allowed) = entry.split_once('=').ok_or_else(|| {
            ControlError::Config(format!(
                "Invalid proxy user configuration, no mapping value specified for: {}",
                entry
            ))
        })?;
        let proxy_user = proxy_user.trim();
        if proxy_user.is_empty() {
            return Err(ControlError::Config(format!(
                "Invalid proxy user configuration, empty proxy user in: {}",
                entry
            )));
        }
        let allowed_users: HashSet<String> = allowed
            .split(',')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if allowed_users.is_empty() {
            return Err(ControlError::Config(format!(
                "Invalid proxy user configuration, no users specified for proxy user '{}'",
                proxy_user
            )));
        }
        map.insert(proxy_user.to_string(), allowed_users);
    }
    Ok(map)
}

/// Extract the probe address from `--local_nodemanager_url`: strip an
/// `http://` or `https://` prefix and parse `host:port`.
pub fn parse_nodemanager_address(url: &str) -> Result<HostPort, ControlError> {
    let trimmed = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    trimmed
        .parse::<HostPort>()
        .map_err(|e| ControlError::Config(format!("Could not parse --local_nodemanager_url: {}", e)))
}
