//! Audit and profile logging.
//!
//! Both logs are line-oriented rotating files: a file holds at most a
//! configured number of entries, then a new generation is started. The
//! file-name prefixes are parsed by fleet tooling and must not change.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{error, info};

use stratus_common::wire::ExecRequest;
use stratus_common::QueryStatus;

use crate::query::QueryExecState;
use crate::server::ControlServer;

/// Prefix of profile log file names. The version number is internal to the
/// file format, not a release number.
pub const PROFILE_LOG_FILE_PREFIX: &str = "impala_profile_log_1.0-";
/// Prefix of audit event log file names.
pub const AUDIT_EVENT_LOG_FILE_PREFIX: &str = "impala_audit_event_log_1.0-";

/// How often the background flusher runs.
const LOG_FLUSH_INTERVAL_SECS: u64 = 5;

/// Whether a query failed authorization. Authorization failures are the
/// one class of errors audited at query teardown.
pub fn is_authorization_error(status: &QueryStatus) -> bool {
    !status.is_ok() && status.message().contains("AuthorizationException")
}

struct LoggerInner {
    writer: BufWriter<File>,
    entries_in_file: u32,
    generation: u64,
}

/// An append-only line logger that starts a new file every `max_entries`
/// lines. File names are `<prefix><ms-timestamp>.<generation>`.
pub struct RotatingLogger {
    dir: PathBuf,
    prefix: String,
    max_entries: u32,
    inner: Mutex<LoggerInner>,
}

impl RotatingLogger {
    pub fn new(dir: &str, prefix: &str, max_entries: u32) -> std::io::Result<Self> {
        let dir = PathBuf::from(dir);
        fs::create_dir_all(&dir)?;
        let writer = Self::open_generation(&dir, prefix, 0)?;
        info!(dir = %dir.display(), prefix = prefix, "Logger initialized");
        Ok(RotatingLogger {
            dir,
            prefix: prefix.to_string(),
            max_entries,
            inner: Mutex::new(LoggerInner { writer, entries_in_file: 0, generation: 0 }),
        })
    }

    fn open_generation(dir: &PathBuf, prefix: &str, generation: u64) -> std::io::Result<BufWriter<File>> {
        let name = format!("{}{}.{}", prefix, Utc::now().timestamp_millis(), generation);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(BufWriter::new(file))
    }

    /// Append one line, rotating first if the current file is full.
    pub fn append_entry(&self, entry: &str) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if self.max_entries > 0 && inner.entries_in_file >= self.max_entries {
            inner.writer.flush()?;
            let generation = inner.generation + 1;
            inner.writer = Self::open_generation(&self.dir, &self.prefix, generation)?;
            inner.generation = generation;
            inner.entries_in_file = 0;
        }
        writeln!(inner.writer, "{}", entry)?;
        inner.entries_in_file += 1;
        Ok(())
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.inner.lock().writer.flush()
    }
}

impl ControlServer {
    /// Append one audit event for a planned query. An append failure is
    /// logged and, with `--abort_on_failed_audit_event`, shuts the daemon
    /// down: a deployment that audits must not run blind.
    pub(crate) fn log_audit_record(&self, exec_state: &QueryExecState, request: &ExecRequest) {
        let Some(logger) = &self.audit_logger else { return };

        let status = exec_state.query_status();
        let catalog_objects: Vec<_> = request
            .access_events
            .iter()
            .map(|event| {
                json!({
                    "name": event.name,
                    "object_type": event.object_type,
                    "privilege": event.privilege,
                })
            })
            .collect();
        let entry = json!({
            "query_id": exec_state.query_id().to_string(),
            "session_id": exec_state.session_id().to_string(),
            "start_time": exec_state.start_time().to_rfc3339(),
            "authorization_failure": is_authorization_error(&status),
            "status": status.message(),
            "user": exec_state.effective_user(),
            "impersonator": exec_state.do_as_user().map(|_| exec_state.connected_user()),
            "statement_type": request.statement_type(),
            "network_address": exec_state.network_address(),
            "sql_statement": exec_state.sql_stmt().replace('\n', " "),
            "catalog_objects": catalog_objects,
        });
        // Each log line is a millisecond timestamp mapped to the event.
        let mut record = serde_json::Map::new();
        record.insert(Utc::now().timestamp_millis().to_string(), entry);
        let record = serde_json::Value::Object(record);

        if let Err(e) = logger.append_entry(&record.to_string()) {
            error!("Unable to record audit event record: {}", e);
            if self.flags.abort_on_failed_audit_event {
                error!("Shutting down due to abort_on_failed_audit_event=true");
                std::process::exit(1);
            }
        }
    }

    /// Periodic flusher for the profile and audit logs.
    pub(crate) async fn flush_logs_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(LOG_FLUSH_INTERVAL_SECS)).await;
            if let Some(logger) = &self.profile_logger {
                if let Err(e) = logger.flush() {
                    error!("Error flushing profile log: {}", e);
                }
            }
            if let Some(logger) = &self.audit_logger {
                if let Err(e) = logger.flush() {
                    error!("Error flushing audit event log: {}", e);
                    if self.flags.abort_on_failed_audit_event {
                        error!("Shutting down due to abort_on_failed_audit_event=true");
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}
