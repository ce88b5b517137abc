//! Typed query options and the `k1=v1,k2=v2,...` grammar.
//!
//! Every option a client can set is a field here. The renderer must emit a
//! value for every known key so that a newly added option without an
//! inverse mapping fails the round-trip test instead of silently vanishing
//! from the client-visible configuration.

use std::collections::BTreeMap;

use stratus_common::units::parse_mem_spec;
use stratus_common::wire::ConfigVariable;
use stratus_common::ControlError;

/// Result-file compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    Gzip,
    Bzip2,
    Default,
    Snappy,
    SnappyBlocked,
}

impl CompressionCodec {
    fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Bzip2 => "bzip2",
            CompressionCodec::Default => "default",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::SnappyBlocked => "snappy_blocked",
        }
    }
}

/// Plan explanation verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainLevel {
    Minimal,
    Standard,
    Extended,
    Verbose,
}

impl ExplainLevel {
    fn as_str(&self) -> &'static str {
        match self {
            ExplainLevel::Minimal => "minimal",
            ExplainLevel::Standard => "standard",
            ExplainLevel::Extended => "extended",
            ExplainLevel::Verbose => "verbose",
        }
    }
}

/// All client-settable query options, with daemon defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub abort_on_error: bool,
    pub max_errors: i32,
    pub disable_codegen: bool,
    pub batch_size: i32,
    pub mem_limit: i64,
    pub num_nodes: i32,
    pub max_scan_range_length: i64,
    pub max_io_buffers: i32,
    pub num_scanner_threads: i32,
    pub allow_unsupported_formats: bool,
    pub default_order_by_limit: i64,
    pub debug_action: String,
    pub compression_codec: CompressionCodec,
    pub abort_on_default_limit_exceeded: bool,
    pub hbase_caching: i32,
    pub hbase_cache_blocks: bool,
    pub parquet_file_size: i64,
    pub explain_level: ExplainLevel,
    pub sync_ddl: bool,
    pub request_pool: String,
    pub v_cpu_cores: i32,
    pub reservation_request_timeout: i64,
    pub disable_cached_reads: bool,
    pub disable_outermost_topn: bool,
    pub rm_initial_mem: i64,
    pub query_timeout_s: i32,
    pub max_block_mgr_memory: i64,
    pub strict_mode: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            abort_on_error: false,
            max_errors: 0,
            disable_codegen: false,
            batch_size: 1024,
            mem_limit: 0,
            num_nodes: 0,
            max_scan_range_length: 0,
            max_io_buffers: 0,
            num_scanner_threads: 0,
            allow_unsupported_formats: false,
            default_order_by_limit: -1,
            debug_action: String::new(),
            compression_codec: CompressionCodec::Default,
            abort_on_default_limit_exceeded: false,
            hbase_caching: 0,
            hbase_cache_blocks: false,
            parquet_file_size: 0,
            explain_level: ExplainLevel::Standard,
            sync_ddl: false,
            request_pool: String::new(),
            v_cpu_cores: 0,
            reservation_request_timeout: 0,
            disable_cached_reads: false,
            disable_outermost_topn: false,
            rm_initial_mem: 0,
            query_timeout_s: 0,
            max_block_mgr_memory: 0,
            strict_mode: false,
        }
    }
}

/// Every known option key, upper-case. The renderer iterates this so a key
/// without a render arm is caught in tests.
pub const KNOWN_OPTION_KEYS: &[&str] = &[
    "ABORT_ON_ERROR",
    "MAX_ERRORS",
    "DISABLE_CODEGEN",
    "BATCH_SIZE",
    "MEM_LIMIT",
    "NUM_NODES",
    "MAX_SCAN_RANGE_LENGTH",
    "MAX_IO_BUFFERS",
    "NUM_SCANNER_THREADS",
    "ALLOW_UNSUPPORTED_FORMATS",
    "DEFAULT_ORDER_BY_LIMIT",
    "DEBUG_ACTION",
    "COMPRESSION_CODEC",
    "ABORT_ON_DEFAULT_LIMIT_EXCEEDED",
    "HBASE_CACHING",
    "HBASE_CACHE_BLOCKS",
    "PARQUET_FILE_SIZE",
    "EXPLAIN_LEVEL",
    "SYNC_DDL",
    "REQUEST_POOL",
    "V_CPU_CORES",
    "RESERVATION_REQUEST_TIMEOUT",
    "DISABLE_CACHED_READS",
    "DISABLE_OUTERMOST_TOPN",
    "RM_INITIAL_MEM",
    "QUERY_TIMEOUT_S",
    "MAX_BLOCK_MGR_MEMORY",
    "STRICT_MODE",
];

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ControlError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ControlError::Internal(format!("Invalid {}: '{}'", key, value)))
}

/// Parse a byte-size option value. Percent forms and negatives are invalid
/// for query options.
fn parse_mem_value(value: &str, key: &str) -> Result<i64, ControlError> {
    let spec = parse_mem_spec(value)
        .ok_or_else(|| ControlError::Internal(format!("Failed to parse {} from '{}'.", key, value)))?;
    if spec.percent {
        return Err(ControlError::Internal(format!(
            "Invalid {} with percent '{}'.",
            key, value
        )));
    }
    Ok(spec.bytes)
}

/// Set a single option by key (case-insensitive). Unknown keys fail.
pub fn set_query_option(
    key: &str,
    value: &str,
    options: &mut QueryOptions,
) -> Result<(), ControlError> {
    match key.to_ascii_uppercase().as_str() {
        "ABORT_ON_ERROR" => options.abort_on_error = parse_bool(value),
        "MAX_ERRORS" => options.max_errors = parse_int(key, value)?,
        "DISABLE_CODEGEN" => options.disable_codegen = parse_bool(value),
        "BATCH_SIZE" => options.batch_size = parse_int(key, value)?,
        "MEM_LIMIT" => options.mem_limit = parse_mem_value(value, "query memory limit")?,
        "NUM_NODES" => options.num_nodes = parse_int(key, value)?,
        "MAX_SCAN_RANGE_LENGTH" => options.max_scan_range_length = parse_int(key, value)?,
        "MAX_IO_BUFFERS" => options.max_io_buffers = parse_int(key, value)?,
        "NUM_SCANNER_THREADS" => options.num_scanner_threads = parse_int(key, value)?,
        "ALLOW_UNSUPPORTED_FORMATS" => options.allow_unsupported_formats = parse_bool(value),
        "DEFAULT_ORDER_BY_LIMIT" => options.default_order_by_limit = parse_int(key, value)?,
        "DEBUG_ACTION" => options.debug_action = value.to_string(),
        "COMPRESSION_CODEC" => {
            // An empty value leaves the codec untouched.
            if value.is_empty() {
                return Ok(());
            }
            options.compression_codec = match value.to_ascii_lowercase().as_str() {
                "none" => CompressionCodec::None,
                "gzip" => CompressionCodec::Gzip,
                "bzip2" => CompressionCodec::Bzip2,
                "default" => CompressionCodec::Default,
                "snappy" => CompressionCodec::Snappy,
                "snappy_blocked" => CompressionCodec::SnappyBlocked,
                other => {
                    return Err(ControlError::Internal(format!(
                        "Invalid compression codec: {}",
                        other
                    )))
                }
            };
        }
        "ABORT_ON_DEFAULT_LIMIT_EXCEEDED" => {
            options.abort_on_default_limit_exceeded = parse_bool(value)
        }
        "HBASE_CACHING" => options.hbase_caching = parse_int(key, value)?,
        "HBASE_CACHE_BLOCKS" => options.hbase_cache_blocks = parse_bool(value),
        "PARQUET_FILE_SIZE" => {
            options.parquet_file_size = parse_mem_value(value, "parquet file size")?
        }
        "EXPLAIN_LEVEL" => {
            options.explain_level = match value.to_ascii_lowercase().as_str() {
                "minimal" | "0" => ExplainLevel::Minimal,
                "standard" | "1" => ExplainLevel::Standard,
                "extended" | "2" => ExplainLevel::Extended,
                "verbose" | "3" => ExplainLevel::Verbose,
                other => {
                    return Err(ControlError::Internal(format!(
                        "Invalid explain level: {}",
                        other
                    )))
                }
            };
        }
        "SYNC_DDL" => options.sync_ddl = parse_bool(value),
        "REQUEST_POOL" => options.request_pool = value.to_string(),
        "V_CPU_CORES" => options.v_cpu_cores = parse_int(key, value)?,
        "RESERVATION_REQUEST_TIMEOUT" => {
            options.reservation_request_timeout = parse_int(key, value)?
        }
        "DISABLE_CACHED_READS" => options.disable_cached_reads = parse_bool(value),
        "DISABLE_OUTERMOST_TOPN" => options.disable_outermost_topn = parse_bool(value),
        "RM_INITIAL_MEM" => options.rm_initial_mem = parse_mem_value(value, "RM memory limit")?,
        "QUERY_TIMEOUT_S" => options.query_timeout_s = parse_int(key, value)?,
        "MAX_BLOCK_MGR_MEMORY" => {
            options.max_block_mgr_memory = parse_mem_value(value, "block mgr memory limit")?
        }
        "STRICT_MODE" => options.strict_mode = parse_bool(value),
        _ => {
            return Err(ControlError::Internal(format!(
                "Ignoring invalid configuration option: {}",
                key
            )))
        }
    }
    Ok(())
}

/// Parse a `k1=v1,k2=v2,...` option string into `options`. Empty input is
/// a no-op. A token without `=` or with an empty key fails.
pub fn parse_query_options(input: &str, options: &mut QueryOptions) -> Result<(), ControlError> {
    if input.is_empty() {
        return Ok(());
    }
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, value) = token.split_once('=').ok_or_else(|| {
            ControlError::Internal(format!(
                "Ignoring invalid configuration option {}: bad format (expected key=value)",
                token
            ))
        })?;
        if key.trim().is_empty() {
            return Err(ControlError::Internal(format!(
                "Ignoring invalid configuration option {}: bad format (expected key=value)",
                token
            )));
        }
        set_query_option(key.trim(), value.trim(), options)?;
    }
    Ok(())
}

fn render_bool(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

/// Render every known option as a string. Panics (in tests) if a known key
/// has no render arm, which is exactly the point.
pub fn options_to_map(options: &QueryOptions) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for &key in KNOWN_OPTION_KEYS {
        let value = match key {
            "ABORT_ON_ERROR" => render_bool(options.abort_on_error),
            "MAX_ERRORS" => options.max_errors.to_string(),
            "DISABLE_CODEGEN" => render_bool(options.disable_codegen),
            "BATCH_SIZE" => options.batch_size.to_string(),
            "MEM_LIMIT" => options.mem_limit.to_string(),
            "NUM_NODES" => options.num_nodes.to_string(),
            "MAX_SCAN_RANGE_LENGTH" => options.max_scan_range_length.to_string(),
            "MAX_IO_BUFFERS" => options.max_io_buffers.to_string(),
            "NUM_SCANNER_THREADS" => options.num_scanner_threads.to_string(),
            "ALLOW_UNSUPPORTED_FORMATS" => render_bool(options.allow_unsupported_formats),
            "DEFAULT_ORDER_BY_LIMIT" => options.default_order_by_limit.to_string(),
            "DEBUG_ACTION" => options.debug_action.clone(),
            "COMPRESSION_CODEC" => options.compression_codec.as_str().to_string(),
            "ABORT_ON_DEFAULT_LIMIT_EXCEEDED" => {
                render_bool(options.abort_on_default_limit_exceeded)
            }
            "HBASE_CACHING" => options.hbase_caching.to_string(),
            "HBASE_CACHE_BLOCKS" => render_bool(options.hbase_cache_blocks),
            "PARQUET_FILE_SIZE" => options.parquet_file_size.to_string(),
            "EXPLAIN_LEVEL" => options.explain_level.as_str().to_string(),
            "SYNC_DDL" => render_bool(options.sync_ddl),
            "REQUEST_POOL" => options.request_pool.clone(),
            "V_CPU_CORES" => options.v_cpu_cores.to_string(),
            "RESERVATION_REQUEST_TIMEOUT" => options.reservation_request_timeout.to_string(),
            "DISABLE_CACHED_READS" => render_bool(options.disable_cached_reads),
            "DISABLE_OUTERMOST_TOPN" => render_bool(options.disable_outermost_topn),
            "RM_INITIAL_MEM" => options.rm_initial_mem.to_string(),
            "QUERY_TIMEOUT_S" => options.query_timeout_s.to_string(),
            "MAX_BLOCK_MGR_MEMORY" => options.max_block_mgr_memory.to_string(),
            "STRICT_MODE" => render_bool(options.strict_mode),
            other => unreachable!("query option {} has no render implementation", other),
        };
        map.insert(key.to_string(), value);
    }
    map
}

/// The `(key, value)` list surfaced to clients as the session defaults,
/// plus the `support_start_over` pseudo-option fetch handlers expect.
pub fn default_config_variables(options: &QueryOptions) -> Vec<ConfigVariable> {
    let mut configs: Vec<ConfigVariable> = options_to_map(options)
        .into_iter()
        .map(|(key, value)| ConfigVariable { key, value })
        .collect();
    configs.push(ConfigVariable {
        key: "support_start_over".to_string(),
        value: "false".to_string(),
    });
    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_ok() {
        let mut opts = QueryOptions::default();
        parse_query_options("", &mut opts).unwrap();
        assert_eq!(opts, QueryOptions::default());
    }

    #[test]
    fn test_parse_basic_options() {
        let mut opts = QueryOptions::default();
        parse_query_options(
            "abort_on_error=true, max_errors=5 ,MEM_LIMIT=4g,EXPLAIN_LEVEL=verbose",
            &mut opts,
        )
        .unwrap();
        assert!(opts.abort_on_error);
        assert_eq!(opts.max_errors, 5);
        assert_eq!(opts.mem_limit, 4i64 << 30);
        assert_eq!(opts.explain_level, ExplainLevel::Verbose);
    }

    #[test]
    fn test_bool_accepts_one_and_true() {
        let mut opts = QueryOptions::default();
        set_query_option("SYNC_DDL", "1", &mut opts).unwrap();
        assert!(opts.sync_ddl);
        set_query_option("SYNC_DDL", "TRUE", &mut opts).unwrap();
        assert!(opts.sync_ddl);
        set_query_option("SYNC_DDL", "no", &mut opts).unwrap();
        assert!(!opts.sync_ddl);
    }

    #[test]
    fn test_unknown_key_fails() {
        let mut opts = QueryOptions::default();
        assert!(parse_query_options("NOT_AN_OPTION=1", &mut opts).is_err());
    }

    #[test]
    fn test_malformed_token_fails() {
        let mut opts = QueryOptions::default();
        assert!(parse_query_options("batch_size", &mut opts).is_err());
        assert!(parse_query_options("=5", &mut opts).is_err());
    }

    #[test]
    fn test_mem_options_reject_percent_and_negative() {
        let mut opts = QueryOptions::default();
        assert!(set_query_option("MEM_LIMIT", "50%", &mut opts).is_err());
        assert!(set_query_option("MEM_LIMIT", "-1g", &mut opts).is_err());
        assert!(set_query_option("PARQUET_FILE_SIZE", "10%", &mut opts).is_err());
    }

    #[test]
    fn test_compression_codec_values() {
        let mut opts = QueryOptions::default();
        for (value, codec) in [
            ("none", CompressionCodec::None),
            ("GZIP", CompressionCodec::Gzip),
            ("bzip2", CompressionCodec::Bzip2),
            ("default", CompressionCodec::Default),
            ("snappy", CompressionCodec::Snappy),
            ("snappy_blocked", CompressionCodec::SnappyBlocked),
        ] {
            set_query_option("COMPRESSION_CODEC", value, &mut opts).unwrap();
            assert_eq!(opts.compression_codec, codec);
        }
        // Empty value leaves the current codec alone.
        set_query_option("COMPRESSION_CODEC", "", &mut opts).unwrap();
        assert_eq!(opts.compression_codec, CompressionCodec::SnappyBlocked);
        assert!(set_query_option("COMPRESSION_CODEC", "lz77", &mut opts).is_err());
    }

    #[test]
    fn test_explain_level_numeric_aliases() {
        let mut opts = QueryOptions::default();
        set_query_option("EXPLAIN_LEVEL", "0", &mut opts).unwrap();
        assert_eq!(opts.explain_level, ExplainLevel::Minimal);
        set_query_option("EXPLAIN_LEVEL", "3", &mut opts).unwrap();
        assert_eq!(opts.explain_level, ExplainLevel::Verbose);
        assert!(set_query_option("EXPLAIN_LEVEL", "chatty", &mut opts).is_err());
    }

    #[test]
    fn test_render_covers_every_known_key() {
        let map = options_to_map(&QueryOptions::default());
        for &key in KNOWN_OPTION_KEYS {
            assert!(map.contains_key(key), "no rendered value for {}", key);
        }
        assert_eq!(map.len(), KNOWN_OPTION_KEYS.len());
    }

    #[test]
    fn test_round_trip_through_render() {
        let mut opts = QueryOptions::default();
        parse_query_options(
            "abort_on_error=1,batch_size=2048,mem_limit=1048576,compression_codec=snappy,\
             explain_level=extended,query_timeout_s=30,request_pool=etl,strict_mode=true",
            &mut opts,
        )
        .unwrap();

        let rendered = options_to_map(&opts)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let mut reparsed = QueryOptions::default();
        parse_query_options(&rendered, &mut reparsed).unwrap();
        assert_eq!(reparsed, opts);
    }

    #[test]
    fn test_default_config_variables_include_start_over() {
        let configs = default_config_variables(&QueryOptions::default());
        assert!(configs
            .iter()
            .any(|c| c.key == "support_start_over" && c.value == "false"));
        assert_eq!(configs.len(), KNOWN_OPTION_KEYS.len() + 1);
    }
}
