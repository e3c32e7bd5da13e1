use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

/// Per-organization engine settings. Passed to every `Engine` explicitly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_resources: usize,
    /// Bookings + unavailabilities on one resource.
    pub max_records_per_resource: usize,
    pub max_name_len: usize,
    pub max_description_len: usize,
    pub max_status_len: usize,
    pub max_metadata_entries: usize,
    pub max_metadata_value_len: usize,
    pub max_slots_per_resource: usize,
    pub min_valid_timestamp_ms: Ms,
    pub max_valid_timestamp_ms: Ms,
    pub max_span_duration_ms: Ms,
    pub max_query_window_ms: Ms,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Upper bound on how long a transaction may wait for locks before commit.
    pub txn_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        const DAY_MS: Ms = 86_400_000;
        Self {
            max_resources: 10_000,
            max_records_per_resource: 100_000,
            max_name_len: 256,
            max_description_len: 4096,
            max_status_len: 64,
            max_metadata_entries: 32,
            max_metadata_value_len: 1024,
            max_slots_per_resource: 64,
            min_valid_timestamp_ms: 0,
            // 2200-01-01T00:00:00Z
            max_valid_timestamp_ms: 7_258_118_400_000,
            max_span_duration_ms: 366 * DAY_MS,
            max_query_window_ms: 366 * DAY_MS,
            default_page_size: 10,
            max_page_size: 1000,
            txn_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide settings, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_tenants: usize,
    pub max_tenant_name_len: usize,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "bookd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            max_tenants: 1024,
            max_tenant_name_len: 128,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let engine_defaults = defaults.engine.clone();

        Self {
            bind: lookup("BOOKD_BIND").unwrap_or(defaults.bind),
            port: parsed_or(&lookup, "BOOKD_PORT", defaults.port),
            data_dir: lookup("BOOKD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("BOOKD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed_or(&lookup, "BOOKD_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parsed_or(&lookup, "BOOKD_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: lookup("BOOKD_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("BOOKD_TLS_CERT"),
            tls_key: lookup("BOOKD_TLS_KEY"),
            max_tenants: parsed_or(&lookup, "BOOKD_MAX_TENANTS", defaults.max_tenants),
            max_tenant_name_len: defaults.max_tenant_name_len,
            engine: EngineConfig {
                txn_timeout: lookup("BOOKD_TXN_TIMEOUT_MS")
                    .and_then(|s| s.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(engine_defaults.txn_timeout),
                default_page_size: parsed_or(
                    &lookup,
                    "BOOKD_DEFAULT_PAGE_SIZE",
                    engine_defaults.default_page_size,
                ),
                ..engine_defaults
            },
        }
    }
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}
