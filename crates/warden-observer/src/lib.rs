pub mod aggregator;
pub mod analytics;
pub mod anomaly;
pub mod docker;
pub mod linux;
pub mod nginx;
pub mod postgres;

pub use aggregator::SnapshotAggregator;
pub use analytics::{disk_series, memory_series, DiskPoint, MemoryPoint};
pub use anomaly::{detect, detect_between};
pub use docker::capture_docker;
pub use linux::capture_linux;
pub use nginx::{capture_filtered_log_lines, capture_nginx};
pub use postgres::capture_postgres;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use warden_ssh::CommandOutcome;

/// Remote `psql` connection settings used by the Postgres parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            database: "postgres".to_string(),
        }
    }
}

pub const DEFAULT_LOG_KEYWORD: &str = "ussd";
pub const DEFAULT_LOG_LIMIT: usize = 80;
pub const MAX_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NginxConfig {
    pub access_log_dir: String,
    pub log_keyword: String,
    pub log_limit: usize,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            access_log_dir: "/var/log/nginx".to_string(),
            log_keyword: DEFAULT_LOG_KEYWORD.to_string(),
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }
}

/// Compiles a fixed pattern once. A pattern that fails to compile is
/// logged and treated as never matching.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            tracing::error!(pattern, error = %err, "invalid parser pattern");
            None
        }
    })
    .as_ref()
}

/// Stdout of a command that exited 0, otherwise nothing.
pub(crate) fn successful_stdout(outcome: &CommandOutcome) -> Option<&str> {
    outcome.success().then_some(outcome.stdout.as_str())
}
