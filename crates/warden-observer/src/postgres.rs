use regex::Regex;
use std::sync::OnceLock;
use warden_core_domain::{DatabaseSize, PostgresPart};
use warden_ssh::{RemoteTarget, SshClient};

use crate::{cached_regex, successful_stdout, PostgresConfig};

pub const CONNECTIONS_SQL: &str =
    "SELECT count(*) FROM pg_stat_activity WHERE datname = current_database();";
pub const SIZES_SQL: &str = "SELECT datname, pg_size_pretty(pg_database_size(datname)) FROM pg_database ORDER BY pg_database_size(datname) DESC;";
pub const LOCKS_SQL: &str = "SELECT count(*), mode FROM pg_locks GROUP BY mode;";
pub const SLOW_QUERIES_SQL: &str = "SELECT count(*) FROM pg_stat_activity WHERE state = 'active' AND query_start < now() - interval '5 seconds';";

static FIRST_INTEGER: OnceLock<Option<Regex>> = OnceLock::new();

/// Runs four independent `psql` queries on the target. A disabled config
/// yields an empty part without error; only a failed connection count sets
/// the part error.
pub fn capture_postgres<C: SshClient + ?Sized>(
    client: &C,
    target: &RemoteTarget,
    config: &PostgresConfig,
) -> PostgresPart {
    let mut part = PostgresPart::default();
    if !config.enabled {
        return part;
    }

    let connections = client.execute(target, &psql_command(config, CONNECTIONS_SQL));
    if let Some(out) = successful_stdout(&connections) {
        part.active_connections = first_integer(out);
    }

    let sizes = client.execute(target, &psql_command(config, SIZES_SQL));
    if let Some(out) = successful_stdout(&sizes) {
        part.databases = parse_database_sizes(out);
    }

    let locks = client.execute(target, &psql_command(config, LOCKS_SQL));
    if let Some(out) = successful_stdout(&locks) {
        let summary = out.trim();
        if !summary.is_empty() {
            part.locks_summary = Some(summary.to_string());
        }
    }

    let slow = client.execute(target, &psql_command(config, SLOW_QUERIES_SQL));
    if let Some(count) = successful_stdout(&slow).and_then(first_integer) {
        part.slow_queries_summary = Some(format!("{count} queries running longer than 5s"));
    }

    if !connections.success() {
        tracing::warn!(
            host = %target.host,
            exit_code = connections.exit_code,
            "postgres connection count failed"
        );
        let detail = connections.stderr.trim();
        part.error = Some(if detail.is_empty() {
            "Postgres unreachable or psql not available.".to_string()
        } else {
            format!("Postgres unreachable or psql not available: {detail}")
        });
    }
    part
}

/// Tuples-only, unaligned `psql` invocation with stderr discarded.
pub fn psql_command(config: &PostgresConfig, sql: &str) -> String {
    let port = config.port.to_string();
    let argv = [
        "psql",
        "-h",
        config.host.as_str(),
        "-p",
        port.as_str(),
        "-U",
        config.user.as_str(),
        "-d",
        config.database.as_str(),
        "-t",
        "-A",
        "-c",
        sql,
    ];
    format!("{} 2>/dev/null", shell_words::join(argv))
}

/// First integer-looking token, ignoring surrounding whitespace and noise.
pub fn first_integer(output: &str) -> Option<u32> {
    cached_regex(&FIRST_INTEGER, r"\d+")?
        .find(output)
        .and_then(|m| m.as_str().parse::<u32>().ok())
}

/// Parses `name|size` rows from unaligned output, preserving query order.
pub fn parse_database_sizes(output: &str) -> Vec<DatabaseSize> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split('|');
            let name = parts.next()?.trim();
            let size = parts.next()?.trim();
            Some(DatabaseSize {
                database_name: name.to_string(),
                size_pretty: size.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{target, MockSshClient};
    use warden_ssh::CommandOutcome;

    fn enabled() -> PostgresConfig {
        PostgresConfig {
            enabled: true,
            database: "app".to_string(),
            ..PostgresConfig::default()
        }
    }

    #[test]
    fn disabled_config_issues_no_commands() {
        let client = MockSshClient::new();
        let part = capture_postgres(&client, &target(), &PostgresConfig::default());
        assert_eq!(part, PostgresPart::default());
        assert!(client.commands().is_empty());
    }

    #[test]
    fn psql_command_quotes_sql() {
        let command = psql_command(&enabled(), SLOW_QUERIES_SQL);
        assert!(command.starts_with("psql -h localhost -p 5432 -U postgres -d app -t -A -c "));
        assert!(command.ends_with(" 2>/dev/null"));
        let argv = shell_words::split(command.trim_end_matches(" 2>/dev/null")).expect("split");
        assert_eq!(argv.last().map(String::as_str), Some(SLOW_QUERIES_SQL));
    }

    #[test]
    fn first_integer_tolerates_noise() {
        assert_eq!(first_integer("   12\n"), Some(12));
        assert_eq!(first_integer(" count \n-------\n 7\n(1 row)"), Some(7));
        assert_eq!(first_integer("none"), None);
    }

    #[test]
    fn sizes_keep_order_and_skip_bad_rows() {
        let sizes = parse_database_sizes("app|812 MB\n\nbroken\npostgres|7453 kB\n");
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].database_name, "app");
        assert_eq!(sizes[0].size_pretty, "812 MB");
        assert_eq!(sizes[1].database_name, "postgres");
    }

    #[test]
    fn capture_collects_all_queries() {
        let client = MockSshClient::new()
            .on("current_database", 0, "14\n")
            .on("pg_database_size", 0, "app|812 MB\npostgres|7453 kB\n")
            .on("pg_locks", 0, "3|AccessShareLock\n1|ExclusiveLock\n")
            .on("5 seconds", 0, "2\n");
        let part = capture_postgres(&client, &target(), &enabled());

        assert_eq!(part.error, None);
        assert_eq!(part.active_connections, Some(14));
        assert_eq!(part.databases.len(), 2);
        assert_eq!(
            part.locks_summary.as_deref(),
            Some("3|AccessShareLock\n1|ExclusiveLock")
        );
        assert_eq!(
            part.slow_queries_summary.as_deref(),
            Some("2 queries running longer than 5s")
        );
    }

    #[test]
    fn only_connection_failure_sets_error() {
        let sizes_down = MockSshClient::new()
            .on("current_database", 0, "3")
            .otherwise(CommandOutcome::new(2, "", "psql: error"));
        let part = capture_postgres(&sizes_down, &target(), &enabled());
        assert_eq!(part.error, None);
        assert_eq!(part.active_connections, Some(3));
        assert!(part.databases.is_empty());
        assert_eq!(part.locks_summary, None);

        let conn_down = MockSshClient::new()
            .on_outcome(
                "current_database",
                CommandOutcome::new(2, "", "psql: could not connect to server\n"),
            )
            .on("pg_database_size", 0, "app|1 MB\n");
        let part = capture_postgres(&conn_down, &target(), &enabled());
        assert_eq!(
            part.error.as_deref(),
            Some("Postgres unreachable or psql not available: psql: could not connect to server")
        );
        assert_eq!(part.databases.len(), 1);
    }

    #[test]
    fn silent_connection_failure_has_no_trailing_separator() {
        let client = MockSshClient::new().otherwise(CommandOutcome::new(2, "", ""));
        let part = capture_postgres(&client, &target(), &enabled());
        assert_eq!(
            part.error.as_deref(),
            Some("Postgres unreachable or psql not available.")
        );
    }
}
