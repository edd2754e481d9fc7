use std::collections::BTreeMap;
use warden_core_domain::NginxPart;
use warden_ssh::{CommandOutcome, RemoteTarget, SshClient};

use crate::{successful_stdout, NginxConfig, MAX_LOG_LIMIT};

pub const STATUS_COMMAND: &str = "if command -v systemctl >/dev/null 2>&1; then \
systemctl is-active nginx 2>/dev/null || echo unknown; \
elif command -v service >/dev/null 2>&1; then \
service nginx status >/dev/null 2>&1 && echo active || echo inactive; \
else \
pgrep -x nginx >/dev/null 2>&1 && echo active || echo inactive; \
fi";

pub const LOCAL_HTTP_COMMAND: &str = "(curl -s -o /dev/null -w \"%{http_code}\" http://127.0.0.1/ 2>/dev/null \
|| wget -q --server-response -O /dev/null http://127.0.0.1/ 2>&1 | awk '/^  HTTP\\//{print $2}' | tail -n1 \
|| echo 000) | head -n1";

const CODE_TAIL_LINES: usize = 2000;
const FILTER_TAIL_LINES: usize = 5000;

/// Service status, local HTTP probe, response-code tally and the focused
/// log view. The part error is set only when none of the four commands
/// reached the host.
pub fn capture_nginx<C: SshClient + ?Sized>(
    client: &C,
    target: &RemoteTarget,
    config: &NginxConfig,
) -> NginxPart {
    let status = client.execute(target, STATUS_COMMAND);
    let http = client.execute(target, LOCAL_HTTP_COMMAND);
    let codes = client.execute(target, &response_codes_command(&config.access_log_dir));
    let lines = client.execute(
        target,
        &filtered_log_command(
            &config.access_log_dir,
            &config.log_keyword,
            bounded_limit(config.log_limit),
        ),
    );

    let mut part = NginxPart::default();
    if [&status, &http, &codes, &lines]
        .iter()
        .all(|o| o.is_transport_failure())
    {
        tracing::warn!(host = %target.host, "nginx check unreachable");
        part.error =
            Some("Nginx check unavailable (SSH not configured or connection failed).".to_string());
        return part;
    }

    if let Some(out) = reached(&status) {
        let state = first_line(out).unwrap_or("unknown").to_string();
        part.running = state.eq_ignore_ascii_case("active");
        part.service_status = Some(state);
    }
    if let Some(code) = reached(&http).and_then(first_line) {
        part.local_http_code = Some(code.to_string());
    }
    if let Some(out) = reached(&codes) {
        part.response_code_counts = parse_code_counts(out);
    }
    if let Some(out) = reached(&lines) {
        part.recent_log_lines = parse_log_lines(out);
    }
    if part.service_status.is_none() {
        part.service_status = Some("unknown".to_string());
    }
    part
}

/// Most recent access-log lines containing `keyword` (case-insensitive).
/// `limit` is clamped to 1..=500.
pub fn capture_filtered_log_lines<C: SshClient + ?Sized>(
    client: &C,
    target: &RemoteTarget,
    config: &NginxConfig,
    keyword: &str,
    limit: usize,
) -> Vec<String> {
    let command = filtered_log_command(&config.access_log_dir, keyword, bounded_limit(limit));
    let outcome = client.execute(target, &command);
    successful_stdout(&outcome)
        .map(parse_log_lines)
        .unwrap_or_default()
}

pub fn bounded_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LOG_LIMIT)
}

/// Tallies the status column of the last 2000 access-log lines, reading the
/// rotated log when the current one is missing.
pub fn response_codes_command(log_dir: &str) -> String {
    with_access_log(log_dir, |log| {
        format!(
            "tail -n {CODE_TAIL_LINES} {log} | awk '{{c[$9]++}} END {{for (k in c) print k\"=\"c[k]}}'"
        )
    })
}

pub fn filtered_log_command(log_dir: &str, keyword: &str, limit: usize) -> String {
    let keyword = shell_words::quote(keyword);
    with_access_log(log_dir, |log| {
        format!("tail -n {FILTER_TAIL_LINES} {log} | grep -i -F -- {keyword} | tail -n {limit}")
    })
}

fn with_access_log(log_dir: &str, body: impl Fn(&str) -> String) -> String {
    let dir = log_dir.trim_end_matches('/');
    let current = shell_words::quote(&format!("{dir}/access.log")).into_owned();
    let rotated = shell_words::quote(&format!("{dir}/access.log.1")).into_owned();
    format!(
        "if [ -r {current} ]; then {}; elif [ -r {rotated} ]; then {}; else echo ''; fi",
        body(&current),
        body(&rotated)
    )
}

/// `code=count` lines; keys that are not three digits are dropped.
pub fn parse_code_counts(output: &str) -> BTreeMap<String, u64> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (code, count) = line.split_once('=')?;
            let code = code.trim();
            if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let count = count.trim().parse::<u64>().ok()?;
            Some((code.to_string(), count))
        })
        .collect()
}

pub fn parse_log_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn reached(outcome: &CommandOutcome) -> Option<&str> {
    (!outcome.is_transport_failure()).then_some(outcome.stdout.as_str())
}

fn first_line(output: &str) -> Option<&str> {
    output
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{target, unreachable, MockSshClient};

    #[test]
    fn code_counts_keep_three_digit_keys() {
        let counts = parse_code_counts("200=1520\n404=12\n-=3\n\"-\"=1\n5xx=2\n301=x\n499=\n");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.get("200"), Some(&1520));
        assert_eq!(counts.get("404"), Some(&12));
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(bounded_limit(0), 1);
        assert_eq!(bounded_limit(80), 80);
        assert_eq!(bounded_limit(10_000), 500);
    }

    #[test]
    fn log_commands_fall_back_to_rotated_file() {
        let command = filtered_log_command("/var/log/nginx/", "ussd", 80);
        assert!(command.starts_with("if [ -r /var/log/nginx/access.log ]; then tail -n 5000"));
        assert!(command.contains("elif [ -r /var/log/nginx/access.log.1 ]"));
        assert!(command.contains("grep -i -F -- ussd | tail -n 80"));

        let quoted = filtered_log_command("/srv/logs", "it's", 5);
        assert!(quoted.contains("-- 'it'\\''s'"));

        let codes = response_codes_command("/var/log/nginx");
        assert!(codes.contains("awk '{c[$9]++} END {for (k in c) print k\"=\"c[k]}'"));
    }

    #[test]
    fn capture_reads_all_four_probes() {
        let client = MockSshClient::new()
            .on("systemctl is-active", 0, "active\n")
            .on("http_code", 0, "200")
            .on("c[$9]++", 0, "200=90\n502=4\n")
            .on("grep -i", 0, "GET /ussd/a 200\n\nPOST /ussd/b 502\n");
        let part = capture_nginx(&client, &target(), &NginxConfig::default());

        assert_eq!(part.error, None);
        assert_eq!(part.service_status.as_deref(), Some("active"));
        assert!(part.running);
        assert_eq!(part.local_http_code.as_deref(), Some("200"));
        assert_eq!(part.response_code_counts.get("502"), Some(&4));
        assert_eq!(part.recent_log_lines.len(), 2);
    }

    #[test]
    fn inactive_or_empty_status() {
        let client = MockSshClient::new()
            .on("systemctl is-active", 3, "inactive\n")
            .otherwise(unreachable());
        let part = capture_nginx(&client, &target(), &NginxConfig::default());
        assert_eq!(part.error, None);
        assert_eq!(part.service_status.as_deref(), Some("inactive"));
        assert!(!part.running);
        assert_eq!(part.local_http_code, None);

        let blank = MockSshClient::new()
            .on("systemctl is-active", 0, "")
            .otherwise(unreachable());
        let part = capture_nginx(&blank, &target(), &NginxConfig::default());
        assert_eq!(part.service_status.as_deref(), Some("unknown"));
    }

    #[test]
    fn error_only_when_every_probe_unreachable() {
        let client = MockSshClient::new().otherwise(unreachable());
        let part = capture_nginx(&client, &target(), &NginxConfig::default());
        assert_eq!(
            part.error.as_deref(),
            Some("Nginx check unavailable (SSH not configured or connection failed).")
        );
        assert_eq!(part.service_status, None);
    }

    #[test]
    fn filtered_lines_use_clamped_limit() {
        let client = MockSshClient::new().on("grep -i", 0, "a\nb\n");
        let lines = capture_filtered_log_lines(
            &client,
            &target(),
            &NginxConfig::default(),
            "USSD",
            9_999,
        );
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
        assert!(client.commands()[0].contains("tail -n 500;"));

        let failing = MockSshClient::new().on("grep -i", 2, "partial");
        assert!(capture_filtered_log_lines(
            &failing,
            &target(),
            &NginxConfig::default(),
            "x",
            5
        )
        .is_empty());
    }
}
