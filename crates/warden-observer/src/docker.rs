use std::collections::HashMap;
use warden_core_domain::{ContainerInfo, DockerPart};
use warden_ssh::{RemoteTarget, SshClient};

use crate::successful_stdout;

pub const LIST_COMMAND: &str = "docker ps -a --format \"{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Status}}\" 2>/dev/null";
pub const STATS_COMMAND: &str = "docker stats --no-stream --format \"{{.ID}}\t{{.CPUPerc}}\t{{.MemUsage}}\t{{.MemPerc}}\" 2>/dev/null";

const SHORT_ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStats {
    pub cpu_percent: String,
    pub mem_usage: String,
    pub mem_percent: String,
}

/// Lists all containers, then merges live stats and restart counts. Stats and
/// inspect failures leave those fields unset; only a failed listing sets the
/// part error.
pub fn capture_docker<C: SshClient + ?Sized>(client: &C, target: &RemoteTarget) -> DockerPart {
    let listing = client.execute(target, LIST_COMMAND);
    let Some(stdout) = successful_stdout(&listing) else {
        tracing::warn!(
            host = %target.host,
            exit_code = listing.exit_code,
            "docker listing failed"
        );
        let detail = listing.stderr.trim();
        let error = if detail.is_empty() {
            "Docker not available or SSH failed.".to_string()
        } else {
            format!("Docker not available or SSH failed: {detail}")
        };
        return DockerPart {
            containers: Vec::new(),
            error: Some(error),
        };
    };

    let mut containers = parse_container_list(stdout);
    if containers.is_empty() {
        return DockerPart::default();
    }

    let stats = client.execute(target, STATS_COMMAND);
    match successful_stdout(&stats) {
        Some(out) => merge_stats(&mut containers, &parse_stats(out)),
        None => tracing::debug!(exit_code = stats.exit_code, "docker stats unavailable"),
    }

    let inspect = client.execute(target, &inspect_command(&containers));
    match successful_stdout(&inspect) {
        Some(out) => merge_restart_counts(&mut containers, &parse_restart_counts(out)),
        None => tracing::debug!(exit_code = inspect.exit_code, "docker inspect unavailable"),
    }

    DockerPart {
        containers,
        error: None,
    }
}

/// One batched inspect call across every listed container.
pub fn inspect_command(containers: &[ContainerInfo]) -> String {
    let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
    format!(
        "docker inspect {} --format '{{{{.Id}}}} {{{{.RestartCount}}}}' 2>/dev/null",
        shell_words::join(ids)
    )
}

/// Parses tab-separated `docker ps` rows; rows with fewer than five fields
/// are skipped.
pub fn parse_container_list(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 5 {
                return None;
            }
            let status = fields[4].trim().to_string();
            Some(ContainerInfo {
                id: fields[0].trim().to_string(),
                name: fields[1].trim().to_string(),
                image: fields[2].trim().to_string(),
                state: fields[3].trim().to_string(),
                uptime_label: uptime_label(&status),
                status,
                ..ContainerInfo::default()
            })
        })
        .collect()
}

/// `"Up 3 hours (healthy)"` becomes `"Up 3 hours"`; non-running statuses
/// have no label.
pub fn uptime_label(status: &str) -> Option<String> {
    let trimmed = status.trim();
    if !trimmed.to_lowercase().starts_with("up ") {
        return None;
    }
    let label = match trimmed.find('(') {
        Some(idx) if idx > 0 => trimmed[..idx].trim(),
        _ => trimmed,
    };
    Some(label.to_string())
}

/// Stats rows keyed by 12-character short id.
pub fn parse_stats(output: &str) -> HashMap<String, ContainerStats> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 4 {
                return None;
            }
            let id = short_id(fields[0].trim());
            if id.is_empty() {
                return None;
            }
            Some((
                id.to_string(),
                ContainerStats {
                    cpu_percent: fields[1].trim().to_string(),
                    mem_usage: fields[2].trim().to_string(),
                    mem_percent: fields[3].trim().to_string(),
                },
            ))
        })
        .collect()
}

pub fn merge_stats(containers: &mut [ContainerInfo], stats: &HashMap<String, ContainerStats>) {
    for container in containers.iter_mut() {
        if let Some(row) = stats.get(short_id(&container.id)) {
            container.cpu_percent = Some(row.cpu_percent.clone());
            container.mem_usage = Some(row.mem_usage.clone());
            container.mem_percent = Some(row.mem_percent.clone());
        }
    }
}

/// Parses `<full id> <restart count>` lines. An unreadable count reads as 0.
pub fn parse_restart_counts(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (id, count) = line.rsplit_once(' ')?;
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            Some((id.to_string(), count.trim().parse::<u32>().unwrap_or(0)))
        })
        .collect()
}

/// Matches each inspected full id to the listed container whose id shares
/// the longest prefix with it.
pub fn merge_restart_counts(containers: &mut [ContainerInfo], counts: &[(String, u32)]) {
    for (full_id, count) in counts {
        let best = containers
            .iter()
            .enumerate()
            .filter(|(_, c)| ids_match(&c.id, full_id))
            .max_by_key(|(_, c)| c.id.len().min(full_id.len()))
            .map(|(idx, _)| idx);
        if let Some(idx) = best {
            containers[idx].restart_count = Some(*count);
        }
    }
}

fn ids_match(listed: &str, full: &str) -> bool {
    !listed.is_empty() && (full.starts_with(listed) || listed.starts_with(short_id(full)))
}

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{target, unreachable, MockSshClient};
    use warden_ssh::CommandOutcome;

    const LISTING: &str = "\
3f2a9c1b7d4e\tapi\tacme/api:1.4\trunning\tUp 3 hours (healthy)
9b8c7d6e5f4a\tworker\tacme/worker:1.4\trestarting\tRestarting (1) 5 seconds ago
a1b2c3d4e5f6\tbroken-row\tonly-three
";

    const STATS: &str = "\
3f2a9c1b7d4e\t1.25%\t120MiB / 7.7GiB\t1.52%
9b8c7d6e5f4a\t0.00%\t0B / 0B\t0.00%
";

    const INSPECT: &str = "\
3f2a9c1b7d4e00112233445566778899aabbccddeeff00112233445566778899 0
9b8c7d6e5f4a00112233445566778899aabbccddeeff00112233445566778899 7
";

    #[test]
    fn parses_listing_and_uptime_labels() {
        let containers = parse_container_list(LISTING);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "api");
        assert_eq!(containers[0].uptime_label.as_deref(), Some("Up 3 hours"));
        assert_eq!(containers[1].state, "restarting");
        assert_eq!(containers[1].uptime_label, None);
    }

    #[test]
    fn uptime_label_rules() {
        assert_eq!(uptime_label("Up 2 days").as_deref(), Some("Up 2 days"));
        assert_eq!(uptime_label("up 5 minutes (Paused)").as_deref(), Some("up 5 minutes"));
        assert_eq!(uptime_label("Exited (0) 2 hours ago"), None);
        assert_eq!(uptime_label("Up"), None);
    }

    #[test]
    fn restart_counts_default_to_zero_on_garbage() {
        let counts = parse_restart_counts("abc notanumber\nsolo\ndef 3\n");
        assert_eq!(
            counts,
            vec![("abc".to_string(), 0), ("def".to_string(), 3)]
        );
    }

    #[test]
    fn restart_merge_prefers_longest_prefix() {
        let mut containers = vec![
            ContainerInfo {
                id: "3f2a".to_string(),
                ..ContainerInfo::default()
            },
            ContainerInfo {
                id: "3f2a9c1b7d4e".to_string(),
                ..ContainerInfo::default()
            },
        ];
        merge_restart_counts(
            &mut containers,
            &[("3f2a9c1b7d4e0011".to_string(), 5)],
        );
        assert_eq!(containers[0].restart_count, None);
        assert_eq!(containers[1].restart_count, Some(5));
    }

    #[test]
    fn capture_merges_all_three_queries() {
        let client = MockSshClient::new()
            .on("docker ps", 0, LISTING)
            .on("docker stats", 0, STATS)
            .on("docker inspect", 0, INSPECT);
        let part = capture_docker(&client, &target());

        assert_eq!(part.error, None);
        let api = &part.containers[0];
        assert_eq!(api.cpu_percent.as_deref(), Some("1.25%"));
        assert_eq!(api.mem_usage.as_deref(), Some("120MiB / 7.7GiB"));
        assert_eq!(api.restart_count, Some(0));
        assert_eq!(part.containers[1].restart_count, Some(7));

        let inspect = client
            .commands()
            .into_iter()
            .find(|c| c.starts_with("docker inspect"))
            .expect("inspect issued");
        assert!(inspect.contains("3f2a9c1b7d4e 9b8c7d6e5f4a"));
        assert!(inspect.contains("{{.Id}} {{.RestartCount}}"));
    }

    #[test]
    fn failed_side_queries_keep_listing() {
        let client = MockSshClient::new()
            .on("docker ps", 0, LISTING)
            .on_outcome("docker stats", unreachable())
            .on("docker inspect", 1, "");
        let part = capture_docker(&client, &target());

        assert_eq!(part.error, None);
        assert_eq!(part.containers.len(), 2);
        assert_eq!(part.containers[0].cpu_percent, None);
        assert_eq!(part.containers[0].restart_count, None);
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        let client = MockSshClient::new().on("docker ps", 0, "\n");
        let part = capture_docker(&client, &target());
        assert_eq!(part, DockerPart::default());
        assert_eq!(client.commands().len(), 1);
    }

    #[test]
    fn unavailable_docker_sets_part_error() {
        let client = MockSshClient::new()
            .on_outcome("docker ps", CommandOutcome::failure("timed out"));
        let part = capture_docker(&client, &target());
        assert!(part.containers.is_empty());
        assert_eq!(
            part.error.as_deref(),
            Some("Docker not available or SSH failed: timed out")
        );
    }
}
