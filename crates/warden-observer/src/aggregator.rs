use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::thread;
use warden_core_domain::{DockerPart, HistoryEntry, LinuxPart, NginxPart, PostgresPart, Snapshot};
use warden_ssh::{RemoteTarget, SshClient};
use warden_storage::SnapshotHistory;

use crate::{capture_docker, capture_linux, capture_nginx, capture_postgres};
use crate::{NginxConfig, PostgresConfig};

/// Fans one capture out to the four parsers on scoped threads. A parser that
/// panics only poisons its own part.
pub struct SnapshotAggregator<C> {
    client: C,
    postgres: PostgresConfig,
    nginx: NginxConfig,
    history: Arc<SnapshotHistory>,
}

impl<C> SnapshotAggregator<C>
where
    C: SshClient + Sync,
{
    pub fn new(client: C, history: Arc<SnapshotHistory>) -> Self {
        Self {
            client,
            postgres: PostgresConfig::default(),
            nginx: NginxConfig::default(),
            history,
        }
    }

    pub fn with_postgres(mut self, config: PostgresConfig) -> Self {
        self.postgres = config;
        self
    }

    pub fn with_nginx(mut self, config: NginxConfig) -> Self {
        self.nginx = config;
        self
    }

    pub fn history(&self) -> &Arc<SnapshotHistory> {
        &self.history
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn capture(&self, target: &RemoteTarget) -> Snapshot {
        let client = &self.client;
        let (linux, docker, postgres, nginx) = thread::scope(|scope| {
            let linux = scope.spawn(|| capture_linux(client, target));
            let docker = scope.spawn(|| capture_docker(client, target));
            let postgres = scope.spawn(|| capture_postgres(client, target, &self.postgres));
            let nginx = scope.spawn(|| capture_nginx(client, target, &self.nginx));
            (
                linux.join().unwrap_or_else(|panic| LinuxPart {
                    error: Some(parser_failure("linux", panic)),
                    ..LinuxPart::default()
                }),
                docker.join().unwrap_or_else(|panic| DockerPart {
                    error: Some(parser_failure("docker", panic)),
                    ..DockerPart::default()
                }),
                postgres.join().unwrap_or_else(|panic| PostgresPart {
                    error: Some(parser_failure("postgres", panic)),
                    ..PostgresPart::default()
                }),
                nginx.join().unwrap_or_else(|panic| NginxPart {
                    error: Some(parser_failure("nginx", panic)),
                    ..NginxPart::default()
                }),
            )
        });

        Snapshot {
            timestamp: Utc::now(),
            linux,
            docker,
            postgres,
            nginx,
        }
    }

    /// Captures and appends the result to the shared history under `key`.
    pub fn capture_and_record(&self, target: &RemoteTarget, key: Option<String>) -> HistoryEntry {
        let snapshot = self.capture(target);
        let entry = self.history.record(key, snapshot);
        tracing::info!(
            server = entry.target.as_deref().unwrap_or("default"),
            history_len = self.history.len(),
            "snapshot recorded"
        );
        entry
    }
}

fn parser_failure(parser: &str, panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(parser, %detail, "snapshot parser panicked");
    format!("{parser} snapshot failed unexpectedly: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{target, MockSshClient, DF_SAMPLE};
    use warden_ssh::CommandOutcome;

    struct PanickyDocker {
        inner: MockSshClient,
    }

    impl SshClient for PanickyDocker {
        fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome {
            if command.starts_with("docker") {
                panic!("docker parser exploded");
            }
            self.inner.execute(target, command)
        }
    }

    #[test]
    fn assembles_all_parts() {
        let client = MockSshClient::new()
            .on("df -h", 0, DF_SAMPLE)
            .on("docker ps", 0, "")
            .on("systemctl is-active", 0, "active");
        let aggregator = SnapshotAggregator::new(client, Arc::new(SnapshotHistory::new()));
        let snapshot = aggregator.capture(&target());

        assert_eq!(snapshot.linux.disks.len(), 5);
        assert_eq!(snapshot.docker.error, None);
        assert_eq!(snapshot.postgres, PostgresPart::default());
        assert!(snapshot.nginx.running);
        assert!(aggregator.history().is_empty());
    }

    #[test]
    fn panicking_parser_is_isolated() {
        let client = PanickyDocker {
            inner: MockSshClient::new().on("df -h", 0, DF_SAMPLE),
        };
        let aggregator = SnapshotAggregator::new(client, Arc::new(SnapshotHistory::new()));
        let snapshot = aggregator.capture(&target());

        let error = snapshot.docker.error.expect("docker error");
        assert!(error.starts_with("docker snapshot failed unexpectedly"));
        assert!(error.contains("docker parser exploded"));
        assert_eq!(snapshot.linux.error, None);
        assert_eq!(snapshot.linux.disks.len(), 5);
    }

    #[test]
    fn capture_and_record_appends_history() {
        let history = Arc::new(SnapshotHistory::new());
        let aggregator = SnapshotAggregator::new(MockSshClient::new(), Arc::clone(&history))
            .with_postgres(PostgresConfig {
                enabled: true,
                ..PostgresConfig::default()
            });
        let entry = aggregator.capture_and_record(&target(), Some("web1".to_string()));

        assert_eq!(entry.target.as_deref(), Some("web1"));
        assert!(entry.snapshot.postgres.error.is_some());
        assert_eq!(history.len(), 1);
        assert_eq!(history.recent(Some("web1"), 10).len(), 1);
        assert!(history.recent(Some("web2"), 10).is_empty());
    }
}
