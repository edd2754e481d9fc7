use std::collections::BTreeMap;
use std::sync::Arc;

use warden_core_domain::{Anomaly, HistoryEntry};
use warden_observer::{
    analytics, anomaly, capture_filtered_log_lines, DiskPoint, MemoryPoint, NginxConfig,
    SnapshotAggregator,
};
use warden_ssh::SshClient;
use warden_storage::SnapshotHistory;

use crate::credentials::{CredentialResolver, ResolveError, TargetIdentity};

/// Captures snapshots for resolved identities and answers history queries.
pub struct SnapshotService<C> {
    aggregator: SnapshotAggregator<C>,
    resolver: CredentialResolver,
    nginx: NginxConfig,
}

impl<C: SshClient + Sync> SnapshotService<C> {
    pub fn new(
        aggregator: SnapshotAggregator<C>,
        resolver: CredentialResolver,
        nginx: NginxConfig,
    ) -> Self {
        Self {
            aggregator,
            resolver,
            nginx,
        }
    }

    pub fn history(&self) -> &Arc<SnapshotHistory> {
        self.aggregator.history()
    }

    /// Resolves the target, captures all four parts and records the result.
    /// Nothing is recorded when the target cannot be resolved.
    pub fn capture(&self, identity: &TargetIdentity) -> Result<HistoryEntry, ResolveError> {
        let target = self.resolver.resolve(identity)?;
        Ok(self
            .aggregator
            .capture_and_record(&target, identity.history_key()))
    }

    /// `None` reads across every target.
    pub fn anomalies(&self, identity: Option<&TargetIdentity>, last_n: usize) -> Vec<Anomaly> {
        let key = identity.and_then(TargetIdentity::history_key);
        anomaly::detect(self.history(), key.as_deref(), last_n)
    }

    pub fn recent(&self, identity: Option<&TargetIdentity>, limit: usize) -> Vec<HistoryEntry> {
        let key = identity.and_then(TargetIdentity::history_key);
        self.history().recent(key.as_deref(), limit)
    }

    pub fn disk_series(
        &self,
        identity: Option<&TargetIdentity>,
        limit: usize,
    ) -> BTreeMap<String, Vec<DiskPoint>> {
        analytics::disk_series(&self.recent(identity, limit))
    }

    pub fn memory_series(
        &self,
        identity: Option<&TargetIdentity>,
        limit: usize,
    ) -> Vec<MemoryPoint> {
        analytics::memory_series(&self.recent(identity, limit))
    }

    pub fn filtered_log_lines(
        &self,
        identity: &TargetIdentity,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<String>, ResolveError> {
        let target = self.resolver.resolve(identity)?;
        Ok(capture_filtered_log_lines(
            self.aggregator.client(),
            &target,
            &self.nginx,
            keyword,
            limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::resolver_with;
    use warden_core_domain::AnomalyKind;
    use warden_ssh::{CommandOutcome, RemoteTarget};

    /// Serves df listings whose root usage follows a queue of percentages.
    struct GrowingDisk {
        percents: std::sync::Mutex<Vec<u32>>,
    }

    impl SshClient for GrowingDisk {
        fn execute(&self, _target: &RemoteTarget, command: &str) -> CommandOutcome {
            if command == "df -h" {
                let mut percents = self.percents.lock().expect("percents lock");
                let pct = if percents.len() > 1 {
                    percents.remove(0)
                } else {
                    percents[0]
                };
                return CommandOutcome::new(
                    0,
                    format!("Filesystem Size Used Avail Use% Mounted on\n/dev/sda1 98G 1G 1G {pct}% /\n"),
                    "",
                );
            }
            if command.contains("grep -i") {
                return CommandOutcome::new(0, "GET /ussd 200\n", "");
            }
            CommandOutcome::new(127, "", "not found")
        }
    }

    fn service(percents: Vec<u32>) -> SnapshotService<GrowingDisk> {
        let client = GrowingDisk {
            percents: std::sync::Mutex::new(percents),
        };
        SnapshotService::new(
            SnapshotAggregator::new(client, Arc::new(SnapshotHistory::new())),
            resolver_with(Vec::new()),
            NginxConfig::default(),
        )
    }

    #[test]
    fn captures_feed_anomaly_detection() {
        let service = service(vec![80, 92]);
        service.capture(&TargetIdentity::Default).expect("capture");
        service.capture(&TargetIdentity::Default).expect("capture");

        let anomalies = service.anomalies(None, 20);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::DiskGrowth);
        assert_eq!(anomalies[0].message, "Disk / is 92% full");

        let series = service.disk_series(None, 50);
        let points: Vec<u32> = series["/"].iter().map(|p| p.use_percent).collect();
        assert_eq!(points, vec![80, 92]);
        assert_eq!(service.memory_series(None, 50).len(), 2);
    }

    #[test]
    fn unresolvable_target_records_nothing() {
        let service = service(vec![50]);
        let err = service
            .capture(&TargetIdentity::Stored("ghost".to_string()))
            .expect_err("unknown server");
        assert!(matches!(err, ResolveError::UnknownServer(_)));
        assert!(service.history().is_empty());
    }

    #[test]
    fn stored_history_is_keyed_by_identity() {
        let service = service(vec![50]);
        service.capture(&TargetIdentity::Default).expect("capture");
        let explicit = TargetIdentity::Explicit(RemoteTarget::new(
            "10.0.0.5",
            "ops",
            warden_ssh::AuthMaterial::SystemDefault,
        ));
        service.capture(&explicit).expect("capture");

        assert_eq!(service.recent(None, 10).len(), 2);
        assert_eq!(service.recent(Some(&explicit), 10).len(), 1);
    }

    #[test]
    fn filtered_lines_go_through_resolver() {
        let service = service(vec![50]);
        let lines = service
            .filtered_log_lines(&TargetIdentity::Default, "ussd", 10)
            .expect("lines");
        assert_eq!(lines, vec!["GET /ussd 200".to_string()]);
    }
}
