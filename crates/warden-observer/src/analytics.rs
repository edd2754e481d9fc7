use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use warden_core_domain::HistoryEntry;

pub const DEFAULT_SERIES_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPoint {
    pub timestamp: DateTime<Utc>,
    pub use_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPoint {
    pub timestamp: DateTime<Utc>,
    pub used_mb: u64,
    pub total_mb: u64,
}

/// Per-mount use% over time, in history order. Unparseable percentages
/// plot as 0.
pub fn disk_series(entries: &[HistoryEntry]) -> BTreeMap<String, Vec<DiskPoint>> {
    let mut by_mount: BTreeMap<String, Vec<DiskPoint>> = BTreeMap::new();
    for entry in entries {
        for disk in &entry.snapshot.linux.disks {
            by_mount
                .entry(disk.mount_key().to_string())
                .or_default()
                .push(DiskPoint {
                    timestamp: entry.timestamp,
                    use_percent: disk.use_percent_value().unwrap_or(0),
                });
        }
    }
    by_mount
}

pub fn memory_series(entries: &[HistoryEntry]) -> Vec<MemoryPoint> {
    entries
        .iter()
        .map(|entry| MemoryPoint {
            timestamp: entry.timestamp,
            used_mb: entry.snapshot.linux.memory.used_mb,
            total_mb: entry.snapshot.linux.memory.total_mb,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux::{parse_df, parse_free};
    use crate::test_support::DF_SAMPLE;
    use warden_core_domain::Snapshot;
    use warden_storage::SnapshotHistory;

    fn snapshot_with(df: &str, free: &str) -> Snapshot {
        let mut snapshot = Snapshot {
            timestamp: Utc::now(),
            linux: Default::default(),
            docker: Default::default(),
            postgres: Default::default(),
            nginx: Default::default(),
        };
        snapshot.linux.disks = parse_df(df);
        snapshot.linux.memory = parse_free(free);
        snapshot
    }

    #[test]
    fn series_follow_history_order() {
        let history = SnapshotHistory::new();
        history.record(
            None,
            snapshot_with(
                "/dev/sda1 98G 50G 48G 51% /\n/dev/sdb1 200G 1G 199G bad% /data\n",
                "Mem: 8000 1000 7000 0 0 6900\n",
            ),
        );
        history.record(
            None,
            snapshot_with(DF_SAMPLE, "Mem: 8000 2500 5500 0 0 5400\n"),
        );
        let entries = history.recent(None, DEFAULT_SERIES_LIMIT);

        let disks = disk_series(&entries);
        let root: Vec<u32> = disks["/"].iter().map(|p| p.use_percent).collect();
        assert_eq!(root, vec![51, 92]);
        assert_eq!(disks["/data"].len(), 1);
        assert_eq!(disks["/data"][0].use_percent, 45);
        assert_eq!(disks["/dev"].len(), 1);

        let memory = memory_series(&entries);
        let used: Vec<u64> = memory.iter().map(|p| p.used_mb).collect();
        assert_eq!(used, vec![1000, 2500]);
        assert!(memory.iter().all(|p| p.total_mb == 8000));
    }
}
