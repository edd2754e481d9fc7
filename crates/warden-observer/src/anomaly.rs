use chrono::{DateTime, Utc};
use std::collections::HashMap;
use warden_core_domain::{Anomaly, AnomalyKind, DiskUsage, HistoryEntry, Severity, Snapshot};
use warden_storage::SnapshotHistory;

const DISK_FULL_PERCENT: u32 = 90;
const DISK_GROWTH_POINTS: u32 = 10;
const RESTART_LOOP_THRESHOLD: u32 = 3;
const MEMORY_GROWTH_RATIO: f64 = 0.05;

/// Compares the two most recent history entries for `target` (`None` reads
/// the global history) within the last `last_n`. Fewer than two entries
/// yield nothing.
pub fn detect(history: &SnapshotHistory, target: Option<&str>, last_n: usize) -> Vec<Anomaly> {
    let entries = history.recent(target, last_n);
    match entries.as_slice() {
        [.., previous, latest] => detect_between(previous, latest),
        _ => Vec::new(),
    }
}

pub fn detect_between(previous: &HistoryEntry, latest: &HistoryEntry) -> Vec<Anomaly> {
    let now = Utc::now();
    let mut anomalies = Vec::new();
    disk_anomalies(&previous.snapshot, &latest.snapshot, now, &mut anomalies);
    restart_anomalies(&latest.snapshot, now, &mut anomalies);
    memory_anomalies(&previous.snapshot, &latest.snapshot, now, &mut anomalies);
    anomalies
}

fn disk_anomalies(
    previous: &Snapshot,
    latest: &Snapshot,
    now: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    let mut previous_by_mount: HashMap<&str, &DiskUsage> = HashMap::new();
    for disk in &previous.linux.disks {
        previous_by_mount.entry(disk.mount_key()).or_insert(disk);
    }

    for disk in &latest.linux.disks {
        let mount = disk.mount_key();
        let Some(before) = previous_by_mount.get(mount) else {
            continue;
        };
        let current_pct = disk.use_percent_value().unwrap_or(0);
        let previous_pct = before.use_percent_value().unwrap_or(0);
        if current_pct >= DISK_FULL_PERCENT {
            out.push(anomaly(
                AnomalyKind::DiskGrowth,
                Severity::High,
                format!("Disk {mount} is {} full", disk.use_percent),
                "Consider cleanup or expansion.",
                now,
            ));
        } else if current_pct.saturating_sub(previous_pct) >= DISK_GROWTH_POINTS {
            out.push(anomaly(
                AnomalyKind::DiskGrowth,
                Severity::Medium,
                format!("Disk {mount} grew from {previous_pct}% to {current_pct}%"),
                "Monitor for continued growth.",
                now,
            ));
        }
    }
}

fn restart_anomalies(latest: &Snapshot, now: DateTime<Utc>, out: &mut Vec<Anomaly>) {
    for container in &latest.docker.containers {
        let Some(restarts) = container.restart_count else {
            continue;
        };
        if restarts > RESTART_LOOP_THRESHOLD {
            out.push(anomaly(
                AnomalyKind::RestartLoop,
                Severity::High,
                format!("Container {} has {restarts} restarts", container.name),
                &format!("Check logs: docker logs {}", container.name),
                now,
            ));
        }
    }
}

fn memory_anomalies(
    previous: &Snapshot,
    latest: &Snapshot,
    now: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    let before = &previous.linux.memory;
    let current = &latest.linux.memory;
    if before.total_mb == 0 || current.total_mb == 0 || current.used_mb <= before.used_mb {
        return;
    }
    let increase = current.used_mb - before.used_mb;
    if increase as f64 >= current.total_mb as f64 * MEMORY_GROWTH_RATIO {
        out.push(anomaly(
            AnomalyKind::MemoryTrend,
            Severity::Medium,
            format!("Memory usage increased by {increase} MB"),
            "Possible memory leak or load increase.",
            now,
        ));
    }
}

fn anomaly(
    kind: AnomalyKind,
    severity: Severity,
    message: String,
    detail: &str,
    detected_at: DateTime<Utc>,
) -> Anomaly {
    Anomaly {
        kind,
        severity,
        message,
        detail: detail.to_string(),
        detected_at,
    }
}
