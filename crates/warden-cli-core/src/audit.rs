use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use tracing::warn;

use crate::{config, CliError};

const LOG_ROTATE_BYTES: u64 = 20 * 1024 * 1024;

pub const CATEGORY_COMMANDS: &str = "commands";
pub const CATEGORY_SNAPSHOTS: &str = "snapshots";
pub const CATEGORY_SERVERS: &str = "servers";

/// Appends one timestamped line to `$WARDEN_HOME/logs/<category>/YYYY-MM-DD.log`.
pub fn write_audit_log(category: &str, message: &str) -> Result<(), CliError> {
    let base_path = config::ensure_home_dir()?;
    let log_dir = base_path.join("logs").join(category);
    fs::create_dir_all(&log_dir)?;

    let now = Local::now();
    let filename = format!("{}-{:02}-{:02}.log", now.year(), now.month(), now.day());
    let log_path = log_dir.join(filename);

    rotate_if_needed(&log_path, now.timestamp(), LOG_ROTATE_BYTES)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    writeln!(file, "[{}] {}", timestamp, message.replace('\n', "\\n"))?;
    Ok(())
}

/// Moves an oversized day file aside as `<file>.<ts>.old`.
fn rotate_if_needed(path: &Path, ts: i64, limit: u64) -> Result<(), CliError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if !metadata.is_file() || metadata.len() <= limit {
        return Ok(());
    }
    let rotated = PathBuf::from(format!("{}.{}.old", path.display(), ts));
    fs::rename(path, &rotated).map_err(|err| {
        warn!(log = %path.display(), error = %err, "audit log rotation failed");
        CliError::Io(err)
    })
}
