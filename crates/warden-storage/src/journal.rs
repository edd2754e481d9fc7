use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};
use warden_core_domain::ExecutionRecord;

use crate::{io_failure, StorageError};

const JOURNAL_FILE: &str = "executions.jsonl";
const SEGMENT_DIR: &str = "archive";
const SEGMENT_STEM: &str = "executions";

/// When the active journal is sealed and how many sealed segments survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPolicy {
    /// Seal once the active file reaches this size; 0 never seals.
    pub max_bytes: u64,
    pub compress: bool,
    /// Sealed segments kept, oldest dropped first; 0 keeps them all.
    pub keep_segments: usize,
}

impl Default for JournalPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            compress: true,
            keep_segments: 10,
        }
    }
}

impl JournalPolicy {
    /// Defaults overridden by `WARDEN_STORAGE_*`; unparseable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: env_value("WARDEN_STORAGE_MAX_JSONL_BYTES").unwrap_or(defaults.max_bytes),
            compress: env::var("WARDEN_STORAGE_ARCHIVE_COMPRESS")
                .map(|value| {
                    matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(defaults.compress),
            keep_segments: env_value("WARDEN_STORAGE_ARCHIVE_MAX_FILES")
                .unwrap_or(defaults.keep_segments),
        }
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

/// Append-only JSONL record of executed commands. A full journal is sealed
/// into `archive/executions.<seq>.jsonl[.gz]` with a sequence number one past
/// the newest existing segment. Callers hold the store lock.
#[derive(Debug, Clone)]
pub struct ExecutionJournal {
    dir: PathBuf,
    policy: JournalPolicy,
}

impl ExecutionJournal {
    pub fn new(dir: PathBuf, policy: JournalPolicy) -> Self {
        Self { dir, policy }
    }

    pub fn policy(&self) -> JournalPolicy {
        self.policy
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn segment_dir(&self) -> PathBuf {
        self.dir.join(SEGMENT_DIR)
    }

    pub(crate) fn append(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let path = self.active_path();
        if self.is_full(&path)? {
            self.seal(&path)?;
        }

        let line = serde_json::to_string(record).map_err(|e| StorageError::ParseError {
            message: format!("failed to serialize execution {}: {}", record.id, e),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_failure("failed to open execution journal"))?;
        writeln!(file, "{line}").map_err(io_failure("failed to append execution"))?;
        file.sync_data()
            .map_err(io_failure("failed to flush execution journal"))
    }

    /// Records in the active journal, oldest first. Sealed segments are not read.
    pub(crate) fn read_active(&self) -> Result<Vec<ExecutionRecord>, StorageError> {
        let file = match File::open(self.active_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_failure("failed to open execution journal")(err)),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_failure("failed to read execution journal"))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| StorageError::ParseError {
                message: format!("execution journal line {}: {}", index + 1, e),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Sealed segments as `(sequence, path)`, lowest sequence first.
    pub fn segments(&self) -> Result<Vec<(u64, PathBuf)>, StorageError> {
        let entries = match fs::read_dir(self.segment_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_failure("failed to list journal segments")(err)),
        };
        let mut segments: Vec<(u64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                let sequence = segment_sequence(path.file_name()?.to_str()?)?;
                Some((sequence, path))
            })
            .collect();
        segments.sort_by_key(|(sequence, _)| *sequence);
        Ok(segments)
    }

    fn is_full(&self, path: &Path) -> Result<bool, StorageError> {
        if self.policy.max_bytes == 0 {
            return Ok(false);
        }
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len() >= self.policy.max_bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_failure("failed to inspect execution journal")(err)),
        }
    }

    fn seal(&self, path: &Path) -> Result<(), StorageError> {
        let segment_dir = self.segment_dir();
        fs::create_dir_all(&segment_dir)
            .map_err(io_failure("failed to create journal segment directory"))?;

        let mut segments = self.segments()?;
        let sequence = segments.last().map_or(1, |(last, _)| last + 1);
        let extension = if self.policy.compress { "jsonl.gz" } else { "jsonl" };
        let sealed = segment_dir.join(format!("{SEGMENT_STEM}.{sequence:06}.{extension}"));

        if self.policy.compress {
            gzip_to(path, &sealed)?;
            fs::remove_file(path).map_err(io_failure("failed to clear sealed journal"))?;
        } else {
            fs::rename(path, &sealed).map_err(io_failure("failed to seal execution journal"))?;
        }
        info!(sequence, segment = %sealed.display(), "sealed execution journal");

        segments.push((sequence, sealed));
        self.drop_oldest(segments);
        Ok(())
    }

    fn drop_oldest(&self, segments: Vec<(u64, PathBuf)>) {
        let keep = self.policy.keep_segments;
        if keep == 0 || segments.len() <= keep {
            return;
        }
        let excess = segments.len() - keep;
        for (sequence, path) in segments.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(sequence, error = %err, "failed to drop old journal segment");
            }
        }
    }
}

/// `executions.000042.jsonl.gz` -> 42. Anything else, including a partially
/// written segment, is not a segment.
fn segment_sequence(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(SEGMENT_STEM)?.strip_prefix('.')?;
    let (digits, extension) = rest.split_once('.')?;
    if extension != "jsonl" && extension != "jsonl.gz" {
        return None;
    }
    digits.parse().ok()
}

/// Compresses `source` into `target` via a `.partial` file so a crash never
/// leaves a truncated segment under its final name.
fn gzip_to(source: &Path, target: &Path) -> Result<(), StorageError> {
    let partial = target.with_extension("partial");
    let mut input = File::open(source).map_err(io_failure("failed to open journal for sealing"))?;
    let output = File::create(&partial).map_err(io_failure("failed to create journal segment"))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(io_failure("failed to compress journal"))?;
    encoder
        .finish()
        .and_then(|file| file.sync_all())
        .map_err(io_failure("failed to finish journal segment"))?;
    fs::rename(&partial, target).map_err(io_failure("failed to publish journal segment"))
}
