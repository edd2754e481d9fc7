pub mod history;
pub mod journal;
mod lock;

pub use history::{
    BoundedLog, ExecutionHistory, SnapshotHistory, EXECUTION_HISTORY_CAPACITY,
    SNAPSHOT_HISTORY_CAPACITY,
};
pub use journal::{ExecutionJournal, JournalPolicy};

use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use warden_core_domain::{ExecutionRecord, ServerRecord};

use lock::StoreLock;

#[derive(Debug)]
pub enum StorageError {
    IoError { message: String },
    ParseError { message: String },
    NotFound { key: String },
    Duplicate { key: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::IoError { message } => write!(f, "io error: {}", message),
            StorageError::ParseError { message } => write!(f, "parse error: {}", message),
            StorageError::NotFound { key } => write!(f, "not found: {}", key),
            StorageError::Duplicate { key } => write!(f, "duplicate: {}", key),
        }
    }
}

impl Error for StorageError {}

pub(crate) fn io_failure(context: &'static str) -> impl FnOnce(io::Error) -> StorageError {
    move |err| StorageError::IoError {
        message: format!("{context}: {err}"),
    }
}

pub trait StorageBackend: Send + Sync {
    fn load_servers(&self) -> Result<Vec<ServerRecord>, StorageError>;
    fn save_servers(&self, servers: &[ServerRecord]) -> Result<(), StorageError>;
    fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError>;
    fn load_executions(&self) -> Result<Vec<ExecutionRecord>, StorageError>;
}

/// Lookup used by credential resolution. Returned records still carry the
/// encrypted credential only.
pub trait ServerInventory {
    fn find_by_id(&self, id: &str) -> Result<Option<ServerRecord>, StorageError>;
}

impl<T: StorageBackend + ?Sized> ServerInventory for T {
    fn find_by_id(&self, id: &str) -> Result<Option<ServerRecord>, StorageError> {
        Ok(self
            .load_servers()?
            .into_iter()
            .find(|server| server.id == id))
    }
}

pub fn add_server(
    storage: &dyn StorageBackend,
    record: ServerRecord,
) -> Result<(), StorageError> {
    let mut servers = storage.load_servers()?;
    if servers.iter().any(|server| server.id == record.id) {
        return Err(StorageError::Duplicate { key: record.id });
    }
    servers.push(record);
    storage.save_servers(&servers)
}

pub fn update_server(
    storage: &dyn StorageBackend,
    record: ServerRecord,
) -> Result<(), StorageError> {
    let mut servers = storage.load_servers()?;
    let slot = servers
        .iter_mut()
        .find(|server| server.id == record.id)
        .ok_or_else(|| StorageError::NotFound {
            key: record.id.clone(),
        })?;
    *slot = record;
    storage.save_servers(&servers)
}

pub fn remove_server(storage: &dyn StorageBackend, id: &str) -> Result<(), StorageError> {
    let mut servers = storage.load_servers()?;
    let before = servers.len();
    servers.retain(|server| server.id != id);
    if servers.len() == before {
        return Err(StorageError::NotFound { key: id.to_string() });
    }
    storage.save_servers(&servers)
}

/// File-backed store rooted at one directory: `servers.json` plus the
/// execution journal, both guarded by a single directory lock.
pub struct JsonFileStorage {
    base_path: PathBuf,
    journal: ExecutionJournal,
}

impl JsonFileStorage {
    /// Journal limits come from the `WARDEN_STORAGE_*` environment.
    pub fn new(base_path: PathBuf) -> Self {
        Self::with_journal_policy(base_path, JournalPolicy::from_env())
    }

    pub fn with_journal_policy(base_path: PathBuf, policy: JournalPolicy) -> Self {
        let journal = ExecutionJournal::new(base_path.clone(), policy);
        Self { base_path, journal }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn journal(&self) -> &ExecutionJournal {
        &self.journal
    }

    fn servers_path(&self) -> PathBuf {
        self.base_path.join("servers.json")
    }
}

impl StorageBackend for JsonFileStorage {
    fn load_servers(&self) -> Result<Vec<ServerRecord>, StorageError> {
        let _lock = StoreLock::shared(&self.base_path)?;
        let content = match fs::read_to_string(self.servers_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_failure("failed to read servers")(err)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| StorageError::ParseError {
            message: format!("failed to parse servers: {}", e),
        })
    }

    /// Replaces `servers.json` atomically; readers see the old or the new
    /// list, never a partial one.
    fn save_servers(&self, servers: &[ServerRecord]) -> Result<(), StorageError> {
        let _lock = StoreLock::exclusive(&self.base_path)?;
        let content =
            serde_json::to_vec_pretty(servers).map_err(|e| StorageError::ParseError {
                message: format!("failed to serialize servers: {}", e),
            })?;

        let mut staged = NamedTempFile::new_in(&self.base_path)
            .map_err(io_failure("failed to stage servers"))?;
        staged
            .write_all(&content)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(io_failure("failed to write staged servers"))?;
        staged
            .persist(self.servers_path())
            .map_err(|e| io_failure("failed to replace servers")(e.error))?;
        Ok(())
    }

    fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let _lock = StoreLock::exclusive(&self.base_path)?;
        self.journal.append(record)
    }

    fn load_executions(&self) -> Result<Vec<ExecutionRecord>, StorageError> {
        let _lock = StoreLock::shared(&self.base_path)?;
        self.journal.read_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use warden_core_domain::{AuthType, RiskLevel, ServerHealth};

    fn server(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            name: format!("{id}-name"),
            host: "192.168.1.1".to_string(),
            port: 22,
            username: "root".to_string(),
            auth_type: AuthType::Password,
            encrypted_credential: "ciphertext".to_string(),
            health: ServerHealth::Unknown,
        }
    }

    fn execution(command: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: "exec-1".to_string(),
            timestamp: Utc::now(),
            command: command.to_string(),
            risk_level: RiskLevel::Low,
            success: true,
            exit_code: 0,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            rollback_suggestion: "No rollback needed for low-risk command.".to_string(),
        }
    }

    #[test]
    fn test_json_storage_servers() {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path().to_path_buf());

        storage.save_servers(&[server("web1")]).unwrap();
        let loaded = storage.load_servers().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "web1");
        assert_eq!(storage.find_by_id("web1").unwrap(), Some(server("web1")));
        assert_eq!(storage.find_by_id("missing").unwrap(), None);
    }

    #[test]
    fn add_update_remove_servers() {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path().to_path_buf());

        add_server(&storage, server("db1")).unwrap();
        assert!(matches!(
            add_server(&storage, server("db1")),
            Err(StorageError::Duplicate { .. })
        ));

        let mut updated = server("db1");
        updated.health = ServerHealth::Ok;
        update_server(&storage, updated).unwrap();
        let found = storage.find_by_id("db1").unwrap().unwrap();
        assert_eq!(found.health, ServerHealth::Ok);

        remove_server(&storage, "db1").unwrap();
        assert!(matches!(
            remove_server(&storage, "db1"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn appends_and_reads_execution_journal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path().to_path_buf());

        storage.append_execution(&execution("df -h")).unwrap();
        storage.append_execution(&execution("uptime")).unwrap();
        let loaded = storage.load_executions().unwrap();
        let commands: Vec<&str> = loaded.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["df -h", "uptime"]);
    }

    #[test]
    fn full_journal_is_sealed_before_the_next_append() {
        let temp_dir = TempDir::new().unwrap();
        let policy = JournalPolicy {
            max_bytes: 64,
            ..JournalPolicy::default()
        };
        let storage = JsonFileStorage::with_journal_policy(temp_dir.path().to_path_buf(), policy);

        storage.append_execution(&execution("df -h")).unwrap();
        storage.append_execution(&execution("uptime")).unwrap();

        let segments = storage.journal().segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].1.ends_with("archive/executions.000001.jsonl.gz"));
        let active = storage.load_executions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].command, "uptime");
    }

    #[test]
    fn servers_file_is_replaced_whole() {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path().join("home"));

        storage.save_servers(&[server("a"), server("b")]).unwrap();
        storage.save_servers(&[server("c")]).unwrap();

        let ids: Vec<String> = storage.load_servers().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c".to_string()]);
        let leftovers: Vec<_> = fs::read_dir(storage.base_path())
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name != "servers.json" && name != ".warden.lock")
            .collect();
        assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
    }
}
