use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

use crate::{io_failure, StorageError};

const LOCK_FILE: &str = ".warden.lock";

/// Advisory lock over a whole store directory, held until dropped. Server
/// writes and journal appends from separate `warden` processes serialize on
/// it; readers share it.
#[derive(Debug)]
pub(crate) struct StoreLock {
    file: File,
}

impl StoreLock {
    pub(crate) fn shared(dir: &Path) -> Result<Self, StorageError> {
        Self::acquire(dir, FileExt::lock_shared)
    }

    pub(crate) fn exclusive(dir: &Path) -> Result<Self, StorageError> {
        Self::acquire(dir, FileExt::lock_exclusive)
    }

    fn acquire(dir: &Path, lock: fn(&File) -> io::Result<()>) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(io_failure("failed to create store directory"))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .map_err(io_failure("failed to open store lock"))?;
        lock(&file).map_err(io_failure("failed to lock store"))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_holders_coexist_and_exclusive_follows() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = dir.path().join("nested");
        let first = StoreLock::shared(&store).expect("first shared");
        let second = StoreLock::shared(&store).expect("second shared");
        assert!(store.join(LOCK_FILE).exists());
        drop(first);
        drop(second);
        let _exclusive = StoreLock::exclusive(&store).expect("exclusive");
    }
}
