pub mod audit;
pub mod cipher;
pub mod config;
pub mod credentials;
pub mod exec;
pub mod risk;
pub mod snapshot;

pub use cipher::{AesGcmCipher, CipherError, CredentialCipher};
pub use config::WardenConfig;
pub use credentials::{CredentialResolver, ResolveError, TargetIdentity};
pub use exec::{CommandExecutor, ExecuteResult, RejectReason};
pub use snapshot::SnapshotService;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] warden_storage::StorageError),
    #[error("credential error: {0}")]
    Cipher(#[from] CipherError),
    #[error("target error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config error: {0}")]
    Config(String),
}
