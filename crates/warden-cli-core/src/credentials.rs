use std::sync::Arc;

use thiserror::Error;
use warden_core_domain::AuthType;
use warden_ssh::{AuthMaterial, RemoteTarget};
use warden_storage::{ServerInventory, StorageError};

use crate::cipher::{CipherError, CredentialCipher};

/// Which host a command or capture is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetIdentity {
    /// The single configured fallback target.
    Default,
    /// A server record in the inventory, by id.
    Stored(String),
    /// Fully specified by the caller.
    Explicit(RemoteTarget),
}

impl TargetIdentity {
    /// Builds an identity from an optional server id; blank means default.
    pub fn from_server_id(id: Option<&str>) -> Self {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => TargetIdentity::Stored(id.to_string()),
            None => TargetIdentity::Default,
        }
    }

    /// Key under which snapshots of this target are kept in history.
    pub fn history_key(&self) -> Option<String> {
        match self {
            TargetIdentity::Default => None,
            TargetIdentity::Stored(id) => Some(id.clone()),
            TargetIdentity::Explicit(target) => Some(format!(
                "{}@{}:{}",
                target.username, target.host, target.port
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("server inventory unavailable: {0}")]
    Inventory(#[from] StorageError),
    #[error("failed to decrypt credential for server {id}: {source}")]
    Decrypt {
        id: String,
        #[source]
        source: CipherError,
    },
}

pub type SharedInventory = Arc<dyn ServerInventory + Send + Sync>;
pub type SharedCipher = Arc<dyn CredentialCipher + Send + Sync>;

/// Turns a [`TargetIdentity`] into a ready-to-use [`RemoteTarget`].
#[derive(Clone)]
pub struct CredentialResolver {
    default_target: RemoteTarget,
    inventory: SharedInventory,
    cipher: SharedCipher,
}

impl CredentialResolver {
    pub fn new(default_target: RemoteTarget, inventory: SharedInventory, cipher: SharedCipher) -> Self {
        Self {
            default_target,
            inventory,
            cipher,
        }
    }

    pub fn default_target(&self) -> &RemoteTarget {
        &self.default_target
    }

    pub fn resolve(&self, identity: &TargetIdentity) -> Result<RemoteTarget, ResolveError> {
        match identity {
            TargetIdentity::Default => Ok(self.default_target.clone()),
            TargetIdentity::Explicit(target) => Ok(target.clone()),
            TargetIdentity::Stored(id) => {
                let record = self
                    .inventory
                    .find_by_id(id)?
                    .ok_or_else(|| ResolveError::UnknownServer(id.clone()))?;
                let secret = self
                    .cipher
                    .decrypt(&record.encrypted_credential)
                    .map_err(|source| ResolveError::Decrypt {
                        id: id.clone(),
                        source,
                    })?;
                let auth = match record.auth_type {
                    AuthType::Password => AuthMaterial::Password(secret),
                    AuthType::PrivateKey => AuthMaterial::PrivateKey(secret),
                };
                Ok(RemoteTarget::new(record.host, record.username, auth)
                    .with_port(record.port)
                    .with_timeouts(
                        self.default_target.connect_timeout,
                        self.default_target.command_timeout,
                    ))
            }
        }
    }
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("default_target", &self.default_target)
            .finish_non_exhaustive()
    }
}
