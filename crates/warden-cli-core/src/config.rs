use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use warden_observer::{NginxConfig, PostgresConfig};
use warden_ssh::{
    AlgorithmPolicy, AuthMaterial, HostKeyPolicy, RemoteTarget, SshConfig,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SSH_PORT,
};

use crate::CliError;

const CONFIG_FILE: &str = "config.json";
const DEV_ENCRYPTION_SECRET: &str = "warden-dev-secret-change-me";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// When set, host keys must already be present in this known_hosts file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<String>,
    pub legacy_algorithms: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_SSH_PORT,
            username: "root".to_string(),
            password: None,
            private_key_path: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            known_hosts: None,
            legacy_algorithms: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenConfig {
    pub ssh: SshSettings,
    pub postgres: PostgresConfig,
    pub nginx: NginxConfig,
    pub encryption_secret: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            ssh: SshSettings::default(),
            postgres: PostgresConfig::default(),
            nginx: NginxConfig::default(),
            encryption_secret: DEV_ENCRYPTION_SECRET.to_string(),
        }
    }
}

impl WardenConfig {
    /// Reads `$WARDEN_HOME/config.json` (if present), then applies
    /// `WARDEN_*` environment overrides.
    pub fn load() -> Result<Self, CliError> {
        let path = warden_home()?.join(CONFIG_FILE);
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<PathBuf, CliError> {
        let path = ensure_home_dir()?.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), CliError> {
        let ssh = &mut self.ssh;
        if let Some(value) = env_string("WARDEN_SSH_HOST") {
            ssh.host = value;
        }
        if let Some(value) = env_parsed("WARDEN_SSH_PORT")? {
            ssh.port = value;
        }
        if let Some(value) = env_string("WARDEN_SSH_USER") {
            ssh.username = value;
        }
        if let Some(value) = env_string("WARDEN_SSH_PASSWORD") {
            ssh.password = Some(value);
        }
        if let Some(value) = env_string("WARDEN_SSH_KEY_PATH") {
            ssh.private_key_path = Some(value);
        }
        if let Some(value) = env_parsed("WARDEN_SSH_CONNECT_TIMEOUT_MS")? {
            ssh.connect_timeout_ms = value;
        }
        if let Some(value) = env_parsed("WARDEN_SSH_COMMAND_TIMEOUT_MS")? {
            ssh.command_timeout_ms = value;
        }
        if let Some(value) = env_string("WARDEN_SSH_KNOWN_HOSTS") {
            ssh.known_hosts = Some(value);
        }
        if let Some(value) = env_flag("WARDEN_SSH_LEGACY_ALGORITHMS")? {
            ssh.legacy_algorithms = value;
        }

        let pg = &mut self.postgres;
        if let Some(value) = env_flag("WARDEN_POSTGRES_ENABLED")? {
            pg.enabled = value;
        }
        if let Some(value) = env_string("WARDEN_POSTGRES_HOST") {
            pg.host = value;
        }
        if let Some(value) = env_parsed("WARDEN_POSTGRES_PORT")? {
            pg.port = value;
        }
        if let Some(value) = env_string("WARDEN_POSTGRES_USER") {
            pg.user = value;
        }
        if let Some(value) = env_string("WARDEN_POSTGRES_DATABASE") {
            pg.database = value;
        }

        if let Some(value) = env_string("WARDEN_ENCRYPTION_SECRET") {
            self.encryption_secret = value;
        }
        Ok(())
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.encryption_secret == DEV_ENCRYPTION_SECRET
    }

    /// The fallback target used when no explicit or stored identity is given.
    pub fn default_target(&self) -> RemoteTarget {
        let ssh = &self.ssh;
        let auth = if let Some(path) = non_blank(ssh.private_key_path.as_deref()) {
            AuthMaterial::KeyFile(PathBuf::from(path))
        } else if let Some(password) = non_blank(ssh.password.as_deref()) {
            AuthMaterial::Password(password.to_string())
        } else {
            AuthMaterial::SystemDefault
        };
        RemoteTarget::new(ssh.host.clone(), ssh.username.clone(), auth)
            .with_port(ssh.port)
            .with_timeouts(
                Duration::from_millis(ssh.connect_timeout_ms),
                Duration::from_millis(ssh.command_timeout_ms),
            )
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            algorithms: AlgorithmPolicy {
                legacy_fallback: self.ssh.legacy_algorithms,
            },
            host_keys: match non_blank(self.ssh.known_hosts.as_deref()) {
                Some(path) => HostKeyPolicy::Pinned(PathBuf::from(path)),
                None => HostKeyPolicy::AcceptAny,
            },
            ..SshConfig::default()
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, CliError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CliError::Config(format!("{key} has an invalid value: {raw}"))),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, CliError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(CliError::Config(format!("{key} has an invalid value: {raw}"))),
        },
    }
}

fn resolve_home_dir() -> Result<PathBuf, CliError> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| CliError::Config("home directory not found".to_string()))
}

fn normalize_dir(value: &str, home: &Path) -> Result<PathBuf, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CliError::Config("data directory is empty".to_string()));
    }
    let mut path = match trimmed.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(trimmed),
    };
    if path.is_relative() {
        path = env::current_dir()?.join(path);
    }
    Ok(path)
}

pub fn warden_home() -> Result<PathBuf, CliError> {
    if let Ok(custom) = env::var("WARDEN_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return match resolve_home_dir() {
                Ok(home) => normalize_dir(trimmed, &home),
                Err(_) => Ok(PathBuf::from(trimmed)),
            };
        }
    }
    Ok(resolve_home_dir()?.join(".warden"))
}

pub fn ensure_home_dir() -> Result<PathBuf, CliError> {
    let path = warden_home()?;
    fs::create_dir_all(&path)?;
    Ok(path)
}
