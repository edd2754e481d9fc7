use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READER_GRACE: Duration = Duration::from_millis(500);
/// ssh reserves 255 for its own failures, but a remote command that exits
/// 255 is reported the same way. The two cannot be told apart here, so a
/// remote 255 also surfaces as a transport failure and its stdout is dropped.
const SSH_CONNECTION_FAILURE: i32 = 255;

const MODERN_KEX: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group14-sha256",
];
const LEGACY_KEX: &[&str] = &[
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group1-sha1",
];

const MODERN_HOST_KEYS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "rsa-sha2-512",
    "rsa-sha2-256",
];
const LEGACY_HOST_KEYS: &[&str] = &["ssh-rsa", "ssh-dss"];

const MODERN_CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-ctr",
    "aes192-ctr",
    "aes128-ctr",
];
const LEGACY_CIPHERS: &[&str] = &["aes256-cbc", "aes128-cbc", "3des-cbc"];

const MODERN_MACS: &[&str] = &[
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-512",
    "hmac-sha2-256",
];
const LEGACY_MACS: &[&str] = &["hmac-sha1", "hmac-md5"];

/// Credentials for one remote session. Password and key material are
/// mutually exclusive.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    Password(String),
    /// PEM/OpenSSH private key content, written to a scoped temp file per call.
    PrivateKey(String),
    KeyFile(PathBuf),
    /// Whatever identities the local ssh client picks up on its own.
    SystemDefault,
}

impl AuthMaterial {
    pub fn is_password_only(&self) -> bool {
        matches!(self, AuthMaterial::Password(_))
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMaterial::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
            AuthMaterial::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            AuthMaterial::SystemDefault => f.write_str("SystemDefault"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMaterial) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Result of one remote command. Transport failures use exit code -1 with the
/// diagnostic in `stderr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub const TRANSPORT_FAILURE: i32 = -1;

    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(Self::TRANSPORT_FAILURE, String::new(), message)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_transport_failure(&self) -> bool {
        self.exit_code == Self::TRANSPORT_FAILURE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    Connection { message: String },
    Timeout { message: String },
    Launch { message: String },
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Connection { message } => write!(f, "ssh connection error: {message}"),
            SshError::Timeout { message } => write!(f, "ssh command timeout: {message}"),
            SshError::Launch { message } => write!(f, "ssh launch error: {message}"),
        }
    }
}

impl std::error::Error for SshError {}

impl From<SshError> for CommandOutcome {
    fn from(err: SshError) -> Self {
        CommandOutcome::failure(err.to_string())
    }
}

/// Algorithm lists offered during negotiation: modern entries first, the
/// SHA-1/CBC/3DES tier appended when `legacy_fallback` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmPolicy {
    pub legacy_fallback: bool,
}

impl Default for AlgorithmPolicy {
    fn default() -> Self {
        Self {
            legacy_fallback: true,
        }
    }
}

impl AlgorithmPolicy {
    fn tiered(&self, modern: &[&str], legacy: &[&str]) -> String {
        let mut list: Vec<&str> = modern.to_vec();
        if self.legacy_fallback {
            list.extend_from_slice(legacy);
        }
        list.join(",")
    }

    pub fn kex(&self) -> String {
        self.tiered(MODERN_KEX, LEGACY_KEX)
    }

    pub fn host_keys(&self) -> String {
        self.tiered(MODERN_HOST_KEYS, LEGACY_HOST_KEYS)
    }

    pub fn ciphers(&self) -> String {
        self.tiered(MODERN_CIPHERS, LEGACY_CIPHERS)
    }

    pub fn macs(&self) -> String {
        self.tiered(MODERN_MACS, LEGACY_MACS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// No verification and nothing recorded.
    AcceptAny,
    /// Only keys already present in the given known_hosts file are accepted.
    Pinned(PathBuf),
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::AcceptAny
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub ssh_program: String,
    pub sshpass_program: String,
    pub algorithms: AlgorithmPolicy,
    pub host_keys: HostKeyPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            algorithms: AlgorithmPolicy::default(),
            host_keys: HostKeyPolicy::default(),
        }
    }
}

pub trait SshClient {
    /// Runs one command in a fresh session. Never fails: transport problems
    /// come back as a [`CommandOutcome`] with exit code -1.
    fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome;
}

impl<T: SshClient + ?Sized> SshClient for &T {
    fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome {
        (**self).execute(target, command)
    }
}

impl<T: SshClient + ?Sized> SshClient for Box<T> {
    fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome {
        (**self).execute(target, command)
    }
}

impl<T: SshClient + ?Sized> SshClient for Arc<T> {
    fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome {
        (**self).execute(target, command)
    }
}

/// Drives the system OpenSSH client, with `sshpass` for password logins.
/// One process per call, no multiplexing.
#[derive(Debug, Default)]
pub struct ProcessSshClient {
    config: SshConfig,
}

impl ProcessSshClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn build_args(&self, target: &RemoteTarget, identity: Option<&Path>, command: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut opt = |value: String| {
            args.push("-o".to_string());
            args.push(value);
        };

        let connect_secs = target.connect_timeout.as_secs_f64().ceil().max(1.0) as u64;
        opt(format!("ConnectTimeout={connect_secs}"));

        match &self.config.host_keys {
            HostKeyPolicy::AcceptAny => {
                opt("StrictHostKeyChecking=no".to_string());
                opt("UserKnownHostsFile=/dev/null".to_string());
                opt("LogLevel=ERROR".to_string());
            }
            HostKeyPolicy::Pinned(path) => {
                opt("StrictHostKeyChecking=yes".to_string());
                opt(format!("UserKnownHostsFile={}", path.display()));
            }
        }

        let algorithms = self.config.algorithms;
        opt(format!("KexAlgorithms={}", algorithms.kex()));
        opt(format!("HostKeyAlgorithms={}", algorithms.host_keys()));
        opt(format!("Ciphers={}", algorithms.ciphers()));
        opt(format!("MACs={}", algorithms.macs()));

        match &target.auth {
            AuthMaterial::Password(_) => {
                // Some daemons break the password flow after a rejected key attempt.
                opt("PreferredAuthentications=password,keyboard-interactive".to_string());
                opt("PubkeyAuthentication=no".to_string());
                opt("NumberOfPasswordPrompts=1".to_string());
            }
            AuthMaterial::PrivateKey(_) | AuthMaterial::KeyFile(_) => {
                opt("BatchMode=yes".to_string());
                opt("IdentitiesOnly=yes".to_string());
                opt(format!("PubkeyAcceptedKeyTypes={}", algorithms.host_keys()));
            }
            AuthMaterial::SystemDefault => {
                opt("BatchMode=yes".to_string());
            }
        }

        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(target.destination());
        args.push(command.to_string());
        args
    }

    fn run(&self, target: &RemoteTarget, command: &str) -> Result<CommandOutcome, SshError> {
        // Held until the process exits; removed on every return path.
        let key_file = match &target.auth {
            AuthMaterial::PrivateKey(content) => Some(write_key_file(content)?),
            _ => None,
        };
        let identity = match (&target.auth, &key_file) {
            (_, Some(file)) => Some(file.path()),
            (AuthMaterial::KeyFile(path), None) => Some(path.as_path()),
            _ => None,
        };

        let args = self.build_args(target, identity, command);
        let mut cmd = match &target.auth {
            AuthMaterial::Password(password) => {
                let mut cmd = Command::new(&self.config.sshpass_program);
                cmd.arg("-e")
                    .arg(&self.config.ssh_program)
                    .args(&args)
                    .env("SSHPASS", password);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&self.config.ssh_program);
                cmd.args(&args);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // sshpass forks ssh; a timeout has to reach both.
            cmd.process_group(0);
        }

        debug!(
            host = %target.host,
            port = target.port,
            user = %target.username,
            password_only = target.auth.is_password_only(),
            "dispatching remote command"
        );

        let mut child = cmd.spawn().map_err(|err| {
            let program = if target.auth.is_password_only() {
                &self.config.sshpass_program
            } else {
                &self.config.ssh_program
            };
            let message = if err.kind() == std::io::ErrorKind::NotFound {
                format!("failed to launch {program}: not installed or not on PATH")
            } else {
                format!("failed to launch {program}: {err}")
            };
            SshError::Launch { message }
        })?;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = target.connect_timeout + target.command_timeout;
        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate(&mut child);
                let _ = stdout_reader.recv_timeout(READER_GRACE);
                let _ = stderr_reader.recv_timeout(READER_GRACE);
                return Err(SshError::Timeout {
                    message: format!(
                        "command did not finish within {} ms",
                        deadline.as_millis()
                    ),
                });
            }
            Err(err) => {
                terminate(&mut child);
                return Err(SshError::Connection {
                    message: format!("failed to wait on ssh process: {err}"),
                });
            }
        };

        let stdout = stdout_reader.recv().unwrap_or_default();
        let stderr = stderr_reader.recv().unwrap_or_default();
        drop(key_file);

        let exit_code = status.code().unwrap_or(CommandOutcome::TRANSPORT_FAILURE);
        if exit_code == SSH_CONNECTION_FAILURE {
            let message = if stderr.trim().is_empty() {
                "ssh connection failed".to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(SshError::Connection { message });
        }

        Ok(CommandOutcome {
            exit_code,
            stdout,
            stderr,
        })
    }
}

impl SshClient for ProcessSshClient {
    fn execute(&self, target: &RemoteTarget, command: &str) -> CommandOutcome {
        match self.run(target, command) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(host = %target.host, port = target.port, error = %err, "remote command failed");
                err.into()
            }
        }
    }
}

fn write_key_file(content: &str) -> Result<NamedTempFile, SshError> {
    let io_err = |err: std::io::Error| SshError::Launch {
        message: format!("failed to stage private key: {err}"),
    };
    let mut file = tempfile::Builder::new()
        .prefix("warden-key-")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    // OpenSSH rejects key files without a trailing newline.
    if !content.ends_with('\n') {
        file.write_all(b"\n").map_err(io_err)?;
    }
    file.flush().map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }
    Ok(file)
}

trait PipeSource: Read + Send + 'static {}
impl PipeSource for ChildStdout {}
impl PipeSource for ChildStderr {}

/// Drains a pipe on its own thread. The text arrives once every writer has
/// closed its end.
fn spawn_reader<R: PipeSource>(stream: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Kills the child together with anything it forked, then reaps it. The
/// child leads its own process group on unix.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    let group_killed = {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        i32::try_from(child.id())
            .map(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok())
            .unwrap_or(false)
    };
    #[cfg(not(unix))]
    let group_killed = false;

    if !group_killed {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
