use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use warden_cli_core::audit::{self, CATEGORY_COMMANDS, CATEGORY_SERVERS, CATEGORY_SNAPSHOTS};
use warden_cli_core::{
    config, risk, AesGcmCipher, CliError, CommandExecutor, CredentialCipher, CredentialResolver,
    ExecuteResult, SnapshotService, TargetIdentity, WardenConfig,
};
use warden_core_domain::{AuthType, RiskLevel, ServerHealth, ServerRecord};
use warden_observer::SnapshotAggregator;
use warden_ssh::{ProcessSshClient, DEFAULT_SSH_PORT};
use warden_storage::{
    add_server, remove_server, update_server, ExecutionHistory, JsonFileStorage, SnapshotHistory,
    StorageBackend,
};

const EXIT_REJECTED: i32 = 2;
const EXIT_TRANSPORT: i32 = 255;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Risk-gated remote execution and host snapshots", long_about = None)]
struct WardenCli {
    #[command(subcommand)]
    command: WardenCommand,
}

#[derive(Subcommand)]
enum WardenCommand {
    /// Classify a command without running it.
    Analyze(AnalyzeCommand),
    /// Run a command after risk confirmation.
    Exec(ExecCommand),
    /// Capture one snapshot of a target.
    Snapshot(TargetArgs),
    /// Capture repeatedly and report anomalies between captures.
    Watch(WatchCommand),
    /// Show recent access-log lines matching a keyword.
    Logs(LogsCommand),
    /// Show journaled executions.
    History(HistoryCommand),
    #[command(subcommand)]
    Servers(ServersCommand),
}

#[derive(Args)]
struct AnalyzeCommand {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    cmd: Vec<String>,
}

#[derive(Args)]
struct ExecCommand {
    /// Risk level shown by `analyze`; required for MEDIUM and HIGH commands.
    #[arg(long)]
    confirm: Option<RiskLevel>,
    #[arg(long)]
    server: Option<String>,
    #[arg(last = true, required = true)]
    cmd: Vec<String>,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    server: Option<String>,
}

#[derive(Args)]
struct WatchCommand {
    #[arg(long)]
    server: Option<String>,
    #[arg(long, default_value_t = 2)]
    count: usize,
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,
    #[arg(long, default_value_t = 20)]
    last_n: usize,
}

#[derive(Args)]
struct LogsCommand {
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct HistoryCommand {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Subcommand)]
enum ServersCommand {
    List,
    Add(ServerAddCommand),
    Remove(ServerIdArgs),
    Health(ServerIdArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthArg {
    Password,
    PrivateKey,
}

#[derive(Args)]
struct ServerAddCommand {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,
    #[arg(long, default_value = "root")]
    username: String,
    #[arg(long, value_enum, default_value_t = AuthArg::Password)]
    auth: AuthArg,
    /// Private key file whose content is stored encrypted.
    #[arg(long)]
    key_file: Option<PathBuf>,
}

#[derive(Args)]
struct ServerIdArgs {
    #[arg(long)]
    id: String,
}

/// Wiring shared by every subcommand.
struct Runtime {
    config: WardenConfig,
    storage: Arc<JsonFileStorage>,
    client: Arc<ProcessSshClient>,
    resolver: CredentialResolver,
}

impl Runtime {
    fn load() -> Result<Self, CliError> {
        let config = WardenConfig::load()?;
        if config.uses_dev_secret() {
            warn!("using the development encryption secret; set WARDEN_ENCRYPTION_SECRET");
        }
        let storage = Arc::new(JsonFileStorage::new(config::ensure_home_dir()?));
        let client = Arc::new(ProcessSshClient::with_config(config.ssh_config()));
        let resolver = CredentialResolver::new(
            config.default_target(),
            storage.clone(),
            Arc::new(AesGcmCipher::from_secret(&config.encryption_secret)),
        );
        Ok(Self {
            config,
            storage,
            client,
            resolver,
        })
    }

    fn cipher(&self) -> AesGcmCipher {
        AesGcmCipher::from_secret(&self.config.encryption_secret)
    }

    fn executor(&self) -> CommandExecutor<Arc<ProcessSshClient>> {
        CommandExecutor::new(
            self.client.clone(),
            self.resolver.clone(),
            Arc::new(ExecutionHistory::new()),
        )
        .with_journal(self.storage.clone())
    }

    fn snapshots(&self) -> SnapshotService<Arc<ProcessSshClient>> {
        let aggregator = SnapshotAggregator::new(self.client.clone(), Arc::new(SnapshotHistory::new()))
            .with_postgres(self.config.postgres.clone())
            .with_nginx(self.config.nginx.clone());
        SnapshotService::new(aggregator, self.resolver.clone(), self.config.nginx.clone())
    }
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32, CliError> {
    let cli = WardenCli::parse();
    match cli.command {
        WardenCommand::Analyze(cmd) => handle_analyze(cmd).map(|_| 0),
        WardenCommand::Exec(cmd) => handle_exec(cmd),
        WardenCommand::Snapshot(cmd) => handle_snapshot(cmd),
        WardenCommand::Watch(cmd) => handle_watch(cmd),
        WardenCommand::Logs(cmd) => handle_logs(cmd).map(|_| 0),
        WardenCommand::History(cmd) => handle_history(cmd).map(|_| 0),
        WardenCommand::Servers(cmd) => handle_servers(cmd).map(|_| 0),
    }
}

fn handle_analyze(cmd: AnalyzeCommand) -> Result<(), CliError> {
    let command_line = cmd.cmd.join(" ");
    let assessment = risk::analyze(&command_line);
    log_event(
        CATEGORY_COMMANDS,
        &format!("analyze risk={} cmd={}", assessment.level, command_line.trim()),
    );
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

fn handle_exec(cmd: ExecCommand) -> Result<i32, CliError> {
    let runtime = Runtime::load()?;
    let command_line = cmd.cmd.join(" ");
    let identity = TargetIdentity::from_server_id(cmd.server.as_deref());
    let executor = runtime.executor();

    match executor.execute(&command_line, cmd.confirm, &identity) {
        ExecuteResult::Executed(record) => {
            log_event(
                CATEGORY_COMMANDS,
                &format!(
                    "exec id={} server={} risk={} exit={} cmd={}",
                    record.id,
                    cmd.server.as_deref().unwrap_or("default"),
                    record.risk_level,
                    record.exit_code,
                    record.command
                ),
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "executed": true,
                    "record": record,
                }))?
            );
            Ok(match record.exit_code {
                -1 => EXIT_TRANSPORT,
                code => code,
            })
        }
        ExecuteResult::Rejected(reason) => {
            log_event(
                CATEGORY_COMMANDS,
                &format!("exec rejected reason={} cmd={}", reason, command_line.trim()),
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "executed": false,
                    "reason": reason.to_string(),
                }))?
            );
            Ok(EXIT_REJECTED)
        }
    }
}

fn handle_snapshot(cmd: TargetArgs) -> Result<i32, CliError> {
    let runtime = Runtime::load()?;
    let identity = TargetIdentity::from_server_id(cmd.server.as_deref());
    let entry = runtime.snapshots().capture(&identity)?;
    log_event(
        CATEGORY_SNAPSHOTS,
        &format!(
            "snapshot server={} disks={} containers={}",
            cmd.server.as_deref().unwrap_or("default"),
            entry.snapshot.linux.disks.len(),
            entry.snapshot.docker.containers.len()
        ),
    );
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(0)
}

fn handle_watch(cmd: WatchCommand) -> Result<i32, CliError> {
    if cmd.count == 0 {
        return Err(CliError::InvalidInput("--count must be at least 1".to_string()));
    }
    let runtime = Runtime::load()?;
    let identity = TargetIdentity::from_server_id(cmd.server.as_deref());
    let service = runtime.snapshots();

    for round in 1..=cmd.count {
        let entry = service.capture(&identity)?;
        let anomalies = service.anomalies(Some(&identity), cmd.last_n);
        log_event(
            CATEGORY_SNAPSHOTS,
            &format!(
                "watch round={round}/{} server={} anomalies={}",
                cmd.count,
                cmd.server.as_deref().unwrap_or("default"),
                anomalies.len()
            ),
        );
        println!(
            "{}",
            serde_json::to_string(&json!({
                "round": round,
                "timestamp": entry.timestamp,
                "anomalies": anomalies,
            }))?
        );
        if round < cmd.count {
            thread::sleep(Duration::from_secs(cmd.interval_secs));
        }
    }

    let disks = service.disk_series(Some(&identity), cmd.count);
    let memory = service.memory_series(Some(&identity), cmd.count);
    println!(
        "{}",
        serde_json::to_string(&json!({ "diskByMount": disks, "memory": memory }))?
    );
    Ok(0)
}

fn handle_logs(cmd: LogsCommand) -> Result<(), CliError> {
    let runtime = Runtime::load()?;
    let identity = TargetIdentity::from_server_id(cmd.server.as_deref());
    let keyword = cmd
        .keyword
        .unwrap_or_else(|| runtime.config.nginx.log_keyword.clone());
    let limit = cmd.limit.unwrap_or(runtime.config.nginx.log_limit);
    let lines = runtime
        .snapshots()
        .filtered_log_lines(&identity, &keyword, limit)?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn handle_history(cmd: HistoryCommand) -> Result<(), CliError> {
    let storage = JsonFileStorage::new(config::ensure_home_dir()?);
    let records = storage.load_executions()?;
    let skip = records.len().saturating_sub(cmd.limit);
    for record in records.iter().skip(skip) {
        println!(
            "{}\t{}\t{}\texit={}\t{}",
            record.timestamp.to_rfc3339(),
            record.id,
            record.risk_level,
            record.exit_code,
            record.command
        );
    }
    Ok(())
}

fn handle_servers(cmd: ServersCommand) -> Result<(), CliError> {
    let runtime = Runtime::load()?;
    let storage = runtime.storage.as_ref();
    match cmd {
        ServersCommand::List => {
            let servers = storage.load_servers()?;
            if servers.is_empty() {
                println!("No servers configured.");
                return Ok(());
            }
            for server in servers {
                println!(
                    "{}\t{}\t{}@{}:{}\t{:?}\t{:?}",
                    server.id,
                    server.name,
                    server.username,
                    server.host,
                    server.port,
                    server.auth_type,
                    server.health
                );
            }
        }
        ServersCommand::Add(cmd) => {
            let (auth_type, secret) = match cmd.auth {
                AuthArg::Password => (
                    AuthType::Password,
                    rpassword::prompt_password(format!("SSH password for {}: ", cmd.id))?,
                ),
                AuthArg::PrivateKey => {
                    let path = cmd.key_file.ok_or_else(|| {
                        CliError::InvalidInput("--key-file is required for private-key auth".to_string())
                    })?;
                    (AuthType::PrivateKey, fs::read_to_string(path)?)
                }
            };
            if secret.is_empty() {
                return Err(CliError::InvalidInput("credential is empty".to_string()));
            }
            let record = ServerRecord {
                name: cmd.name.unwrap_or_else(|| cmd.id.clone()),
                id: cmd.id,
                host: cmd.host,
                port: cmd.port,
                username: cmd.username,
                auth_type,
                encrypted_credential: runtime.cipher().encrypt(&secret)?,
                health: ServerHealth::Unknown,
            };
            let summary = format!("servers add id={} host={}", record.id, record.host);
            add_server(storage, record)?;
            log_event(CATEGORY_SERVERS, &summary);
            println!("Server saved.");
        }
        ServersCommand::Remove(cmd) => {
            remove_server(storage, &cmd.id)?;
            log_event(CATEGORY_SERVERS, &format!("servers remove id={}", cmd.id));
            println!("Server removed.");
        }
        ServersCommand::Health(cmd) => {
            let identity = TargetIdentity::Stored(cmd.id.clone());
            let health = runtime.executor().check_health(&identity)?;
            let mut record = storage
                .load_servers()?
                .into_iter()
                .find(|server| server.id == cmd.id)
                .ok_or_else(|| CliError::InvalidInput(format!("unknown server: {}", cmd.id)))?;
            record.health = health;
            update_server(storage, record)?;
            log_event(
                CATEGORY_SERVERS,
                &format!("servers health id={} result={:?}", cmd.id, health),
            );
            println!("{}", serde_json::to_string(&json!({ "id": cmd.id, "health": health }))?);
        }
    }
    Ok(())
}

fn log_event(category: &str, message: &str) {
    if let Err(err) = audit::write_audit_log(category, message) {
        warn!(category, error = %err, "failed to write audit log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        WardenCli::command().debug_assert();
    }

    #[test]
    fn exec_takes_command_after_separator() {
        let cli = WardenCli::try_parse_from([
            "warden", "exec", "--confirm", "high", "--server", "web1", "--", "rm", "-rf", "/",
        ])
        .expect("parse");
        let WardenCommand::Exec(cmd) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(cmd.confirm, Some(RiskLevel::High));
        assert_eq!(cmd.server.as_deref(), Some("web1"));
        assert_eq!(cmd.cmd.join(" "), "rm -rf /");
    }

    #[test]
    fn analyze_accepts_hyphenated_words() {
        let cli = WardenCli::try_parse_from(["warden", "analyze", "kill", "-9", "1234"])
            .expect("parse");
        let WardenCommand::Analyze(cmd) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(cmd.cmd, vec!["kill", "-9", "1234"]);
    }

    #[test]
    fn unknown_confirmation_level_is_rejected() {
        assert!(WardenCli::try_parse_from(["warden", "exec", "--confirm", "extreme", "--", "ls"])
            .is_err());
    }
}
