use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use warden_core_domain::{ExecutionRecord, RiskAssessment, RiskLevel, ServerHealth};
use warden_ssh::SshClient;
use warden_storage::{ExecutionHistory, StorageBackend};

use crate::credentials::{CredentialResolver, ResolveError, TargetIdentity};
use crate::risk;

pub const HEALTH_CHECK_COMMAND: &str = "echo ok";

/// Why a command was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyCommand,
    RiskMismatch {
        analyzed: RiskLevel,
        confirmed: Option<RiskLevel>,
    },
    TargetUnresolved {
        message: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyCommand => f.write_str("Command is empty."),
            RejectReason::RiskMismatch {
                analyzed,
                confirmed,
            } => write!(
                f,
                "Confirmation level does not match analyzed risk. Analyzed: {}, confirmed: {}. \
                 Re-run analysis and confirm with the shown risk level.",
                analyzed,
                confirmed.map_or("NONE", RiskLevel::as_str)
            ),
            RejectReason::TargetUnresolved { message } => {
                write!(f, "Target could not be resolved: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteResult {
    /// The command reached the remote host; the record holds its outcome,
    /// whatever the exit code.
    Executed(ExecutionRecord),
    Rejected(RejectReason),
}

impl ExecuteResult {
    pub fn executed(&self) -> bool {
        matches!(self, ExecuteResult::Executed(_))
    }

    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            ExecuteResult::Executed(record) => Some(record),
            ExecuteResult::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            ExecuteResult::Executed(_) => None,
            ExecuteResult::Rejected(reason) => Some(reason),
        }
    }
}

/// Risk-gated command runner: analyze, check confirmation, dispatch, record.
pub struct CommandExecutor<C> {
    client: C,
    resolver: CredentialResolver,
    history: Arc<ExecutionHistory>,
    journal: Option<Arc<dyn StorageBackend>>,
}

impl<C: SshClient> CommandExecutor<C> {
    pub fn new(client: C, resolver: CredentialResolver, history: Arc<ExecutionHistory>) -> Self {
        Self {
            client,
            resolver,
            history,
            journal: None,
        }
    }

    /// Also append every executed record to a durable journal.
    pub fn with_journal(mut self, journal: Arc<dyn StorageBackend>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.history
    }

    pub fn analyze(&self, command: &str) -> RiskAssessment {
        risk::analyze(command)
    }

    pub fn execute(
        &self,
        command: &str,
        confirmed: Option<RiskLevel>,
        identity: &TargetIdentity,
    ) -> ExecuteResult {
        let command = command.trim();
        if command.is_empty() {
            return self.reject(RejectReason::EmptyCommand);
        }

        // Always re-assess; the caller's view of the command may be stale.
        let assessment = risk::analyze(command);
        if assessment.level.requires_confirmation() && confirmed != Some(assessment.level) {
            return self.reject(RejectReason::RiskMismatch {
                analyzed: assessment.level,
                confirmed,
            });
        }

        let target = match self.resolver.resolve(identity) {
            Ok(target) => target,
            Err(err) => {
                return self.reject(RejectReason::TargetUnresolved {
                    message: err.to_string(),
                })
            }
        };

        let outcome = self.client.execute(&target, command);
        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            command: command.to_string(),
            risk_level: assessment.level,
            success: outcome.success(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            rollback_suggestion: assessment.rollback_suggestion,
        };

        self.history.record(record.clone());
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append_execution(&record) {
                warn!(id = %record.id, error = %err, "failed to journal execution");
            }
        }
        info!(
            id = %record.id,
            host = %target.host,
            risk = %record.risk_level,
            exit_code = record.exit_code,
            "command executed"
        );

        ExecuteResult::Executed(record)
    }

    /// Runs a trivial probe against the target. Not recorded in history.
    pub fn check_health(&self, identity: &TargetIdentity) -> Result<ServerHealth, ResolveError> {
        let target = self.resolver.resolve(identity)?;
        let outcome = self.client.execute(&target, HEALTH_CHECK_COMMAND);
        if outcome.success() && outcome.stdout.trim() == "ok" {
            Ok(ServerHealth::Ok)
        } else {
            warn!(host = %target.host, stderr = %outcome.stderr.trim(), "health check failed");
            Ok(ServerHealth::Fail)
        }
    }

    fn reject(&self, reason: RejectReason) -> ExecuteResult {
        warn!(reason = %reason, "execution rejected");
        ExecuteResult::Rejected(reason)
    }
}
