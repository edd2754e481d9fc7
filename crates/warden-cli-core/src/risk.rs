use std::sync::OnceLock;

use regex::Regex;
use tracing::error;
use warden_core_domain::{RiskAssessment, RiskLevel};

pub const EMPTY_COMMAND_REASON: &str = "Empty command.";
pub const LOW_RISK_REASON: &str =
    "No high- or medium-risk patterns detected. Command appears read-only or low impact.";
pub const LOW_RISK_ROLLBACK: &str = "No rollback needed for low-risk command.";

const GENERIC_HIGH_ROLLBACK: &str =
    "No automated rollback. Restore from backups if data was affected.";
const GENERIC_MEDIUM_ROLLBACK: &str =
    "Reverse the action manually (e.g. restart service, restore from backup).";

/// One classification rule. `rollback` may contain `{target}`, filled from the
/// pattern's `target` capture or left as the given placeholder.
#[derive(Debug, Clone, Copy)]
pub struct RiskRule {
    pub level: RiskLevel,
    pub pattern: &'static str,
    pub reason: &'static str,
    pub rollback: &'static str,
    pub placeholder: &'static str,
}

const fn rule(
    level: RiskLevel,
    pattern: &'static str,
    reason: &'static str,
    rollback: &'static str,
) -> RiskRule {
    RiskRule {
        level,
        pattern,
        reason,
        rollback,
        placeholder: "",
    }
}

const fn targeted(
    level: RiskLevel,
    pattern: &'static str,
    reason: &'static str,
    rollback: &'static str,
    placeholder: &'static str,
) -> RiskRule {
    RiskRule {
        level,
        pattern,
        reason,
        rollback,
        placeholder,
    }
}

// First match wins. Every HIGH rule precedes every MEDIUM rule, and specific
// patterns precede their generic supersets.
const RULES: &[RiskRule] = &[
    rule(
        RiskLevel::High,
        r"\brm\s+-rf\s+/",
        "Recursive force delete (rm -rf) of a root path is destructive and can remove system or data.",
        GENERIC_HIGH_ROLLBACK,
    ),
    rule(
        RiskLevel::High,
        r"\brm\s+-rf\s+\*/",
        "Recursive force delete (rm -rf) across every directory is destructive and can remove system or data.",
        GENERIC_HIGH_ROLLBACK,
    ),
    rule(
        RiskLevel::High,
        r"\blvreduce\b",
        "LVM lvreduce can cause data loss if the filesystem is not resized first.",
        "LVM: Cannot undo lvreduce. Ensure you have backups; use lvextend to grow again if space is available.",
    ),
    rule(
        RiskLevel::High,
        r"\bpvremove\b",
        "LVM remove operations can destroy volumes and data.",
        "LVM remove is irreversible. Restore from backup if data was on the PV.",
    ),
    rule(
        RiskLevel::High,
        r"\bvgremove\b",
        "LVM remove operations can destroy volumes and data.",
        "LVM remove is irreversible. Restore from backup if data was on the VG.",
    ),
    rule(
        RiskLevel::High,
        r"\blvremove\b",
        "LVM remove operations can destroy volumes and data.",
        "LVM remove is irreversible. Restore from backup if data was on the LV.",
    ),
    rule(
        RiskLevel::High,
        r"\bmkfs\.",
        "Formatting a block device erases all data on it.",
        GENERIC_HIGH_ROLLBACK,
    ),
    rule(
        RiskLevel::High,
        r"\bdd\s+.*if=.*of=/dev/",
        "dd to a block device overwrites disk contents irreversibly.",
        GENERIC_HIGH_ROLLBACK,
    ),
    rule(
        RiskLevel::High,
        r"\bdrop\s+database\b",
        "Dropping a database removes all data permanently.",
        "Restore database from a recent backup (pg_restore or dump).",
    ),
    rule(
        RiskLevel::High,
        r"\btruncate\s+(table\s+)?\w+",
        "TRUNCATE removes all rows from a table without row-by-row delete.",
        "Restore table data from backup or point-in-time recovery.",
    ),
    rule(
        RiskLevel::High,
        r">\s*/dev/sd[a-z]",
        "Writing to a raw block device can destroy filesystems and data.",
        GENERIC_HIGH_ROLLBACK,
    ),
    rule(
        RiskLevel::High,
        r"\breboot\b|\bshutdown\s+-h\s+now\b",
        "Reboot or shutdown affects the entire system.",
        "System will come back up after reboot; ensure services start on boot or start them manually.",
    ),
    rule(
        RiskLevel::Medium,
        r"\brm\s+-rf\b",
        "Recursive delete (rm -rf) can remove large amounts of data.",
        "Restore the deleted files from backup or snapshot.",
    ),
    rule(
        RiskLevel::Medium,
        r"\bkill\s+-9\b",
        "SIGKILL (-9) forcibly terminates processes without cleanup.",
        "Restart the killed process or the service that owns it.",
    ),
    targeted(
        RiskLevel::Medium,
        r"\bsystemctl\s+stop\b(?:\s+(?P<target>[^\s\-;&|][^\s;&|]*))?",
        "Stopping services can cause downtime.",
        "Run: systemctl start {target} to bring the service back up.",
        "<service>",
    ),
    targeted(
        RiskLevel::Medium,
        r"\bsystemctl\s+restart\b(?:\s+(?P<target>[^\s\-;&|][^\s;&|]*))?",
        "Restarting services can cause downtime.",
        "Check the service with: systemctl status {target}; revert recent configuration changes if it fails to come back.",
        "<service>",
    ),
    rule(
        RiskLevel::Medium,
        r"\bdocker\s+rm\s+-f\b",
        "Force-removing containers affects running workloads.",
        "Container is removed; recreate from image if needed (docker run ...).",
    ),
    targeted(
        RiskLevel::Medium,
        r"\bdocker\s+stop\b(?:\s+(?P<target>[^\s\-;&|][^\s;&|]*))?",
        "Stopping containers affects running workloads.",
        "Run: docker start {target} to start the container again.",
        "<container>",
    ),
    rule(
        RiskLevel::Medium,
        r"\bdelete\s+from\s+\w+",
        "SQL DELETE removes rows from a table.",
        "Restore affected rows from backup or transaction log if available.",
    ),
    rule(
        RiskLevel::Medium,
        r"\bdrop\s+table\b",
        "SQL DROP TABLE removes a table and its data.",
        "Restore the table from backup or transaction log if available.",
    ),
    rule(
        RiskLevel::Medium,
        r"\bALTER\s+TABLE\s+\w+\s+DROP\b",
        "ALTER TABLE ... DROP removes a column or constraint and its data.",
        GENERIC_MEDIUM_ROLLBACK,
    ),
];

struct CompiledRule {
    rule: &'static RiskRule,
    regex: Regex,
}

fn compiled_rules() -> &'static [CompiledRule] {
    static COMPILED: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| match Regex::new(&format!("(?i){}", rule.pattern)) {
                Ok(regex) => Some(CompiledRule { rule, regex }),
                Err(err) => {
                    error!(pattern = rule.pattern, error = %err, "invalid risk rule skipped");
                    None
                }
            })
            .collect()
    })
}

/// The ordered rule table used by [`analyze`].
pub fn rules() -> &'static [RiskRule] {
    RULES
}

/// Classifies a command. Pure and deterministic; never fails.
pub fn analyze(command: &str) -> RiskAssessment {
    let normalized = command.trim();
    if normalized.is_empty() {
        return RiskAssessment {
            level: RiskLevel::Low,
            reason: EMPTY_COMMAND_REASON.to_string(),
            rollback_suggestion: String::new(),
        };
    }

    for compiled in compiled_rules() {
        if let Some(captures) = compiled.regex.captures(normalized) {
            let rule = compiled.rule;
            let target = captures
                .name("target")
                .map(|m| m.as_str())
                .unwrap_or(rule.placeholder);
            return RiskAssessment {
                level: rule.level,
                reason: rule.reason.to_string(),
                rollback_suggestion: rule.rollback.replace("{target}", target),
            };
        }
    }

    RiskAssessment {
        level: RiskLevel::Low,
        reason: LOW_RISK_REASON.to_string(),
        rollback_suggestion: LOW_RISK_ROLLBACK.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_compiles() {
        assert_eq!(compiled_rules().len(), RULES.len());
    }

    #[test]
    fn high_rules_precede_medium_rules() {
        let first_medium = rules()
            .iter()
            .position(|r| r.level == RiskLevel::Medium)
            .expect("medium rules present");
        assert!(rules()[..first_medium]
            .iter()
            .all(|r| r.level == RiskLevel::High));
        assert!(rules()[first_medium..]
            .iter()
            .all(|r| r.level == RiskLevel::Medium));
        assert_eq!(first_medium, 12);
        assert_eq!(rules().len(), 21);
    }

    #[test]
    fn detects_high_risk() {
        let result = analyze("rm -rf /");
        assert_eq!(result.level, RiskLevel::High);
        assert!(result.reason.contains("rm -rf"));
        assert!(result.rollback_suggestion.contains("backups"));

        for command in [
            "rm -rf */",
            "lvreduce -L 10G /dev/vg0/data",
            "pvremove /dev/sdb",
            "vgremove vg0",
            "lvremove /dev/vg0/tmp",
            "mkfs.ext4 /dev/sdb1",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "DROP DATABASE app;",
            "truncate table users",
            "cat image.bin > /dev/sdb",
            "sudo reboot",
            "shutdown -h now",
        ] {
            let result = analyze(command);
            assert_eq!(result.level, RiskLevel::High, "{command}");
            assert!(!result.reason.is_empty(), "{command}");
            assert!(!result.rollback_suggestion.is_empty(), "{command}");
        }
    }

    #[test]
    fn detects_medium_risk() {
        for command in [
            "rm -rf build",
            "kill -9 4242",
            "systemctl stop nginx",
            "systemctl restart postgresql",
            "docker rm -f web",
            "docker stop web",
            "DELETE FROM sessions WHERE expired",
            "drop table audit_old",
            "alter table users drop column legacy",
        ] {
            assert_eq!(analyze(command).level, RiskLevel::Medium, "{command}");
        }
    }

    #[test]
    fn detects_low_risk() {
        let result = analyze("df -h");
        assert_eq!(result.level, RiskLevel::Low);
        assert_eq!(result.reason, LOW_RISK_REASON);
        assert_eq!(result.rollback_suggestion, LOW_RISK_ROLLBACK);
        assert_eq!(analyze("docker ps -a").level, RiskLevel::Low);
        assert_eq!(analyze("shutdown -r +5").level, RiskLevel::Low);
    }

    #[test]
    fn empty_command_is_low_with_explanation() {
        let result = analyze("   ");
        assert_eq!(result.level, RiskLevel::Low);
        assert_eq!(result.reason, EMPTY_COMMAND_REASON);
    }

    #[test]
    fn specific_delete_outranks_generic_delete() {
        assert_eq!(analyze("rm -rf /var/lib/app").level, RiskLevel::High);
        assert_eq!(analyze("rm -rf ./cache").level, RiskLevel::Medium);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(analyze("Drop Database app").level, RiskLevel::High);
        assert_eq!(analyze("SYSTEMCTL STOP nginx").level, RiskLevel::Medium);
    }

    #[test]
    fn rollback_names_stopped_unit() {
        let result = analyze("systemctl stop nginx.service");
        assert_eq!(
            result.rollback_suggestion,
            "Run: systemctl start nginx.service to bring the service back up."
        );
        let result = analyze("systemctl stop");
        assert!(result.rollback_suggestion.contains("<service>"));
        let result = analyze("docker stop api && docker ps");
        assert_eq!(
            result.rollback_suggestion,
            "Run: docker start api to start the container again."
        );
    }

    #[test]
    fn database_drop_suggests_restore() {
        let result = analyze("psql -c 'drop database billing'");
        assert_eq!(result.level, RiskLevel::High);
        assert!(result.rollback_suggestion.contains("backup"));
    }

    #[test]
    fn analysis_is_deterministic() {
        assert_eq!(analyze("kill -9 1"), analyze("kill -9 1"));
    }
}
