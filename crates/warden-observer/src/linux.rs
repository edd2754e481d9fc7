use regex::Regex;
use std::sync::OnceLock;
use warden_core_domain::{DiskUsage, LinuxPart, MemoryInfo, RawLinuxOutputs, UptimeInfo};
use warden_ssh::{CommandOutcome, RemoteTarget, SshClient};

use crate::{cached_regex, successful_stdout};

pub const DF_COMMAND: &str = "df -h";
pub const FREE_COMMAND: &str = "free -m";
pub const UPTIME_COMMAND: &str = "uptime";
pub const CPU_COMMAND: &str = "LC_ALL=C top -bn1 | grep 'Cpu(s)'";

static DF_LINE: OnceLock<Option<Regex>> = OnceLock::new();
static USE_PERCENT: OnceLock<Option<Regex>> = OnceLock::new();
static FREE_MEM: OnceLock<Option<Regex>> = OnceLock::new();
static FREE_SWAP: OnceLock<Option<Regex>> = OnceLock::new();
static LOAD_AVG: OnceLock<Option<Regex>> = OnceLock::new();
static CPU_IDLE: OnceLock<Option<Regex>> = OnceLock::new();
static CPU_USER: OnceLock<Option<Regex>> = OnceLock::new();
static CPU_SYSTEM: OnceLock<Option<Regex>> = OnceLock::new();

/// Collects disk, memory, uptime and CPU figures. Each command is parsed only
/// when it exited 0; the part error is set only when every command failed
/// to reach the host.
pub fn capture_linux<C: SshClient + ?Sized>(client: &C, target: &RemoteTarget) -> LinuxPart {
    let df = client.execute(target, DF_COMMAND);
    let free = client.execute(target, FREE_COMMAND);
    let uptime = client.execute(target, UPTIME_COMMAND);
    let cpu = client.execute(target, CPU_COMMAND);

    let outcomes = [&df, &free, &uptime, &cpu];
    if outcomes.iter().all(|o| o.is_transport_failure()) {
        tracing::warn!(host = %target.host, "linux snapshot unreachable");
        return LinuxPart {
            error: Some(format!(
                "Linux snapshot unavailable (SSH not configured or connection failed): {}",
                df.stderr.trim()
            )),
            ..LinuxPart::default()
        };
    }

    let mut part = LinuxPart {
        raw: RawLinuxOutputs {
            df: raw_stdout(&df),
            free: raw_stdout(&free),
            uptime: raw_stdout(&uptime),
            cpu: raw_stdout(&cpu),
        },
        ..LinuxPart::default()
    };
    if let Some(out) = successful_stdout(&df) {
        part.disks = parse_df(out);
    }
    if let Some(out) = successful_stdout(&free) {
        part.memory = parse_free(out);
    }
    if let Some(out) = successful_stdout(&uptime) {
        part.uptime = parse_uptime(out);
    }
    if let Some(out) = successful_stdout(&cpu) {
        part.cpu_usage_percent = parse_cpu_usage(out);
    }
    part
}

fn raw_stdout(outcome: &CommandOutcome) -> Option<String> {
    (!outcome.is_transport_failure()).then(|| outcome.stdout.clone())
}

/// Parses `df -h` output. Rows whose fifth column is not a literal `NN%`
/// (the header included) are dropped.
pub fn parse_df(output: &str) -> Vec<DiskUsage> {
    let (Some(line_re), Some(percent_re)) = (
        cached_regex(&DF_LINE, r"^(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(.*)$"),
        cached_regex(&USE_PERCENT, r"^\d+%$"),
    ) else {
        return Vec::new();
    };

    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line_re.captures(line))
        .filter(|caps| percent_re.is_match(&caps[5]))
        .map(|caps| DiskUsage {
            filesystem: caps[1].to_string(),
            size: caps[2].to_string(),
            used: caps[3].to_string(),
            avail: caps[4].to_string(),
            use_percent: caps[5].to_string(),
            mounted_on: caps[6].trim().to_string(),
        })
        .collect()
}

/// Parses `free -m`. The `Mem:` line needs all six numeric columns or the
/// physical figures stay zero; `Swap:` is read independently.
pub fn parse_free(output: &str) -> MemoryInfo {
    let mut memory = MemoryInfo::default();

    let mem_re = cached_regex(
        &FREE_MEM,
        r"Mem:\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)",
    );
    if let Some(caps) = mem_re.and_then(|re| re.captures(output)) {
        let fields = (
            caps[1].parse::<u64>(),
            caps[2].parse::<u64>(),
            caps[3].parse::<u64>(),
            caps[6].parse::<u64>(),
        );
        if let (Ok(total), Ok(used), Ok(free), Ok(available)) = fields {
            memory.total_mb = total;
            memory.used_mb = used;
            memory.free_mb = free;
            memory.available_mb = available;
        }
    }

    let swap_re = cached_regex(&FREE_SWAP, r"Swap:\s+(\d+)\s+(\d+)\s+(\d+)");
    if let Some(caps) = swap_re.and_then(|re| re.captures(output)) {
        let fields = (
            caps[1].parse::<u64>(),
            caps[2].parse::<u64>(),
            caps[3].parse::<u64>(),
        );
        if let (Ok(total), Ok(used), Ok(free)) = fields {
            memory.swap_total_mb = total;
            memory.swap_used_mb = used;
            memory.swap_free_mb = free;
        }
    }

    memory
}

pub fn parse_uptime(output: &str) -> UptimeInfo {
    let mut uptime = UptimeInfo {
        raw: output.trim().to_string(),
        ..UptimeInfo::default()
    };
    let load_re = cached_regex(
        &LOAD_AVG,
        r"load averages?:\s*(\d+(?:[.,]\d+)?)(?:\s*,\s*|\s+)(\d+(?:[.,]\d+)?)(?:\s*,\s*|\s+)(\d+(?:[.,]\d+)?)",
    );
    if let Some(caps) = load_re.and_then(|re| re.captures(output)) {
        uptime.load1 = parse_load(&caps[1]);
        uptime.load5 = parse_load(&caps[2]);
        uptime.load15 = parse_load(&caps[3]);
    }
    uptime
}

// Some locales print "0,52" for a load figure.
fn parse_load(field: &str) -> Option<f64> {
    field.replace(',', ".").parse::<f64>().ok()
}

/// Derives CPU usage from a `top` summary line: `100 - idle` when an idle
/// field exists, else `user + system`, else `None`. Always within [0, 100].
pub fn parse_cpu_usage(output: &str) -> Option<f64> {
    let sanitized = output.replace(',', ".").to_lowercase();

    let idle_re = cached_regex(&CPU_IDLE, r"(\d+(?:\.\d+)?)\s*%?\s*id");
    if let Some(idle) = idle_re.and_then(|re| capture_f64(re, &sanitized)) {
        return Some((100.0 - idle).clamp(0.0, 100.0));
    }

    let user_re = cached_regex(&CPU_USER, r"(\d+(?:\.\d+)?)\s*%?\s*us");
    let system_re = cached_regex(&CPU_SYSTEM, r"(\d+(?:\.\d+)?)\s*%?\s*sy");
    let user = user_re.and_then(|re| capture_f64(re, &sanitized))?;
    let system = system_re.and_then(|re| capture_f64(re, &sanitized))?;
    Some((user + system).clamp(0.0, 100.0))
}

fn capture_f64(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
