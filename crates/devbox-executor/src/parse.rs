//! Parsers for `pct`, `vzdump` and in-container tool output.

use devbox_common::{AdapterError, AdapterErrorKind, AdapterResult, ContainerSummary, ObservedStatus};
use std::net::IpAddr;

fn parse_error(detail: impl Into<String>) -> AdapterError {
    AdapterError::new(AdapterErrorKind::Parse, detail)
}

/// Parse `pct list`. The `Lock` column is blank for unlocked containers.
pub fn parse_pct_list(stdout: &str) -> AdapterResult<Vec<ContainerSummary>> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0] == "VMID" {
            continue;
        }
        let (id, status, lock, name) = match fields.as_slice() {
            [id, status, name] => (id, status, None, *name),
            [id, status, lock, name, ..] => (id, status, Some(lock.to_string()), *name),
            _ => return Err(parse_error(format!("unexpected pct list row: {line}"))),
        };
        let id = id
            .parse()
            .map_err(|_| parse_error(format!("invalid VMID in pct list row: {line}")))?;
        rows.push(ContainerSummary {
            id,
            status: ObservedStatus::parse(status),
            name: name.to_string(),
            lock,
        });
    }
    Ok(rows)
}

/// Parse `pct status <id>`, e.g. `status: running`.
pub fn parse_pct_status(stdout: &str) -> AdapterResult<ObservedStatus> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(ObservedStatus::parse)
        .ok_or_else(|| parse_error(format!("no status line in: {}", stdout.trim())))
}

/// First `inet <addr>/<prefix>` in `ip addr` output.
pub fn parse_inet_address(stdout: &str) -> Option<IpAddr> {
    let mut tokens = stdout.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "inet" {
            let cidr = tokens.next()?;
            let addr = cidr.split('/').next()?;
            if let Ok(ip) = addr.parse() {
                return Some(ip);
            }
        }
    }
    None
}

/// Busy CPU percentage from one `top -bn1` frame, derived from the idle figure.
///
/// Handles procps (`%Cpu(s): 1.2 us, ... 97.5 id, ...`) and busybox
/// (`CPU:  2% usr ... 96% idle ...`) summary lines.
pub fn parse_cpu_usage(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("%Cpu") || line.starts_with("Cpu(s)") {
            let summary = line.split_once(':')?.1;
            for part in summary.split(',') {
                let mut words = part.split_whitespace();
                if let (Some(value), Some("id")) = (words.next(), words.next()) {
                    let idle: f64 = value.parse().ok()?;
                    return Some(clamp_percent(100.0 - idle));
                }
            }
        } else if line.starts_with("CPU:") {
            let words: Vec<&str> = line.split_whitespace().collect();
            for pair in words.windows(2) {
                if pair[1] == "idle" {
                    let idle: f64 = pair[0].trim_end_matches('%').parse().ok()?;
                    return Some(clamp_percent(100.0 - idle));
                }
            }
        }
    }
    None
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// `(used, total)` bytes from the `Mem:` row of `free -b`.
pub fn parse_free_bytes(stdout: &str) -> Option<(u64, u64)> {
    let line = stdout.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let used = fields.get(2)?.parse().ok()?;
    Some((used, total))
}

/// `(used, total)` bytes from `df -B1 /`.
pub fn parse_df_bytes(stdout: &str) -> Option<(u64, u64)> {
    let line = stdout
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with("Filesystem"))
        .last()?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.trim_end_matches('B').parse().ok()?;
    let used = fields.get(2)?.trim_end_matches('B').parse().ok()?;
    Some((used, total))
}

/// Ordered `key: value` pairs from `pct config`. Snapshot sections are ignored.
pub fn parse_pct_config(stdout: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            break;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    entries
}

/// Archive path from vzdump's `creating ... archive '<path>'` log line.
pub fn parse_vzdump_archive(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.contains("creating"))
        .find_map(|line| {
            let start = line.find("archive '")? + "archive '".len();
            let rest = &line[start..];
            let end = rest.find('\'')?;
            Some(rest[..end].to_string())
        })
}
