//! Local listening-socket lookup: which process owns a scanned port.
//!
//! Purely diagnostic. Every failure here collapses to "no process info".

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ListerConfig;
use crate::probe::{run_bounded, Exit};
use crate::types::ProcessInfo;

/// Parse a listing of listening sockets.
///
/// Understands `lsof -nP -iTCP -sTCP:LISTEN` rows
/// (`COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME (LISTEN)`) and
/// `ss -ltnpH` rows (`... users:(("name",pid=N,fd=M))`). Rows that fit
/// neither are ignored. Output is deduplicated and sorted by (port, pid).
pub fn parse_listing(output: &str) -> Vec<ProcessInfo> {
    let mut out = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("users:((") {
            out.extend(parse_ss_line(line));
        } else if let Some(info) = parse_lsof_line(line) {
            out.insert(info);
        }
    }
    out.into_iter().collect()
}

fn parse_lsof_line(line: &str) -> Option<ProcessInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let pid: u32 = fields[1].parse().ok()?;
    let (name_field, state) = match fields.last() {
        Some(last) if last.starts_with('(') => (fields[fields.len() - 2], Some(*last)),
        _ => (fields[fields.len() - 1], None),
    };
    if state.is_some_and(|s| s != "(LISTEN)") || name_field.contains("->") {
        return None;
    }
    Some(ProcessInfo {
        port: port_of(name_field)?,
        pid,
        process_name: fields[0].replace("\\x20", " "),
    })
}

fn parse_ss_line(line: &str) -> Vec<ProcessInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // State Recv-Q Send-Q Local Peer Process
    let local = match fields.first() {
        Some(f) if f.parse::<u64>().is_ok() => fields.get(2),
        _ => fields.get(3),
    };
    let Some(port) = local.and_then(|l| port_of(l)) else {
        return Vec::new();
    };
    let Some(users_at) = line.find("users:((") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut rest = &line[users_at + "users:(".len()..];
    while let Some(open) = rest.find("(\"") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('"') else { break };
        let name = &after[..close];
        let tail = &after[close + 1..];
        let entry_end = tail.find(')').unwrap_or(tail.len());
        let entry = &tail[..entry_end];
        let pid = entry
            .split(',')
            .find_map(|kv| kv.trim().strip_prefix("pid="))
            .and_then(|p| p.parse::<u32>().ok());
        if let Some(pid) = pid {
            out.push(ProcessInfo {
                port,
                pid,
                process_name: name.to_string(),
            });
        }
        rest = &tail[entry_end..];
    }
    out
}

/// Port after the last `:` of `addr:port`, `*:port` or `[v6]:port`.
fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    port.parse().ok().filter(|p| *p != 0)
}

/// Keep the entries whose port is one of `ports`. Matching is by port number only.
pub fn match_ports(listing: &[ProcessInfo], ports: &[u16]) -> Vec<ProcessInfo> {
    listing
        .iter()
        .filter(|p| ports.contains(&p.port))
        .cloned()
        .collect()
}

/// Runs the listing tool and maps ports to processes.
#[derive(Debug, Clone)]
pub struct ProcessLister {
    cfg: ListerConfig,
    max_output_bytes: usize,
}

impl ProcessLister {
    pub fn new(cfg: ListerConfig, max_output_bytes: usize) -> Self {
        Self {
            cfg,
            max_output_bytes,
        }
    }

    /// Processes listening on any of `ports`. Empty on any failure.
    pub async fn processes_for(&self, ports: &[u16], cancel: &CancellationToken) -> Vec<ProcessInfo> {
        if ports.is_empty() {
            return Vec::new();
        }
        let out = match run_bounded(
            &self.cfg.program,
            &self.cfg.args,
            self.cfg.timeout,
            self.max_output_bytes,
            cancel,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                debug!(program = %self.cfg.program, error = %e, "process lister unavailable");
                return Vec::new();
            }
        };
        match out.exit {
            Exit::Completed(status) if status.success() => {}
            other => {
                debug!(program = %self.cfg.program, exit = ?other, "process lister did not complete");
                return Vec::new();
            }
        }
        match_ports(&parse_listing(&out.stdout), ports)
    }
}
