//! Endpoint lists produced by the discovery step.
//!
//! Discovery itself (listing pods through the cluster API) happens
//! elsewhere; this module only reads its output and narrows it down to what
//! the scheduler should see.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::InventoryError;
use crate::types::Endpoint;

/// Which discovered endpoints to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    AllPods,
    Namespace(String),
}

/// Parse an endpoint list.
///
/// Two formats are accepted:
/// - a JSON array of endpoint objects (`{"ip": .., "port": .., "namespace": .., "pod_name": ..}`)
/// - one endpoint per line: `ip:port [namespace] [pod]`, IPv6 as `[addr]:port`;
///   everything after `#` is ignored, blank lines are skipped.
///
/// Order is preserved; duplicates are kept (see [`dedup_endpoints`]).
pub fn parse_endpoints_str(s: &str) -> Result<Vec<Endpoint>, InventoryError> {
    if s.trim_start().starts_with('[') {
        let eps: Vec<Endpoint> = serde_json::from_str(s)?;
        if let Some(bad) = eps.iter().position(|e| e.port == 0) {
            return Err(InventoryError::BadLine {
                line: bad + 1,
                reason: "port 0 is not scannable".to_string(),
            });
        }
        return Ok(eps);
    }

    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let addr_str = fields.next().unwrap_or_default();
        let addr: SocketAddr = addr_str.parse().map_err(|_| InventoryError::BadLine {
            line: line_no,
            reason: format!("invalid address (want ip:port): {addr_str}"),
        })?;
        if addr.port() == 0 {
            return Err(InventoryError::BadLine {
                line: line_no,
                reason: "port 0 is not scannable".to_string(),
            });
        }
        let namespace = fields.next().map(str::to_string);
        let pod_name = fields.next().map(str::to_string);
        if fields.next().is_some() {
            return Err(InventoryError::BadLine {
                line: line_no,
                reason: "too many fields (want ip:port [namespace] [pod])".to_string(),
            });
        }
        out.push(Endpoint {
            ip: addr.ip(),
            port: addr.port(),
            namespace,
            pod_name,
        });
    }
    Ok(out)
}

/// Load an endpoint list from a file, or from stdin when `path` is `-`.
pub fn load_endpoints_from_path(path: impl AsRef<Path>) -> Result<Vec<Endpoint>> {
    let path = path.as_ref();
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read endpoints from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read endpoints file: {}", path.display()))?
    };
    parse_endpoints_str(&content)
        .with_context(|| format!("failed to parse endpoints from {}", path.display()))
}

/// Keep the endpoints matching `selection`, in input order.
pub fn select(endpoints: Vec<Endpoint>, selection: &Selection) -> Vec<Endpoint> {
    match selection {
        Selection::AllPods => endpoints,
        Selection::Namespace(ns) => endpoints
            .into_iter()
            .filter(|e| e.namespace.as_deref() == Some(ns.as_str()))
            .collect(),
    }
}

/// Drop repeated `(ip, port)` pairs, keeping the first occurrence.
pub fn dedup_endpoints(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    endpoints
        .into_iter()
        .filter(|e| seen.insert(e.key()))
        .collect()
}

/// Keep only the first `limit` endpoints; the rest are not scanned at all.
pub fn apply_limit(mut endpoints: Vec<Endpoint>, limit: Option<usize>) -> Vec<Endpoint> {
    if let Some(cap) = limit {
        endpoints.truncate(cap);
    }
    endpoints
}
