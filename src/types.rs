use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A scan target as handed over by the discovery step.
///
/// Identity is the `(ip, port)` pair; namespace and pod are annotations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            namespace: None,
            pod_name: None,
        }
    }

    pub fn with_pod(mut self, namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self.pod_name = Some(pod_name.into());
        self
    }

    /// Uniqueness and ordering key.
    pub fn key(&self) -> (IpAddr, u16) {
        (self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// One cipher suite accepted for a protocol version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    /// Name exactly as reported by the probe tool.
    pub name: String,
    /// Standard IANA suite name, only when a known mapping exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iana_name: Option<String>,
    /// Probe-assigned grade (A..F), passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<String>,
}

impl Cipher {
    /// Preferred display name: IANA when known, else the reported name.
    pub fn display_name(&self) -> &str {
        self.iana_name.as_deref().unwrap_or(&self.name)
    }
}

/// TLS findings for one endpoint, projected from the probe document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_product: Option<String>,
    /// Transport protocol of the port (`tcp` / `udp`).
    pub protocol: String,
    /// Every open port the probe reported for the host.
    pub open_ports: Vec<u16>,
    /// Protocol version label (`TLSv1.2`, ...) to the ciphers accepted, in probe order.
    /// A version with no ciphers means TLS was detected but not enumerated.
    pub tls_versions: BTreeMap<String, Vec<Cipher>>,
    /// Per-version `client` / `server` preference when reported.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cipher_preference: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub least_strength: Option<String>,
}

/// A local process listening on a port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessInfo {
    pub port: u16,
    pub pid: u32,
    pub process_name: String,
}

/// Outcome of scanning a single endpoint. Exactly one per result.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    NoTlsDetected,
    Timeout,
    Unreachable,
    ParseError,
    LaunchError,
    /// The run was cancelled before this endpoint produced an outcome.
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Success,
        Status::NoTlsDetected,
        Status::Timeout,
        Status::Unreachable,
        Status::ParseError,
        Status::LaunchError,
        Status::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::NoTlsDetected => "no_tls_detected",
            Status::Timeout => "timeout",
            Status::Unreachable => "unreachable",
            Status::ParseError => "parse_error",
            Status::LaunchError => "launch_error",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command line and raw output of the probe, kept for the log stream only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub command: String,
    pub raw_output: String,
}

/// Per-endpoint result entry.
///
/// `record` is present if and only if `status == Success`; use the
/// constructors to keep that true.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub endpoint: Endpoint,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ScanRecord>,
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub transcript: Option<Transcript>,
}

impl ScanResult {
    pub fn success(record: ScanRecord, processes: Vec<ProcessInfo>) -> Self {
        Self {
            endpoint: record.endpoint.clone(),
            status: Status::Success,
            record: Some(record),
            processes,
            error: None,
            elapsed_ms: 0,
            transcript: None,
        }
    }

    /// Any non-success outcome. `status` must not be `Success`.
    pub fn failure(endpoint: Endpoint, status: Status, error: Option<String>) -> Self {
        debug_assert!(status != Status::Success, "failure() called with Success");
        Self {
            endpoint,
            status,
            record: None,
            processes: Vec::new(),
            error,
            elapsed_ms: 0,
            transcript: None,
        }
    }

    pub fn cancelled(endpoint: Endpoint) -> Self {
        Self::failure(
            endpoint,
            Status::Cancelled,
            Some("run cancelled before the endpoint completed".to_string()),
        )
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }
}

/// Counts per status.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: u64,
    pub by_status: BTreeMap<Status, u64>,
}

impl Summary {
    pub fn from_results(results: &[ScanResult]) -> Self {
        let mut by_status = BTreeMap::new();
        for r in results {
            *by_status.entry(r.status).or_insert(0u64) += 1;
        }
        Self {
            total: results.len() as u64,
            by_status,
        }
    }

    pub fn count(&self, status: Status) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Finalized output of one run, sorted by (ip, port).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Report {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Whether the run was cut short by cancellation or the global deadline.
    pub cancelled: bool,
    pub summary: Summary,
    pub results: Vec<ScanResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn endpoint_display_brackets_v6() {
        let v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443);
        assert_eq!(v4.to_string(), "10.0.0.1:443");
        let v6 = Endpoint::new("::1".parse().unwrap(), 6443);
        assert_eq!(v6.to_string(), "[::1]:6443");
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&Status::NoTlsDetected).unwrap();
        assert_eq!(s, "\"no_tls_detected\"");
        for st in Status::ALL {
            let json = serde_json::to_string(&st).unwrap();
            assert_eq!(json, format!("\"{}\"", st.as_str()));
        }
    }

    #[test]
    fn summary_counts_only_seen_statuses() {
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let results = vec![
            ScanResult::failure(ep.clone(), Status::Timeout, None),
            ScanResult::failure(ep.clone(), Status::Timeout, None),
            ScanResult::cancelled(ep),
        ];
        let s = Summary::from_results(&results);
        assert_eq!(s.total, 3);
        assert_eq!(s.count(Status::Timeout), 2);
        assert_eq!(s.count(Status::Cancelled), 1);
        assert_eq!(s.count(Status::Success), 0);
        assert_eq!(s.by_status.len(), 2);
    }

    #[test]
    fn failure_has_no_record() {
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
        let r = ScanResult::failure(ep, Status::ParseError, Some("bad".into()));
        assert!(r.record.is_none());
        assert_eq!(r.error.as_deref(), Some("bad"));
    }
}
