//! Projection of the probe tool's XML report into typed findings.
//!
//! Expected shape (nmap `-oX`):
//!
//! ```text
//! nmaprun
//!   host
//!     status[@state]
//!     ports
//!       port[@protocol, @portid]
//!         state[@state]
//!         service[@name, @product, @tunnel]
//!         script[@id="ssl-enum-ciphers"]
//!           table[@key="TLSv1.2"]
//!             table[@key="ciphers"]
//!               table
//!                 elem[@key="name"]      TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
//!                 elem[@key="strength"]  A
//!             elem[@key="cipher preference"]  server
//!           elem[@key="least strength"]  A
//! ```
//!
//! Anything missing from that shape is simply not reported; only a document
//! that is not XML at all, or not an nmap report, is a [`ParseError`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::ciphers;
use crate::error::ParseError;
use crate::types::{Cipher, Endpoint, ScanRecord};
use crate::xmltree::{self, Node};

pub const TLS_SCRIPT_ID: &str = "ssl-enum-ciphers";

/// What a well-formed probe report says about an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Findings {
    /// TLS versions (and usually ciphers) were enumerated.
    Tls(ScanRecord),
    /// Ports are open but none carried a TLS enumeration result.
    NoTls {
        open_ports: Vec<u16>,
        service_name: Option<String>,
    },
    /// The host is down or no port is open.
    NoOpenPorts { reason: String },
}

/// Parse raw probe stdout for `endpoint`.
pub fn parse_probe_output(endpoint: &Endpoint, raw: &str) -> Result<Findings, ParseError> {
    parse_probe_output_for(endpoint, raw, TLS_SCRIPT_ID)
}

/// Same as [`parse_probe_output`] with a custom TLS script id.
pub fn parse_probe_output_for(
    endpoint: &Endpoint,
    raw: &str,
    script_id: &str,
) -> Result<Findings, ParseError> {
    let root = xmltree::parse_document(raw)?;
    if root.name != "nmaprun" {
        return Err(ParseError::new(
            format!("unexpected root element <{}>, want <nmaprun>", root.name),
            raw,
        ));
    }
    Ok(project(endpoint, &root, script_id))
}

fn project(endpoint: &Endpoint, root: &Node, script_id: &str) -> Findings {
    let mut open_ports = BTreeSet::new();
    let mut open_nodes: Vec<&Node> = Vec::new();
    let mut hosts_seen = 0usize;
    let mut last_state: Option<String> = None;

    for host in root.children_named("host") {
        hosts_seen += 1;
        if host.child("status").and_then(|s| s.attr("state")) == Some("down") {
            last_state = Some("host down".to_string());
            continue;
        }
        let Some(ports) = host.child("ports") else {
            continue;
        };
        for port in ports.children_named("port") {
            let state = port.child("state").and_then(|s| s.attr("state"));
            let Some(portid) = port.attr("portid").and_then(|p| p.trim().parse::<u16>().ok())
            else {
                continue;
            };
            if state == Some("open") {
                open_ports.insert(portid);
                open_nodes.push(port);
            } else if let Some(state) = state {
                last_state = Some(format!("port {portid} {state}"));
            }
        }
    }

    if open_nodes.is_empty() {
        let reason = match (hosts_seen, last_state) {
            (0, _) => "probe reported no hosts".to_string(),
            (_, Some(state)) => state,
            (_, None) => "no open ports reported".to_string(),
        };
        return Findings::NoOpenPorts { reason };
    }

    let target = open_nodes
        .iter()
        .copied()
        .filter(|p| port_number(p) == Some(endpoint.port))
        .find_map(|p| tls_script(p, script_id).map(|s| (p, s)))
        .or_else(|| {
            open_nodes
                .iter()
                .copied()
                .find_map(|p| tls_script(p, script_id).map(|s| (p, s)))
        });

    let open_ports: Vec<u16> = open_ports.into_iter().collect();
    let Some((port, script)) = target else {
        let service_name = open_nodes
            .iter()
            .find(|p| port_number(p) == Some(endpoint.port))
            .or_else(|| open_nodes.first())
            .and_then(|p| service_name(p));
        return Findings::NoTls {
            open_ports,
            service_name,
        };
    };

    let mut tls_versions = BTreeMap::new();
    let mut cipher_preference = BTreeMap::new();
    for version in script.children_named("table") {
        let Some(label) = version.attr("key").filter(|k| is_version_label(k)) else {
            continue;
        };
        tls_versions.insert(label.to_string(), version_ciphers(version));
        if let Some(pref) = elem_text(version, "cipher preference") {
            cipher_preference.insert(label.to_string(), pref);
        }
    }

    if tls_versions.is_empty() {
        return Findings::NoTls {
            open_ports,
            service_name: service_name(port),
        };
    }

    Findings::Tls(ScanRecord {
        endpoint: endpoint.clone(),
        service_name: service_name(port),
        service_product: port
            .child("service")
            .and_then(|s| s.attr("product"))
            .map(str::to_string),
        protocol: port.attr("protocol").unwrap_or("tcp").to_string(),
        open_ports,
        tls_versions,
        cipher_preference,
        least_strength: elem_text(script, "least strength"),
    })
}

fn port_number(port: &Node) -> Option<u16> {
    port.attr("portid")?.trim().parse().ok()
}

fn tls_script<'a>(port: &'a Node, script_id: &str) -> Option<&'a Node> {
    port.children_named("script")
        .find(|s| s.attr("id") == Some(script_id))
}

fn is_version_label(key: &str) -> bool {
    key.starts_with("TLSv") || key.starts_with("SSLv") || key.starts_with("DTLSv")
}

/// nmap prints `ssl/http` for TLS-wrapped services.
fn service_name(port: &Node) -> Option<String> {
    let service = port.child("service")?;
    let name = service.attr("name").filter(|n| !n.is_empty())?;
    if service.attr("tunnel") == Some("ssl") && !name.starts_with("ssl/") {
        Some(format!("ssl/{name}"))
    } else {
        Some(name.to_string())
    }
}

fn elem_text(node: &Node, key: &str) -> Option<String> {
    node.keyed("elem", key)
        .map(|e| e.text.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Ciphers in document order; unnamed entries are skipped, repeats keep the first.
fn version_ciphers(version: &Node) -> Vec<Cipher> {
    let Some(table) = version.keyed("table", "ciphers") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in table.children_named("table") {
        let Some(name) = elem_text(entry, "name") else {
            continue;
        };
        if !seen.insert(name.clone()) {
            continue;
        }
        out.push(Cipher {
            iana_name: ciphers::iana_name(&name).map(str::to_string),
            strength: elem_text(entry, "strength"),
            name,
        });
    }
    out
}
