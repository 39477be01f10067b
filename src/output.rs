//! Report writers: JSON, CSV, the per-endpoint log stream and a terminal summary.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;

use crate::types::{Report, ScanResult, Status};

pub const CSV_HEADER: [&str; 13] = [
    "ip",
    "port",
    "namespace",
    "pod",
    "status",
    "service",
    "protocol",
    "tls_version",
    "cipher",
    "cipher_name",
    "strength",
    "processes",
    "error",
];

pub fn write_json(path: &Path, report: &Report) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create JSON file: {}", path.display()))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, report)?;
    w.flush()?;
    Ok(())
}

pub fn write_csv(path: &Path, report: &Report) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create CSV file: {}", path.display()))?;
    render_csv(report, BufWriter::new(file))
}

/// One row per (endpoint, version, cipher) for successful scans; one
/// summary row with empty TLS fields for everything else.
pub fn render_csv<W: Write>(report: &Report, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(CSV_HEADER)?;

    for r in &report.results {
        let ip = r.endpoint.ip.to_string();
        let port = r.endpoint.port.to_string();
        let namespace = r.endpoint.namespace.as_deref().unwrap_or("");
        let pod = r.endpoint.pod_name.as_deref().unwrap_or("");
        let processes = format_processes(r);
        let error = r.error.as_deref().unwrap_or("");

        let Some(rec) = r.record.as_ref().filter(|_| r.status == Status::Success) else {
            wtr.write_record([
                ip.as_str(),
                port.as_str(),
                namespace,
                pod,
                r.status.as_str(),
                "",
                "",
                "",
                "",
                "",
                "",
                processes.as_str(),
                error,
            ])?;
            continue;
        };

        let service = rec.service_name.as_deref().unwrap_or("");
        for (version, ciphers) in &rec.tls_versions {
            if ciphers.is_empty() {
                wtr.write_record([
                    ip.as_str(),
                    port.as_str(),
                    namespace,
                    pod,
                    r.status.as_str(),
                    service,
                    rec.protocol.as_str(),
                    version.as_str(),
                    "",
                    "",
                    "",
                    processes.as_str(),
                    error,
                ])?;
                continue;
            }
            for c in ciphers {
                wtr.write_record([
                    ip.as_str(),
                    port.as_str(),
                    namespace,
                    pod,
                    r.status.as_str(),
                    service,
                    rec.protocol.as_str(),
                    version.as_str(),
                    c.display_name(),
                    c.name.as_str(),
                    c.strength.as_deref().unwrap_or(""),
                    processes.as_str(),
                    error,
                ])?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

fn format_processes(r: &ScanResult) -> String {
    r.processes
        .iter()
        .map(|p| format!("{}({})", p.process_name, p.pid))
        .collect::<Vec<_>>()
        .join(";")
}

/// `(ip, port, tls_version, cipher)` points in a report, cipher by display name.
pub fn data_points(report: &Report) -> BTreeSet<(String, u16, String, String)> {
    let mut out = BTreeSet::new();
    for r in &report.results {
        let Some(rec) = &r.record else { continue };
        for (version, ciphers) in &rec.tls_versions {
            for c in ciphers {
                out.insert((
                    r.endpoint.ip.to_string(),
                    r.endpoint.port,
                    version.clone(),
                    c.display_name().to_string(),
                ));
            }
        }
    }
    out
}

pub fn write_log(path: &Path, report: &Report) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create log file: {}", path.display()))?;
    let mut w = BufWriter::new(file);
    render_log(report, &mut w)?;
    w.flush()?;
    Ok(())
}

/// Human-readable log: one block per endpoint with the command, the raw
/// probe output and what was extracted from it.
pub fn render_log<W: Write>(report: &Report, out: &mut W) -> Result<()> {
    writeln!(
        out,
        "scan started {} finished {}{}",
        report.started_at.format(&Rfc3339)?,
        report.finished_at.format(&Rfc3339)?,
        if report.cancelled { " (cancelled)" } else { "" }
    )?;

    for r in &report.results {
        writeln!(out)?;
        match (&r.endpoint.namespace, &r.endpoint.pod_name) {
            (Some(ns), Some(pod)) => writeln!(out, "=== {} ({ns}/{pod}) ===", r.endpoint)?,
            (Some(ns), None) => writeln!(out, "=== {} ({ns}) ===", r.endpoint)?,
            _ => writeln!(out, "=== {} ===", r.endpoint)?,
        }
        match &r.transcript {
            Some(t) => {
                writeln!(out, "command: {}", t.command)?;
                writeln!(out, "--- raw output ---")?;
                if t.raw_output.trim().is_empty() {
                    writeln!(out, "(none)")?;
                } else {
                    writeln!(out, "{}", t.raw_output.trim_end())?;
                }
            }
            None => writeln!(out, "command: (not run)")?,
        }
        writeln!(out, "--- findings ---")?;
        writeln!(out, "status: {} ({} ms)", r.status, r.elapsed_ms)?;
        if let Some(err) = &r.error {
            writeln!(out, "error: {err}")?;
        }
        if let Some(rec) = &r.record {
            writeln!(
                out,
                "service: {} ({})",
                rec.service_name.as_deref().unwrap_or("unknown"),
                rec.protocol
            )?;
            for (version, ciphers) in &rec.tls_versions {
                writeln!(out, "{version}: {} cipher(s)", ciphers.len())?;
                for c in ciphers {
                    writeln!(
                        out,
                        "  {} [{}]",
                        c.display_name(),
                        c.strength.as_deref().unwrap_or("?")
                    )?;
                }
            }
        }
        if !r.processes.is_empty() {
            writeln!(out, "processes: {}", format_processes(r))?;
        }
    }
    Ok(())
}

/// Print status counts and a compact per-endpoint table to stdout.
pub fn print_summary(report: &Report) {
    let summary = &report.summary;
    let counts: Vec<String> = summary
        .by_status
        .iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!(
        "\nEndpoints: {} ({}){}",
        summary.total,
        counts.join(", "),
        if report.cancelled { " [cancelled]" } else { "" }
    );

    let mut ep_w = "endpoint".len();
    let mut status_w = "status".len();
    for r in &report.results {
        ep_w = ep_w.max(r.endpoint.to_string().len());
        status_w = status_w.max(r.status.as_str().len());
    }

    println!(
        "{:<ep_w$}  {:<status_w$}  {:<24}  {:>7}",
        "endpoint",
        "status",
        "versions",
        "ciphers",
        ep_w = ep_w,
        status_w = status_w
    );
    println!(
        "{:-<ep_w$}  {:-<status_w$}  {:-<24}  {:-<7}",
        "",
        "",
        "",
        "",
        ep_w = ep_w,
        status_w = status_w
    );
    for r in &report.results {
        let (versions, ciphers) = match &r.record {
            Some(rec) => (
                rec.tls_versions.keys().cloned().collect::<Vec<_>>().join(","),
                rec.tls_versions.values().map(Vec::len).sum::<usize>(),
            ),
            None => (String::new(), 0),
        };
        println!(
            "{:<ep_w$}  {:<status_w$}  {:<24}  {:>7}",
            r.endpoint.to_string(),
            r.status.as_str(),
            versions,
            ciphers,
            ep_w = ep_w,
            status_w = status_w
        );
    }
}
