use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tls_posture_scan::config::{ListerConfig, ProbeToolConfig, ScanConfig};
use tls_posture_scan::error::ConfigError;
use tls_posture_scan::inventory::{self, Selection};
use tls_posture_scan::types::Report;
use tls_posture_scan::{output, scanner};

/// tls-posture-scan: probe cluster endpoints for TLS versions, cipher suites and owning processes.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tls-posture-scan",
    version,
    about = "Probe cluster endpoints for open ports, TLS versions, cipher suites and listening processes.",
    long_about = None
)]
struct Cli {
    /// Endpoint list from discovery: JSON array or `ip:port [namespace] [pod]` lines. `-` reads stdin.
    #[arg(long)]
    endpoints: PathBuf,

    /// Scan every discovered pod endpoint.
    #[arg(long = "all-pods", default_value_t = false)]
    all_pods: bool,

    /// Only scan endpoints in this namespace.
    #[arg(long, conflicts_with = "all_pods")]
    namespace: Option<String>,

    /// Scan at most this many endpoints (first N in discovery order).
    #[arg(long = "limit-ips")]
    limit_ips: Option<usize>,

    /// Write the full report as pretty JSON to this path.
    #[arg(long = "json-file")]
    json_file: Option<PathBuf>,

    /// Write one CSV row per endpoint/version/cipher to this path.
    #[arg(long = "csv-file")]
    csv_file: Option<PathBuf>,

    /// Write the per-endpoint command/output/findings log to this path.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Max endpoints probed concurrently.
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Per-probe timeout in seconds.
    #[arg(long = "timeout-secs", default_value_t = 90)]
    timeout_secs: u64,

    /// Cancel the whole run after this many seconds and report what finished.
    #[arg(long = "deadline-secs")]
    deadline_secs: Option<u64>,

    /// Probe tool binary.
    #[arg(long = "nmap-path", default_value = "nmap")]
    nmap_path: String,

    /// Listening-socket lister binary (invoked as `<bin> -nP -iTCP -sTCP:LISTEN`).
    #[arg(long = "lister-path", default_value = "lsof")]
    lister_path: String,
}

impl Cli {
    fn selection(&self) -> Result<Selection, ConfigError> {
        match (&self.namespace, self.all_pods) {
            (_, true) => Ok(Selection::AllPods),
            (Some(ns), false) => Ok(Selection::Namespace(ns.clone())),
            (None, false) => Err(ConfigError::NoSelection),
        }
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            workers: self.workers,
            probe_timeout: Duration::from_secs(self.timeout_secs),
            run_deadline: self.deadline_secs.map(Duration::from_secs),
            limit_ips: self.limit_ips,
            probe: ProbeToolConfig {
                program: self.nmap_path.clone(),
                ..ProbeToolConfig::default()
            },
            lister: ListerConfig {
                program: self.lister_path.clone(),
                ..ListerConfig::default()
            },
            ..ScanConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let selection = cli.selection()?;
    let cfg = cli.scan_config();
    cfg.validate()?;

    println!("tls-posture-scan configuration:");
    println!("  endpoints    : {}", cli.endpoints.display());
    println!(
        "  selection    : {}",
        match &selection {
            Selection::AllPods => "all pods".to_string(),
            Selection::Namespace(ns) => format!("namespace {ns}"),
        }
    );
    println!(
        "  limit_ips    : {}",
        cfg.limit_ips
            .map(|n| n.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  workers      : {}", cfg.workers);
    println!("  timeout      : {:?}", cfg.probe_timeout);
    println!("  probe        : {}", cfg.probe.program);
    println!("  lister       : {}", cfg.lister.program);

    let discovered = inventory::load_endpoints_from_path(&cli.endpoints)?;
    let endpoints = inventory::select(discovered, &selection);
    println!("  selected     : {} endpoint(s)", endpoints.len());

    // Ctrl-C cancels the run; the partial report is still written.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling scan");
            cancel_ctrlc.cancel();
        }
    });

    let report = scanner::run_scan(endpoints, &cfg, cancel).await?;
    output::print_summary(&report);

    let mut failed = 0usize;
    failed += write_output(cli.json_file.as_deref(), "JSON", &report, output::write_json);
    failed += write_output(cli.csv_file.as_deref(), "CSV", &report, output::write_csv);
    failed += write_output(cli.log_file.as_deref(), "log", &report, output::write_log);
    if failed > 0 {
        bail!("{failed} output file(s) could not be written");
    }
    Ok(())
}

fn write_output(
    path: Option<&Path>,
    kind: &str,
    report: &Report,
    write: fn(&Path, &Report) -> Result<()>,
) -> usize {
    let Some(path) = path else {
        return 0;
    };
    match write(path, report) {
        Ok(()) => {
            println!("Wrote {kind} results to {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("Failed to write {kind} to {}: {e:#}", path.display());
            1
        }
    }
}
