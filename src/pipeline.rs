use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ScanConfig;
use crate::parser::{self, Findings};
use crate::probe::{Invocation, ProbeInvoker};
use crate::procs::ProcessLister;
use crate::types::{Endpoint, ScanResult, Status, Transcript};

/// Turns one endpoint into exactly one [`ScanResult`].
///
/// Implementations must not fail: every outcome, including cancellation,
/// is expressed as a status.
pub trait EndpointScanner: Send + Sync + 'static {
    fn scan(
        &self,
        endpoint: Endpoint,
        cancel: CancellationToken,
    ) -> impl Future<Output = ScanResult> + Send;
}

/// Probe, parse, then look up listening processes.
#[derive(Debug, Clone)]
pub struct ProbePipeline {
    invoker: ProbeInvoker,
    lister: ProcessLister,
    script_id: String,
}

impl ProbePipeline {
    pub fn new(invoker: ProbeInvoker, lister: ProcessLister, script_id: impl Into<String>) -> Self {
        Self {
            invoker,
            lister,
            script_id: script_id.into(),
        }
    }

    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self::new(
            ProbeInvoker::from_config(cfg),
            ProcessLister::new(cfg.lister.clone(), cfg.max_output_bytes),
            cfg.probe.script.clone(),
        )
    }

    async fn classify(
        &self,
        endpoint: Endpoint,
        stdout: &str,
        cancel: &CancellationToken,
    ) -> ScanResult {
        match parser::parse_probe_output_for(&endpoint, stdout, &self.script_id) {
            Ok(Findings::Tls(record)) => {
                let processes = self.lister.processes_for(&record.open_ports, cancel).await;
                ScanResult::success(record, processes)
            }
            Ok(Findings::NoTls { .. }) => ScanResult::failure(endpoint, Status::NoTlsDetected, None),
            Ok(Findings::NoOpenPorts { reason }) => {
                ScanResult::failure(endpoint, Status::Unreachable, Some(reason))
            }
            Err(e) => ScanResult::failure(endpoint, Status::ParseError, Some(e.to_string())),
        }
    }
}

impl EndpointScanner for ProbePipeline {
    async fn scan(&self, endpoint: Endpoint, cancel: CancellationToken) -> ScanResult {
        let start = Instant::now();
        let command = self.invoker.command_line(&endpoint);
        debug!(%endpoint, %command, "invoking probe");

        let (result, raw_output) = match self.invoker.invoke(&endpoint, &cancel).await {
            Invocation::Completed { stdout, .. } => {
                let result = self.classify(endpoint, &stdout, &cancel).await;
                (result, stdout)
            }
            Invocation::TimedOut { partial } => {
                let msg = format!("probe exceeded {:?}", self.invoker.timeout());
                (
                    ScanResult::failure(endpoint, Status::Timeout, Some(msg)),
                    partial,
                )
            }
            Invocation::Cancelled { partial } => (ScanResult::cancelled(endpoint), partial),
            Invocation::LaunchFailed { reason } => (
                ScanResult::failure(endpoint, Status::LaunchError, Some(reason)),
                String::new(),
            ),
        };

        result
            .with_elapsed_ms(start.elapsed().as_millis() as u64)
            .with_transcript(Transcript {
                command,
                raw_output,
            })
    }
}
