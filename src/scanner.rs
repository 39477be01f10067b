use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ::time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::{spawn_aggregator, Aggregator};
use crate::config::ScanConfig;
use crate::error::RunError;
use crate::inventory::{apply_limit, dedup_endpoints};
use crate::pipeline::{EndpointScanner, ProbePipeline};
use crate::types::{Endpoint, Report};

/// Scan `endpoints` with the external probe and process-lister tools
/// configured in `cfg`.
///
/// See [`run_scan_with`] for the scheduling contract.
pub async fn run_scan(
    endpoints: Vec<Endpoint>,
    cfg: &ScanConfig,
    cancel: CancellationToken,
) -> Result<Report, RunError> {
    let pipeline = Arc::new(ProbePipeline::from_config(cfg));
    run_scan_with(endpoints, cfg, pipeline, cancel).await
}

/// Scan `endpoints` using `scanner` for the per-endpoint work.
///
/// - Duplicate `(ip, port)` pairs are dropped, then `cfg.limit_ips` keeps
///   the first endpoints in input order; the rest are not part of the run.
/// - At most `cfg.workers` endpoints are in flight at once, bounded by a
///   `Semaphore`; each one runs its whole pipeline before its slot frees.
/// - Results flow over a channel to a single aggregating task.
/// - When `cancel` fires or `cfg.run_deadline` passes, dispatching stops,
///   in-flight scans are told to abort, and every endpoint still without a
///   result is reported as cancelled. The partial report is still returned.
///
/// Every scheduled endpoint appears exactly once in the report.
pub async fn run_scan_with<S: EndpointScanner>(
    endpoints: Vec<Endpoint>,
    cfg: &ScanConfig,
    scanner: Arc<S>,
    cancel: CancellationToken,
) -> Result<Report, RunError> {
    cfg.validate()?;
    let started_at = OffsetDateTime::now_utc();

    let discovered = endpoints.len();
    let endpoints = apply_limit(dedup_endpoints(endpoints), cfg.limit_ips);
    if endpoints.is_empty() {
        return Err(RunError::NoEndpoints);
    }
    let total = endpoints.len() as u64;
    info!(
        discovered,
        scheduled = total,
        workers = cfg.workers,
        probe_timeout = ?cfg.probe_timeout,
        "starting scan"
    );

    let mut agg = Aggregator::new(started_at);
    agg.expect(&endpoints);
    let (tx, agg_handle) = spawn_aggregator(agg, cfg.workers.saturating_mul(2));

    // Child token: cancelling it at the end stops the deadline timer without
    // touching the caller's token.
    let run_cancel = cancel.child_token();
    if let Some(deadline) = cfg.run_deadline {
        let run_cancel = run_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(deadline) => {
                    warn!(?deadline, "run deadline reached; cancelling scan");
                    run_cancel.cancel();
                }
                _ = run_cancel.cancelled() => {}
            }
        });
    }

    let sem = Arc::new(Semaphore::new(cfg.workers));
    let done = Arc::new(AtomicU64::new(0));
    let mut set = JoinSet::new();

    for endpoint in endpoints {
        let permit = tokio::select! {
            permit = sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = run_cancel.cancelled() => break,
        };
        if run_cancel.is_cancelled() {
            break;
        }

        let tx = tx.clone();
        let scanner = scanner.clone();
        let cancel = run_cancel.clone();
        let done = done.clone();

        set.spawn(async move {
            let _permit = permit; // slot held for the whole pipeline

            info!(%endpoint, "scan started");
            let result = scanner.scan(endpoint, cancel).await;
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                endpoint = %result.endpoint,
                status = %result.status,
                elapsed_ms = result.elapsed_ms,
                done = finished,
                total,
                "scan finished"
            );
            if tx.send(result).await.is_err() {
                warn!("aggregator closed; result dropped");
            }
        });
    }
    drop(tx);

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            // The aggregator records this endpoint as cancelled.
            warn!(error = %e, "scan task failed");
        }
    }

    let cancelled = run_cancel.is_cancelled();
    run_cancel.cancel();

    let mut agg = agg_handle.await.map_err(|_| RunError::AggregatorLost)?;
    if cancelled {
        warn!(
            completed = done.load(Ordering::Relaxed),
            total, "scan cancelled; finalizing partial report"
        );
        agg.mark_cancelled();
    }
    let report = agg.into_report();
    info!(
        results = report.results.len(),
        cancelled = report.cancelled,
        "scan complete"
    );
    Ok(report)
}
