//! Single-writer accumulation of per-endpoint results into a [`Report`].
//!
//! Workers never touch the report directly: they send results over a
//! channel to one task that owns the [`Aggregator`]. The finalized report is
//! sorted by (ip, port), so arrival order never shows in the output.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::IpAddr;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Endpoint, Report, ScanResult, Summary};

type Key = (IpAddr, u16);

#[derive(Debug)]
pub struct Aggregator {
    started_at: OffsetDateTime,
    expected: BTreeMap<Key, Endpoint>,
    results: BTreeMap<Key, ScanResult>,
    cancelled: bool,
    finalized: Option<Report>,
}

impl Aggregator {
    pub fn new(started_at: OffsetDateTime) -> Self {
        Self {
            started_at,
            expected: BTreeMap::new(),
            results: BTreeMap::new(),
            cancelled: false,
            finalized: None,
        }
    }

    /// Register endpoints that must appear in the report. Any of them still
    /// without a result at finalization is recorded as cancelled.
    pub fn expect<'a>(&mut self, endpoints: impl IntoIterator<Item = &'a Endpoint>) {
        for ep in endpoints {
            self.expected.entry(ep.key()).or_insert_with(|| ep.clone());
        }
    }

    /// Add one result. Returns `false` when it was not taken: the report is
    /// already final, or the result already held for the same endpoint ranks
    /// equal or higher.
    pub fn insert(&mut self, result: ScanResult) -> bool {
        if self.finalized.is_some() {
            warn!(endpoint = %result.endpoint, "result arrived after finalization; dropped");
            return false;
        }
        let key = result.endpoint.key();
        match self.results.get(&key) {
            Some(existing) if !outranks(&result, existing) => {
                debug!(endpoint = %result.endpoint, "duplicate result ignored");
                false
            }
            _ => {
                self.results.insert(key, result);
                true
            }
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Number of results held, including after finalization.
    pub fn len(&self) -> usize {
        match &self.finalized {
            Some(report) => report.results.len(),
            None => self.results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Freeze the report. Later calls return the same report unchanged.
    pub fn finalize_at(&mut self, finished_at: OffsetDateTime) -> &Report {
        let report = match self.finalized.take() {
            Some(report) => report,
            None => self.build(finished_at),
        };
        self.finalized.insert(report)
    }

    pub fn finalize(&mut self) -> &Report {
        self.finalize_at(OffsetDateTime::now_utc())
    }

    /// Finalize (if needed) and hand the report over by value.
    pub fn into_report(mut self) -> Report {
        match self.finalized.take() {
            Some(report) => report,
            None => self.build(OffsetDateTime::now_utc()),
        }
    }

    fn build(&mut self, finished_at: OffsetDateTime) -> Report {
        for (key, ep) in &self.expected {
            if !self.results.contains_key(key) {
                self.results.insert(*key, ScanResult::cancelled(ep.clone()));
            }
        }
        let results: Vec<ScanResult> = std::mem::take(&mut self.results).into_values().collect();
        Report {
            started_at: self.started_at,
            finished_at,
            cancelled: self.cancelled,
            summary: Summary::from_results(&results),
            results,
        }
    }
}

/// Total order between two results for the same endpoint: better status
/// first, then the smaller serialized form, then the transcript. Keeps the
/// kept result independent of arrival order.
fn outranks(candidate: &ScanResult, existing: &ScanResult) -> bool {
    match candidate.status.cmp(&existing.status) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => content_key(candidate) < content_key(existing),
    }
}

fn content_key(r: &ScanResult) -> (String, Option<(&str, &str)>) {
    let json = serde_json::to_string(r).unwrap_or_default();
    let transcript = r
        .transcript
        .as_ref()
        .map(|t| (t.command.as_str(), t.raw_output.as_str()));
    (json, transcript)
}

/// Run `agg` as the single writer behind a bounded channel.
///
/// The task ends when every sender is dropped and returns the aggregator
/// for finalization.
pub fn spawn_aggregator(
    mut agg: Aggregator,
    buffer: usize,
) -> (mpsc::Sender<ScanResult>, JoinHandle<Aggregator>) {
    let (tx, mut rx) = mpsc::channel::<ScanResult>(buffer.max(1));
    let handle = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            agg.insert(result);
        }
        agg
    });
    (tx, handle)
}
