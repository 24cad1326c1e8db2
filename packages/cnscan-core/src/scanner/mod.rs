//! Instance scanning.
//!
//! [`ScanOrchestrator`] splits an ID range into shuffled batches, runs one
//! worker task per batch and streams every finished [`InstanceRecord`] back
//! through a [`ScanStream`]. Each worker drives an [`InstanceProbe`] over its
//! batch one ID at a time.

mod parse;
pub mod partition;
mod probe;
pub(crate) mod record;

#[cfg(test)]
pub(crate) mod testing;

pub use parse::{GeoStyle, extract_hostname, extract_version, parse_location, strip_vendor_prefix};
pub use partition::{WorkBatch, partition, partition_random, partition_range};
pub use probe::{InstanceProbe, LEGACY_VERSION_PATH, ProbeStage, VERSION_PATH};
pub use record::{API_PROTECTED, InstanceRecord, Location};

use crate::config::ScanSettings;
use crate::transport::{Connector, HttpConnector, Resolver, SystemResolver};
use futures::FutureExt;
use futures::Stream;
use std::any::Any;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Records buffered between the workers and the consumer.
const RESULT_BUFFER: usize = 256;

/// Totals for a finished (or cancelled) scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub requested: u64,
    pub probed: u64,
    pub active: u64,
    pub inactive: u64,
    /// Probes that panicked; their IDs are reported with every field unset.
    pub faults: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct WorkerReport {
    probed: u64,
    active: u64,
    inactive: u64,
    faults: u64,
}

impl WorkerReport {
    /// Count a delivered record by its liveness outcome.
    fn delivered(&mut self, active: Option<bool>) {
        self.probed += 1;
        match active {
            Some(true) => self.active += 1,
            Some(false) => self.inactive += 1,
            None => {}
        }
    }
}

impl ScanSummary {
    fn absorb(&mut self, report: WorkerReport) {
        self.probed += report.probed;
        self.active += report.active;
        self.inactive += report.inactive;
        self.faults += report.faults;
    }
}

/// Runs scans over a fixed-size worker pool.
pub struct ScanOrchestrator<C: Connector, R: Resolver> {
    settings: Arc<ScanSettings>,
    connector: Arc<C>,
    resolver: Arc<R>,
    cancel: CancellationToken,
}

impl ScanOrchestrator<HttpConnector, SystemResolver> {
    /// Orchestrator using real HTTP clients and the system resolver.
    pub fn with_defaults(settings: ScanSettings) -> Self {
        let resolver = SystemResolver::new(settings.transport.timeout);
        Self::new(settings, HttpConnector, resolver)
    }
}

impl<C: Connector, R: Resolver> ScanOrchestrator<C, R> {
    pub fn new(settings: ScanSettings, connector: C, resolver: R) -> Self {
        Self {
            settings: Arc::new(settings),
            connector: Arc::new(connector),
            resolver: Arc::new(resolver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Token that stops every scan started by this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        tracing::info!("Scan cancellation requested");
        self.cancel.cancel();
    }

    /// A probe bound to this orchestrator's settings, for one-off lookups.
    pub fn probe(&self) -> InstanceProbe<C, R> {
        InstanceProbe::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.connector),
            Arc::clone(&self.resolver),
        )
    }

    /// Scan IDs `[0, total)` with `workers` concurrent workers.
    pub fn run(&self, total: u64, workers: usize) -> ScanStream {
        self.run_range(0..total, workers)
    }

    /// Scan an arbitrary ID range.
    pub fn run_range(&self, range: Range<u64>, workers: usize) -> ScanStream {
        let batches = partition_range(range, workers, &mut rand::thread_rng());
        self.run_batches(batches)
    }

    /// Scan pre-computed batches, one worker per non-empty batch.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_batches(&self, batches: Vec<WorkBatch>) -> ScanStream {
        let started = Instant::now();
        let requested: u64 = batches.iter().map(|b| b.len() as u64).sum();
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);

        let mut workers = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            workers.spawn(run_worker(
                index,
                batch,
                self.probe(),
                tx.clone(),
                cancel.clone(),
            ));
        }
        drop(tx);

        tracing::info!(
            "Scanning {} instances of {} with {} workers",
            requested,
            self.settings.domain,
            workers.len()
        );

        let supervisor_cancel = cancel.clone();
        let supervisor = tokio::spawn(async move {
            let mut summary = ScanSummary {
                requested,
                ..ScanSummary::default()
            };

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(report) => summary.absorb(report),
                    Err(e) => tracing::error!("Worker task failed: {}", e),
                }
            }

            summary.cancelled = supervisor_cancel.is_cancelled();
            summary.elapsed = started.elapsed();
            tracing::info!(
                "Scan {}: {}/{} instances probed, {} active in {:.1}s",
                if summary.cancelled { "cancelled" } else { "complete" },
                summary.probed,
                summary.requested,
                summary.active,
                summary.elapsed.as_secs_f64()
            );
            summary
        });

        ScanStream {
            rx,
            supervisor: Some(supervisor),
            cancel,
        }
    }
}

/// Probe every ID of `batch` in order, sending each record to `results`.
async fn run_worker<C: Connector, R: Resolver>(
    index: usize,
    batch: WorkBatch,
    probe: InstanceProbe<C, R>,
    results: mpsc::Sender<InstanceRecord>,
    cancel: CancellationToken,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    tracing::debug!("Worker {} starting with {} instances", index, batch.len());

    for id in batch {
        if cancel.is_cancelled() {
            tracing::debug!("Worker {} stopping: scan cancelled", index);
            break;
        }

        let record = match AssertUnwindSafe(probe.run(id, &cancel)).catch_unwind().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("Worker {} abandoned instance {}: scan cancelled", index, id);
                break;
            }
            Err(panic) => {
                report.faults += 1;
                tracing::error!(
                    "Worker {} reporting instance {} as unknown: probe panicked: {}",
                    index,
                    id,
                    panic_message(panic.as_ref())
                );
                InstanceRecord::new(id)
            }
        };

        let active = record.active();
        if results.send(record).await.is_err() {
            tracing::debug!("Worker {} stopping: result stream closed", index);
            break;
        }
        report.delivered(active);
    }

    tracing::debug!("Worker {} finished after {} instances", index, report.probed);
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Records of a running scan, in completion order.
///
/// Finite and single-use. Dropping the stream before it ends cancels the
/// scan.
pub struct ScanStream {
    rx: mpsc::Receiver<InstanceRecord>,
    supervisor: Option<JoinHandle<ScanSummary>>,
    cancel: CancellationToken,
}

impl ScanStream {
    pub async fn next_record(&mut self) -> Option<InstanceRecord> {
        self.rx.recv().await
    }

    /// Stop all workers of this scan.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every worker and return the totals. Records not yet read
    /// are discarded.
    pub async fn finish(mut self) -> ScanSummary {
        while self.rx.recv().await.is_some() {}

        match self.supervisor.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!("Scan supervisor failed: {}", e);
                ScanSummary::default()
            }),
            None => ScanSummary::default(),
        }
    }

    /// Read every record, then finish.
    pub async fn collect_all(mut self) -> (Vec<InstanceRecord>, ScanSummary) {
        let mut records = Vec::new();
        while let Some(record) = self.rx.recv().await {
            records.push(record);
        }
        let summary = self.finish().await;
        (records, summary)
    }
}

impl Stream for ScanStream {
    type Item = InstanceRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.cancel.cancel();
        }
    }
}
