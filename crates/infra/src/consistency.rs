//! Consistency checking between cached counters and the ledger.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use stockledger_core::ProductId;

use crate::aggregate_service::AggregateService;
use crate::ledger_store::LedgerStore;

/// A cached counter that disagreed with the full ledger sum.
///
/// This is an anomaly report, not a request failure: the cache is corrected
/// to `recomputed` when it is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsistencyViolation {
    pub product_id: ProductId,
    pub cached: i64,
    pub recomputed: i64,
}

impl ConsistencyViolation {
    pub fn drift(&self) -> i64 {
        self.recomputed - self.cached
    }
}

/// Result of recomputing one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecomputeOutcome {
    pub product_id: ProductId,
    pub cached: i64,
    pub recomputed: i64,
    pub violation: Option<ConsistencyViolation>,
}

/// Result of recomputing every product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub violations: Vec<ConsistencyViolation>,
    /// Products whose recompute errored.
    pub failed: Vec<ProductId>,
}

impl ConsistencyReport {
    pub fn record(&mut self, outcome: RecomputeOutcome) {
        self.checked += 1;
        if let Some(v) = outcome.violation {
            self.violations.push(v);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.failed.is_empty()
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    last_report: Arc<Mutex<Option<ConsistencyReport>>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Report from the most recent completed pass.
    pub fn last_report(&self) -> Option<ConsistencyReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background task that periodically recomputes every product.
pub struct ConsistencySweeper;

impl ConsistencySweeper {
    /// Run a pass every `interval` until the handle is shut down.
    pub fn spawn<S>(service: Arc<AggregateService<S>>, interval: Duration) -> std::io::Result<SweeperHandle>
    where
        S: LedgerStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let last_report = Arc::new(Mutex::new(None));
        let last_report_clone = last_report.clone();

        let join = thread::Builder::new()
            .name("consistency-sweeper".to_string())
            .spawn(move || sweep_loop(&service, interval, shutdown_rx, &last_report_clone))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            last_report,
        })
    }
}

fn sweep_loop<S: LedgerStore>(
    service: &AggregateService<S>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    last_report: &Mutex<Option<ConsistencyReport>>,
) {
    info!(interval_ms = interval.as_millis() as u64, "consistency sweeper started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        match service.recompute_all() {
            Ok(report) => {
                if report.is_clean() {
                    info!(checked = report.checked, "consistency sweep clean");
                } else {
                    warn!(
                        checked = report.checked,
                        violations = report.violations.len(),
                        failed = report.failed.len(),
                        "consistency sweep found problems"
                    );
                }
                *last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
            }
            Err(e) => error!(error = %e, "consistency sweep failed"),
        }
    }

    info!("consistency sweeper stopped");
}
