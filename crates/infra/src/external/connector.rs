use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use stockledger_accounting::{SyncableEvent, VoucherId};

/// Answer of the accounting agent to a create-voucher call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoucherResponse {
    Created { voucher_id: VoucherId },
    Rejected { message: String },
}

/// Why a connector call did not produce a voucher.
///
/// Recorded onto the event as its sync error; never surfaced to callers that
/// merely enqueued the event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalSyncError {
    #[error("accounting agent unreachable: {0}")]
    Unreachable(String),

    #[error("voucher rejected: {0}")]
    Rejected(String),

    #[error("accounting agent did not answer within {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connector call aborted: {0}")]
    Aborted(String),
}

/// Network client to the external accounting agent.
pub trait ExternalConnector: Send + Sync + 'static {
    fn create_voucher(&self, event: &SyncableEvent) -> Result<VoucherResponse, ExternalSyncError>;

    /// Whether the agent is reachable.
    fn test_connection(&self) -> Result<bool, ExternalSyncError>;
}

impl<C> ExternalConnector for Arc<C>
where
    C: ExternalConnector + ?Sized,
{
    fn create_voucher(&self, event: &SyncableEvent) -> Result<VoucherResponse, ExternalSyncError> {
        (**self).create_voucher(event)
    }

    fn test_connection(&self) -> Result<bool, ExternalSyncError> {
        (**self).test_connection()
    }
}

/// Run `call` on its own thread and give up after `timeout`.
///
/// A call that overruns is left to finish in the background; its result is dropped.
pub fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ExternalSyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExternalSyncError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("connector-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|e| ExternalSyncError::Aborted(format!("cannot spawn connector thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ExternalSyncError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExternalSyncError::Aborted(
            "connector call panicked".to_string(),
        )),
    }
}

/// Connector wrapper that bounds every call by a fixed timeout.
#[derive(Debug)]
pub struct TimedConnector<C> {
    inner: Arc<C>,
    timeout: Duration,
}

impl<C> Clone for TimedConnector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: ExternalConnector> TimedConnector<C> {
    pub fn new(inner: Arc<C>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a voucher; an explicit rejection becomes `ExternalSyncError::Rejected`.
    pub fn create_voucher(&self, event: SyncableEvent) -> Result<VoucherId, ExternalSyncError> {
        let inner = self.inner.clone();
        let response = call_with_timeout(self.timeout, move || inner.create_voucher(&event))?;
        match response {
            VoucherResponse::Created { voucher_id } => Ok(voucher_id),
            VoucherResponse::Rejected { message } if message.trim().is_empty() => Err(
                ExternalSyncError::Rejected("agent rejected the voucher without a message".to_string()),
            ),
            VoucherResponse::Rejected { message } => Err(ExternalSyncError::Rejected(message)),
        }
    }

    /// `false` on any error or timeout.
    pub fn test_connection(&self) -> bool {
        let inner = self.inner.clone();
        match call_with_timeout(self.timeout, move || inner.test_connection()) {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!(error = %e, "accounting agent connection test failed");
                false
            }
        }
    }
}
