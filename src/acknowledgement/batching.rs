use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::acknowledgement::AcknowledgementCallback;
use crate::errors::ListenerError;

/// Buffers acknowledgements and sends them to an inner callback in batches.
///
/// A batch is sent once `threshold` receipt handles are buffered, and every
/// `interval` for whatever is buffered by then. A zero threshold or interval
/// disables that trigger. Acknowledging only buffers, so deletion failures
/// surface in the logs and in the result of [`flush`](Self::flush), never on
/// the acknowledged message.
pub struct BatchingAcknowledgementCallback {
    inner: Arc<dyn AcknowledgementCallback>,
    threshold: usize,
    pending: Mutex<Vec<String>>,
}

impl BatchingAcknowledgementCallback {
    /// Must be called within a Tokio runtime when `interval` is non-zero.
    pub fn new(
        inner: Arc<dyn AcknowledgementCallback>,
        threshold: usize,
        interval: Duration,
    ) -> Result<Arc<Self>, ListenerError> {
        if threshold == 0 && interval.is_zero() {
            return Err(ListenerError::Configuration(
                "acknowledgement batching needs a threshold or an interval".to_string(),
            ));
        }

        let callback = Arc::new(BatchingAcknowledgementCallback {
            inner,
            threshold,
            pending: Mutex::new(Vec::new()),
        });
        if !interval.is_zero() {
            let runtime = Handle::try_current().map_err(|e| {
                ListenerError::Configuration(format!("acknowledgement interval requires a Tokio runtime: {e}"))
            })?;
            runtime.spawn(flush_periodically(Arc::downgrade(&callback), interval));
        }
        Ok(callback)
    }

    /// Receipt handles accepted but not yet sent.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn send(&self, receipt_handles: Vec<String>) -> Result<(), ListenerError> {
        if receipt_handles.is_empty() {
            return Ok(());
        }
        debug!(count = receipt_handles.len(), "Sending batched acknowledgements");
        self.inner.acknowledge(&receipt_handles).await.inspect_err(|e| {
            error!(count = receipt_handles.len(), error = %e, "Failed to send batched acknowledgements");
        })
    }
}

#[async_trait]
impl AcknowledgementCallback for BatchingAcknowledgementCallback {
    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), ListenerError> {
        let ready = {
            let mut pending = self.pending.lock().await;
            pending.extend(receipt_handles.iter().cloned());
            if self.threshold > 0 && pending.len() >= self.threshold {
                std::mem::take(&mut *pending)
            } else {
                Vec::new()
            }
        };
        // Failures are already logged and belong to the whole batch.
        let _ = self.send(ready).await;
        Ok(())
    }

    async fn flush(&self) -> Result<(), ListenerError> {
        let ready = std::mem::take(&mut *self.pending.lock().await);
        self.send(ready).await
    }
}

async fn flush_periodically(callback: Weak<BatchingAcknowledgementCallback>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let Some(callback) = callback.upgrade() else {
            debug!("Acknowledgement batching stopped");
            return;
        };
        let _ = callback.flush().await;
    }
}
