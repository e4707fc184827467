//! Deleting processed messages from the queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::client::QueueClient;
use crate::errors::ListenerError;

pub mod batching;
pub mod handler;

pub use batching::BatchingAcknowledgementCallback;
pub use handler::{
    AcknowledgementHandler, AcknowledgementMode, AlwaysAcknowledgementHandler,
    NeverAcknowledgementHandler, OnSuccessAcknowledgementHandler,
};

/// Removes messages from the queue they were received from.
#[async_trait]
pub trait AcknowledgementCallback: Send + Sync {
    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), ListenerError>;

    /// Completes acknowledgements that were accepted but not yet sent.
    async fn flush(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Acknowledges by deleting messages from an SQS queue.
pub struct SqsAcknowledgementCallback {
    client: Arc<dyn QueueClient>,
    queue_url: String,
}

impl SqsAcknowledgementCallback {
    pub fn new(client: Arc<dyn QueueClient>, queue_url: impl Into<String>) -> Self {
        SqsAcknowledgementCallback {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl AcknowledgementCallback for SqsAcknowledgementCallback {
    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), ListenerError> {
        self.client
            .delete_messages(&self.queue_url, receipt_handles)
            .await
            .map_err(|e| match e {
                partial @ ListenerError::PartialBatch { .. } => partial,
                other => ListenerError::Acknowledgement(other.to_string()),
            })
    }
}

/// Per-message acknowledgement handle.
///
/// Clones share state: once any clone acknowledged successfully, further
/// calls are no-ops.
#[derive(Clone)]
pub struct Acknowledgement {
    callback: Arc<dyn AcknowledgementCallback>,
    receipt_handle: String,
    acknowledged: Arc<AtomicBool>,
}

impl Acknowledgement {
    pub fn new(callback: Arc<dyn AcknowledgementCallback>, receipt_handle: impl Into<String>) -> Self {
        Acknowledgement {
            callback,
            receipt_handle: receipt_handle.into(),
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub async fn acknowledge(&self) -> Result<(), ListenerError> {
        if !self.claim() {
            debug!(receipt_handle = %self.receipt_handle, "Message already acknowledged");
            return Ok(());
        }

        let result = self
            .callback
            .acknowledge(std::slice::from_ref(&self.receipt_handle))
            .await;
        if let Err(e) = &result {
            self.release();
            error!(receipt_handle = %self.receipt_handle, error = %e, "Failed to acknowledge message");
        }
        result
    }

    // Returns false when this handle was already acknowledged.
    fn claim(&self) -> bool {
        !self.acknowledged.swap(true, Ordering::SeqCst)
    }

    fn release(&self) {
        self.acknowledged.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("receipt_handle", &self.receipt_handle)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// Acknowledges several messages, issuing one callback call per queue.
///
/// Handles that were already acknowledged are skipped. When part of a call
/// fails, only the failed handles can be acknowledged again.
pub async fn acknowledge_all(handles: &[&Acknowledgement]) -> Result<(), ListenerError> {
    let mut groups: Vec<(Arc<dyn AcknowledgementCallback>, Vec<&Acknowledgement>)> = Vec::new();
    for handle in handles.iter().copied().filter(|handle| handle.claim()) {
        match groups
            .iter_mut()
            .find(|(callback, _)| Arc::ptr_eq(callback, &handle.callback))
        {
            Some((_, members)) => members.push(handle),
            None => groups.push((Arc::clone(&handle.callback), vec![handle])),
        }
    }

    let mut failures = Vec::new();
    for (callback, members) in groups {
        let receipt_handles: Vec<String> = members
            .iter()
            .map(|member| member.receipt_handle.clone())
            .collect();
        if let Err(e) = callback.acknowledge(&receipt_handles).await {
            match e.failed_receipt_handles() {
                Some(failed) => members
                    .iter()
                    .filter(|member| failed.contains(&member.receipt_handle))
                    .for_each(|member| member.release()),
                None => members.iter().for_each(|member| member.release()),
            }
            error!(count = receipt_handles.len(), error = %e, "Failed to acknowledge messages");
            failures.push(e.to_string());
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ListenerError::Acknowledgement(failures.join("; ")))
    }
}
