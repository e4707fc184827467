use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::client::QueueClient;
use crate::errors::ListenerError;

/// Handle to change the visibility timeout of one received message.
///
/// Only valid while the receipt handle it was created with is valid.
#[derive(Clone)]
pub struct QueueMessageVisibility {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    receipt_handle: String,
}

impl QueueMessageVisibility {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue_url: impl Into<String>,
        receipt_handle: impl Into<String>,
    ) -> Self {
        QueueMessageVisibility {
            client,
            queue_url: queue_url.into(),
            receipt_handle: receipt_handle.into(),
        }
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    /// Sets the message visibility timeout to `seconds` from now.
    pub async fn change_to(&self, seconds: u32) -> Result<(), ListenerError> {
        self.client
            .change_visibility(&self.queue_url, &self.receipt_handle, seconds)
            .await
            .map_err(|e| ListenerError::LeaseExtension(e.to_string()))?;
        debug!(receipt_handle = %self.receipt_handle, seconds, "Message visibility changed");
        Ok(())
    }
}

impl fmt::Debug for QueueMessageVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMessageVisibility")
            .field("queue_url", &self.queue_url)
            .field("receipt_handle", &self.receipt_handle)
            .finish()
    }
}

/// Handle to change the visibility timeout of messages received together.
#[derive(Clone)]
pub struct BatchVisibility {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    receipt_handles: Vec<String>,
}

impl BatchVisibility {
    pub fn new(client: Arc<dyn QueueClient>, queue_url: impl Into<String>, receipt_handles: Vec<String>) -> Self {
        BatchVisibility {
            client,
            queue_url: queue_url.into(),
            receipt_handles,
        }
    }

    /// Builds a batch handle from single message handles of the same queue.
    ///
    /// Returns `None` when `handles` is empty.
    pub fn from_handles<'a>(handles: impl IntoIterator<Item = &'a QueueMessageVisibility>) -> Option<Self> {
        let mut handles = handles.into_iter();
        let first = handles.next()?;
        let mut receipt_handles = vec![first.receipt_handle.clone()];
        receipt_handles.extend(handles.map(|handle| handle.receipt_handle.clone()));
        Some(BatchVisibility::new(
            Arc::clone(&first.client),
            first.queue_url.clone(),
            receipt_handles,
        ))
    }

    pub fn len(&self) -> usize {
        self.receipt_handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipt_handles.is_empty()
    }

    pub async fn change_to(&self, seconds: u32) -> Result<(), ListenerError> {
        if self.receipt_handles.is_empty() {
            return Ok(());
        }
        self.client
            .change_visibility_batch(&self.queue_url, &self.receipt_handles, seconds)
            .await
            .map_err(|e| ListenerError::LeaseExtension(e.to_string()))?;
        debug!(count = self.receipt_handles.len(), seconds, "Batch visibility changed");
        Ok(())
    }
}

impl fmt::Debug for BatchVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchVisibility")
            .field("queue_url", &self.queue_url)
            .field("receipt_handles", &self.receipt_handles)
            .finish()
    }
}
