#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rs_sqs_pipeline::client::QueueClient;
use rs_sqs_pipeline::converter::{QueueAttributes, SqsMessageConverter, StringPayloadConverter};
use rs_sqs_pipeline::errors::{BoxError, ListenerError};
use rs_sqs_pipeline::listener::{MessageListener, listener_fn};
use rs_sqs_pipeline::message::{ApplicationMessage, RawMessage};
use rs_sqs_pipeline::pipeline::Converted;
use tokio::sync::Mutex;

pub const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/000000000000/orders";

/// In-memory queue client recording every delete and visibility change.
#[derive(Default)]
pub struct RecordingClient {
    deleted: Mutex<Vec<String>>,
    delete_calls: AtomicUsize,
    visibility_changes: Mutex<Vec<(String, u32)>>,
    fail_deletes: AtomicBool,
    fail_visibility: AtomicBool,
    failing_receipts: Vec<String>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingClient::default())
    }

    pub fn failing_deletes() -> Arc<Self> {
        let client = RecordingClient::default();
        client.fail_deletes.store(true, Ordering::SeqCst);
        Arc::new(client)
    }

    pub fn failing_visibility() -> Arc<Self> {
        let client = RecordingClient::default();
        client.fail_visibility.store(true, Ordering::SeqCst);
        Arc::new(client)
    }

    /// Client whose deletes fail for the given receipt handles only.
    pub fn failing_receipts(receipt_handles: &[&str]) -> Arc<Self> {
        Arc::new(RecordingClient {
            failing_receipts: receipt_handles.iter().map(|handle| handle.to_string()).collect(),
            ..Default::default()
        })
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub async fn visibility_changes(&self) -> Vec<(String, u32)> {
        self.visibility_changes.lock().await.clone()
    }
}

#[async_trait]
impl QueueClient for RecordingClient {
    async fn delete_messages(&self, queue_url: &str, receipt_handles: &[String]) -> Result<(), ListenerError> {
        assert_eq!(queue_url, QUEUE_URL);
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ListenerError::Sqs("AccessDenied".to_string()));
        }
        let (failed, deleted): (Vec<String>, Vec<String>) = receipt_handles
            .iter()
            .cloned()
            .partition(|handle| self.failing_receipts.contains(handle));
        self.deleted.lock().await.extend(deleted);
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ListenerError::PartialBatch {
                failed,
                total: receipt_handles.len(),
                reason: "ReceiptHandleIsInvalid".to_string(),
            })
        }
    }

    async fn change_visibility(&self, _queue_url: &str, receipt_handle: &str, seconds: u32) -> Result<(), ListenerError> {
        if self.fail_visibility.load(Ordering::SeqCst) {
            return Err(ListenerError::Sqs("ReceiptHandleIsInvalid".to_string()));
        }
        self.visibility_changes
            .lock()
            .await
            .push((receipt_handle.to_string(), seconds));
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        _queue_url: &str,
        receipt_handles: &[String],
        seconds: u32,
    ) -> Result<(), ListenerError> {
        if self.fail_visibility.load(Ordering::SeqCst) {
            return Err(ListenerError::Sqs("ReceiptHandleIsInvalid".to_string()));
        }
        self.visibility_changes
            .lock()
            .await
            .extend(receipt_handles.iter().map(|handle| (handle.clone(), seconds)));
        Ok(())
    }
}

pub fn converter(client: &Arc<RecordingClient>, queue_visibility: Option<u32>) -> SqsMessageConverter<String> {
    let mut queue = QueueAttributes::from_queue_url(QUEUE_URL);
    queue.visibility_timeout = queue_visibility;
    let client: Arc<dyn QueueClient> = client.clone();
    SqsMessageConverter::new(Arc::new(StringPayloadConverter), queue, client)
}

/// Converts a message as if it had been received `elapsed_seconds` ago.
pub fn received(
    converter: &SqsMessageConverter<String>,
    raw: RawMessage,
    elapsed_seconds: i64,
) -> Converted<String> {
    converter.convert_at(&raw, Utc::now() - Duration::seconds(elapsed_seconds))
}

/// Listener counting its invocations, failing every message when `fail` is set.
pub fn counting_listener(calls: Arc<AtomicUsize>, fail: bool) -> Arc<dyn MessageListener<String>> {
    Arc::new(listener_fn(move |_message: ApplicationMessage<String>| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err::<(), BoxError>("payment declined".into())
            } else {
                Ok(())
            }
        }
    }))
}
