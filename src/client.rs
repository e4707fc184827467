use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::config::{Credentials, SharedCredentialsProvider};
use aws_sdk_sqs::types::{ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry};
use futures::future::join_all;
use tracing::debug;

use crate::errors::ListenerError;

/// Maximum number of entries SQS accepts in a single batch request.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Queue operations the delivery pipeline needs after a message was received.
///
/// Implemented for [`aws_sdk_sqs::Client`]. The client is shared by every
/// in-flight message of a container, so implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Deletes the messages identified by `receipt_handles` from the queue.
    async fn delete_messages(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<(), ListenerError>;

    /// Sets the visibility timeout of one message to `seconds` from now.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<(), ListenerError>;

    /// Sets the visibility timeout of several messages to `seconds` from now.
    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
        seconds: u32,
    ) -> Result<(), ListenerError>;
}

#[async_trait]
impl QueueClient for aws_sdk_sqs::Client {
    async fn delete_messages(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<(), ListenerError> {
        match receipt_handles {
            [] => Ok(()),
            [receipt_handle] => {
                self.delete_message()
                    .queue_url(queue_url)
                    .receipt_handle(receipt_handle)
                    .send()
                    .await
                    .map_err(|e| ListenerError::Sqs(e.to_string()))?;
                debug!(queue_url = %queue_url, receipt_handle = %receipt_handle, "Message deleted from SQS");
                Ok(())
            }
            _ => {
                let chunks: Vec<&[String]> = receipt_handles.chunks(MAX_BATCH_ENTRIES).collect();
                let results = join_all(chunks.iter().map(|chunk| delete_chunk(self, queue_url, chunk))).await;
                collect_entry_failures(receipt_handles.len(), chunks.into_iter().zip(results))?;
                debug!(queue_url = %queue_url, count = receipt_handles.len(), "Messages deleted from SQS");
                Ok(())
            }
        }
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<(), ListenerError> {
        self.change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout(seconds)?)
            .send()
            .await
            .map_err(|e| ListenerError::Sqs(e.to_string()))?;

        debug!(queue_url = %queue_url, receipt_handle = %receipt_handle, seconds, "Visibility changed in SQS");
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
        seconds: u32,
    ) -> Result<(), ListenerError> {
        let requests = receipt_handles
            .chunks(MAX_BATCH_ENTRIES)
            .map(|chunk| change_visibility_chunk(self, queue_url, chunk, seconds));
        collect_failures(join_all(requests).await)?;

        debug!(queue_url = %queue_url, count = receipt_handles.len(), seconds, "Visibility changed in SQS");
        Ok(())
    }
}

async fn delete_chunk(
    client: &aws_sdk_sqs::Client,
    queue_url: &str,
    receipt_handles: &[String],
) -> Result<(), ListenerError> {
    let entries = receipt_handles
        .iter()
        .enumerate()
        .map(|(index, handle)| {
            DeleteMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(handle)
                .build()
                .map_err(|e| ListenerError::Sqs(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let output = client
        .delete_message_batch()
        .queue_url(queue_url)
        .set_entries(Some(entries))
        .send()
        .await
        .map_err(|e| ListenerError::Sqs(e.to_string()))?;

    let failed = output.failed();
    if failed.is_empty() {
        return Ok(());
    }
    let reason = failed
        .iter()
        .map(|entry| format!("{} ({})", entry.code(), entry.message().unwrap_or("no message")))
        .collect::<Vec<_>>()
        .join(", ");
    // Entry ids are indexes into the chunk.
    let failed = failed
        .iter()
        .filter_map(|entry| entry.id().parse::<usize>().ok())
        .filter_map(|index| receipt_handles.get(index).cloned())
        .collect();
    Err(ListenerError::PartialBatch {
        failed,
        total: receipt_handles.len(),
        reason,
    })
}

async fn change_visibility_chunk(
    client: &aws_sdk_sqs::Client,
    queue_url: &str,
    receipt_handles: &[String],
    seconds: u32,
) -> Result<(), ListenerError> {
    let seconds = visibility_timeout(seconds)?;
    let entries = receipt_handles
        .iter()
        .enumerate()
        .map(|(index, handle)| {
            ChangeMessageVisibilityBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(handle)
                .visibility_timeout(seconds)
                .build()
                .map_err(|e| ListenerError::Sqs(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let output = client
        .change_message_visibility_batch()
        .queue_url(queue_url)
        .set_entries(Some(entries))
        .send()
        .await
        .map_err(|e| ListenerError::Sqs(e.to_string()))?;

    let failed = output.failed();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(ListenerError::Sqs(format!(
            "{} of {} visibility changes failed",
            failed.len(),
            receipt_handles.len()
        )))
    }
}

fn collect_failures(results: Vec<Result<(), ListenerError>>) -> Result<(), ListenerError> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err())
        .map(|e| e.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ListenerError::Sqs(errors.join("; ")))
    }
}

// Merges chunk results, counting every entry of a failed request as failed.
fn collect_entry_failures<'a>(
    total: usize,
    results: impl IntoIterator<Item = (&'a [String], Result<(), ListenerError>)>,
) -> Result<(), ListenerError> {
    let mut failed = Vec::new();
    let mut reasons = Vec::new();
    for (chunk, result) in results {
        match result {
            Ok(()) => {}
            Err(ListenerError::PartialBatch {
                failed: entries,
                reason,
                ..
            }) => {
                failed.extend(entries);
                reasons.push(reason);
            }
            Err(e) => {
                failed.extend(chunk.iter().cloned());
                reasons.push(e.to_string());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(ListenerError::PartialBatch {
            failed,
            total,
            reason: reasons.join("; "),
        })
    }
}

fn visibility_timeout(seconds: u32) -> Result<i32, ListenerError> {
    i32::try_from(seconds).map_err(|_| {
        ListenerError::LeaseExtension(format!("visibility timeout of {seconds} seconds is out of range"))
    })
}

/// Creates an AWS SQS client using credentials and configuration from the environment.
///
/// This function loads AWS configuration from environment variables such as:
/// - `AWS_ACCESS_KEY_ID`
/// - `AWS_SECRET_ACCESS_KEY`
/// - `AWS_REGION`
/// - `AWS_PROFILE`
///
/// # Example
///
/// ```rust,no_run
/// use rs_sqs_pipeline::client::create_sqs_client_from_env;
///
/// #[tokio::main]
/// async fn main() {
///     let client = create_sqs_client_from_env().await;
///     // Use the client...
/// }
/// ```
pub async fn create_sqs_client_from_env() -> aws_sdk_sqs::Client {
    let config = aws_config::load_from_env().await;
    aws_sdk_sqs::Client::new(&config)
}

/// Creates an AWS SQS client with explicitly provided credentials and region.
///
/// # Arguments
///
/// * `access_key_id` - The AWS access key ID
/// * `secret_access_key` - The AWS secret access key
/// * `region` - The AWS region (e.g., "us-east-1", "eu-west-1")
pub fn create_sqs_client_with_credentials(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> aws_sdk_sqs::Client {
    let credentials =
        Credentials::new(access_key_id, secret_access_key, None, None, "aws");

    let shared_credentials = SharedCredentialsProvider::new(credentials);

    let config = aws_sdk_sqs::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(shared_credentials)
        .build();

    aws_sdk_sqs::Client::from_conf(config)
}

/// Creates an AWS SQS client pointed at a custom endpoint, e.g. LocalStack.
///
/// Without `credentials` the default provider chain is used.
pub async fn create_sqs_client_with_endpoint(
    endpoint_url: &str,
    region: &str,
    credentials: Option<Credentials>,
) -> aws_sdk_sqs::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .endpoint_url(endpoint_url);
    if let Some(credentials) = credentials {
        loader = loader.credentials_provider(credentials);
    }

    aws_sdk_sqs::Client::new(&loader.load().await)
}
