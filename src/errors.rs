use thiserror::Error;

use crate::message::MessageHeaders;

/// Boxed error returned by application listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for the SQS message delivery pipeline.
///
/// Per-message variants (`Conversion`, `LeaseExtension`, `Handler`,
/// `Interceptor`, `Acknowledgement`) never affect sibling messages of the same
/// batch. Only `Configuration` and `Fatal` stop a container.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The message body could not be decoded into the listener's payload type.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Extending the visibility timeout of a message failed.
    ///
    /// This is logged and never fails the message on its own.
    #[error("failed to change message visibility: {0}")]
    LeaseExtension(String),

    /// The application listener returned an error.
    #[error("listener failed: {0}")]
    Handler(#[source] BoxError),

    /// An interceptor failed while pre- or post-processing a message.
    #[error("interceptor failed: {0}")]
    Interceptor(String),

    /// A decision to acknowledge was made but the message could not be
    /// deleted from the queue. The message may be redelivered even though it
    /// was processed.
    #[error("failed to acknowledge message(s): {0}")]
    Acknowledgement(String),

    /// Invalid container setup, detected when the container is built.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Unexpected failure of the listener binding itself (e.g. a panic).
    #[error("fatal listener error: {0}")]
    Fatal(String),

    /// The container was stopped and accepts no more messages.
    #[error("listener container is stopped")]
    Stopped,

    /// Raw error reported by the SQS client.
    #[error("AWS SQS error: {0}")]
    Sqs(String),

    /// Some entries of a batch request failed while the others succeeded.
    #[error("{} of {total} batch entries failed: {reason}", .failed.len())]
    PartialBatch {
        /// Receipt handles of the failed entries.
        failed: Vec<String>,
        total: usize,
        reason: String,
    },
}

impl ListenerError {
    /// Wraps an application error as a handler failure.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        ListenerError::Handler(error.into())
    }

    /// Receipt handles that failed, when only part of a batch request failed.
    pub fn failed_receipt_handles(&self) -> Option<&[String]> {
        match self {
            ListenerError::PartialBatch { failed, .. } => Some(failed),
            _ => None,
        }
    }

    /// Returns true for errors that must stop the container instead of
    /// being scoped to a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ListenerError::Configuration(_) | ListenerError::Fatal(_)
        )
    }
}

/// Failure to convert a raw SQS message into an application message.
///
/// The headers of the failed message are kept so the acknowledgement
/// policy can still act on it.
#[derive(Debug, Error)]
#[error("failed to convert message {message_id}: {reason}")]
pub struct ConversionError {
    message_id: String,
    reason: String,
    headers: MessageHeaders,
}

impl ConversionError {
    pub fn new(reason: impl Into<String>, headers: MessageHeaders) -> Self {
        let message_id = headers.message_id().unwrap_or("unknown").to_string();
        ConversionError {
            message_id,
            reason: reason.into(),
            headers,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Headers of the message that failed to convert.
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }
}
