use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::errors::ListenerError;
use crate::interceptor::{Interception, MessageInterceptor};
use crate::message::{ApplicationMessage, MessageHeaders};
use crate::visibility::BatchVisibility;

/// Visibility assumed when the queue's timeout is unknown.
pub const DEFAULT_QUEUE_VISIBILITY_SECONDS: u32 = 30;

pub const DEFAULT_MINIMUM_VISIBILITY_SECONDS: u32 = 30;

/// SQS upper bound for a visibility timeout (12 hours).
pub const MAX_VISIBILITY_SECONDS: u32 = 43_200;

/// Extends the visibility of messages about to be processed when less than
/// the configured minimum is left.
///
/// Remaining visibility is the queue's visibility timeout minus the time
/// since the message was received. Extension is best effort: failures are
/// logged and the message is still processed with its original visibility.
#[derive(Debug, Clone, Copy)]
pub struct MessageVisibilityExtendingInterceptor {
    minimum_visibility: u32,
}

impl MessageVisibilityExtendingInterceptor {
    /// Fails unless `minimum_visibility_seconds` is within `1..=43200`.
    pub fn new(minimum_visibility_seconds: u32) -> Result<Self, ListenerError> {
        validate_minimum_visibility(minimum_visibility_seconds)?;
        Ok(MessageVisibilityExtendingInterceptor {
            minimum_visibility: minimum_visibility_seconds,
        })
    }

    pub fn minimum_visibility(&self) -> u32 {
        self.minimum_visibility
    }

    /// Seconds of visibility left for a message at `now`. Negative once the
    /// visibility timeout expired.
    pub fn remaining_visibility(headers: &MessageHeaders, now: DateTime<Utc>) -> i64 {
        let queue_visibility = headers
            .queue_visibility_seconds()
            .unwrap_or(DEFAULT_QUEUE_VISIBILITY_SECONDS);
        let elapsed = headers
            .received_at()
            .map(|received_at| (now - received_at).num_seconds().max(0))
            .unwrap_or(0);
        i64::from(queue_visibility) - elapsed
    }

    fn needs_extension(&self, headers: &MessageHeaders, now: DateTime<Utc>) -> bool {
        Self::remaining_visibility(headers, now) < i64::from(self.minimum_visibility)
    }
}

impl Default for MessageVisibilityExtendingInterceptor {
    fn default() -> Self {
        MessageVisibilityExtendingInterceptor {
            minimum_visibility: DEFAULT_MINIMUM_VISIBILITY_SECONDS,
        }
    }
}

pub(crate) fn validate_minimum_visibility(seconds: u32) -> Result<(), ListenerError> {
    if seconds == 0 || seconds > MAX_VISIBILITY_SECONDS {
        return Err(ListenerError::Configuration(format!(
            "minimum visibility must be between 1 and {MAX_VISIBILITY_SECONDS} seconds, got {seconds}"
        )));
    }
    Ok(())
}

#[async_trait]
impl<T> MessageInterceptor<T> for MessageVisibilityExtendingInterceptor
where
    T: Send + Sync + 'static,
{
    async fn intercept(
        &self,
        message: ApplicationMessage<T>,
    ) -> Result<Interception<ApplicationMessage<T>>, ListenerError> {
        let headers = message.headers();
        if !self.needs_extension(headers, Utc::now()) {
            return Ok(Interception::Proceed(message));
        }

        match headers.visibility() {
            Some(visibility) => match visibility.change_to(self.minimum_visibility).await {
                Ok(()) => debug!(
                    message_id = %message.message_id(),
                    seconds = self.minimum_visibility,
                    "Extended message visibility"
                ),
                Err(e) => warn!(
                    message_id = %message.message_id(),
                    error = %e,
                    "Failed to extend message visibility, processing with current visibility"
                ),
            },
            None => warn!(message_id = %message.message_id(), "Message has no visibility handle"),
        }
        Ok(Interception::Proceed(message))
    }

    async fn intercept_batch(
        &self,
        messages: Vec<ApplicationMessage<T>>,
    ) -> Result<Interception<Vec<ApplicationMessage<T>>>, ListenerError> {
        let now = Utc::now();
        let expiring = messages
            .iter()
            .map(ApplicationMessage::headers)
            .filter(|headers| self.needs_extension(headers, now))
            .filter_map(MessageHeaders::visibility);

        if let Some(batch) = BatchVisibility::from_handles(expiring) {
            match batch.change_to(self.minimum_visibility).await {
                Ok(()) => debug!(
                    count = batch.len(),
                    seconds = self.minimum_visibility,
                    "Extended batch visibility"
                ),
                Err(e) => warn!(
                    count = batch.len(),
                    error = %e,
                    "Failed to extend batch visibility, processing with current visibility"
                ),
            }
        }
        Ok(Interception::Proceed(messages))
    }
}
