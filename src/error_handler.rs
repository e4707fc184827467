//! Hooks run for failed messages before the acknowledgement decision, and
//! backoff handlers that delay redelivery by changing visibility.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::errors::ListenerError;
use crate::interceptor::visibility::MAX_VISIBILITY_SECONDS;
use crate::message::MessageHeaders;
use crate::visibility::BatchVisibility;

/// SQS system attribute counting how often a message was received.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

pub const DEFAULT_INITIAL_VISIBILITY_SECONDS: u32 = 100;
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_INCREMENT: u32 = 2;
pub const DEFAULT_MAX_VISIBILITY_SECONDS: u32 = MAX_VISIBILITY_SECONDS;

/// Runs for every message whose processing failed, before the
/// acknowledgement handler's error hook.
///
/// A returned error is logged and never changes the message outcome.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, message: &MessageHeaders, error: &ListenerError) -> Result<(), ListenerError>;

    async fn handle_batch(&self, messages: &[MessageHeaders], error: &ListenerError) -> Result<(), ListenerError> {
        for message in messages {
            self.handle(message, error).await?;
        }
        Ok(())
    }
}

/// Randomization applied to a computed backoff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    #[default]
    None,
    /// Uniform in `1..=timeout`.
    Full,
    /// Uniform in `timeout / 2..=timeout`.
    Half,
}

impl Jitter {
    pub fn apply<R: Rng + ?Sized>(self, timeout: u32, rng: &mut R) -> u32 {
        match self {
            Jitter::None => timeout,
            Jitter::Full => rng.gen_range(0..=timeout).max(1),
            Jitter::Half => {
                let half = timeout / 2;
                (half + rng.gen_range(0..=timeout - half)).max(1)
            }
        }
    }
}

/// Receive count of a message, `1` when the attribute is missing or invalid.
pub fn receive_count(message: &MessageHeaders) -> u64 {
    message
        .get_text(APPROXIMATE_RECEIVE_COUNT)
        .and_then(|count| count.trim().parse::<u64>().ok())
        .unwrap_or(1)
        .max(1)
}

/// `initial * multiplier^(receive_count - 1)`, capped at `max`.
pub fn exponential_timeout(receive_count: u64, initial: u32, multiplier: f64, max: u32) -> u32 {
    let exponent = receive_count.saturating_sub(1).min(i32::MAX as u64) as i32;
    let timeout = f64::from(initial) * multiplier.powi(exponent);
    if timeout >= f64::from(max) {
        max
    } else {
        timeout as u32
    }
}

/// `initial + increment * (receive_count - 1)`, capped at `max`.
pub fn linear_timeout(receive_count: u64, initial: u32, increment: u32, max: u32) -> u32 {
    let timeout = u64::from(increment)
        .saturating_mul(receive_count.saturating_sub(1))
        .saturating_add(u64::from(initial));
    timeout.min(u64::from(max)) as u32
}

fn check_visibility(name: &str, seconds: u32) -> Result<(), ListenerError> {
    if seconds == 0 || seconds > MAX_VISIBILITY_SECONDS {
        return Err(ListenerError::Configuration(format!(
            "{name} must be between 1 and {MAX_VISIBILITY_SECONDS} seconds, got {seconds}"
        )));
    }
    Ok(())
}

fn check_bounds(initial: u32, max: u32) -> Result<(), ListenerError> {
    check_visibility("initial visibility timeout", initial)?;
    check_visibility("max visibility timeout", max)?;
    if initial > max {
        return Err(ListenerError::Configuration(format!(
            "initial visibility timeout {initial} exceeds max visibility timeout {max}"
        )));
    }
    Ok(())
}

async fn change_visibility(message: &MessageHeaders, seconds: u32) -> Result<(), ListenerError> {
    let message_id = message.message_id().unwrap_or("unknown");
    let visibility = message.visibility().ok_or_else(|| {
        ListenerError::LeaseExtension(format!("message {message_id} has no visibility handle"))
    })?;
    debug!(message_id, seconds, "Applying backoff visibility timeout");
    visibility.change_to(seconds).await.inspect_err(|e| {
        warn!(message_id, seconds, error = %e, "Failed to apply backoff visibility timeout");
    })
}

// Messages sharing a receive count get one batch visibility change.
async fn change_batch_visibility<F>(messages: &[MessageHeaders], timeout: F) -> Result<(), ListenerError>
where
    F: Fn(u64) -> u32,
{
    let mut groups: BTreeMap<u64, Vec<&MessageHeaders>> = BTreeMap::new();
    for message in messages {
        groups.entry(receive_count(message)).or_default().push(message);
    }

    let mut failures = Vec::new();
    for (count, members) in groups {
        let seconds = timeout(count);
        let Some(visibility) = BatchVisibility::from_handles(members.iter().filter_map(|m| m.visibility())) else {
            continue;
        };
        debug!(receive_count = count, count = visibility.len(), seconds, "Applying backoff visibility timeout");
        if let Err(e) = visibility.change_to(seconds).await {
            warn!(receive_count = count, seconds, error = %e, "Failed to apply batch backoff visibility timeout");
            failures.push(e.to_string());
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ListenerError::LeaseExtension(failures.join("; ")))
    }
}

/// Delays redelivery exponentially with the receive count.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffErrorHandler {
    initial_visibility_seconds: u32,
    multiplier: f64,
    max_visibility_seconds: u32,
    jitter: Jitter,
}

impl ExponentialBackoffErrorHandler {
    pub fn new(initial_visibility_seconds: u32, multiplier: f64, max_visibility_seconds: u32) -> Result<Self, ListenerError> {
        check_bounds(initial_visibility_seconds, max_visibility_seconds)?;
        if !(multiplier >= 1.0) {
            return Err(ListenerError::Configuration(format!(
                "multiplier must be greater than or equal to 1, got {multiplier}"
            )));
        }
        Ok(ExponentialBackoffErrorHandler {
            initial_visibility_seconds,
            multiplier,
            max_visibility_seconds,
            jitter: Jitter::None,
        })
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Visibility timeout for a message received `receive_count` times.
    pub fn timeout(&self, receive_count: u64) -> u32 {
        let timeout = exponential_timeout(
            receive_count,
            self.initial_visibility_seconds,
            self.multiplier,
            self.max_visibility_seconds,
        );
        self.jitter.apply(timeout, &mut rand::thread_rng())
    }
}

impl Default for ExponentialBackoffErrorHandler {
    fn default() -> Self {
        ExponentialBackoffErrorHandler {
            initial_visibility_seconds: DEFAULT_INITIAL_VISIBILITY_SECONDS,
            multiplier: DEFAULT_MULTIPLIER,
            max_visibility_seconds: DEFAULT_MAX_VISIBILITY_SECONDS,
            jitter: Jitter::None,
        }
    }
}

#[async_trait]
impl ErrorHandler for ExponentialBackoffErrorHandler {
    async fn handle(&self, message: &MessageHeaders, _error: &ListenerError) -> Result<(), ListenerError> {
        change_visibility(message, self.timeout(receive_count(message))).await
    }

    async fn handle_batch(&self, messages: &[MessageHeaders], _error: &ListenerError) -> Result<(), ListenerError> {
        change_batch_visibility(messages, |count| self.timeout(count)).await
    }
}

/// Delays redelivery linearly with the receive count.
#[derive(Debug, Clone)]
pub struct LinearBackoffErrorHandler {
    initial_visibility_seconds: u32,
    increment: u32,
    max_visibility_seconds: u32,
}

impl LinearBackoffErrorHandler {
    pub fn new(initial_visibility_seconds: u32, increment: u32, max_visibility_seconds: u32) -> Result<Self, ListenerError> {
        check_bounds(initial_visibility_seconds, max_visibility_seconds)?;
        if increment == 0 {
            return Err(ListenerError::Configuration(
                "increment must be greater than or equal to 1".to_string(),
            ));
        }
        Ok(LinearBackoffErrorHandler {
            initial_visibility_seconds,
            increment,
            max_visibility_seconds,
        })
    }

    pub fn timeout(&self, receive_count: u64) -> u32 {
        linear_timeout(
            receive_count,
            self.initial_visibility_seconds,
            self.increment,
            self.max_visibility_seconds,
        )
    }
}

impl Default for LinearBackoffErrorHandler {
    fn default() -> Self {
        LinearBackoffErrorHandler {
            initial_visibility_seconds: DEFAULT_INITIAL_VISIBILITY_SECONDS,
            increment: DEFAULT_INCREMENT,
            max_visibility_seconds: DEFAULT_MAX_VISIBILITY_SECONDS,
        }
    }
}

#[async_trait]
impl ErrorHandler for LinearBackoffErrorHandler {
    async fn handle(&self, message: &MessageHeaders, _error: &ListenerError) -> Result<(), ListenerError> {
        change_visibility(message, self.timeout(receive_count(message))).await
    }

    async fn handle_batch(&self, messages: &[MessageHeaders], _error: &ListenerError) -> Result<(), ListenerError> {
        change_batch_visibility(messages, |count| self.timeout(count)).await
    }
}
