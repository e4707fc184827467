use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::acknowledgement::AcknowledgementMode;
use crate::errors::ListenerError;
use crate::interceptor::visibility::validate_minimum_visibility;

pub const ENV_ACKNOWLEDGEMENT_MODE: &str = "SQS_LISTENER_ACKNOWLEDGEMENT_MODE";
pub const ENV_MINIMUM_VISIBILITY_SECONDS: &str = "SQS_LISTENER_MINIMUM_VISIBILITY_SECONDS";
pub const ENV_MAX_CONCURRENT_MESSAGES: &str = "SQS_LISTENER_MAX_CONCURRENT_MESSAGES";
pub const ENV_SHUTDOWN_TIMEOUT_SECONDS: &str = "SQS_LISTENER_SHUTDOWN_TIMEOUT_SECONDS";

/// Configuration for a listener container.
///
/// # Fields
/// - `acknowledgement_mode`: When processed messages are deleted from the queue.
/// - `minimum_visibility_seconds`: Visibility a message must have left before
///   the listener runs; extended otherwise. `None` disables extension.
/// - `max_concurrent_messages`: Size of the worker pool.
/// - `shutdown_timeout_seconds`: Grace period for in-flight messages on stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub acknowledgement_mode: AcknowledgementMode,

    pub minimum_visibility_seconds: Option<u32>,

    /// Messages (or batches, in batch mode) processed at the same time.
    pub max_concurrent_messages: usize,

    pub shutdown_timeout_seconds: u64,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        ContainerOptions {
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            minimum_visibility_seconds: None,
            max_concurrent_messages: 10,
            shutdown_timeout_seconds: 20,
        }
    }
}

impl ContainerOptions {
    /// Defaults with environment variable overrides applied.
    pub fn from_env() -> Result<Self, ListenerError> {
        let mut options = ContainerOptions::default();
        options.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(options)
    }

    /// Applies overrides looked up by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ListenerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ACKNOWLEDGEMENT_MODE) {
            self.acknowledgement_mode = value.parse()?;
        }
        if let Some(value) = lookup(ENV_MINIMUM_VISIBILITY_SECONDS) {
            self.minimum_visibility_seconds = Some(parse_number(ENV_MINIMUM_VISIBILITY_SECONDS, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_MESSAGES) {
            self.max_concurrent_messages = parse_number(ENV_MAX_CONCURRENT_MESSAGES, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT_SECONDS) {
            self.shutdown_timeout_seconds = parse_number(ENV_SHUTDOWN_TIMEOUT_SECONDS, &value)?;
        }
        debug!(options = ?self, "Applied container option overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ListenerError> {
        if let Some(seconds) = self.minimum_visibility_seconds {
            validate_minimum_visibility(seconds)?;
        }
        if self.max_concurrent_messages == 0 {
            return Err(ListenerError::Configuration(
                "max_concurrent_messages must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_messages > Semaphore::MAX_PERMITS {
            return Err(ListenerError::Configuration(format!(
                "max_concurrent_messages must not exceed {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent_messages
            )));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn parse_number<N: std::str::FromStr>(name: &str, value: &str) -> Result<N, ListenerError> {
    value
        .trim()
        .parse()
        .map_err(|_| ListenerError::Configuration(format!("{name} must be a non-negative integer, got '{value}'")))
}
