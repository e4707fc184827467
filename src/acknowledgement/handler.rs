use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::acknowledgement::acknowledge_all;
use crate::errors::ListenerError;
use crate::message::MessageHeaders;

/// Decides whether processed messages get acknowledged.
///
/// All hooks default to doing nothing. Implementations are stateless and
/// shared by every in-flight message of a container.
#[async_trait]
pub trait AcknowledgementHandler: Send + Sync {
    async fn on_success(&self, _message: &MessageHeaders) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn on_batch_success(&self, _messages: &[MessageHeaders]) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn on_error(
        &self,
        _message: &MessageHeaders,
        _error: &ListenerError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn on_batch_error(
        &self,
        _messages: &[MessageHeaders],
        _error: &ListenerError,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

async fn acknowledge(message: &MessageHeaders) -> Result<(), ListenerError> {
    let acknowledgement = message.acknowledgement().ok_or_else(|| {
        ListenerError::Acknowledgement(format!(
            "message {} has no acknowledgement handle",
            message.message_id().unwrap_or("unknown")
        ))
    })?;
    acknowledgement.acknowledge().await
}

async fn acknowledge_batch(messages: &[MessageHeaders]) -> Result<(), ListenerError> {
    let handles = messages
        .iter()
        .map(|message| {
            message.acknowledgement().ok_or_else(|| {
                ListenerError::Acknowledgement(format!(
                    "message {} has no acknowledgement handle",
                    message.message_id().unwrap_or("unknown")
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    acknowledge_all(&handles).await
}

/// Acknowledges messages that were processed successfully.
///
/// Failed messages stay on the queue and are redelivered once their
/// visibility timeout expires, subject to the queue's redrive policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnSuccessAcknowledgementHandler;

#[async_trait]
impl AcknowledgementHandler for OnSuccessAcknowledgementHandler {
    async fn on_success(&self, message: &MessageHeaders) -> Result<(), ListenerError> {
        acknowledge(message).await
    }

    async fn on_batch_success(&self, messages: &[MessageHeaders]) -> Result<(), ListenerError> {
        acknowledge_batch(messages).await
    }

    async fn on_error(
        &self,
        message: &MessageHeaders,
        error: &ListenerError,
    ) -> Result<(), ListenerError> {
        debug!(
            message_id = message.message_id().unwrap_or("unknown"),
            error = %error,
            "Leaving failed message on the queue"
        );
        Ok(())
    }
}

/// Acknowledges every message, whether processing succeeded or not.
///
/// This gives at-most-once delivery: a failed message is removed from the
/// queue and never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAcknowledgementHandler;

#[async_trait]
impl AcknowledgementHandler for AlwaysAcknowledgementHandler {
    async fn on_success(&self, message: &MessageHeaders) -> Result<(), ListenerError> {
        acknowledge(message).await
    }

    async fn on_batch_success(&self, messages: &[MessageHeaders]) -> Result<(), ListenerError> {
        acknowledge_batch(messages).await
    }

    async fn on_error(
        &self,
        message: &MessageHeaders,
        _error: &ListenerError,
    ) -> Result<(), ListenerError> {
        acknowledge(message).await
    }

    async fn on_batch_error(
        &self,
        messages: &[MessageHeaders],
        _error: &ListenerError,
    ) -> Result<(), ListenerError> {
        acknowledge_batch(messages).await
    }
}

/// Never acknowledges. Application code acknowledges through the
/// message's acknowledgement handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAcknowledgementHandler;

impl AcknowledgementHandler for NeverAcknowledgementHandler {}

/// Acknowledgement policy selected for a container.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcknowledgementMode {
    #[default]
    OnSuccess,
    Always,
    Manual,
}

impl AcknowledgementMode {
    pub fn handler(self) -> Arc<dyn AcknowledgementHandler> {
        match self {
            AcknowledgementMode::OnSuccess => Arc::new(OnSuccessAcknowledgementHandler),
            AcknowledgementMode::Always => Arc::new(AlwaysAcknowledgementHandler),
            AcknowledgementMode::Manual => Arc::new(NeverAcknowledgementHandler),
        }
    }
}

impl fmt::Display for AcknowledgementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcknowledgementMode::OnSuccess => "ON_SUCCESS",
            AcknowledgementMode::Always => "ALWAYS",
            AcknowledgementMode::Manual => "MANUAL",
        };
        f.write_str(name)
    }
}

impl FromStr for AcknowledgementMode {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON_SUCCESS" => Ok(AcknowledgementMode::OnSuccess),
            "ALWAYS" => Ok(AcknowledgementMode::Always),
            "MANUAL" => Ok(AcknowledgementMode::Manual),
            other => Err(ListenerError::Configuration(format!(
                "unknown acknowledgement mode '{other}', expected ON_SUCCESS, ALWAYS or MANUAL"
            ))),
        }
    }
}
