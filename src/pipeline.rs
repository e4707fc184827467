//! Per-message processing: interceptors, listener, after-processing hooks
//! and acknowledgement, strictly in that order.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::acknowledgement::AcknowledgementHandler;
use crate::error_handler::ErrorHandler;
use crate::errors::{ConversionError, ListenerError};
use crate::interceptor::{Interception, InterceptorChain};
use crate::listener::{BatchMessageListener, MessageListener, invoke_listener};
use crate::message::{ApplicationMessage, MessageHeaders};

pub type Converted<T> = Result<ApplicationMessage<T>, ConversionError>;

/// Completion signal for one message, or for the messages of one batch.
#[derive(Debug)]
pub struct Completion {
    pub message_ids: Vec<String>,
    /// Conversion, interceptor or listener failure.
    pub processing_error: Option<ListenerError>,
    /// Failure to apply the acknowledgement decision. The messages may be
    /// redelivered even when processing succeeded.
    pub acknowledgement_error: Option<ListenerError>,
    /// An interceptor skipped the listener.
    pub skipped: bool,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.processing_error.is_none() && self.acknowledgement_error.is_none()
    }
}

/// Pipeline for listeners that take one message at a time.
pub struct MessageProcessingPipeline<T>
where
    T: Send + Sync + 'static,
{
    interceptors: InterceptorChain<T>,
    listener: Arc<dyn MessageListener<T>>,
    acknowledgement_handler: Arc<dyn AcknowledgementHandler>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl<T> MessageProcessingPipeline<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        interceptors: InterceptorChain<T>,
        listener: Arc<dyn MessageListener<T>>,
        acknowledgement_handler: Arc<dyn AcknowledgementHandler>,
    ) -> Self {
        MessageProcessingPipeline {
            interceptors,
            listener,
            acknowledgement_handler,
            error_handler: None,
        }
    }

    /// Runs `error_handler` for failed messages before the acknowledgement
    /// handler.
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Processes one converted message.
    ///
    /// Returns `Err` only for container-fatal errors; after-processing hooks
    /// have run by then.
    pub async fn process(&self, converted: Converted<T>) -> Result<Completion, ListenerError> {
        let message = match converted {
            Ok(message) => message,
            Err(conversion) => return Ok(self.conversion_failed(conversion).await),
        };
        let message_ids = vec![message.message_id().to_string()];

        let (message, outcome) = match self.interceptors.intercept(message.clone()).await {
            Ok(Interception::Proceed(intercepted)) => {
                let invocation = invoke_listener(|| self.listener.on_message(intercepted.clone())).await;
                match invocation {
                    Ok(outcome) => (intercepted, Some(outcome)),
                    Err(fatal) => {
                        self.interceptors.after_processing(&intercepted, Some(&fatal)).await;
                        return Err(fatal);
                    }
                }
            }
            Ok(Interception::Skip(intercepted)) => (intercepted, None),
            Err(e) if e.is_fatal() => {
                self.interceptors.after_processing(&message, Some(&e)).await;
                return Err(e);
            }
            Err(e) => (message, Some(Err(e))),
        };

        let processing_error = outcome.as_ref().and_then(|outcome| outcome.as_ref().err());
        self.interceptors.after_processing(&message, processing_error).await;

        let headers = message.headers();
        let acknowledgement = match &outcome {
            Some(Ok(())) => self.acknowledgement_handler.on_success(headers).await,
            Some(Err(e)) => {
                handle_error(self.error_handler.as_deref(), headers, e).await;
                self.acknowledgement_handler.on_error(headers, e).await
            }
            None => {
                debug!(message_id = %message.message_id(), "Listener skipped by interceptor");
                Ok(())
            }
        };
        if let Err(e) = &acknowledgement {
            error!(message_id = %message.message_id(), error = %e, "Acknowledgement failed");
        }

        Ok(Completion {
            message_ids,
            skipped: outcome.is_none(),
            processing_error: outcome.and_then(Result::err),
            acknowledgement_error: acknowledgement.err(),
        })
    }

    async fn conversion_failed(&self, conversion: ConversionError) -> Completion {
        conversion_failed(self.acknowledgement_handler.as_ref(), self.error_handler.as_deref(), conversion).await
    }
}

async fn handle_error(error_handler: Option<&dyn ErrorHandler>, message: &MessageHeaders, error: &ListenerError) {
    let Some(error_handler) = error_handler else {
        return;
    };
    if let Err(e) = error_handler.handle(message, error).await {
        warn!(message_id = message.message_id().unwrap_or("unknown"), error = %e, "Error handler failed");
    }
}

async fn handle_batch_error(error_handler: Option<&dyn ErrorHandler>, messages: &[MessageHeaders], error: &ListenerError) {
    let Some(error_handler) = error_handler else {
        return;
    };
    if let Err(e) = error_handler.handle_batch(messages, error).await {
        warn!(count = messages.len(), error = %e, "Batch error handler failed");
    }
}

async fn conversion_failed(
    handler: &dyn AcknowledgementHandler,
    error_handler: Option<&dyn ErrorHandler>,
    conversion: ConversionError,
) -> Completion {
    let headers = conversion.headers().clone();
    let message_ids = vec![conversion.message_id().to_string()];
    let processing_error = ListenerError::Conversion(conversion);
    debug!(message_id = %message_ids[0], error = %processing_error, "Message conversion failed");

    handle_error(error_handler, &headers, &processing_error).await;
    let acknowledgement = handler.on_error(&headers, &processing_error).await;
    Completion {
        message_ids,
        processing_error: Some(processing_error),
        acknowledgement_error: acknowledgement.err(),
        skipped: false,
    }
}

/// Pipeline for listeners that take all messages received together.
pub struct BatchProcessingPipeline<T>
where
    T: Send + Sync + 'static,
{
    interceptors: InterceptorChain<T>,
    listener: Arc<dyn BatchMessageListener<T>>,
    acknowledgement_handler: Arc<dyn AcknowledgementHandler>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl<T> BatchProcessingPipeline<T>
where
    T: Send + Sync + 'static,
{
    /// Fails when an interceptor of `interceptors` does not support batches.
    pub fn new(
        interceptors: InterceptorChain<T>,
        listener: Arc<dyn BatchMessageListener<T>>,
        acknowledgement_handler: Arc<dyn AcknowledgementHandler>,
    ) -> Result<Self, ListenerError> {
        interceptors.validate_batch()?;
        Ok(BatchProcessingPipeline {
            interceptors,
            listener,
            acknowledgement_handler,
            error_handler: None,
        })
    }

    /// Runs `error_handler` for failed batches before the acknowledgement
    /// handler.
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Processes converted messages of one batch.
    ///
    /// Messages that failed to convert complete individually and never reach
    /// the listener. The remaining messages complete together as the first
    /// element of the returned list.
    pub async fn process(&self, converted: Vec<Converted<T>>) -> Result<Vec<Completion>, ListenerError> {
        let mut messages = Vec::with_capacity(converted.len());
        let mut failures = Vec::new();
        for result in converted {
            match result {
                Ok(message) => messages.push(message),
                Err(conversion) => failures.push(conversion),
            }
        }

        let mut completions = Vec::with_capacity(failures.len() + 1);
        if !messages.is_empty() {
            completions.push(self.process_converted(messages).await?);
        }
        for conversion in failures {
            completions.push(
                conversion_failed(self.acknowledgement_handler.as_ref(), self.error_handler.as_deref(), conversion).await,
            );
        }
        Ok(completions)
    }

    async fn process_converted(&self, messages: Vec<ApplicationMessage<T>>) -> Result<Completion, ListenerError> {
        let message_ids: Vec<String> = messages
            .iter()
            .map(|message| message.message_id().to_string())
            .collect();

        let (messages, outcome) = match self.interceptors.intercept_batch(messages.clone()).await {
            Ok(Interception::Proceed(intercepted)) => {
                let invocation = invoke_listener(|| self.listener.on_messages(intercepted.clone())).await;
                match invocation {
                    Ok(outcome) => (intercepted, Some(outcome)),
                    Err(fatal) => {
                        self.interceptors.after_batch_processing(&intercepted, Some(&fatal)).await;
                        return Err(fatal);
                    }
                }
            }
            Ok(Interception::Skip(intercepted)) => (intercepted, None),
            Err(e) if e.is_fatal() => {
                self.interceptors.after_batch_processing(&messages, Some(&e)).await;
                return Err(e);
            }
            Err(e) => (messages, Some(Err(e))),
        };

        let processing_error = outcome.as_ref().and_then(|outcome| outcome.as_ref().err());
        self.interceptors.after_batch_processing(&messages, processing_error).await;

        let headers: Vec<MessageHeaders> = messages.iter().map(|message| message.headers().clone()).collect();
        let acknowledgement = match &outcome {
            Some(Ok(())) => self.acknowledgement_handler.on_batch_success(&headers).await,
            Some(Err(e)) => {
                handle_batch_error(self.error_handler.as_deref(), &headers, e).await;
                self.acknowledgement_handler.on_batch_error(&headers, e).await
            }
            None => Ok(()),
        };
        if let Err(e) = &acknowledgement {
            error!(count = headers.len(), error = %e, "Batch acknowledgement failed");
        }

        Ok(Completion {
            message_ids,
            skipped: outcome.is_none(),
            processing_error: outcome.and_then(Result::err),
            acknowledgement_error: acknowledgement.err(),
        })
    }
}
