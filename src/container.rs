//! Listener containers: bounded concurrent dispatch of received messages
//! through a processing pipeline.
//!
//! The container does not poll. An outer receive loop hands it each batch returned
//! by `ReceiveMessage` through [`MessageListenerContainer::dispatch`] and
//! consumes the [`Completion`]s of processed messages from the returned
//! [`CompletionReceiver`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::acknowledgement::AcknowledgementHandler;
use crate::converter::SqsMessageConverter;
use crate::error_handler::ErrorHandler;
use crate::errors::ListenerError;
use crate::interceptor::visibility::MessageVisibilityExtendingInterceptor;
use crate::interceptor::{InterceptorChain, MessageInterceptor};
use crate::listener::{BatchMessageListener, MessageListener, panic_message};
use crate::message::RawMessage;
use crate::pipeline::{BatchProcessingPipeline, Completion, Converted, MessageProcessingPipeline};

pub mod config;

pub use config::ContainerOptions;

/// Completion of a message or batch, or the fatal error that stopped the
/// container.
pub type CompletionResult = Result<Completion, ListenerError>;

pub type CompletionReceiver = mpsc::UnboundedReceiver<CompletionResult>;

/// Builds listener containers from [`ContainerOptions`] and a declared list
/// of interceptors.
///
/// When minimum visibility is configured, a
/// [`MessageVisibilityExtendingInterceptor`] is placed ahead of the declared
/// interceptors.
pub struct ListenerContainerFactory<T>
where
    T: Send + Sync + 'static,
{
    options: ContainerOptions,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    acknowledgement_handler: Option<Arc<dyn AcknowledgementHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl<T> ListenerContainerFactory<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(options: ContainerOptions) -> Self {
        ListenerContainerFactory {
            options,
            interceptors: Vec::new(),
            acknowledgement_handler: None,
            error_handler: None,
        }
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Appends an interceptor. Interceptors run in the order they are added.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor<T>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replaces the handler derived from the acknowledgement mode.
    pub fn with_acknowledgement_handler(mut self, handler: Arc<dyn AcknowledgementHandler>) -> Self {
        self.acknowledgement_handler = Some(handler);
        self
    }

    /// Runs `error_handler` for failed messages before the acknowledgement
    /// handler, e.g. a backoff handler.
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Creates a container invoking `listener` once per message.
    pub fn create_container(
        &self,
        converter: SqsMessageConverter<T>,
        listener: Arc<dyn MessageListener<T>>,
    ) -> Result<(MessageListenerContainer<T>, CompletionReceiver), ListenerError> {
        let mut pipeline = MessageProcessingPipeline::new(self.interceptor_chain()?, listener, self.handler());
        if let Some(error_handler) = &self.error_handler {
            pipeline = pipeline.with_error_handler(Arc::clone(error_handler));
        }
        Ok(self.build(converter, Dispatcher::Single(Arc::new(pipeline))))
    }

    /// Creates a container invoking `listener` once per dispatched batch.
    ///
    /// Fails when a declared interceptor does not support batches.
    pub fn create_batch_container(
        &self,
        converter: SqsMessageConverter<T>,
        listener: Arc<dyn BatchMessageListener<T>>,
    ) -> Result<(MessageListenerContainer<T>, CompletionReceiver), ListenerError> {
        let mut pipeline = BatchProcessingPipeline::new(self.interceptor_chain()?, listener, self.handler())?;
        if let Some(error_handler) = &self.error_handler {
            pipeline = pipeline.with_error_handler(Arc::clone(error_handler));
        }
        Ok(self.build(converter, Dispatcher::Batch(Arc::new(pipeline))))
    }

    fn interceptor_chain(&self) -> Result<InterceptorChain<T>, ListenerError> {
        self.options.validate()?;

        let mut chain = InterceptorChain::new();
        if let Some(seconds) = self.options.minimum_visibility_seconds {
            chain.push(Arc::new(MessageVisibilityExtendingInterceptor::new(seconds)?));
        }
        for interceptor in &self.interceptors {
            chain.push(Arc::clone(interceptor));
        }
        Ok(chain)
    }

    fn handler(&self) -> Arc<dyn AcknowledgementHandler> {
        self.acknowledgement_handler
            .clone()
            .unwrap_or_else(|| self.options.acknowledgement_mode.handler())
    }

    fn build(
        &self,
        converter: SqsMessageConverter<T>,
        dispatcher: Dispatcher<T>,
    ) -> (MessageListenerContainer<T>, CompletionReceiver) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let max_concurrent_messages = self.options.max_concurrent_messages;

        info!(
            queue = %converter.queue().queue_name,
            acknowledgement_mode = %self.options.acknowledgement_mode,
            max_concurrent_messages,
            batch = matches!(dispatcher, Dispatcher::Batch(_)),
            "Created listener container"
        );

        let container = MessageListenerContainer {
            converter: Arc::new(converter),
            dispatcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent_messages)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(JoinSet::new()),
            completions,
            running: Arc::new(AtomicBool::new(true)),
            shutdown_timeout: self.options.shutdown_timeout(),
        };
        (container, receiver)
    }
}

impl<T> Default for ListenerContainerFactory<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        ListenerContainerFactory::new(ContainerOptions::default())
    }
}

enum Dispatcher<T>
where
    T: Send + Sync + 'static,
{
    Single(Arc<MessageProcessingPipeline<T>>),
    Batch(Arc<BatchProcessingPipeline<T>>),
}

/// Processes dispatched messages concurrently, at most
/// `max_concurrent_messages` at a time.
pub struct MessageListenerContainer<T>
where
    T: Send + Sync + 'static,
{
    converter: Arc<SqsMessageConverter<T>>,
    dispatcher: Dispatcher<T>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    tasks: Mutex<JoinSet<()>>,
    completions: mpsc::UnboundedSender<CompletionResult>,
    running: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl<T> MessageListenerContainer<T>
where
    T: Send + Sync + 'static,
{
    pub fn queue_name(&self) -> &str {
        &self.converter.queue().queue_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Messages (or batches) currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Converts `messages` and schedules their processing.
    ///
    /// Waits while the worker pool is full. Returns once every message has
    /// been handed to a worker, not when processing completes. When the
    /// container stops while waiting, the messages not yet handed over
    /// complete with [`ListenerError::Stopped`] and `Err(Stopped)` is returned.
    pub async fn dispatch(&self, messages: Vec<RawMessage>) -> Result<(), ListenerError> {
        if !self.is_running() {
            return Err(ListenerError::Stopped);
        }
        if messages.is_empty() {
            return Ok(());
        }

        let converted = self.converter.convert_batch(&messages);
        debug!(queue = %self.queue_name(), count = converted.len(), "Dispatching messages");

        match &self.dispatcher {
            Dispatcher::Single(pipeline) => {
                let mut pending = converted.into_iter();
                while let Some(message) = pending.next() {
                    let permit = match self.acquire().await {
                        Ok(permit) => permit,
                        Err(stopped) => {
                            let rejected: Vec<String> = std::iter::once(&message)
                                .chain(pending.as_slice())
                                .map(|message| converted_message_id(message).to_string())
                                .collect();
                            self.reject(rejected.into_iter().map(|message_id| vec![message_id]));
                            return Err(stopped);
                        }
                    };
                    let message_id = converted_message_id(&message).to_string();
                    let span = info_span!("sqs_message", message_id = %message_id, queue = %self.queue_name());
                    let pipeline = Arc::clone(pipeline);
                    let processing = async move { pipeline.process(message).await.map(|completion| vec![completion]) };
                    self.spawn(permit, vec![message_id], processing.instrument(span)).await;
                }
            }
            Dispatcher::Batch(pipeline) => {
                let message_ids: Vec<String> = converted
                    .iter()
                    .map(|message| converted_message_id(message).to_string())
                    .collect();
                let permit = match self.acquire().await {
                    Ok(permit) => permit,
                    Err(stopped) => {
                        self.reject(std::iter::once(message_ids));
                        return Err(stopped);
                    }
                };
                let span = info_span!("sqs_batch", count = converted.len(), queue = %self.queue_name());
                let pipeline = Arc::clone(pipeline);
                let processing = async move { pipeline.process(converted).await };
                self.spawn(permit, message_ids, processing.instrument(span)).await;
            }
        }

        self.reap().await;
        Ok(())
    }

    /// Stops accepting messages and waits up to the shutdown timeout for
    /// in-flight messages. Messages still running afterwards are left to
    /// finish on their own. Buffered acknowledgements are flushed last.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.semaphore.close();
        info!(queue = %self.queue_name(), in_flight = self.in_flight(), "Stopping listener container");

        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        })
        .await;

        match drained {
            Ok(()) => info!(queue = %self.queue_name(), "Listener container stopped"),
            Err(_) => {
                warn!(
                    queue = %self.queue_name(),
                    remaining = tasks.len(),
                    timeout_seconds = self.shutdown_timeout.as_secs(),
                    "Shutdown timeout elapsed, abandoning in-flight messages"
                );
                tasks.detach_all();
            }
        }
        drop(tasks);

        if let Err(e) = self.converter.acknowledgement_callback().flush().await {
            error!(queue = %self.queue_name(), error = %e, "Failed to flush acknowledgements on stop");
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ListenerError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Stopped)
    }

    // A panic escaping the pipeline still completes the messages and frees
    // their worker slot.
    async fn spawn<F>(&self, permit: OwnedSemaphorePermit, message_ids: Vec<String>, processing: F)
    where
        F: Future<Output = Result<Vec<Completion>, ListenerError>> + Send + 'static,
    {
        let completions = self.completions.clone();
        let running = Arc::clone(&self.running);
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);

        self.tasks.lock().await.spawn(async move {
            let result = AssertUnwindSafe(processing).catch_unwind().await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            match result {
                Ok(Ok(completed)) => {
                    for completion in completed {
                        send_completion(&completions, Ok(completion));
                    }
                }
                Ok(Err(fatal)) => stop_on_fatal(&running, &semaphore, &completions, fatal),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(message_ids = ?message_ids, panic = %reason, "Message processing panicked");
                    send_completion(
                        &completions,
                        Ok(Completion {
                            message_ids,
                            processing_error: Some(ListenerError::handler(format!(
                                "message processing panicked: {reason}"
                            ))),
                            acknowledgement_error: None,
                            skipped: false,
                        }),
                    );
                }
            }
        });
    }

    fn reject(&self, groups: impl IntoIterator<Item = Vec<String>>) {
        for message_ids in groups {
            warn!(queue = %self.queue_name(), message_ids = ?message_ids, "Container stopped before dispatch");
            send_completion(
                &self.completions,
                Ok(Completion {
                    message_ids,
                    processing_error: Some(ListenerError::Stopped),
                    acknowledgement_error: None,
                    skipped: false,
                }),
            );
        }
    }

    async fn reap(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            log_task_result(result);
        }
    }
}

fn converted_message_id<T>(converted: &Converted<T>) -> &str {
    match converted {
        Ok(message) => message.message_id(),
        Err(conversion) => conversion.message_id(),
    }
}

fn send_completion(completions: &mpsc::UnboundedSender<CompletionResult>, completion: CompletionResult) {
    if completions.send(completion).is_err() {
        debug!("Completion receiver dropped");
    }
}

fn stop_on_fatal(
    running: &AtomicBool,
    semaphore: &Semaphore,
    completions: &mpsc::UnboundedSender<CompletionResult>,
    fatal: ListenerError,
) {
    error!(error = %fatal, "Fatal listener error, stopping container");
    running.store(false, Ordering::Release);
    semaphore.close();
    send_completion(completions, Err(fatal));
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Message processing task failed");
    }
}
