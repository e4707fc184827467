//! Application listeners and the adapter that observes their completion.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;

use async_trait::async_trait;
use futures::FutureExt;

use crate::errors::{BoxError, ListenerError};
use crate::message::ApplicationMessage;

/// Processes one message at a time.
#[async_trait]
pub trait MessageListener<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn on_message(&self, message: ApplicationMessage<T>) -> Result<(), BoxError>;
}

/// Processes all messages received together in one call.
#[async_trait]
pub trait BatchMessageListener<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn on_messages(&self, messages: Vec<ApplicationMessage<T>>) -> Result<(), BoxError>;
}

type ListenerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

// The closure adapters call the closure before boxing its future, so a panic
// while creating the future surfaces at the call site.

/// Listener backed by an async closure. See [`listener_fn`].
pub struct ListenerFn<F> {
    f: F,
}

/// Wraps `Fn(ApplicationMessage<T>) -> Future` as a [`MessageListener`].
pub fn listener_fn<F>(f: F) -> ListenerFn<F> {
    ListenerFn { f }
}

impl<F, Fut, T> MessageListener<T> for ListenerFn<F>
where
    F: Fn(ApplicationMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    fn on_message<'life0, 'async_trait>(&'life0 self, message: ApplicationMessage<T>) -> ListenerFuture<'async_trait>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin((self.f)(message))
    }
}

/// Listener backed by an async closure receiving a clone of shared resources
/// with every message.
///
/// # Type Parameters
///
/// * `F` - The message handler function type
/// * `TShared` - The type of shared resources passed to the handler
pub struct SharedListenerFn<F, TShared> {
    f: F,
    shared_resources: TShared,
}

/// Wraps `Fn(ApplicationMessage<T>, TShared) -> Future` as a [`MessageListener`].
pub fn shared_listener_fn<F, TShared>(f: F, shared_resources: TShared) -> SharedListenerFn<F, TShared> {
    SharedListenerFn { f, shared_resources }
}

impl<F, Fut, T, TShared> MessageListener<T> for SharedListenerFn<F, TShared>
where
    F: Fn(ApplicationMessage<T>, TShared) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    T: Send + Sync + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    fn on_message<'life0, 'async_trait>(&'life0 self, message: ApplicationMessage<T>) -> ListenerFuture<'async_trait>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin((self.f)(message, self.shared_resources.clone()))
    }
}

/// Batch listener backed by an async closure. See [`batch_listener_fn`].
pub struct BatchListenerFn<F> {
    f: F,
}

pub fn batch_listener_fn<F>(f: F) -> BatchListenerFn<F> {
    BatchListenerFn { f }
}

impl<F, Fut, T> BatchMessageListener<T> for BatchListenerFn<F>
where
    F: Fn(Vec<ApplicationMessage<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    fn on_messages<'life0, 'async_trait>(
        &'life0 self,
        messages: Vec<ApplicationMessage<T>>,
    ) -> ListenerFuture<'async_trait>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin((self.f)(messages))
    }
}

/// Runs one listener invocation and turns its completion into a processing
/// outcome.
///
/// The inner result is the per-message outcome: `Err(Handler)` when the
/// listener returned an error or panicked while running. The outer `Err` is
/// a [`ListenerError::Fatal`] raised when creating the invocation itself
/// panicked; it is never folded into the per-message outcome.
pub async fn invoke_listener<F, Fut>(invocation: F) -> Result<Result<(), ListenerError>, ListenerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    let future = catch_unwind(AssertUnwindSafe(invocation))
        .map_err(|panic| ListenerError::Fatal(panic_message(panic.as_ref())))?;

    let outcome = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ListenerError::Handler(e)),
        Err(panic) => Err(ListenerError::handler(format!(
            "listener panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    Ok(outcome)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
