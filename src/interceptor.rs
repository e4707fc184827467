//! Hooks that run before and after a listener processes a message.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use crate::errors::ListenerError;
use crate::listener::panic_message;
use crate::message::ApplicationMessage;

pub mod visibility;

pub use visibility::MessageVisibilityExtendingInterceptor;

/// Result of a pre-processing hook.
#[derive(Debug)]
pub enum Interception<M> {
    /// Continue with the next interceptor and then the listener.
    Proceed(M),
    /// Stop: later interceptors and the listener are skipped. After-processing
    /// hooks still run.
    Skip(M),
}

impl<M> Interception<M> {
    pub fn into_inner(self) -> M {
        match self {
            Interception::Proceed(inner) | Interception::Skip(inner) => inner,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Interception::Skip(_))
    }
}

/// Pre- and post-processing hooks for single messages and batches.
///
/// Every hook defaults to passing its input through unchanged. An
/// interceptor that cannot handle batches returns `false` from
/// [`supports_batch`](MessageInterceptor::supports_batch); containers in batch
/// mode refuse to build with it.
#[async_trait]
pub trait MessageInterceptor<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    fn supports_batch(&self) -> bool {
        true
    }

    async fn intercept(
        &self,
        message: ApplicationMessage<T>,
    ) -> Result<Interception<ApplicationMessage<T>>, ListenerError> {
        Ok(Interception::Proceed(message))
    }

    async fn intercept_batch(
        &self,
        messages: Vec<ApplicationMessage<T>>,
    ) -> Result<Interception<Vec<ApplicationMessage<T>>>, ListenerError> {
        Ok(Interception::Proceed(messages))
    }

    async fn after_processing(
        &self,
        _message: &ApplicationMessage<T>,
        _error: Option<&ListenerError>,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn after_batch_processing(
        &self,
        _messages: &[ApplicationMessage<T>],
        _error: Option<&ListenerError>,
    ) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Interceptors in declaration order. Each hook awaits the previous one.
pub struct InterceptorChain<T>
where
    T: Send + Sync + 'static,
{
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
}

impl<T> InterceptorChain<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        InterceptorChain {
            interceptors: Vec::new(),
        }
    }

    pub fn with(mut self, interceptor: Arc<dyn MessageInterceptor<T>>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn MessageInterceptor<T>>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Fails when an interceptor of the chain cannot handle batches.
    pub fn validate_batch(&self) -> Result<(), ListenerError> {
        match self
            .interceptors
            .iter()
            .position(|interceptor| !interceptor.supports_batch())
        {
            Some(index) => Err(ListenerError::Configuration(format!(
                "interceptor at position {index} does not support batch processing"
            ))),
            None => Ok(()),
        }
    }

    pub async fn intercept(
        &self,
        message: ApplicationMessage<T>,
    ) -> Result<Interception<ApplicationMessage<T>>, ListenerError> {
        let mut current = message;
        for interceptor in &self.interceptors {
            match guarded(|| interceptor.intercept(current))
                .await
                .map_err(into_interceptor_error)?
            {
                Interception::Proceed(next) => current = next,
                skipped @ Interception::Skip(_) => return Ok(skipped),
            }
        }
        Ok(Interception::Proceed(current))
    }

    pub async fn intercept_batch(
        &self,
        messages: Vec<ApplicationMessage<T>>,
    ) -> Result<Interception<Vec<ApplicationMessage<T>>>, ListenerError> {
        self.validate_batch()?;
        let mut current = messages;
        for interceptor in &self.interceptors {
            match guarded(|| interceptor.intercept_batch(current))
                .await
                .map_err(into_interceptor_error)?
            {
                Interception::Proceed(next) => current = next,
                skipped @ Interception::Skip(_) => return Ok(skipped),
            }
        }
        Ok(Interception::Proceed(current))
    }

    /// Runs every after-processing hook. Hook failures and panics are logged
    /// and do not stop later hooks.
    pub async fn after_processing(&self, message: &ApplicationMessage<T>, error: Option<&ListenerError>) {
        for interceptor in &self.interceptors {
            if let Err(e) = guarded(|| interceptor.after_processing(message, error)).await {
                warn!(message_id = %message.message_id(), error = %e, "After-processing interceptor failed");
            }
        }
    }

    pub async fn after_batch_processing(&self, messages: &[ApplicationMessage<T>], error: Option<&ListenerError>) {
        for interceptor in &self.interceptors {
            if let Err(e) = guarded(|| interceptor.after_batch_processing(messages, error)).await {
                warn!(count = messages.len(), error = %e, "After-processing batch interceptor failed");
            }
        }
    }
}

// Runs one hook, turning a panic into an interceptor error.
async fn guarded<F, Fut, R>(hook: F) -> Result<R, ListenerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, ListenerError>>,
{
    let future = catch_unwind(AssertUnwindSafe(hook)).map_err(interceptor_panicked)?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(interceptor_panicked)?
}

fn interceptor_panicked(panic: Box<dyn Any + Send>) -> ListenerError {
    ListenerError::Interceptor(format!("interceptor panicked: {}", panic_message(panic.as_ref())))
}

// Configuration errors keep their kind so the container can stop on them.
fn into_interceptor_error(error: ListenerError) -> ListenerError {
    match error {
        ListenerError::Configuration(_) | ListenerError::Fatal(_) | ListenerError::Interceptor(_) => error,
        other => ListenerError::Interceptor(other.to_string()),
    }
}

impl<T> Default for InterceptorChain<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        InterceptorChain::new()
    }
}

impl<T> Clone for InterceptorChain<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        InterceptorChain {
            interceptors: self.interceptors.clone(),
        }
    }
}
