//! # SQS Message Pipeline
//!
//! An asynchronous delivery pipeline for AWS SQS messages: conversion of
//! received messages into typed application messages, an interceptor chain,
//! proactive visibility extension, listener invocation and policy-driven
//! acknowledgement.
//!
//! ## Features
//!
//! - Typed [`ApplicationMessage`]s carrying visibility and acknowledgement handles
//! - Ordered interceptor chain with single-message and batch hooks
//! - Visibility extension for messages about to run out of visibility
//! - `ON_SUCCESS`, `ALWAYS` and `MANUAL` acknowledgement modes, optionally batched
//! - Exponential and linear backoff of failed messages by receive count
//! - Bounded concurrent processing with graceful shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rs_sqs_pipeline::client::create_sqs_client_from_env;
//! use rs_sqs_pipeline::container::{ContainerOptions, ListenerContainerFactory};
//! use rs_sqs_pipeline::converter::{QueueAttributes, SqsMessageConverter, StringPayloadConverter};
//! use rs_sqs_pipeline::listener::listener_fn;
//! use rs_sqs_pipeline::message::{ApplicationMessage, RawMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = create_sqs_client_from_env().await;
//!     let queue_url = "https://sqs.region.amazonaws.com/account/queue-name";
//!
//!     let queue = QueueAttributes::fetch(&client, queue_url).await?;
//!     let converter = SqsMessageConverter::<String>::new(Arc::new(StringPayloadConverter), queue, Arc::new(client.clone()));
//!
//!     let options = ContainerOptions {
//!         minimum_visibility_seconds: Some(60),
//!         ..ContainerOptions::from_env()?
//!     };
//!     let factory = ListenerContainerFactory::new(options);
//!     let (container, mut completions) = factory.create_container(
//!         converter,
//!         Arc::new(listener_fn(|message: ApplicationMessage<String>| async move {
//!             println!("Processing message: {}", message.payload());
//!             Ok(())
//!         })),
//!     )?;
//!
//!     tokio::spawn(async move {
//!         while let Some(completion) = completions.recv().await {
//!             println!("Completed: {:?}", completion);
//!         }
//!     });
//!
//!     loop {
//!         let output = client
//!             .receive_message()
//!             .queue_url(queue_url)
//!             .max_number_of_messages(10)
//!             .wait_time_seconds(20)
//!             .send()
//!             .await?;
//!         let messages = output
//!             .messages()
//!             .iter()
//!             .filter_map(|message| RawMessage::try_from(message).ok())
//!             .collect();
//!         container.dispatch(messages).await?;
//!     }
//! }
//! ```

pub mod acknowledgement;
pub mod client;
pub mod container;
pub mod converter;
pub mod error_handler;
pub mod errors;
pub mod interceptor;
pub mod listener;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod visibility;

pub use acknowledgement::{
    Acknowledgement, AcknowledgementCallback, AcknowledgementHandler, AcknowledgementMode,
    BatchingAcknowledgementCallback,
};
pub use container::{ContainerOptions, ListenerContainerFactory, MessageListenerContainer};
pub use error_handler::{ErrorHandler, ExponentialBackoffErrorHandler, LinearBackoffErrorHandler};
pub use errors::{BoxError, ConversionError, ListenerError};
pub use interceptor::{Interception, InterceptorChain, MessageInterceptor};
pub use listener::{BatchMessageListener, MessageListener};
pub use message::{ApplicationMessage, MessageHeaders, RawMessage};
pub use visibility::QueueMessageVisibility;
