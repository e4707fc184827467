mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{RecordingClient, converter, counting_listener, received};
use rs_sqs_pipeline::acknowledgement::AcknowledgementMode;
use rs_sqs_pipeline::error_handler::ExponentialBackoffErrorHandler;
use rs_sqs_pipeline::errors::{BoxError, ListenerError};
use rs_sqs_pipeline::interceptor::visibility::MessageVisibilityExtendingInterceptor;
use rs_sqs_pipeline::interceptor::{Interception, InterceptorChain, MessageInterceptor};
use rs_sqs_pipeline::listener::{BatchMessageListener, batch_listener_fn, listener_fn};
use rs_sqs_pipeline::message::{ApplicationMessage, RawMessage};
use rs_sqs_pipeline::pipeline::{BatchProcessingPipeline, MessageProcessingPipeline};
use tokio::sync::Mutex;

fn extending_chain(minimum_visibility: u32) -> InterceptorChain<String> {
    InterceptorChain::new().with(Arc::new(
        MessageVisibilityExtendingInterceptor::new(minimum_visibility).unwrap(),
    ))
}

/// Records hook invocations and appends its name to the payload.
struct Recording {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageInterceptor<String> for Recording {
    async fn intercept(
        &self,
        message: ApplicationMessage<String>,
    ) -> Result<Interception<ApplicationMessage<String>>, ListenerError> {
        self.log
            .lock()
            .await
            .push(format!("{} before {}", self.name, message.payload()));
        let payload = format!("{}-{}", message.payload(), self.name);
        Ok(Interception::Proceed(message.with_payload(payload)))
    }

    async fn after_processing(
        &self,
        message: &ApplicationMessage<String>,
        error: Option<&ListenerError>,
    ) -> Result<(), ListenerError> {
        self.log.lock().await.push(format!(
            "{} after {} failed={}",
            self.name,
            message.payload(),
            error.is_some()
        ));
        Ok(())
    }
}

struct SkipAll;

#[async_trait]
impl MessageInterceptor<String> for SkipAll {
    fn supports_batch(&self) -> bool {
        false
    }

    async fn intercept(
        &self,
        message: ApplicationMessage<String>,
    ) -> Result<Interception<ApplicationMessage<String>>, ListenerError> {
        Ok(Interception::Skip(message))
    }
}

#[tokio::test]
async fn on_success_extends_expiring_message_and_acknowledges_once() {
    let client = RecordingClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = MessageProcessingPipeline::new(
        extending_chain(30),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 5);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.is_success());
    assert_eq!(completion.message_ids, vec!["m1".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.visibility_changes().await, vec![("r1".to_string(), 30)]);
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
    assert_eq!(client.delete_calls(), 1);
}

#[tokio::test]
async fn manual_mode_never_acknowledges() {
    let client = RecordingClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = MessageProcessingPipeline::new(
        extending_chain(30),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::Manual.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 5);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.visibility_changes().await, vec![("r1".to_string(), 30)]);
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn manual_mode_listener_acknowledges_through_handle() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        Arc::new(listener_fn(|message: ApplicationMessage<String>| async move {
            message.acknowledge().await?;
            message.acknowledge().await?;
            Ok::<(), BoxError>(())
        })),
        AcknowledgementMode::Manual.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 0);
    assert!(pipeline.process(message).await.unwrap().is_success());
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn extends_when_one_second_short_of_minimum() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        extending_chain(30),
        counting_listener(Arc::new(AtomicUsize::new(0)), false),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 1);
    pipeline.process(message).await.unwrap();

    assert_eq!(client.visibility_changes().await, vec![("r1".to_string(), 30)]);
}

#[tokio::test]
async fn does_not_extend_with_enough_visibility_left() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        extending_chain(30),
        counting_listener(Arc::new(AtomicUsize::new(0)), false),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(120)), RawMessage::new("m1", "r1", "payload"), 5);
    pipeline.process(message).await.unwrap();

    assert!(client.visibility_changes().await.is_empty());
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn visibility_extension_failure_still_processes_message() {
    let client = RecordingClient::failing_visibility();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = MessageProcessingPipeline::new(
        extending_chain(60),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 0);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn on_success_leaves_failed_message_on_queue() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::new(AtomicUsize::new(0)), true),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 0);
    let completion = pipeline.process(message).await.unwrap();

    assert!(matches!(completion.processing_error, Some(ListenerError::Handler(_))));
    assert!(completion.acknowledgement_error.is_none());
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn always_acknowledges_failed_message() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::new(AtomicUsize::new(0)), true),
        AcknowledgementMode::Always.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 0);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.processing_error.is_some());
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn conversion_failure_goes_to_error_path() {
    let client = RecordingClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let converter = converter(&client, Some(30));

    let on_success = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::OnSuccess.handler(),
    );
    let completion = on_success
        .process(received(&converter, RawMessage::new("m1", "r1", vec![0xff, 0xfe]), 0))
        .await
        .unwrap();
    assert!(matches!(completion.processing_error, Some(ListenerError::Conversion(_))));
    assert_eq!(client.delete_calls(), 0);

    let always = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::Always.handler(),
    );
    let completion = always
        .process(received(&converter, RawMessage::new("m2", "r2", vec![0xff, 0xfe]), 0))
        .await
        .unwrap();
    assert_eq!(completion.message_ids, vec!["m2".to_string()]);
    assert_eq!(client.deleted().await, vec!["r2".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn acknowledgement_failure_is_reported_separately() {
    let client = RecordingClient::failing_deletes();
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::new(AtomicUsize::new(0)), false),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "payload"), 0);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.processing_error.is_none());
    assert!(matches!(
        completion.acknowledgement_error,
        Some(ListenerError::Acknowledgement(_))
    ));
    assert!(!completion.is_success());
}

#[tokio::test]
async fn interceptors_run_in_declared_order() {
    let client = RecordingClient::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = InterceptorChain::new()
        .with(Arc::new(Recording {
            name: "a",
            log: Arc::clone(&log),
        }))
        .with(Arc::new(Recording {
            name: "b",
            log: Arc::clone(&log),
        }));
    let seen = Arc::new(Mutex::new(String::new()));
    let listener_seen = Arc::clone(&seen);
    let pipeline = MessageProcessingPipeline::new(
        chain,
        Arc::new(listener_fn(move |message: ApplicationMessage<String>| {
            let seen = Arc::clone(&listener_seen);
            async move {
                *seen.lock().await = message.payload().clone();
                Err::<(), BoxError>("declined".into())
            }
        })),
        AcknowledgementMode::OnSuccess.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "x"), 0);
    pipeline.process(message).await.unwrap();

    assert_eq!(*seen.lock().await, "x-a-b");
    assert_eq!(
        *log.lock().await,
        vec![
            "a before x".to_string(),
            "b before x-a".to_string(),
            "a after x-a-b failed=true".to_string(),
            "b after x-a-b failed=true".to_string(),
        ]
    );
}

#[tokio::test]
async fn skipped_message_is_not_acknowledged() {
    let client = RecordingClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new().with(Arc::new(SkipAll)),
        counting_listener(Arc::clone(&calls), false),
        AcknowledgementMode::Always.handler(),
    );

    let message = received(&converter(&client, Some(30)), RawMessage::new("m1", "r1", "x"), 0);
    let completion = pipeline.process(message).await.unwrap();

    assert!(completion.skipped);
    assert!(completion.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn listener_panic_fails_only_that_message() {
    let client = RecordingClient::new();
    let pipeline = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        Arc::new(listener_fn(|message: ApplicationMessage<String>| async move {
            if message.payload() == "poison" {
                panic!("cannot handle poison");
            }
            Ok::<(), BoxError>(())
        })),
        AcknowledgementMode::OnSuccess.handler(),
    );
    let converter = converter(&client, Some(30));

    let poisoned = pipeline
        .process(received(&converter, RawMessage::new("m1", "r1", "poison"), 0))
        .await
        .unwrap();
    let healthy = pipeline
        .process(received(&converter, RawMessage::new("m2", "r2", "fine"), 0))
        .await
        .unwrap();

    assert!(matches!(poisoned.processing_error, Some(ListenerError::Handler(_))));
    assert!(healthy.is_success());
    assert_eq!(client.deleted().await, vec!["r2".to_string()]);
}

fn recording_batch_listener(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn BatchMessageListener<String>> {
    Arc::new(batch_listener_fn(move |messages: Vec<ApplicationMessage<String>>| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock()
                .await
                .extend(messages.iter().map(|message| message.message_id().to_string()));
            Ok::<(), BoxError>(())
        }
    }))
}

#[tokio::test]
async fn batch_keeps_order_and_acknowledges_together() {
    let client = RecordingClient::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = BatchProcessingPipeline::new(
        InterceptorChain::new(),
        recording_batch_listener(Arc::clone(&seen)),
        AcknowledgementMode::OnSuccess.handler(),
    )
    .unwrap();

    let raws = vec![
        RawMessage::new("m1", "r1", "one"),
        RawMessage::new("m2", "r2", "two"),
        RawMessage::new("m3", "r3", "three"),
    ];
    let completions = pipeline
        .process(converter(&client, Some(30)).convert_batch(&raws))
        .await
        .unwrap();

    let expected_ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].message_ids, expected_ids);
    assert_eq!(*seen.lock().await, expected_ids);
    assert_eq!(
        client.deleted().await,
        vec!["r1".to_string(), "r2".to_string(), "r3".to_string()]
    );
    assert_eq!(client.delete_calls(), 1);
}

#[tokio::test]
async fn batch_conversion_failure_does_not_affect_siblings() {
    let client = RecordingClient::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = BatchProcessingPipeline::new(
        InterceptorChain::new(),
        recording_batch_listener(Arc::clone(&seen)),
        AcknowledgementMode::OnSuccess.handler(),
    )
    .unwrap();

    let raws = vec![
        RawMessage::new("m1", "r1", "one"),
        RawMessage::new("m2", "r2", vec![0xff]),
        RawMessage::new("m3", "r3", "three"),
    ];
    let completions = pipeline
        .process(converter(&client, Some(30)).convert_batch(&raws))
        .await
        .unwrap();

    assert_eq!(completions.len(), 2);
    assert!(completions[0].is_success());
    assert_eq!(completions[1].message_ids, vec!["m2".to_string()]);
    assert!(matches!(completions[1].processing_error, Some(ListenerError::Conversion(_))));
    assert_eq!(*seen.lock().await, vec!["m1".to_string(), "m3".to_string()]);
    assert_eq!(client.deleted().await, vec!["r1".to_string(), "r3".to_string()]);
}

#[tokio::test]
async fn batch_extends_expiring_messages_in_one_call() {
    let client = RecordingClient::new();
    let pipeline = BatchProcessingPipeline::new(
        extending_chain(60),
        recording_batch_listener(Arc::new(Mutex::new(Vec::new()))),
        AcknowledgementMode::Manual.handler(),
    )
    .unwrap();

    let raws = vec![RawMessage::new("m1", "r1", "one"), RawMessage::new("m2", "r2", "two")];
    pipeline
        .process(converter(&client, Some(30)).convert_batch(&raws))
        .await
        .unwrap();

    assert_eq!(
        client.visibility_changes().await,
        vec![("r1".to_string(), 60), ("r2".to_string(), 60)]
    );
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn batch_pipeline_rejects_single_message_interceptor() {
    let result = BatchProcessingPipeline::new(
        InterceptorChain::new().with(Arc::new(SkipAll)),
        recording_batch_listener(Arc::new(Mutex::new(Vec::new()))),
        AcknowledgementMode::OnSuccess.handler(),
    );

    assert!(matches!(result, Err(ListenerError::Configuration(_))));
}

#[test]
fn visibility_interceptor_rejects_out_of_range_minimum() {
    assert!(MessageVisibilityExtendingInterceptor::new(0).is_err());
    assert!(MessageVisibilityExtendingInterceptor::new(43_201).is_err());
}

#[tokio::test]
async fn backoff_applies_only_to_failed_messages() {
    let client = RecordingClient::new();
    let converter = converter(&client, Some(30));
    let succeeding = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::new(AtomicUsize::new(0)), false),
        AcknowledgementMode::OnSuccess.handler(),
    )
    .with_error_handler(Arc::new(ExponentialBackoffErrorHandler::default()));
    let failing = MessageProcessingPipeline::new(
        InterceptorChain::new(),
        counting_listener(Arc::new(AtomicUsize::new(0)), true),
        AcknowledgementMode::OnSuccess.handler(),
    )
    .with_error_handler(Arc::new(ExponentialBackoffErrorHandler::default()));

    let ok = RawMessage::new("m1", "r1", "one").with_attribute("ApproximateReceiveCount", "2");
    let bad = RawMessage::new("m2", "r2", "two").with_attribute("ApproximateReceiveCount", "2");
    assert!(succeeding.process(received(&converter, ok, 0)).await.unwrap().is_success());
    let completion = failing.process(received(&converter, bad, 0)).await.unwrap();

    assert!(matches!(completion.processing_error, Some(ListenerError::Handler(_))));
    assert_eq!(client.visibility_changes().await, vec![("r2".to_string(), 200)]);
    assert_eq!(client.deleted().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn batch_backoff_groups_messages_by_receive_count() {
    let client = RecordingClient::new();
    let pipeline = BatchProcessingPipeline::new(
        InterceptorChain::new(),
        Arc::new(batch_listener_fn(|_messages: Vec<ApplicationMessage<String>>| async move {
            Err::<(), BoxError>("declined".into())
        })),
        AcknowledgementMode::OnSuccess.handler(),
    )
    .unwrap()
    .with_error_handler(Arc::new(ExponentialBackoffErrorHandler::default()));

    let raws = vec![
        RawMessage::new("m1", "r1", "one").with_attribute("ApproximateReceiveCount", "1"),
        RawMessage::new("m2", "r2", "two").with_attribute("ApproximateReceiveCount", "3"),
        RawMessage::new("m3", "r3", "three").with_attribute("ApproximateReceiveCount", "3"),
    ];
    let completions = pipeline
        .process(converter(&client, Some(30)).convert_batch(&raws))
        .await
        .unwrap();

    assert!(completions[0].processing_error.is_some());
    assert_eq!(
        client.visibility_changes().await,
        vec![
            ("r1".to_string(), 100),
            ("r2".to_string(), 400),
            ("r3".to_string(), 400)
        ]
    );
    assert_eq!(client.delete_calls(), 0);
}
