//! Conversion of raw SQS messages into [`ApplicationMessage`]s.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use aws_sdk_sqs::types::QueueAttributeName;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::acknowledgement::{Acknowledgement, AcknowledgementCallback, SqsAcknowledgementCallback};
use crate::client::QueueClient;
use crate::errors::{BoxError, ConversionError, ListenerError};
use crate::message::{ApplicationMessage, AttributeValue, HeaderValue, MessageHeaders, RawMessage, headers};
use crate::visibility::QueueMessageVisibility;

/// Decodes a message body into the listener's payload type.
pub trait PayloadConverter<T>: Send + Sync {
    fn convert(&self, body: &[u8], headers: &MessageHeaders) -> Result<T, BoxError>;
}

/// Decodes UTF-8 bodies into `String`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringPayloadConverter;

impl PayloadConverter<String> for StringPayloadConverter {
    fn convert(&self, body: &[u8], _headers: &MessageHeaders) -> Result<String, BoxError> {
        Ok(String::from_utf8(body.to_vec())?)
    }
}

/// Passes bodies through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesPayloadConverter;

impl PayloadConverter<Vec<u8>> for BytesPayloadConverter {
    fn convert(&self, body: &[u8], _headers: &MessageHeaders) -> Result<Vec<u8>, BoxError> {
        Ok(body.to_vec())
    }
}

/// Payload converter backed by a closure. See [`payload_converter_fn`].
pub struct FnPayloadConverter<F, T> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wraps a decoding closure as a [`PayloadConverter`].
pub fn payload_converter_fn<F, T>(f: F) -> FnPayloadConverter<F, T>
where
    F: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync,
{
    FnPayloadConverter {
        f,
        _payload: PhantomData,
    }
}

impl<F, T> PayloadConverter<T> for FnPayloadConverter<F, T>
where
    F: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync,
{
    fn convert(&self, body: &[u8], _headers: &MessageHeaders) -> Result<T, BoxError> {
        (self.f)(body)
    }
}

/// Attributes of the queue messages are received from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub queue_name: String,
    pub queue_url: String,
    /// Visibility timeout configured on the queue, in seconds.
    pub visibility_timeout: Option<u32>,
}

impl QueueAttributes {
    pub fn new(queue_name: impl Into<String>, queue_url: impl Into<String>) -> Self {
        QueueAttributes {
            queue_name: queue_name.into(),
            queue_url: queue_url.into(),
            visibility_timeout: None,
        }
    }

    /// Create from queue URL, extracting name
    pub fn from_queue_url(queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("unknown")
            .to_string();
        QueueAttributes::new(queue_name, queue_url)
    }

    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(seconds);
        self
    }

    /// Reads the queue's configured visibility timeout from SQS.
    pub async fn fetch(client: &aws_sdk_sqs::Client, queue_url: &str) -> Result<Self, ListenerError> {
        let output = client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::VisibilityTimeout)
            .send()
            .await
            .map_err(|e| ListenerError::Sqs(e.to_string()))?;

        let visibility_timeout = output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::VisibilityTimeout))
            .and_then(|value| value.parse::<u32>().ok());

        let mut attributes = QueueAttributes::from_queue_url(queue_url);
        attributes.visibility_timeout = visibility_timeout;
        debug!(queue = %attributes.queue_name, ?visibility_timeout, "Resolved queue attributes");
        Ok(attributes)
    }
}

/// Converts raw SQS messages of one queue into application messages.
///
/// Conversion is local: the visibility and acknowledgement handles embedded
/// in the headers only perform I/O when used.
pub struct SqsMessageConverter<T> {
    payload_converter: Arc<dyn PayloadConverter<T>>,
    queue: QueueAttributes,
    client: Arc<dyn QueueClient>,
    acknowledgement_callback: Arc<dyn AcknowledgementCallback>,
}

impl<T> SqsMessageConverter<T> {
    pub fn new(
        payload_converter: Arc<dyn PayloadConverter<T>>,
        queue: QueueAttributes,
        client: Arc<dyn QueueClient>,
    ) -> Self {
        let acknowledgement_callback = Arc::new(SqsAcknowledgementCallback::new(
            Arc::clone(&client),
            queue.queue_url.clone(),
        ));
        SqsMessageConverter {
            payload_converter,
            queue,
            client,
            acknowledgement_callback,
        }
    }

    pub fn with_acknowledgement_callback(mut self, callback: Arc<dyn AcknowledgementCallback>) -> Self {
        self.acknowledgement_callback = callback;
        self
    }

    pub fn queue(&self) -> &QueueAttributes {
        &self.queue
    }

    pub fn acknowledgement_callback(&self) -> &Arc<dyn AcknowledgementCallback> {
        &self.acknowledgement_callback
    }

    pub fn convert(&self, raw: &RawMessage) -> Result<ApplicationMessage<T>, ConversionError> {
        self.convert_at(raw, Utc::now())
    }

    /// Converts a message that was received at `received_at`.
    pub fn convert_at(
        &self,
        raw: &RawMessage,
        received_at: DateTime<Utc>,
    ) -> Result<ApplicationMessage<T>, ConversionError> {
        let (headers, attribute_error) = self.headers_for(raw, received_at);
        if let Some(reason) = attribute_error {
            return Err(ConversionError::new(reason, headers));
        }

        match self.payload_converter.convert(&raw.body, &headers) {
            Ok(payload) => {
                trace!(message_id = %raw.message_id, queue = %self.queue.queue_name, "Message converted");
                Ok(ApplicationMessage::new(payload, headers))
            }
            Err(e) => {
                debug!(message_id = %raw.message_id, error = %e, "Failed to convert message payload");
                Err(ConversionError::new(e.to_string(), headers))
            }
        }
    }

    /// Converts each message independently, preserving input order.
    pub fn convert_batch(&self, raws: &[RawMessage]) -> Vec<Result<ApplicationMessage<T>, ConversionError>> {
        let received_at = Utc::now();
        raws.iter().map(|raw| self.convert_at(raw, received_at)).collect()
    }

    fn headers_for(&self, raw: &RawMessage, received_at: DateTime<Utc>) -> (MessageHeaders, Option<String>) {
        let mut entries = BTreeMap::new();
        let mut attribute_error = None;

        for (name, value) in &raw.message_attributes {
            if name == headers::RESERVED_ATTRIBUTE_ID {
                trace!(message_id = %raw.message_id, "Ignoring 'id' message attribute");
                continue;
            }
            let header = if headers::CONTENT_TYPE_ATTRIBUTES.contains(&name.as_str()) {
                headers::CONTENT_TYPE
            } else {
                name.as_str()
            };
            match attribute_header_value(value) {
                Ok(header_value) => {
                    entries.insert(header.to_string(), header_value);
                }
                Err(reason) => {
                    attribute_error.get_or_insert(format!("message attribute '{name}': {reason}"));
                }
            }
        }

        // System attributes win over message attributes of the same name.
        for (name, value) in &raw.attributes {
            let header = match name.as_str() {
                headers::SQS_GROUP_ID => headers::GROUP_ID,
                headers::SQS_DEDUPLICATION_ID => headers::DEDUPLICATION_ID,
                headers::SQS_TRACE_HEADER => headers::TRACE_HEADER,
                other => other,
            };
            entries.insert(header.to_string(), HeaderValue::Text(value.clone()));
        }

        entries.insert(headers::MESSAGE_ID.to_string(), HeaderValue::from(raw.message_id.as_str()));
        entries.insert(
            headers::RECEIPT_HANDLE.to_string(),
            HeaderValue::from(raw.receipt_handle.as_str()),
        );
        entries.insert(
            headers::QUEUE_NAME.to_string(),
            HeaderValue::from(self.queue.queue_name.as_str()),
        );
        entries.insert(
            headers::QUEUE_URL.to_string(),
            HeaderValue::from(self.queue.queue_url.as_str()),
        );
        entries.insert(headers::RECEIVED_AT.to_string(), HeaderValue::Timestamp(received_at));
        if let Some(seconds) = self.queue.visibility_timeout {
            entries.insert(headers::QUEUE_VISIBILITY.to_string(), HeaderValue::Seconds(seconds));
        }
        entries.insert(
            headers::VISIBILITY.to_string(),
            HeaderValue::Visibility(QueueMessageVisibility::new(
                Arc::clone(&self.client),
                self.queue.queue_url.clone(),
                raw.receipt_handle.clone(),
            )),
        );
        entries.insert(
            headers::ACKNOWLEDGEMENT.to_string(),
            HeaderValue::Acknowledgement(Acknowledgement::new(
                Arc::clone(&self.acknowledgement_callback),
                raw.receipt_handle.clone(),
            )),
        );

        (MessageHeaders::new(entries), attribute_error)
    }
}

fn attribute_header_value(value: &AttributeValue) -> Result<HeaderValue, String> {
    match value.base_type() {
        "Number" => {
            let text = value
                .string_value
                .as_deref()
                .ok_or_else(|| "number attribute without a value".to_string())?;
            if let Ok(integer) = text.parse::<i64>() {
                Ok(HeaderValue::Integer(integer))
            } else {
                text.parse::<f64>()
                    .map(HeaderValue::Float)
                    .map_err(|_| format!("'{text}' is not a number"))
            }
        }
        "Binary" => Ok(HeaderValue::Binary(value.binary_value.clone().unwrap_or_default())),
        _ => Ok(HeaderValue::Text(value.string_value.clone().unwrap_or_default())),
    }
}
