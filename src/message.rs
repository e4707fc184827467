//! Raw SQS messages and the application-facing messages they are converted into.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::acknowledgement::Acknowledgement;
use crate::errors::ListenerError;
use crate::visibility::QueueMessageVisibility;

/// Well-known header names carried by every [`ApplicationMessage`].
pub mod headers {
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT_HANDLE: &str = "receipt-token";
    pub const QUEUE_NAME: &str = "queue-name";
    pub const QUEUE_URL: &str = "queue-url";
    pub const RECEIVED_AT: &str = "received-at";
    pub const QUEUE_VISIBILITY: &str = "queue-visibility-seconds";
    pub const VISIBILITY: &str = "lease-handle";
    pub const ACKNOWLEDGEMENT: &str = "acknowledgement-handle";
    pub const GROUP_ID: &str = "group-id";
    pub const DEDUPLICATION_ID: &str = "deduplication-id";
    pub const TRACE_HEADER: &str = "trace-header";
    pub const CONTENT_TYPE: &str = "content-type";

    /// Attribute names that never pass through as generic headers.
    pub(crate) const RESERVED_ATTRIBUTE_ID: &str = "id";
    pub(crate) const CONTENT_TYPE_ATTRIBUTES: [&str; 2] = ["content-type", "contentType"];

    /// SQS system attribute names with a dedicated header.
    pub(crate) const SQS_GROUP_ID: &str = "MessageGroupId";
    pub(crate) const SQS_DEDUPLICATION_ID: &str = "MessageDeduplicationId";
    pub(crate) const SQS_TRACE_HEADER: &str = "AWSTraceHeader";
}

/// A typed SQS message attribute, as sent by the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    /// `String`, `Number` or `Binary`, optionally suffixed with a custom type (`Number.int`).
    pub data_type: String,
    pub string_value: Option<String>,
    pub binary_value: Option<Vec<u8>>,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        AttributeValue {
            data_type: "String".to_string(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    pub fn number(value: impl fmt::Display) -> Self {
        AttributeValue {
            data_type: "Number".to_string(),
            string_value: Some(value.to_string()),
            binary_value: None,
        }
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        AttributeValue {
            data_type: "Binary".to_string(),
            string_value: None,
            binary_value: Some(value.into()),
        }
    }

    /// Overrides the data type, e.g. `Number.int`.
    pub fn with_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    /// The base data type, without any custom type suffix.
    pub fn base_type(&self) -> &str {
        self.data_type
            .split_once('.')
            .map_or(self.data_type.as_str(), |(base, _)| base)
    }
}

/// A message as received from SQS, before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: Vec<u8>,
    /// System attributes such as `SentTimestamp` or `MessageGroupId`.
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, AttributeValue>,
}

impl RawMessage {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        RawMessage {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_message_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.message_attributes.insert(name.into(), value);
        self
    }
}

impl TryFrom<&aws_sdk_sqs::types::Message> for RawMessage {
    type Error = ListenerError;

    fn try_from(message: &aws_sdk_sqs::types::Message) -> Result<Self, Self::Error> {
        let message_id = message
            .message_id()
            .ok_or_else(|| ListenerError::Sqs("Missing message id".to_string()))?;
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| ListenerError::Sqs("Missing receipt handle".to_string()))?;

        let attributes = message
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let message_attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| {
                        let attribute = AttributeValue {
                            data_type: value.data_type().to_string(),
                            string_value: value.string_value().map(str::to_string),
                            binary_value: value.binary_value().map(|blob| blob.as_ref().to_vec()),
                        };
                        (name.clone(), attribute)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(RawMessage {
            message_id: message_id.to_string(),
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().as_bytes().to_vec(),
            attributes,
            message_attributes,
        })
    }
}

/// A single header value.
#[derive(Debug, Clone)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Seconds(u32),
    Visibility(QueueMessageVisibility),
    Acknowledgement(Acknowledgement),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// Immutable header bag of an [`ApplicationMessage`]. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    entries: Arc<BTreeMap<String, HeaderValue>>,
}

impl MessageHeaders {
    pub fn new(entries: BTreeMap<String, HeaderValue>) -> Self {
        MessageHeaders {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries.get(name)
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::as_text)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_text(headers::MESSAGE_ID)
    }

    pub fn receipt_handle(&self) -> Option<&str> {
        self.get_text(headers::RECEIPT_HANDLE)
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.get_text(headers::QUEUE_NAME)
    }

    pub fn queue_url(&self) -> Option<&str> {
        self.get_text(headers::QUEUE_URL)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.get_text(headers::GROUP_ID)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_text(headers::CONTENT_TYPE)
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        match self.get(headers::RECEIVED_AT) {
            Some(HeaderValue::Timestamp(at)) => Some(*at),
            _ => None,
        }
    }

    /// Visibility timeout configured on the queue, when known.
    pub fn queue_visibility_seconds(&self) -> Option<u32> {
        match self.get(headers::QUEUE_VISIBILITY) {
            Some(HeaderValue::Seconds(seconds)) => Some(*seconds),
            _ => None,
        }
    }

    pub fn visibility(&self) -> Option<&QueueMessageVisibility> {
        match self.get(headers::VISIBILITY) {
            Some(HeaderValue::Visibility(visibility)) => Some(visibility),
            _ => None,
        }
    }

    pub fn acknowledgement(&self) -> Option<&Acknowledgement> {
        match self.get(headers::ACKNOWLEDGEMENT) {
            Some(HeaderValue::Acknowledgement(acknowledgement)) => Some(acknowledgement),
            _ => None,
        }
    }
}

/// A converted message handed to listeners and interceptors.
///
/// Both payload and headers are reference counted, so clones share them.
pub struct ApplicationMessage<T> {
    payload: Arc<T>,
    headers: MessageHeaders,
}

impl<T> ApplicationMessage<T> {
    pub fn new(payload: T, headers: MessageHeaders) -> Self {
        ApplicationMessage {
            payload: Arc::new(payload),
            headers,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn message_id(&self) -> &str {
        self.headers.message_id().unwrap_or_default()
    }

    /// Replaces the payload, keeping the headers.
    pub fn with_payload<U>(self, payload: U) -> ApplicationMessage<U> {
        ApplicationMessage::new(payload, self.headers)
    }

    pub fn map_payload<U>(self, f: impl FnOnce(&T) -> U) -> ApplicationMessage<U> {
        let payload = f(&self.payload);
        ApplicationMessage::new(payload, self.headers)
    }

    /// Acknowledges this message through its acknowledgement handle.
    ///
    /// Only meant for application code running under manual acknowledgement.
    pub async fn acknowledge(&self) -> Result<(), ListenerError> {
        match self.headers.acknowledgement() {
            Some(acknowledgement) => acknowledgement.acknowledge().await,
            None => Err(ListenerError::Acknowledgement(format!(
                "message {} has no acknowledgement handle",
                self.message_id()
            ))),
        }
    }
}

impl<T> Clone for ApplicationMessage<T> {
    fn clone(&self) -> Self {
        ApplicationMessage {
            payload: Arc::clone(&self.payload),
            headers: self.headers.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ApplicationMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationMessage")
            .field("payload", &self.payload)
            .field("message_id", &self.message_id())
            .finish()
    }
}
