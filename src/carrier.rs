//! Inbound message carriers.
//!
//! A consumer handler receives its message in one of two shapes: a
//! [`ConsumerRecord`] with an ordered header list, or a [`MessageHeaders`]
//! metadata map filled in by the consumption framework. [`Carrier`] puts both
//! behind the same header lookup so trace context extraction and span
//! attributes never care which one arrived.
//!
//! ```rust
//! use tracehook::carrier::{select_carrier, Argument, CarrierShape, ConsumerRecord, MessageHeaders};
//!
//! let record = ConsumerRecord::new("reservation.created", 2, 41)
//!     .with_header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
//! let headers = MessageHeaders::new().with_destination("reservation.created");
//!
//! let args = vec![Argument::Record(record), Argument::Headers(headers)];
//! let carrier = select_carrier(&args).unwrap();
//!
//! // The metadata map wins even though the record was declared first.
//! assert_eq!(carrier.shape(), CarrierShape::Metadata);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key holding the destination (topic) a message was received from.
pub const RECEIVED_DESTINATION: &str = "kafka_receivedTopic";
/// Metadata key holding the partition a message was received from.
pub const RECEIVED_PARTITION: &str = "kafka_receivedPartitionId";
/// Metadata key holding the offset of the received message.
pub const OFFSET: &str = "kafka_offset";

/// Destination reported when a metadata map does not name one.
pub const UNKNOWN_DESTINATION: &str = "unknown";
/// Partition or offset reported when the carrier did not supply one.
pub const UNKNOWN_POSITION: i64 = -1;

/// A generic key/value metadata map attached to an inbound message.
///
/// Keys are stored exactly as given. Inserting a key that already exists
/// replaces its value, so lookups always see the last write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    entries: Vec<(String, Value)>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a metadata entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_destination(self, destination: impl Into<String>) -> Self {
        self.with(RECEIVED_DESTINATION, destination.into())
    }

    pub fn with_partition(self, partition: i32) -> Self {
        self.with(RECEIVED_PARTITION, partition)
    }

    pub fn with_offset(self, offset: i64) -> Self {
        self.with(OFFSET, offset)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destination written by the framework, or [`UNKNOWN_DESTINATION`].
    pub fn destination(&self) -> String {
        match self.get(RECEIVED_DESTINATION) {
            Some(Value::String(topic)) => topic.clone(),
            Some(Value::Null) | None => UNKNOWN_DESTINATION.to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Partition written by the framework. Only integer values count.
    pub fn partition(&self) -> i64 {
        self.get(RECEIVED_PARTITION)
            .and_then(Value::as_i64)
            .filter(|p| i32::try_from(*p).is_ok())
            .unwrap_or(UNKNOWN_POSITION)
    }

    /// Offset written by the framework. Only integer values count.
    pub fn offset(&self) -> i64 {
        self.get(OFFSET)
            .and_then(Value::as_i64)
            .unwrap_or(UNKNOWN_POSITION)
    }
}

/// A raw record as delivered by the broker client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ConsumerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Append a header. Earlier headers with the same key are kept.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.add_header(key, value);
        self
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.push((key.into(), value.into()));
    }

    /// The last header stored under `key`.
    pub fn last_header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_slice())
    }
}

/// A single declared argument of a consumer handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Headers(MessageHeaders),
    Record(ConsumerRecord),
    Payload(Vec<u8>),
}

impl From<MessageHeaders> for Argument {
    fn from(headers: MessageHeaders) -> Self {
        Argument::Headers(headers)
    }
}

impl From<ConsumerRecord> for Argument {
    fn from(record: ConsumerRecord) -> Self {
        Argument::Record(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierShape {
    Metadata,
    Record,
}

/// Borrowed view over whichever carrier an invocation supplied.
#[derive(Debug, Clone, Copy)]
pub enum Carrier<'a> {
    Metadata(&'a MessageHeaders),
    Record(&'a ConsumerRecord),
}

impl<'a> Carrier<'a> {
    pub fn shape(&self) -> CarrierShape {
        match *self {
            Carrier::Metadata(_) => CarrierShape::Metadata,
            Carrier::Record(_) => CarrierShape::Record,
        }
    }

    /// Header keys in carrier order. Record payloads are never consulted.
    pub fn header_keys(&self) -> Vec<&'a str> {
        match *self {
            Carrier::Metadata(headers) => headers.keys().collect(),
            Carrier::Record(record) => record.headers.iter().map(|(k, _)| k.as_str()).collect(),
        }
    }

    /// Look up a header as text.
    ///
    /// Metadata values that are not strings are rendered with their JSON
    /// form; nulls count as absent. Record headers resolve to the last
    /// header with that key and must be valid UTF-8.
    pub fn header(&self, key: &str) -> Option<String> {
        match *self {
            Carrier::Metadata(headers) => match headers.get(key)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
            Carrier::Record(record) => record
                .last_header(key)
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .map(str::to_string),
        }
    }

    pub fn destination(&self) -> String {
        match *self {
            Carrier::Metadata(headers) => headers.destination(),
            Carrier::Record(record) => record.topic.clone(),
        }
    }

    pub fn partition(&self) -> i64 {
        match *self {
            Carrier::Metadata(headers) => headers.partition(),
            Carrier::Record(record) => i64::from(record.partition),
        }
    }

    pub fn offset(&self) -> i64 {
        match *self {
            Carrier::Metadata(headers) => headers.offset(),
            Carrier::Record(record) => record.offset,
        }
    }

    /// Raw message body, only available on records.
    pub fn payload(&self) -> Option<&'a [u8]> {
        match *self {
            Carrier::Metadata(_) => None,
            Carrier::Record(record) => Some(record.payload.as_slice()),
        }
    }
}

/// Pick the carrier for an invocation.
///
/// A metadata map is preferred over a raw record wherever each appears in
/// the argument list. Returns `None` when neither shape is present.
pub fn select_carrier(args: &[Argument]) -> Option<Carrier<'_>> {
    let metadata = args.iter().find_map(|arg| match arg {
        Argument::Headers(headers) => Some(Carrier::Metadata(headers)),
        _ => None,
    });

    metadata.or_else(|| {
        args.iter().find_map(|arg| match arg {
            Argument::Record(record) => Some(Carrier::Record(record)),
            _ => None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_insert_is_last_write_wins() {
        let mut headers = MessageHeaders::new();
        headers.insert("traceparent", "first");
        headers.insert("traceparent", "second");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("traceparent"), Some(&json!("second")));
    }

    #[test]
    fn test_metadata_keys_are_case_preserving() {
        let headers = MessageHeaders::new().with("TraceParent", "upper");

        assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["TraceParent"]);
        assert!(headers.get("traceparent").is_none());
        assert_eq!(
            Carrier::Metadata(&headers).header("TraceParent"),
            Some("upper".to_string())
        );
    }

    #[test]
    fn test_record_lookup_uses_last_header() {
        let record = ConsumerRecord::new("payment.approved", 0, 7)
            .with_header("tracestate", "a=1")
            .with_header("tracestate", "b=2");

        assert_eq!(record.last_header("tracestate"), Some(&b"b=2"[..]));
        assert_eq!(
            Carrier::Record(&record).header("tracestate"),
            Some("b=2".to_string())
        );
        assert_eq!(
            Carrier::Record(&record).header_keys(),
            vec!["tracestate", "tracestate"]
        );
    }

    #[test]
    fn test_record_lookup_ignores_payload_and_bad_utf8() {
        let record = ConsumerRecord::new("payment.approved", 0, 7)
            .with_payload(r#"{"traceparent":"nope"}"#)
            .with_header("binary", vec![0xff, 0xfe]);
        let carrier = Carrier::Record(&record);

        assert_eq!(carrier.header("traceparent"), None);
        assert_eq!(carrier.header("binary"), None);
    }

    #[test]
    fn test_metadata_values_are_stringified() {
        let headers = MessageHeaders::new()
            .with("retries", 3)
            .with("flag", true)
            .with("missing", Value::Null);
        let carrier = Carrier::Metadata(&headers);

        assert_eq!(carrier.header("retries"), Some("3".to_string()));
        assert_eq!(carrier.header("flag"), Some("true".to_string()));
        assert_eq!(carrier.header("missing"), None);
        assert_eq!(carrier.header("absent"), None);
    }

    #[test]
    fn test_metadata_positions_default_to_sentinels() {
        let headers = MessageHeaders::new();
        let carrier = Carrier::Metadata(&headers);

        assert_eq!(carrier.destination(), UNKNOWN_DESTINATION);
        assert_eq!(carrier.partition(), -1);
        assert_eq!(carrier.offset(), -1);
        assert_eq!(carrier.payload(), None);
    }

    #[test]
    fn test_metadata_positions_require_integers() {
        let headers = MessageHeaders::new()
            .with_destination("ticket.issued")
            .with(RECEIVED_PARTITION, "3")
            .with(OFFSET, 0);
        let carrier = Carrier::Metadata(&headers);

        assert_eq!(carrier.destination(), "ticket.issued");
        assert_eq!(carrier.partition(), -1);
        // Offset zero is a real position, not "unknown".
        assert_eq!(carrier.offset(), 0);
    }

    #[test]
    fn test_select_prefers_metadata_map() {
        let args = vec![
            Argument::Payload(b"{}".to_vec()),
            Argument::Record(ConsumerRecord::new("a", 0, 0)),
            Argument::Headers(MessageHeaders::new()),
        ];

        let carrier = select_carrier(&args).unwrap();
        assert_eq!(carrier.shape(), CarrierShape::Metadata);
    }

    #[test]
    fn test_select_falls_back_to_record() {
        let args = vec![
            Argument::Payload(b"{}".to_vec()),
            ConsumerRecord::new("a", 1, 2).into(),
        ];

        let carrier = select_carrier(&args).unwrap();
        assert_eq!(carrier.shape(), CarrierShape::Record);
        assert_eq!(carrier.partition(), 1);
        assert_eq!(carrier.offset(), 2);
    }

    #[test]
    fn test_select_without_carrier() {
        let args = vec![Argument::Payload(b"hello".to_vec())];
        assert!(select_carrier(&args).is_none());
        assert!(select_carrier(&[]).is_none());
    }
}
