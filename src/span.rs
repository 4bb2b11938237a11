//! Consumer span construction.

use opentelemetry::{
    Context, KeyValue,
    trace::{SpanBuilder, SpanKind, Tracer},
};

use crate::{carrier::Carrier, options::SpanConfig};

pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
pub const MESSAGING_DESTINATION_KIND: &str = "messaging.destination.kind";
pub const MESSAGING_KAFKA_PARTITION: &str = "messaging.kafka.partition";
pub const MESSAGING_KAFKA_OFFSET: &str = "messaging.kafka.message.offset";
pub const MESSAGING_MESSAGE_BODY: &str = "messaging.message.body";

pub const SYSTEM_KAFKA: &str = "kafka";
pub const DESTINATION_KIND_TOPIC: &str = "topic";

/// Longest message body recorded on a span before truncation.
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 1000;

/// Positional facts about the consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor<'a> {
    pub destination: String,
    pub partition: i64,
    pub offset: i64,
    pub payload: Option<&'a [u8]>,
}

impl<'a> MessageDescriptor<'a> {
    pub fn from_carrier(carrier: &Carrier<'a>) -> Self {
        Self {
            destination: carrier.destination(),
            partition: carrier.partition(),
            offset: carrier.offset(),
            payload: carrier.payload(),
        }
    }
}

/// Attributes for a consumer span, in recording order.
pub fn span_attributes(
    message: &MessageDescriptor<'_>,
    config: &SpanConfig,
    max_payload_length: usize,
) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(MESSAGING_SYSTEM, SYSTEM_KAFKA),
        KeyValue::new(MESSAGING_DESTINATION_NAME, message.destination.clone()),
        KeyValue::new(MESSAGING_DESTINATION_KIND, DESTINATION_KIND_TOPIC),
        KeyValue::new(MESSAGING_KAFKA_PARTITION, message.partition),
        KeyValue::new(MESSAGING_KAFKA_OFFSET, message.offset),
    ];

    attributes.extend(
        config
            .attributes
            .iter()
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
    );

    if config.record_payload {
        if let Some(payload) = message.payload.filter(|p| !p.is_empty()) {
            attributes.push(KeyValue::new(
                MESSAGING_MESSAGE_BODY,
                render_payload(payload, max_payload_length),
            ));
        }
    }

    attributes
}

/// Decode a payload for display, truncating to `max_chars` characters.
pub fn render_payload(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > max_chars {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push_str("...");
        truncated
    } else {
        text.into_owned()
    }
}

pub fn span_builder(
    message: &MessageDescriptor<'_>,
    config: &SpanConfig,
    max_payload_length: usize,
) -> SpanBuilder {
    SpanBuilder::from_name(config.span_name.clone())
        .with_kind(SpanKind::Consumer)
        .with_attributes(span_attributes(message, config, max_payload_length))
}

/// Start a consumer span as a child of `parent_cx`.
///
/// The span is started but not made current.
pub fn build_span<T: Tracer>(
    tracer: &T,
    parent_cx: &Context,
    message: &MessageDescriptor<'_>,
    config: &SpanConfig,
    max_payload_length: usize,
) -> T::Span {
    span_builder(message, config, max_payload_length).start_with_context(tracer, parent_cx)
}
