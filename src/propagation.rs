//! Trace context propagation over message carriers.
//!
//! Extraction adapts a [`Carrier`] to the OpenTelemetry [`Extractor`]
//! interface and lets the configured [`TextMapPropagator`] rebuild the
//! upstream context. No trace header format is decoded here.
//!
//! Injection is the producer side of the same exchange: it writes the
//! propagation keys of a context into a metadata map or a record's headers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use opentelemetry::{
    Context, global,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::TraceContextExt,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::carrier::{Carrier, ConsumerRecord, MessageHeaders};

/// Read-only accessor handed to the propagator.
///
/// An absent carrier behaves like a carrier with no headers at all.
pub struct CarrierExtractor<'a> {
    carrier: Option<Carrier<'a>>,
    rendered: HashMap<&'a str, String>,
}

impl<'a> CarrierExtractor<'a> {
    pub fn new(carrier: Option<Carrier<'a>>) -> Self {
        // Extractor::get hands out borrowed strings, so non-string metadata
        // values are rendered up front.
        let mut rendered = HashMap::new();
        if let Some(Carrier::Metadata(headers)) = carrier {
            for (key, value) in headers.iter() {
                match value {
                    Value::String(_) | Value::Null => {}
                    other => {
                        rendered.insert(key, other.to_string());
                    }
                }
            }
        }

        Self { carrier, rendered }
    }
}

impl Extractor for CarrierExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.carrier? {
            Carrier::Metadata(headers) => match headers.get(key)? {
                Value::String(s) => Some(s.as_str()),
                Value::Null => None,
                _ => self.rendered.get(key).map(String::as_str),
            },
            Carrier::Record(record) => record
                .last_header(key)
                .and_then(|bytes| std::str::from_utf8(bytes).ok()),
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.carrier
            .map(|carrier| carrier.header_keys())
            .unwrap_or_default()
    }
}

/// Rebuild the upstream context carried by `carrier`.
///
/// Uses `propagator` when given and the global propagator otherwise. The
/// result is the current context when the carrier holds no usable trace
/// headers, and also when the propagator panics.
pub fn extract_context(
    carrier: Option<Carrier<'_>>,
    propagator: Option<&(dyn TextMapPropagator + Send + Sync)>,
) -> Context {
    let extractor = CarrierExtractor::new(carrier);
    let current = Context::current();

    let extracted = panic::catch_unwind(AssertUnwindSafe(|| match propagator {
        Some(propagator) => propagator.extract_with_context(&current, &extractor),
        None => global::get_text_map_propagator(|propagator| {
            propagator.extract_with_context(&current, &extractor)
        }),
    }));

    match extracted {
        Ok(cx) => {
            let remote = cx.span().span_context().clone();
            if remote.is_valid() {
                debug!(
                    "Extracted upstream trace context: trace_id={}, span_id={}",
                    remote.trace_id(),
                    remote.span_id()
                );
            } else {
                debug!("No upstream trace context found on carrier");
            }
            cx
        }
        Err(_) => {
            warn!("Trace context propagator panicked, continuing without a parent context");
            current
        }
    }
}

/// Writes propagation keys into a metadata map, replacing existing values.
pub struct HeadersInjector<'a>(pub &'a mut MessageHeaders);

impl Injector for HeadersInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value);
    }
}

/// Writes propagation keys into record headers.
///
/// Any earlier header under the same key is removed first so the record
/// carries exactly one value per propagation key.
pub struct RecordInjector<'a>(pub &'a mut ConsumerRecord);

impl Injector for RecordInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.headers.retain(|(k, _)| k != key);
        self.0.add_header(key, value.into_bytes());
    }
}

/// Inject `cx` into a metadata map with the global propagator.
pub fn inject_headers(cx: &Context, headers: &mut MessageHeaders) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeadersInjector(headers))
    });
}

/// Inject `cx` into record headers with the global propagator.
pub fn inject_record(cx: &Context, record: &mut ConsumerRecord) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut RecordInjector(record))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::propagation::text_map_propagator::FieldIter;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[derive(Debug)]
    struct PanickingPropagator;

    impl TextMapPropagator for PanickingPropagator {
        fn inject_context(&self, _cx: &Context, _injector: &mut dyn Injector) {}

        fn extract_with_context(&self, _cx: &Context, _extractor: &dyn Extractor) -> Context {
            panic!("corrupt propagator state");
        }

        fn fields(&self) -> FieldIter<'_> {
            FieldIter::new(&[])
        }
    }

    #[test]
    fn test_extractor_without_carrier() {
        let extractor = CarrierExtractor::new(None);

        assert_eq!(extractor.get("traceparent"), None);
        assert!(extractor.keys().is_empty());
    }

    #[test]
    fn test_extractor_over_metadata_map() {
        let headers = MessageHeaders::new()
            .with("traceparent", TRACEPARENT)
            .with("attempt", 2)
            .with("cleared", Value::Null);
        let extractor = CarrierExtractor::new(Some(Carrier::Metadata(&headers)));

        assert_eq!(extractor.get("traceparent"), Some(TRACEPARENT));
        assert_eq!(extractor.get("attempt"), Some("2"));
        assert_eq!(extractor.get("cleared"), None);
        assert_eq!(extractor.keys(), vec!["traceparent", "attempt", "cleared"]);
    }

    #[test]
    fn test_extractor_over_record_headers() {
        let record = ConsumerRecord::new("payment.approved", 0, 0)
            .with_header("traceparent", "stale")
            .with_header("traceparent", TRACEPARENT);
        let extractor = CarrierExtractor::new(Some(Carrier::Record(&record)));

        assert_eq!(extractor.get("traceparent"), Some(TRACEPARENT));
        assert_eq!(extractor.get("tracestate"), None);
    }

    #[test]
    fn test_extract_with_w3c_propagator() {
        let propagator = TraceContextPropagator::new();
        let record =
            ConsumerRecord::new("payment.approved", 0, 0).with_header("traceparent", TRACEPARENT);

        let cx = extract_context(Some(Carrier::Record(&record)), Some(&propagator));
        let remote = cx.span().span_context().clone();

        assert!(remote.is_valid());
        assert!(remote.is_remote());
        assert_eq!(
            remote.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(remote.span_id().to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn test_extract_without_headers_has_no_parent() {
        let propagator = TraceContextPropagator::new();
        let headers = MessageHeaders::new().with_destination("ticket.issued");

        let cx = extract_context(Some(Carrier::Metadata(&headers)), Some(&propagator));
        assert!(!cx.span().span_context().is_valid());

        let cx = extract_context(None, Some(&propagator));
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_extract_survives_panicking_propagator() {
        let record =
            ConsumerRecord::new("payment.approved", 0, 0).with_header("traceparent", TRACEPARENT);

        let cx = extract_context(Some(Carrier::Record(&record)), Some(&PanickingPropagator));
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_record_injector_replaces_existing_key() {
        let mut record =
            ConsumerRecord::new("reservation.created", 0, 0).with_header("traceparent", "old");

        RecordInjector(&mut record).set("traceparent", TRACEPARENT.to_string());

        assert_eq!(record.headers.len(), 1);
        assert_eq!(record.last_header("traceparent"), Some(TRACEPARENT.as_bytes()));
    }

    #[test]
    fn test_round_trip_through_metadata_map() {
        let propagator = TraceContextPropagator::new();
        let upstream = propagator.extract(&CarrierExtractor::new(Some(Carrier::Record(
            &ConsumerRecord::new("t", 0, 0).with_header("traceparent", TRACEPARENT),
        ))));

        let mut headers = MessageHeaders::new();
        propagator.inject_context(&upstream, &mut HeadersInjector(&mut headers));

        let cx = extract_context(Some(Carrier::Metadata(&headers)), Some(&propagator));
        assert_eq!(
            cx.span().span_context().trace_id(),
            upstream.span().span_context().trace_id()
        );
    }
}
