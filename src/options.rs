//! Per-handler tracing options.
//!
//! [`TraceOptions`] is what a call site declares when it registers a traced
//! handler. It is resolved once into a [`SpanConfig`], which the interceptor
//! then reuses for every message the handler receives.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of the span name used when a handler does not declare one.
pub const DEFAULT_SPAN_NAME_PREFIX: &str = "Consumer.";

/// Tracing options declared for a consumer handler.
///
/// # Examples
///
/// ```rust
/// use tracehook::options::{SpanConfig, TraceOptions};
///
/// let options = TraceOptions::new()
///     .with_span_name("process-payment-approved")
///     .with_attribute("event.type=payment.approved")
///     .with_attribute("service=ticket");
///
/// let config = SpanConfig::resolve("paymentApprovedListener", Some(&options));
/// assert_eq!(config.span_name, "process-payment-approved");
/// assert_eq!(config.attributes.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    /// Span name; blank means `Consumer.<handler>`
    pub span_name: Option<String>,
    /// Extra attributes as `key=value` declarations
    pub attributes: Vec<String>,
    /// Record handler errors on the span
    pub record_exception: bool,
    /// Record the message body on the span
    pub record_payload: bool,
}

impl TraceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = Some(name.into());
        self
    }

    /// Add a `key=value` attribute declaration.
    pub fn with_attribute(mut self, declaration: impl Into<String>) -> Self {
        self.attributes.push(declaration.into());
        self
    }

    pub fn with_attributes<I, S>(mut self, declarations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .extend(declarations.into_iter().map(Into::into));
        self
    }

    pub fn with_record_exception(mut self, enabled: bool) -> Self {
        self.record_exception = enabled;
        self
    }

    /// Record the message body. Leave this off for topics carrying
    /// sensitive data.
    pub fn with_record_payload(mut self, enabled: bool) -> Self {
        self.record_payload = enabled;
        self
    }
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            span_name: None,
            attributes: Vec::new(),
            record_exception: true,
            record_payload: false,
        }
    }
}

/// Resolved span settings for one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanConfig {
    pub span_name: String,
    pub attributes: Vec<(String, String)>,
    pub record_exception: bool,
    pub record_payload: bool,
}

impl SpanConfig {
    /// Resolve the options declared for `handler_name`.
    ///
    /// `None` means the handler is a plain consumer entry point and gets the
    /// default treatment: derived span name, no extra attributes, errors
    /// recorded, payload not recorded.
    pub fn resolve(handler_name: &str, options: Option<&TraceOptions>) -> Self {
        let Some(options) = options else {
            return Self::defaults(handler_name);
        };

        let span_name = match options.span_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => default_span_name(handler_name),
        };

        let attributes = options
            .attributes
            .iter()
            .filter_map(|declaration| {
                let parsed = parse_attribute(declaration);
                if parsed.is_none() {
                    debug!(
                        "Ignoring malformed span attribute '{}' on handler {}",
                        declaration, handler_name
                    );
                }
                parsed
            })
            .collect();

        Self {
            span_name,
            attributes,
            record_exception: options.record_exception,
            record_payload: options.record_payload,
        }
    }

    pub fn defaults(handler_name: &str) -> Self {
        Self {
            span_name: default_span_name(handler_name),
            attributes: Vec::new(),
            record_exception: true,
            record_payload: false,
        }
    }
}

pub fn default_span_name(handler_name: &str) -> String {
    format!("{}{}", DEFAULT_SPAN_NAME_PREFIX, handler_name)
}

/// Split a `key=value` declaration on its first `=`.
///
/// Key and value are trimmed. Declarations without `=` or with an empty key
/// yield `None`.
pub fn parse_attribute(declaration: &str) -> Option<(String, String)> {
    let (key, value) = declaration.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}
