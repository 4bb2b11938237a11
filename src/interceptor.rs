//! Tracing interception around consumer handlers.
//!
//! [`ConsumerTracing::instrument`] is the single interception point. For each
//! invocation it picks the carrier out of the handler arguments, extracts the
//! upstream context, starts a consumer span, runs the handler with that span
//! as the current context and ends the span once the handler finishes.
//!
//! Only the handler's own error ever reaches the caller, unchanged. Missing
//! carriers, missing trace headers and propagator failures all degrade to
//! running the handler without a parent (or without a span at all when there
//! is no carrier).
//!
//! [`traced`] applies the same interception when a handler is registered:
//!
//! ```rust
//! use std::sync::Arc;
//! use tracehook::{ConsumerTracing, MessageHandler, TraceOptions, traced};
//!
//! let handler: MessageHandler = Arc::new(|_args| Box::pin(async { Ok(()) }));
//! let tracing = Arc::new(ConsumerTracing::global());
//!
//! let handler = traced(
//!     tracing,
//!     "paymentApprovedListener",
//!     Some(TraceOptions::new().with_span_name("process-payment-approved")),
//!     handler,
//! );
//! # let _ = handler;
//! ```

use std::{
    any::Any,
    fmt::Display,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use futures_util::FutureExt as _;

use opentelemetry::{
    Context, KeyValue, global,
    global::BoxedTracer,
    propagation::TextMapPropagator,
    trace::{FutureExt, Status, TraceContextExt, Tracer},
};
use tracing::{debug, error, warn};

use crate::{
    carrier::{Argument, select_carrier},
    config::ConsumerTracingConfig,
    consumer::MessageHandler,
    options::{SpanConfig, TraceOptions},
    propagation::extract_context,
    span::{DEFAULT_MAX_PAYLOAD_LENGTH, MessageDescriptor, build_span},
};

/// Instrumentation scope name used for the global tracer.
pub const TRACER_NAME: &str = "tracehook";

/// Status description used when a handler error renders as an empty string.
pub const FALLBACK_ERROR_MESSAGE: &str = "Message consumer execution failed";

pub const EXCEPTION_EVENT: &str = "exception";
pub const EXCEPTION_TYPE: &str = "exception.type";
pub const EXCEPTION_MESSAGE: &str = "exception.message";

/// `exception.type` recorded for a handler that panicked.
pub const PANIC_EXCEPTION_TYPE: &str = "panic";

/// Wraps consumer handler invocations in consumer spans.
pub struct ConsumerTracing<T = BoxedTracer> {
    tracer: T,
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    enabled: bool,
    max_payload_length: usize,
}

impl ConsumerTracing<BoxedTracer> {
    /// Tracing backed by the global tracer provider and propagator.
    pub fn global() -> Self {
        Self::new(global::tracer(TRACER_NAME))
    }

    pub fn from_config(config: &ConsumerTracingConfig) -> Self {
        Self::new(global::tracer(config.tracer_name.clone()))
            .with_enabled(config.enabled)
            .with_max_payload_length(config.max_payload_length)
    }
}

impl<T> ConsumerTracing<T>
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T) -> Self {
        Self {
            tracer,
            propagator: None,
            enabled: true,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
        }
    }

    /// Use `propagator` instead of the global one.
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_payload_length(mut self, max_chars: usize) -> Self {
        self.max_payload_length = max_chars;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `handler` with `args` inside a consumer span.
    ///
    /// The handler's result is returned as is. When `config.record_exception`
    /// is set, an error result is recorded as an `exception` event and the
    /// span status is set to error before the span ends. A panicking handler
    /// is recorded the same way and the panic is then resumed.
    pub async fn instrument<H, Fut, R, E>(
        &self,
        handler_name: &str,
        config: &SpanConfig,
        args: Vec<Argument>,
        handler: H,
    ) -> Result<R, E>
    where
        H: FnOnce(Vec<Argument>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Display,
    {
        if !self.enabled {
            return handler(args).await;
        }

        let Some(cx) = self.start(handler_name, config, &args) else {
            return handler(args).await;
        };

        let active = ActiveSpan::new(cx.clone());
        let invocation = {
            let _attached = cx.clone().attach();
            handler(args)
        };

        debug!(
            "Executing consumer {} with trace_id={}",
            config.span_name,
            cx.span().span_context().trace_id()
        );
        let outcome = match AssertUnwindSafe(invocation.with_context(cx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if config.record_exception {
                    active.record_exception(PANIC_EXCEPTION_TYPE, &message);
                }
                error!(
                    "Traced consumer {} panicked, span {}: {}",
                    handler_name, config.span_name, message
                );
                active.finish();
                panic::resume_unwind(payload);
            }
        };

        if let Err(err) = &outcome {
            if config.record_exception {
                active.record_error(err);
            }
            error!(
                "Error in traced consumer {}, span {}: {}",
                handler_name, config.span_name, err
            );
        }
        active.finish();
        debug!("Completed consumer trace: {}", config.span_name);

        outcome
    }

    /// Select the carrier, extract the parent and start the span.
    ///
    /// Returns the context to activate, or `None` when the invocation has no
    /// carrier and should run untraced.
    fn start(&self, handler_name: &str, config: &SpanConfig, args: &[Argument]) -> Option<Context> {
        let Some(carrier) = select_carrier(args) else {
            warn!(
                "Traced handler {} has no MessageHeaders or ConsumerRecord argument, trace context will not be propagated",
                handler_name
            );
            return None;
        };

        debug!(
            "Tracing {} via {:?} carrier on destination {}",
            handler_name,
            carrier.shape(),
            carrier.destination()
        );

        let parent_cx = extract_context(Some(carrier), self.propagator.as_deref());
        let message = MessageDescriptor::from_carrier(&carrier);
        let span = build_span(
            &self.tracer,
            &parent_cx,
            &message,
            config,
            self.max_payload_length,
        );

        Some(parent_cx.with_span(span))
    }
}

impl Default for ConsumerTracing<BoxedTracer> {
    fn default() -> Self {
        Self::global()
    }
}

/// Owns the end of a started span.
///
/// The span is ended when this value is dropped, so an invocation that is
/// cancelled or unwinds still closes its span, and closes it only once.
struct ActiveSpan {
    cx: Context,
    completed: bool,
}

impl ActiveSpan {
    fn new(cx: Context) -> Self {
        Self {
            cx,
            completed: false,
        }
    }

    fn record_error<E: Display>(&self, err: &E) {
        self.record_exception(std::any::type_name::<E>(), &err.to_string());
    }

    fn record_exception(&self, exception_type: &str, message: &str) {
        let message = match message {
            "" => FALLBACK_ERROR_MESSAGE.to_string(),
            m => m.to_string(),
        };

        let span = self.cx.span();
        span.add_event(
            EXCEPTION_EVENT,
            vec![
                KeyValue::new(EXCEPTION_TYPE, exception_type.to_string()),
                KeyValue::new(EXCEPTION_MESSAGE, message.clone()),
            ],
        );
        span.set_status(Status::error(message));
    }

    fn finish(mut self) {
        self.completed = true;
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if !self.completed {
            debug!("Consumer invocation dropped before completing, ending its span");
        }
        self.cx.span().end();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        FALLBACK_ERROR_MESSAGE.to_string()
    }
}

/// Decorate `handler` with consumer tracing.
///
/// The span configuration is resolved here, once, from `options`; `None`
/// gives the zero-configuration defaults for a plain consumer entry point.
pub fn traced<T>(
    tracing: Arc<ConsumerTracing<T>>,
    handler_name: impl Into<String>,
    options: Option<TraceOptions>,
    handler: MessageHandler,
) -> MessageHandler
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let handler_name: Arc<str> = Arc::from(handler_name.into());
    let config = Arc::new(SpanConfig::resolve(&handler_name, options.as_ref()));

    Arc::new(move |args: Vec<Argument>| {
        let tracing = Arc::clone(&tracing);
        let handler_name = Arc::clone(&handler_name);
        let config = Arc::clone(&config);
        let handler = Arc::clone(&handler);

        Box::pin(async move {
            tracing
                .instrument(&handler_name, &config, args, |args| handler(args))
                .await
        })
    })
}
