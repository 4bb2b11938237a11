//! # Tracehook
//!
//! Distributed tracing for asynchronous message consumers, built on
//! OpenTelemetry.
//!
//! ## Features
//!
//! - **Two carrier shapes**: raw [`ConsumerRecord`]s with ordered headers and
//!   framework-level [`MessageHeaders`] metadata maps, metadata maps preferred
//! - **Context propagation**: the upstream trace context is extracted from
//!   the carrier with the configured propagator and becomes the span parent
//! - **Consumer spans**: messaging attributes (system, destination,
//!   partition, offset), declared custom attributes and optionally the body
//! - **Guaranteed finalization**: every span is ended exactly once, on
//!   success, on error, and when the invocation is cancelled
//! - **Transparent errors**: handler errors are recorded, then returned
//!   unchanged so retry and dead-letter handling behave as without tracing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tracehook::{
//!     Argument, Consumer, ConsumerPool, ConsumerTracing, MessageHandler, TraceOptions, traced,
//! };
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let handler: MessageHandler = Arc::new(|args: Vec<Argument>| {
//!         Box::pin(async move {
//!             println!("Issuing ticket for {} argument(s)", args.len());
//!             Ok(())
//!         })
//!     });
//!
//!     // Wrap the handler once, at registration time.
//!     let handler = traced(
//!         Arc::new(ConsumerTracing::global()),
//!         "paymentApprovedListener",
//!         Some(
//!             TraceOptions::new()
//!                 .with_span_name("process-payment-approved")
//!                 .with_attribute("service=ticket"),
//!         ),
//!         handler,
//!     );
//!
//!     let (_deliveries_tx, deliveries_rx) = mpsc::channel(64);
//!     let mut pool = ConsumerPool::new();
//!     pool.add_consumer(Consumer::new("payment.approved-0", deliveries_rx, handler));
//!
//!     pool.start();
//!     tokio::signal::ctrl_c().await?;
//!     pool.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `otlp` - Export spans over OTLP/gRPC from [`telemetry::init_telemetry`]

pub mod carrier;
pub mod config;
pub mod consumer;
pub mod error;
pub mod interceptor;
pub mod options;
pub mod propagation;
pub mod span;
pub mod telemetry;

pub use carrier::{Argument, Carrier, CarrierShape, ConsumerRecord, MessageHeaders, select_carrier};
pub use config::{ConsumerTracingConfig, LoggingConfig, TracehookConfig};
pub use consumer::{Consumer, ConsumerPool, ConsumerStats, Delivery, MessageHandler};
pub use error::TracehookError;
pub use interceptor::{ConsumerTracing, traced};
pub use options::{SpanConfig, TraceOptions};
pub use propagation::{extract_context, inject_headers, inject_record};
pub use telemetry::{TelemetryConfig, init_telemetry, shutdown_telemetry};

/// Convenient type alias for Results with [`TracehookError`] as the error type.
pub type Result<T> = std::result::Result<T, TracehookError>;
