//! OpenTelemetry bootstrap for services that consume traced messages.
//!
//! [`init_telemetry`] installs everything the interceptor reads from the
//! process-wide OpenTelemetry state: the global tracer provider, the W3C
//! trace context propagator, and a `tracing` subscriber whose spans and log
//! lines join the same traces.
//!
//! ```rust,no_run
//! use tracehook::config::LoggingConfig;
//! use tracehook::telemetry::{TelemetryConfig, init_telemetry};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::new()
//!     .with_service_name("payment-service")
//!     .with_otlp_endpoint("http://localhost:4317");
//!
//! init_telemetry(&config, &LoggingConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{self as sdktrace, Sampler},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;

use crate::{Result, TracehookError, config::LoggingConfig, interceptor::TRACER_NAME};

/// Tracer provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Name of the service for tracing identification
    pub service_name: String,
    /// Version of the service
    pub service_version: Option<String>,
    /// Environment (e.g., "production", "staging", "development")
    pub environment: Option<String>,
    /// OTLP endpoint for exporting traces
    pub otlp_endpoint: Option<String>,
    /// Additional resource attributes
    pub resource_attributes: Vec<(String, String)>,
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self {
            service_name: "tracehook".to_string(),
            service_version: None,
            environment: None,
            otlp_endpoint: None,
            resource_attributes: Vec::new(),
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the OTLP gRPC endpoint. Export requires the `otlp` feature.
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_resource_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.resource_attributes.push((key.into(), value.into()));
        self
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new("service.name", self.service_name.clone())];

        if let Some(version) = &self.service_version {
            attributes.push(KeyValue::new("service.version", version.clone()));
        }
        if let Some(environment) = &self.environment {
            attributes.push(KeyValue::new("deployment.environment", environment.clone()));
        }
        for (key, value) in &self.resource_attributes {
            attributes.push(KeyValue::new(key.clone(), value.clone()));
        }

        Resource::new(attributes)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global tracer provider, propagator and subscriber.
///
/// Without an OTLP endpoint spans are not sampled, but trace identifiers
/// still flow from inbound messages to outbound ones.
pub async fn init_telemetry(config: &TelemetryConfig, logging: &LoggingConfig) -> Result<()> {
    let tracer_provider = build_tracer_provider(config)?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(tracer_provider.clone());

    let filter = EnvFilter::try_new(&logging.level).map_err(|e| TracehookError::Tracing {
        message: format!("Invalid log filter '{}': {}", logging.level, e),
    })?;

    let fmt_layer = logging.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_file(logging.include_location)
            .with_line_number(logging.include_location)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(OpenTelemetryLayer::new(tracer_provider.tracer(TRACER_NAME)))
        .try_init()
        .map_err(|e| TracehookError::Tracing {
            message: format!("Failed to initialize tracing subscriber: {}", e),
        })?;

    info!("Telemetry initialized for service {}", config.service_name);
    Ok(())
}

#[cfg(feature = "otlp")]
fn build_tracer_provider(config: &TelemetryConfig) -> Result<sdktrace::TracerProvider> {
    let Some(endpoint) = &config.otlp_endpoint else {
        return Ok(unsampled_provider(config));
    };

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.clone())
        .build_span_exporter()
        .map_err(|e| TracehookError::Tracing {
            message: format!("Failed to build OTLP span exporter: {}", e),
        })?;

    let span_processor =
        sdktrace::BatchSpanProcessor::builder(exporter, opentelemetry_sdk::runtime::Tokio).build();

    Ok(sdktrace::TracerProvider::builder()
        .with_config(
            sdktrace::config()
                .with_resource(config.resource())
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        )
        .with_span_processor(span_processor)
        .build())
}

#[cfg(not(feature = "otlp"))]
fn build_tracer_provider(config: &TelemetryConfig) -> Result<sdktrace::TracerProvider> {
    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::warn!(
            "OTLP endpoint {} configured but the `otlp` feature is disabled, spans will not be exported",
            endpoint
        );
    }
    Ok(unsampled_provider(config))
}

fn unsampled_provider(config: &TelemetryConfig) -> sdktrace::TracerProvider {
    sdktrace::TracerProvider::builder()
        .with_config(
            sdktrace::config()
                .with_resource(config.resource())
                .with_sampler(Sampler::AlwaysOff),
        )
        .build()
}

/// Flush pending spans and shut the global tracer provider down.
pub async fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
