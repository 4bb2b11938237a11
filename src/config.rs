//! Configuration management for tracehook.
//!
//! Settings come from a TOML file, from `TRACEHOOK_*` environment variables,
//! or from the builder methods below. Per-handler span options are not part
//! of this file; they are declared where each handler is registered (see
//! [`crate::options::TraceOptions`]).

use crate::{interceptor::TRACER_NAME, span::DEFAULT_MAX_PAYLOAD_LENGTH, telemetry::TelemetryConfig};
use serde::{Deserialize, Serialize};

/// Main configuration for tracehook.
///
/// # Examples
///
/// ```rust
/// use tracehook::config::TracehookConfig;
///
/// let config = TracehookConfig::new()
///     .with_tracing_enabled(true)
///     .with_service_name("payment-service")
///     .with_max_payload_length(256);
///
/// assert_eq!(config.tracing.max_payload_length, 256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TracehookConfig {
    /// Consumer span interception settings
    pub tracing: ConsumerTracingConfig,

    /// Tracer provider and exporter settings
    pub telemetry: TelemetryConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl TracehookConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn consumer tracing on or off
    pub fn with_tracing_enabled(mut self, enabled: bool) -> Self {
        self.tracing.enabled = enabled;
        self
    }

    /// Set the service name reported by the tracer provider
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.telemetry.service_name = name.into();
        self
    }

    /// Set the longest message body recorded on a span
    pub fn with_max_payload_length(mut self, max_chars: usize) -> Self {
        self.tracing.max_payload_length = max_chars;
        self
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `TRACEHOOK_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(enabled) = std::env::var("TRACEHOOK_ENABLED") {
            self.tracing.enabled = parse_bool("TRACEHOOK_ENABLED", &enabled)?;
        }
        if let Ok(name) = std::env::var("TRACEHOOK_TRACER_NAME") {
            self.tracing.tracer_name = name;
        }
        if let Ok(max) = std::env::var("TRACEHOOK_MAX_PAYLOAD_LENGTH") {
            self.tracing.max_payload_length = max.parse().map_err(|_| {
                crate::TracehookError::Config(format!(
                    "TRACEHOOK_MAX_PAYLOAD_LENGTH must be a non-negative integer, got '{}'",
                    max
                ))
            })?;
        }

        if let Ok(name) = std::env::var("TRACEHOOK_SERVICE_NAME") {
            self.telemetry.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("TRACEHOOK_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }

        if let Ok(level) = std::env::var("TRACEHOOK_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> crate::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(crate::TracehookError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Consumer span interception settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerTracingConfig {
    /// Whether traced handlers create spans at all
    pub enabled: bool,

    /// Instrumentation scope name of the tracer
    pub tracer_name: String,

    /// Longest message body recorded on a span, in characters
    pub max_payload_length: usize,
}

impl Default for ConsumerTracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracer_name: TRACER_NAME.to_string(),
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an
    /// `EnvFilter` expression)
    pub level: String,

    /// Whether to print log lines to stdout
    pub console: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            include_location: false,
        }
    }
}
