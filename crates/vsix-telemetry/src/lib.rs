//! OpenTelemetry configuration and lifecycle management for IDE extensions.
//!
//! This crate wires the OpenTelemetry SDK, OTLP exporters and the `tracing`
//! ecosystem into one lifecycle object that an extension initialises when it
//! loads and shuts down when it unloads. It handles:
//!
//! - **Layered configuration** - defaults, an optional TOML file, standard
//!   `OTEL_*` variables and `VSIX_TELEMETRY_*` overrides via
//!   [figment](https://docs.rs/figment)
//! - **Per-signal providers** - traces, metrics and logs are each optional;
//!   disabled signals degrade to no-ops instead of errors
//! - **Activities** - span handles for host commands, tool windows and
//!   document operations
//! - **Instrument registry** - named counters and histograms created once
//!   and reused
//! - **Exception tracking** - errors and panics recorded on the current span
//!   and in the log, with an optional global panic hook
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vsix_telemetry::{Telemetry, TelemetryConfig, TrackedException};
//!
//! fn main() -> Result<(), vsix_telemetry::TelemetryError> {
//!     let mut config = TelemetryConfig::from_env()?;
//!     config.service_name = "MyExtension".to_string();
//!     config.exporter.endpoint = Some("http://localhost:4318".to_string());
//!     config.exporter.protocol = vsix_telemetry::Protocol::HttpBinary;
//!
//!     let telemetry = Telemetry::global();
//!     telemetry.initialize(config)?;
//!
//!     let activity = telemetry.start_document_activity("/src/main.rs", "Save");
//!     if let Some(counter) = telemetry.get_or_create_counter::<u64>("saves", None, None) {
//!         counter.add(1, &[]);
//!     }
//!     telemetry.record_exception_on_activity(
//!         Some(&activity),
//!         Some(&TrackedException::new("IoError", "disk full")),
//!         true,
//!     );
//!     activity.end();
//!
//!     telemetry.shutdown(Duration::from_secs(5))
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod activity;
pub mod config;
mod error;
pub mod exceptions;
mod lifecycle;
mod logger;
pub mod metrics;
mod providers;
pub mod resource;

pub use activity::{Activity, ActivitySourceProvider};
pub use config::{
    AttributeValue, ExceptionConfig, ExceptionFilter, ExporterConfig, Protocol, Signal,
    SignalsConfig, TelemetryConfig,
};
pub use error::{Result, TelemetryError};
pub use exceptions::{ExceptionTracker, TrackedException};
pub use lifecycle::{DEFAULT_SHUTDOWN_TIMEOUT, Telemetry};
pub use logger::TelemetryLogger;
pub use metrics::MetricsProvider;
pub use providers::{build_logger_provider, build_meter_provider, build_tracer_provider, sampler};
pub use resource::{HostEnvironment, ProcessEnvironment};

// Re-exported so callers can name span kinds and log severities without a
// direct dependency.
pub use opentelemetry::logs::Severity;
pub use opentelemetry::trace::{SpanKind, Status};
pub use opentelemetry::KeyValue;

// Re-export figment for callers who layer their own configuration sources
pub use figment;
