//! Error types for telemetry configuration and lifecycle.

use crate::config::Signal;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_sdk::error::OTelSdkError;
use std::time::Duration;
use thiserror::Error;

/// A specialised Result type for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors that can occur while configuring, using or tearing down telemetry.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configuration failed validation.
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfiguration(String),

    /// `initialize` was called while telemetry was already running.
    #[error("telemetry is already initialised")]
    AlreadyInitialized,

    /// A direct accessor was called before `initialize`.
    #[error("telemetry is not initialised")]
    NotInitialized,

    /// A direct accessor was called for a signal that was not enabled.
    #[error("the {0} signal is disabled")]
    SignalDisabled(Signal),

    /// The component has been disposed.
    #[error("{0} has been disposed")]
    ObjectDisposed(&'static str),

    /// An instrument name was reused with a different kind or numeric type.
    #[error("instrument `{name}` is registered as {registered}, requested {requested}")]
    InstrumentConflict {
        /// Instrument name.
        name: String,
        /// Kind of the instrument already registered under the name.
        registered: &'static str,
        /// Kind that was requested.
        requested: &'static str,
    },

    /// Failed to create the trace exporter.
    #[error("failed to create trace exporter")]
    TraceExporter(#[source] ExporterBuildError),

    /// Failed to create the metric exporter.
    #[error("failed to create metric exporter")]
    MetricExporter(#[source] ExporterBuildError),

    /// Failed to create the log exporter.
    #[error("failed to create log exporter")]
    LogExporter(#[source] ExporterBuildError),

    /// A provider failed to flush or shut down.
    #[error("failed to shut down provider")]
    Shutdown(#[source] OTelSdkError),

    /// Providers did not finish shutting down within the budget.
    #[error("provider shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Layered configuration could not be extracted.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),
}

impl From<figment::Error> for TelemetryError {
    fn from(err: figment::Error) -> Self {
        TelemetryError::Config(Box::new(err))
    }
}
