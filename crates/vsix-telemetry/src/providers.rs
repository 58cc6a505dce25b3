//! Construction and teardown of the SDK signal providers.
//!
//! Each enabled signal gets an OTLP exporter when an endpoint is configured
//! and a stdout exporter when there is none or `debug_output` is set. The
//! gRPC transport is built on tonic and needs a Tokio runtime in scope;
//! without one, building a gRPC exporter fails with
//! [`TelemetryError::InvalidConfiguration`]. `http/protobuf` uses a blocking
//! client and works from any thread.

use crate::config::{Protocol, Signal, TelemetryConfig};
use crate::error::{Result, TelemetryError};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{
    BatchConfigBuilder as LogBatchConfigBuilder, BatchLogProcessor, SdkLoggerProvider,
};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder as TraceBatchConfigBuilder, BatchSpanProcessor, Sampler,
    SdkTracerProvider,
};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Trace sampler for a ratio in `[0.0, 1.0]`. Child spans follow their
/// parent's decision.
pub fn sampler(ratio: f64) -> Sampler {
    let root = if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    };
    Sampler::ParentBased(Box::new(root))
}

fn metadata_map(headers: &HashMap<String, String>) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers {
        if let (Ok(k), Ok(v)) = (
            key.parse::<MetadataKey<_>>(),
            value.parse::<MetadataValue<_>>(),
        ) {
            metadata.insert(k, v);
        } else {
            tracing::warn!(target: "vsix_telemetry", header = %key, "Skipping invalid gRPC metadata header");
        }
    }
    metadata
}

fn require_tokio_runtime() -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| {
            TelemetryError::InvalidConfiguration(
                "grpc transport requires a Tokio runtime".to_string(),
            )
        })
}

/// Builds the OTLP exporter for one signal, or `None` without an endpoint.
macro_rules! otlp_exporter {
    ($exporter:ty, $config:expr, $signal:expr, $error:path) => {{
        let exporter_config = &$config.exporter;
        match exporter_config.signal_endpoint($signal) {
            None => None,
            Some(endpoint) => {
                tracing::debug!(
                    target: "vsix_telemetry",
                    signal = %$signal,
                    endpoint = %endpoint,
                    protocol = ?exporter_config.protocol,
                    headers = %exporter_config.headers_string(),
                    "Configuring OTLP exporter"
                );
                let exporter = match exporter_config.protocol {
                    Protocol::Grpc => {
                        require_tokio_runtime()?;
                        let mut builder = <$exporter>::builder()
                            .with_tonic()
                            .with_endpoint(&endpoint)
                            .with_timeout(exporter_config.timeout);
                        if !exporter_config.headers.is_empty() {
                            builder = builder.with_metadata(metadata_map(&exporter_config.headers));
                        }
                        builder.build().map_err($error)?
                    }
                    Protocol::HttpBinary => {
                        let mut builder = <$exporter>::builder()
                            .with_http()
                            .with_endpoint(&endpoint)
                            .with_timeout(exporter_config.timeout)
                            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary);
                        if !exporter_config.headers.is_empty() {
                            builder = builder.with_headers(exporter_config.headers.clone());
                        }
                        builder.build().map_err($error)?
                    }
                };
                Some(exporter)
            }
        }
    }};
}

/// Builds the tracer provider with the configured sampler and exporters.
///
/// # Errors
///
/// Returns [`TelemetryError::TraceExporter`] if the OTLP exporter cannot be
/// created, or [`TelemetryError::InvalidConfiguration`] for gRPC outside a
/// Tokio runtime.
pub fn build_tracer_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkTracerProvider> {
    let mut builder = SdkTracerProvider::builder()
        .with_sampler(sampler(config.sampling_ratio))
        .with_resource(resource);

    if let Some(exporter) = otlp_exporter!(
        opentelemetry_otlp::SpanExporter,
        config,
        Signal::Traces,
        TelemetryError::TraceExporter
    ) {
        let batch_config = TraceBatchConfigBuilder::default()
            .with_scheduled_delay(config.exporter.batch_delay)
            .build();
        let span_processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build();
        builder = builder.with_span_processor(span_processor);
    }

    if config.exporter.uses_debug_output() {
        builder = builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default());
    }

    Ok(builder.build())
}

/// Builds the meter provider. Readers export every `batch_delay`.
///
/// # Errors
///
/// Returns [`TelemetryError::MetricExporter`] if the OTLP exporter cannot be
/// created.
pub fn build_meter_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkMeterProvider> {
    let mut builder = SdkMeterProvider::builder().with_resource(resource);

    if let Some(exporter) = otlp_exporter!(
        opentelemetry_otlp::MetricExporter,
        config,
        Signal::Metrics,
        TelemetryError::MetricExporter
    ) {
        let reader = PeriodicReader::builder(exporter)
            .with_interval(config.exporter.batch_delay)
            .build();
        builder = builder.with_reader(reader);
    }

    if config.exporter.uses_debug_output() {
        let reader = PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(config.exporter.batch_delay)
            .build();
        builder = builder.with_reader(reader);
    }

    Ok(builder.build())
}

/// Builds the logger provider backing the telemetry logging sink.
///
/// # Errors
///
/// Returns [`TelemetryError::LogExporter`] if the OTLP exporter cannot be
/// created.
pub fn build_logger_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<SdkLoggerProvider> {
    let mut builder = SdkLoggerProvider::builder().with_resource(resource);

    if let Some(exporter) = otlp_exporter!(
        opentelemetry_otlp::LogExporter,
        config,
        Signal::Logs,
        TelemetryError::LogExporter
    ) {
        let batch_config = LogBatchConfigBuilder::default()
            .with_scheduled_delay(config.exporter.batch_delay)
            .build();
        let log_processor = BatchLogProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build();
        builder = builder.with_log_processor(log_processor);
    }

    if config.exporter.uses_debug_output() {
        builder = builder.with_simple_exporter(opentelemetry_stdout::LogExporter::default());
    }

    Ok(builder.build())
}

/// The SDK providers built for one telemetry session.
#[derive(Clone, Default)]
pub(crate) struct SignalProviders {
    pub(crate) tracer: Option<SdkTracerProvider>,
    pub(crate) meter: Option<SdkMeterProvider>,
    pub(crate) logger: Option<SdkLoggerProvider>,
}

impl SignalProviders {
    /// Builds a provider for every enabled signal.
    pub(crate) fn build(config: &TelemetryConfig, resource: &Resource) -> Result<Self> {
        let tracer = if config.signals.is_enabled(Signal::Traces) {
            Some(build_tracer_provider(config, resource.clone())?)
        } else {
            None
        };

        let meter = if config.signals.is_enabled(Signal::Metrics) {
            Some(build_meter_provider(config, resource.clone())?)
        } else {
            None
        };

        let logger = if config.signals.is_enabled(Signal::Logs) {
            Some(build_logger_provider(config, resource.clone())?)
        } else {
            None
        };

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }

    /// Flushes and shuts down every provider, waiting at most `timeout`.
    ///
    /// The work runs on its own thread; on timeout it is left to finish in
    /// the background.
    pub(crate) fn shutdown(self, timeout: Duration) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let providers = self.clone();
        let spawned = std::thread::Builder::new()
            .name("vsix-telemetry-shutdown".to_string())
            .spawn(move || {
                let _ = tx.send(providers.shutdown_blocking());
            });

        if let Err(e) = spawned {
            tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to spawn shutdown thread, shutting down inline");
            return self.shutdown_blocking();
        }
        drop(self);

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(target: "vsix_telemetry", ?timeout, "Provider shutdown timed out");
                Err(TelemetryError::ShutdownTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(target: "vsix_telemetry", "Shutdown thread exited without reporting");
                Ok(())
            }
        }
    }

    /// Every provider is shut down even if an earlier one fails; the first
    /// failure is returned.
    fn shutdown_blocking(self) -> Result<()> {
        let mut first_error = None;

        if let Some(provider) = self.tracer {
            if let Err(e) = provider.force_flush() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to flush tracer provider");
            }
            if let Err(e) = provider.shutdown() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to shut down tracer provider");
                first_error.get_or_insert(e);
            }
        }

        if let Some(provider) = self.meter {
            if let Err(e) = provider.force_flush() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to flush meter provider");
            }
            if let Err(e) = provider.shutdown() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to shut down meter provider");
                first_error.get_or_insert(e);
            }
        }

        if let Some(provider) = self.logger {
            if let Err(e) = provider.force_flush() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to flush logger provider");
            }
            if let Err(e) = provider.shutdown() {
                tracing::warn!(target: "vsix_telemetry", error = %e, "Failed to shut down logger provider");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), |e| Err(TelemetryError::Shutdown(e)))
    }
}

/// Installs a global `tracing` subscriber bridged to the providers.
///
/// Returns `false` if a global subscriber was already set. That is not an
/// error: a process can only install one, and re-initialisation must work.
pub(crate) fn init_subscriber(
    tracer_name: &str,
    tracer_provider: Option<&SdkTracerProvider>,
    logger_provider: Option<&SdkLoggerProvider>,
) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .without_time();

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    let result = match (tracer_provider, logger_provider) {
        (Some(tp), Some(lp)) => {
            let tracer = tp.tracer(tracer_name.to_string());
            let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            let log_layer = OpenTelemetryTracingBridge::new(lp);
            registry.with(telemetry_layer).with(log_layer).try_init()
        }
        (Some(tp), None) => {
            let tracer = tp.tracer(tracer_name.to_string());
            let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(telemetry_layer).try_init()
        }
        (None, Some(lp)) => {
            let log_layer = OpenTelemetryTracingBridge::new(lp);
            registry.with(log_layer).try_init()
        }
        (None, None) => registry.try_init(),
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(target: "vsix_telemetry", error = %e, "Tracing subscriber not installed");
            false
        }
    }
}
