//! Telemetry lifecycle management.
//!
//! [`Telemetry`] owns one telemetry session at a time: it validates the
//! configuration, builds the signal providers and the components on top of
//! them, and tears everything down again on [`Telemetry::shutdown`]. After a
//! shutdown the same instance can be initialised again.
//!
//! Direct accessors ([`Telemetry::tracer`], [`Telemetry::meter`], ...) report
//! why they cannot return anything. The instrumentation helpers
//! ([`Telemetry::start_activity`], [`Telemetry::track_exception`], ...) never
//! fail: before initialisation, or with the relevant signal disabled, they
//! return an empty handle or do nothing.

use crate::activity::{Activity, ActivitySourceProvider};
use crate::config::{Signal, TelemetryConfig};
use crate::error::{Result, TelemetryError};
use crate::exceptions::{ExceptionTracker, TrackedException};
use crate::logger::TelemetryLogger;
use crate::metrics::{CounterValue, HistogramValue, MetricsProvider, UpDownCounterValue};
use crate::providers::{self, SignalProviders};
use crate::resource::{self, HostEnvironment, ProcessEnvironment};
use opentelemetry::logs::Severity;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::trace::SpanKind;
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::error::Error;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Shutdown budget used when a [`Telemetry`] is dropped while initialised.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static GLOBAL: LazyLock<Telemetry> = LazyLock::new(Telemetry::new);

/// Lifecycle manager for one telemetry session at a time.
///
/// Most extensions use the process-wide instance from [`Telemetry::global`].
/// Independent instances are useful in tests and in hosts that load several
/// extensions into one process.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use vsix_telemetry::{Telemetry, TelemetryConfig};
///
/// # fn main() -> Result<(), vsix_telemetry::TelemetryError> {
/// let telemetry = Telemetry::global();
/// telemetry.initialize(TelemetryConfig::new("MyExtension"))?;
///
/// let activity = telemetry.start_command_activity("MyExtension.Format");
/// {
///     let _current = activity.enter();
///     telemetry.log_information("formatting document");
/// }
/// activity.end();
///
/// telemetry.shutdown(Duration::from_secs(5))?;
/// # Ok(())
/// # }
/// ```
pub struct Telemetry {
    host: Arc<dyn HostEnvironment>,
    state: RwLock<Option<Arc<ActiveTelemetry>>>,
}

struct ActiveTelemetry {
    service_name: String,
    providers: SignalProviders,
    activity_source: Option<ActivitySourceProvider>,
    metrics: Option<MetricsProvider>,
    logger: TelemetryLogger,
    exception_tracker: ExceptionTracker,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Creates an uninitialised manager that reports the process's own
    /// environment.
    pub fn new() -> Self {
        Self::with_host_environment(Arc::new(ProcessEnvironment))
    }

    /// Creates an uninitialised manager that reads host facts from `host`.
    pub fn with_host_environment(host: Arc<dyn HostEnvironment>) -> Self {
        Self {
            host,
            state: RwLock::new(None),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static Telemetry {
        &GLOBAL
    }

    /// Starts a telemetry session.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfiguration`] if `config` fails
    /// validation, [`TelemetryError::AlreadyInitialized`] if a session is
    /// running (it is left untouched), or an exporter error if a provider
    /// cannot be built. The gRPC transport additionally needs a Tokio
    /// runtime in scope and fails with
    /// [`TelemetryError::InvalidConfiguration`] without one. On error nothing
    /// is left initialised.
    pub fn initialize(&self, config: TelemetryConfig) -> Result<()> {
        self.initialize_with(config, SignalProviders::build)
    }

    fn initialize_with<F>(&self, config: TelemetryConfig, build_providers: F) -> Result<()>
    where
        F: FnOnce(&TelemetryConfig, &Resource) -> Result<SignalProviders>,
    {
        config.validate()?;

        let mut state = self.state.write();
        if state.is_some() {
            return Err(TelemetryError::AlreadyInitialized);
        }

        let resource = resource::build_resource(&config, self.host.as_ref());
        let providers = build_providers(&config, &resource)?;

        let activity_source = providers.tracer.as_ref().map(|provider| {
            ActivitySourceProvider::new(
                config.service_name.clone(),
                config.service_version.clone(),
                provider,
            )
        });

        let metrics = providers.meter.as_ref().map(|provider| {
            MetricsProvider::new(
                config.service_name.clone(),
                config.service_version.clone(),
                provider,
            )
        });

        let logger = match &providers.logger {
            Some(provider) => {
                let scope = InstrumentationScope::builder(config.service_name.clone())
                    .with_version(config.service_version.clone())
                    .build();
                TelemetryLogger::new(provider, scope)
            }
            None => TelemetryLogger::noop(),
        };

        let exception_tracker = ExceptionTracker::new(
            &config.exceptions,
            logger.clone(),
            Some(Arc::clone(&self.host)),
        );
        if config.exceptions.global_handler {
            exception_tracker.register_global_exception_handler()?;
        }

        if config.install_tracing_subscriber {
            providers::init_subscriber(
                &config.service_name,
                providers.tracer.as_ref(),
                providers.logger.as_ref(),
            );
        }

        tracing::info!(
            target: "vsix_telemetry",
            service_name = %config.service_name,
            service_version = %config.service_version,
            tracing = config.signals.tracing,
            metrics = config.signals.metrics,
            logging = config.signals.logging,
            "Telemetry initialised"
        );

        *state = Some(Arc::new(ActiveTelemetry {
            service_name: config.service_name,
            providers,
            activity_source,
            metrics,
            logger,
            exception_tracker,
        }));
        Ok(())
    }

    /// Ends the running session, if any.
    ///
    /// Components are disposed first (exception tracker, logger, metrics,
    /// activity source), then the providers are flushed and shut down within
    /// `timeout`. The manager is uninitialised when this returns, whatever
    /// the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Shutdown`] if a provider failed to shut down
    /// or [`TelemetryError::ShutdownTimeout`] if `timeout` elapsed first.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let Some(active) = self.state.write().take() else {
            return Ok(());
        };

        tracing::info!(target: "vsix_telemetry", service_name = %active.service_name, "Telemetry shutting down");

        active.exception_tracker.dispose();
        active.logger.dispose();
        if let Some(metrics) = &active.metrics {
            metrics.dispose();
        }
        if let Some(activity_source) = &active.activity_source {
            activity_source.dispose();
        }

        active.providers.clone().shutdown(timeout)
    }

    /// Whether a session is running.
    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    fn active(&self) -> Result<Arc<ActiveTelemetry>> {
        self.state
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TelemetryError::NotInitialized)
    }

    /// The span source of the running session.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn tracer(&self) -> Result<ActivitySourceProvider> {
        self.active()?
            .activity_source
            .clone()
            .ok_or(TelemetryError::SignalDisabled(Signal::Traces))
    }

    /// The metrics provider of the running session.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn meter(&self) -> Result<MetricsProvider> {
        self.active()?
            .metrics
            .clone()
            .ok_or(TelemetryError::SignalDisabled(Signal::Metrics))
    }

    /// The logging sink of the running session.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn logger(&self) -> Result<TelemetryLogger> {
        let active = self.active()?;
        if active.providers.logger.is_none() {
            return Err(TelemetryError::SignalDisabled(Signal::Logs));
        }
        Ok(active.logger.clone())
    }

    /// The exception tracker of the running session.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`].
    pub fn exception_tracker(&self) -> Result<ExceptionTracker> {
        Ok(self.active()?.exception_tracker.clone())
    }

    /// The SDK tracer provider, for wiring other libraries.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn tracer_provider(&self) -> Result<SdkTracerProvider> {
        self.active()?
            .providers
            .tracer
            .clone()
            .ok_or(TelemetryError::SignalDisabled(Signal::Traces))
    }

    /// The SDK meter provider.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn meter_provider(&self) -> Result<SdkMeterProvider> {
        self.active()?
            .providers
            .meter
            .clone()
            .ok_or(TelemetryError::SignalDisabled(Signal::Metrics))
    }

    /// The SDK logger provider.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotInitialized`] or
    /// [`TelemetryError::SignalDisabled`].
    pub fn logger_provider(&self) -> Result<SdkLoggerProvider> {
        self.active()?
            .providers
            .logger
            .clone()
            .ok_or(TelemetryError::SignalDisabled(Signal::Logs))
    }

    /// Starts an activity, or returns an empty one.
    pub fn start_activity(&self, name: impl Into<Cow<'static, str>>, kind: SpanKind) -> Activity {
        self.tracer()
            .and_then(|source| source.start_activity(name, kind))
            .unwrap_or_default()
    }

    /// Starts a `Command: {command_name}` activity, or returns an empty one.
    pub fn start_command_activity(&self, command_name: &str) -> Activity {
        self.tracer()
            .and_then(|source| source.start_command_activity(command_name))
            .unwrap_or_default()
    }

    /// Starts a `ToolWindow: {window_name}.{operation}` activity, or returns
    /// an empty one.
    pub fn start_tool_window_activity(&self, window_name: &str, operation: &str) -> Activity {
        self.tracer()
            .and_then(|source| source.start_tool_window_activity(window_name, operation))
            .unwrap_or_default()
    }

    /// Starts a `Document: {operation}` activity, or returns an empty one.
    pub fn start_document_activity(&self, document_path: &str, operation: &str) -> Activity {
        self.tracer()
            .and_then(|source| source.start_document_activity(document_path, operation))
            .unwrap_or_default()
    }

    /// Returns the named counter, or `None` when metrics are unavailable or
    /// the name is taken by another instrument type.
    pub fn get_or_create_counter<T: CounterValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Option<Arc<Counter<T>>> {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.get_or_create_counter(name, unit, description)),
        )
    }

    /// Returns the named histogram, or `None`.
    pub fn get_or_create_histogram<T: HistogramValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Option<Arc<Histogram<T>>> {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.get_or_create_histogram(name, unit, description)),
        )
    }

    /// Returns the named up-down counter, or `None`.
    pub fn get_or_create_up_down_counter<T: UpDownCounterValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Option<Arc<UpDownCounter<T>>> {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.get_or_create_up_down_counter(name, unit, description)),
        )
    }

    /// Counts one execution of `command_name`, if metrics are available.
    pub fn record_command_execution(&self, command_name: &str) {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.record_command_execution(command_name)),
        );
    }

    /// Records an operation duration in milliseconds, if metrics are
    /// available.
    pub fn record_operation_duration(&self, operation: &str, duration_ms: f64) {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.record_operation_duration(operation, duration_ms)),
        );
    }

    /// Counts one error of `error_type`, if metrics are available.
    pub fn record_error(&self, error_type: &str) {
        degrade(
            self.meter()
                .and_then(|metrics| metrics.record_error(error_type)),
        );
    }

    /// Tracks `exception` on the current activity and in the log.
    pub fn track_exception(&self, exception: Option<&TrackedException>, extra: &[KeyValue]) {
        degrade(
            self.exception_tracker()
                .and_then(|tracker| tracker.track_exception(exception, extra)),
        );
    }

    /// Tracks a typed error.
    pub fn track_error<E: Error + 'static>(&self, error: &E, extra: &[KeyValue]) {
        degrade(
            self.exception_tracker()
                .and_then(|tracker| tracker.track_error(error, extra)),
        );
    }

    /// Records `exception` on `activity` rather than the current one.
    pub fn record_exception_on_activity(
        &self,
        activity: Option<&Activity>,
        exception: Option<&TrackedException>,
        escaped: bool,
    ) {
        degrade(self.exception_tracker().and_then(|tracker| {
            tracker.record_exception_on_activity(activity, exception, escaped)
        }));
    }

    /// Logs at information level.
    pub fn log_information(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    /// Logs at warning level.
    pub fn log_warning(&self, message: &str) {
        self.log(Severity::Warn, message);
    }

    /// Logs at error level.
    pub fn log_error(&self, message: &str) {
        self.log(Severity::Error, message);
    }

    fn log(&self, severity: Severity, message: &str) {
        if let Ok(active) = self.active() {
            active.logger.log(severity, message, &[]);
        }
    }
}

fn degrade<T>(result: Result<T>) -> Option<T> {
    result
        .inspect_err(|e| tracing::debug!(target: "vsix_telemetry", error = %e, "Telemetry call skipped"))
        .ok()
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT) {
            eprintln!("Error shutting down telemetry: {e}");
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
