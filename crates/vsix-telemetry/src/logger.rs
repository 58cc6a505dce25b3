//! Logging sink backed by the OpenTelemetry Logs API.

use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _, Severity};
use opentelemetry::{InstrumentationScope, KeyValue, Value};
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;

/// Handle to the telemetry logging sink.
///
/// A logger built without a provider, or one that has been disposed, accepts
/// every call and drops the record. Clones share the same sink, so disposing
/// one clone silences all of them.
#[derive(Clone, Default)]
pub struct TelemetryLogger {
    logger: Arc<RwLock<Option<SdkLogger>>>,
}

impl TelemetryLogger {
    /// Creates a logger that emits through `provider` under the given scope.
    pub fn new(provider: &SdkLoggerProvider, scope: InstrumentationScope) -> Self {
        Self {
            logger: Arc::new(RwLock::new(Some(provider.logger_with_scope(scope)))),
        }
    }

    /// Creates a logger that drops every record.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Whether records are currently delivered anywhere.
    pub fn is_enabled(&self) -> bool {
        self.logger.read().is_some()
    }

    /// Emits a record with the given severity, body and attributes.
    pub fn log(&self, severity: Severity, message: &str, attributes: &[KeyValue]) {
        self.emit(severity, None, message, attributes);
    }

    /// Emits a named event record, as used for tracked exceptions.
    pub fn log_event(
        &self,
        severity: Severity,
        event_name: &'static str,
        message: &str,
        attributes: &[KeyValue],
    ) {
        self.emit(severity, Some(event_name), message, attributes);
    }

    /// Emits an `Info` record.
    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message, &[]);
    }

    /// Emits a `Warn` record.
    pub fn warn(&self, message: &str) {
        self.log(Severity::Warn, message, &[]);
    }

    /// Emits an `Error` record.
    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message, &[]);
    }

    /// Detaches the sink. Later calls are dropped.
    pub fn dispose(&self) {
        self.logger.write().take();
    }

    fn emit(
        &self,
        severity: Severity,
        event_name: Option<&'static str>,
        message: &str,
        attributes: &[KeyValue],
    ) {
        let guard = self.logger.read();
        let Some(logger) = guard.as_ref() else {
            return;
        };

        let now = SystemTime::now();
        let mut record = logger.create_log_record();
        record.set_timestamp(now);
        record.set_observed_timestamp(now);
        record.set_severity_number(severity);
        record.set_severity_text(severity.name());
        record.set_body(AnyValue::from(message.to_string()));
        if let Some(name) = event_name {
            record.set_event_name(name);
        }
        for attribute in attributes {
            record.add_attribute(attribute.key.clone(), any_value(&attribute.value));
        }
        logger.emit(record);
    }
}

impl std::fmt::Debug for TelemetryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryLogger")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn any_value(value: &Value) -> AnyValue {
    match value {
        Value::Bool(v) => AnyValue::Boolean(*v),
        Value::I64(v) => AnyValue::Int(*v),
        Value::F64(v) => AnyValue::Double(*v),
        Value::String(v) => AnyValue::String(v.clone()),
        other => AnyValue::String(other.to_string().into()),
    }
}
