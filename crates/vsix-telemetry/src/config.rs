//! Telemetry configuration.
//!
//! [`TelemetryConfig`] is a plain serde struct that can be built in code or
//! loaded in layers with figment. Layers are applied in order of priority:
//! 1. Default values (compiled in)
//! 2. Config file (optional)
//! 3. Standard OpenTelemetry environment variables (`OTEL_*`)
//! 4. Crate-specific environment variables (`VSIX_TELEMETRY_*`, nested with `__`)
//!
//! # Supported Standard Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `OTEL_SERVICE_NAME` | `service_name` | Service name |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `exporter.endpoint` | OTLP endpoint URL |
//! | `OTEL_EXPORTER_OTLP_PROTOCOL` | `exporter.protocol` | `grpc` or `http/protobuf` |
//! | `OTEL_EXPORTER_OTLP_HEADERS` | `exporter.headers` | Comma-separated key=value pairs |
//! | `OTEL_EXPORTER_OTLP_TIMEOUT` | `exporter.timeout` | Export timeout in milliseconds |
//! | `OTEL_BSP_SCHEDULE_DELAY` | `exporter.batch_delay` | Batch delay in milliseconds |
//! | `OTEL_TRACES_SAMPLER_ARG` | `sampling_ratio` | Trace sampling ratio |
//!
//! The configuration is validated once, by
//! [`Telemetry::initialize`](crate::Telemetry::initialize), and never
//! mutated afterwards.

use crate::error::TelemetryError;
use crate::exceptions::TrackedException;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use opentelemetry::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "VSIX_TELEMETRY_";

/// Default service name.
pub const DEFAULT_SERVICE_NAME: &str = "VsixExtension";

/// Default service version.
pub const DEFAULT_SERVICE_VERSION: &str = "1.0.0";

/// One of the three telemetry data kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Spans.
    Traces,
    /// Instruments.
    Metrics,
    /// Log records.
    Logs,
}

impl Signal {
    /// Path appended to the base endpoint for HTTP export.
    pub fn http_path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        })
    }
}

/// OTLP transport.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    /// gRPC (port 4317). Requires a Tokio runtime when providers are built.
    #[serde(rename = "grpc")]
    Grpc,
    /// HTTP with protobuf payloads (port 4318).
    #[default]
    #[serde(rename = "http/protobuf", alias = "http")]
    HttpBinary,
}

impl Protocol {
    /// Conventional collector port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Grpc => 4317,
            Protocol::HttpBinary => 4318,
        }
    }

    /// Local collector endpoint for the protocol.
    pub fn default_endpoint(self) -> String {
        format!("http://localhost:{}", self.default_port())
    }
}

/// A typed resource attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// String value.
    String(String),
}

impl From<AttributeValue> for Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(v) => Value::Bool(v),
            AttributeValue::Int(v) => Value::I64(v),
            AttributeValue::Double(v) => Value::F64(v),
            AttributeValue::String(v) => Value::String(v.into()),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

/// Predicate deciding whether an exception is tracked.
///
/// Returning `false` drops the exception entirely.
#[derive(Clone)]
pub struct ExceptionFilter(Arc<dyn Fn(&TrackedException) -> bool + Send + Sync>);

impl ExceptionFilter {
    /// Wraps a predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&TrackedException) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Evaluates the predicate.
    pub fn allows(&self, exception: &TrackedException) -> bool {
        (self.0)(exception)
    }
}

impl fmt::Debug for ExceptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExceptionFilter(..)")
    }
}

/// Main telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute and span source name.
    pub service_name: String,
    /// `service.version` resource attribute.
    pub service_version: String,
    /// Exporter configuration.
    pub exporter: ExporterConfig,
    /// Per-signal enable flags.
    pub signals: SignalsConfig,
    /// Exception tracking configuration.
    pub exceptions: ExceptionConfig,
    /// Trace sampling ratio in `[0.0, 1.0]`.
    pub sampling_ratio: f64,
    /// Caller-supplied resource attributes. These win over the fixed ones.
    pub resource_attributes: BTreeMap<String, AttributeValue>,
    /// Install a global `tracing` subscriber bridged to the providers.
    pub install_tracing_subscriber: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: DEFAULT_SERVICE_VERSION.to_string(),
            exporter: ExporterConfig::default(),
            signals: SignalsConfig::default(),
            exceptions: ExceptionConfig::default(),
            sampling_ratio: 1.0,
            resource_attributes: BTreeMap::new(),
            install_tracing_subscriber: false,
        }
    }
}

impl TelemetryConfig {
    /// Creates a default configuration with the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from defaults and environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn from_env() -> Result<Self, TelemetryError> {
        Ok(Self::figment(None::<&Path>).extract()?)
    }

    /// Loads configuration from defaults, a TOML file (if it exists) and
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, TelemetryError> {
        Ok(Self::figment(Some(config_path)).extract()?)
    }

    /// Returns the layered figment so callers can merge their own providers
    /// before extracting.
    pub fn figment<P: AsRef<Path>>(config_path: Option<P>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(TelemetryConfig::default()));

        if let Some(path) = config_path
            && path.as_ref().exists()
        {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(standard_otel_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Checks the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfiguration`] for an empty service
    /// name, a sampling ratio outside `[0.0, 1.0]`, or a zero export timeout
    /// or batch delay.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.service_name.trim().is_empty() {
            return Err(TelemetryError::InvalidConfiguration(
                "service name must not be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "sampling ratio must be within [0.0, 1.0], got {}",
                self.sampling_ratio
            )));
        }

        if self.exporter.timeout.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "export timeout must be positive".to_string(),
            ));
        }

        if self.exporter.batch_delay.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "batch delay must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// OTLP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Base OTLP endpoint. When absent, signals go to the debug output.
    pub endpoint: Option<String>,
    /// Transport.
    pub protocol: Protocol,
    /// Additional headers sent with every export.
    pub headers: HashMap<String, String>,
    /// Export timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Batch delay in milliseconds.
    #[serde(with = "duration_ms")]
    pub batch_delay: Duration,
    /// Also write signals to the debug output when an endpoint is set.
    pub debug_output: bool,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            protocol: Protocol::HttpBinary,
            headers: HashMap::new(),
            timeout: Duration::from_millis(30_000),
            batch_delay: Duration::from_millis(5_000),
            debug_output: false,
        }
    }
}

impl ExporterConfig {
    /// Returns the configured base endpoint, treating a blank string as absent.
    pub fn base_endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }

    /// Returns the endpoint a signal's exporter should use.
    ///
    /// gRPC uses the base endpoint unchanged. HTTP appends the signal path
    /// unless the endpoint already ends with it (case-insensitive).
    pub fn signal_endpoint(&self, signal: Signal) -> Option<String> {
        let base = self.base_endpoint()?;
        Some(match self.protocol {
            Protocol::Grpc => base.to_string(),
            Protocol::HttpBinary => append_signal_path(base, signal.http_path()),
        })
    }

    /// Whether signals should also go to the debug output.
    pub fn uses_debug_output(&self) -> bool {
        self.debug_output || self.base_endpoint().is_none()
    }

    /// Headers serialised as `key=value,...`.
    pub fn headers_string(&self) -> String {
        format_headers(&self.headers)
    }
}

fn append_signal_path(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.to_ascii_lowercase().ends_with(path) {
        return base.to_string();
    }
    format!("{base}{path}")
}

/// Serialises headers as a comma-joined `key=value` list, sorted by key.
pub fn format_headers(headers: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = headers.iter().collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-joined `key=value` list. Malformed pairs are skipped.
pub fn parse_headers(headers: &str) -> HashMap<String, String> {
    headers
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Per-signal enable flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Build the tracer provider and span source.
    pub tracing: bool,
    /// Build the meter provider and instrument registry.
    pub metrics: bool,
    /// Build the logger provider and logging sink.
    pub logging: bool,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            tracing: true,
            metrics: true,
            logging: true,
        }
    }
}

impl SignalsConfig {
    /// Whether the given signal is enabled.
    pub fn is_enabled(&self, signal: Signal) -> bool {
        match signal {
            Signal::Traces => self.tracing,
            Signal::Metrics => self.metrics,
            Signal::Logs => self.logging,
        }
    }
}

/// Exception tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionConfig {
    /// Register the global unhandled-exception (panic) hook.
    pub global_handler: bool,
    /// Attach host application context to tracked exceptions.
    pub include_host_context: bool,
    /// Optional predicate; exceptions it rejects are dropped.
    #[serde(skip)]
    pub filter: Option<ExceptionFilter>,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            global_handler: true,
            include_host_context: true,
            filter: None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialExporterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_delay: Option<u64>,
}

impl PartialExporterConfig {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.protocol.is_none()
            && self.headers.is_empty()
            && self.timeout.is_none()
            && self.batch_delay.is_none()
    }
}

/// Partial config for standard OTEL env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampling_ratio: Option<f64>,
    #[serde(skip_serializing_if = "PartialExporterConfig::is_empty")]
    exporter: PartialExporterConfig,
}

fn standard_otel_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig::default();

    if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
        config.service_name = Some(name);
    }

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.exporter.endpoint = Some(endpoint);
    }

    if let Ok(protocol) = std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL") {
        config.exporter.protocol = match protocol.to_lowercase().as_str() {
            "grpc" => Some(Protocol::Grpc),
            "http/protobuf" | "http" => Some(Protocol::HttpBinary),
            _ => None,
        };
    }

    if let Ok(headers) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        config.exporter.headers = parse_headers(&headers);
    }

    if let Ok(timeout) = std::env::var("OTEL_EXPORTER_OTLP_TIMEOUT") {
        config.exporter.timeout = timeout.trim().parse().ok();
    }

    if let Ok(delay) = std::env::var("OTEL_BSP_SCHEDULE_DELAY") {
        config.exporter.batch_delay = delay.trim().parse().ok();
    }

    if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
        config.sampling_ratio = ratio.trim().parse().ok();
    }

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const OTEL_VARS: [&str; 7] = [
        "OTEL_SERVICE_NAME",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_EXPORTER_OTLP_PROTOCOL",
        "OTEL_EXPORTER_OTLP_HEADERS",
        "OTEL_EXPORTER_OTLP_TIMEOUT",
        "OTEL_BSP_SCHEDULE_DELAY",
        "OTEL_TRACES_SAMPLER_ARG",
    ];

    fn without_otel_env<F: FnOnce()>(f: F) {
        temp_env::with_vars(OTEL_VARS.map(|var| (var, None::<&str>)), f);
    }

    fn http_exporter(endpoint: &str) -> ExporterConfig {
        ExporterConfig {
            endpoint: Some(endpoint.to_string()),
            protocol: Protocol::HttpBinary,
            ..ExporterConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();

        assert_eq!(config.service_name, "VsixExtension");
        assert_eq!(config.service_version, "1.0.0");
        assert!(config.exporter.endpoint.is_none());
        assert_eq!(config.exporter.protocol, Protocol::HttpBinary);
        assert_eq!(config.exporter.timeout, Duration::from_millis(30_000));
        assert_eq!(config.exporter.batch_delay, Duration::from_millis(5_000));
        assert!(config.signals.tracing);
        assert!(config.signals.metrics);
        assert!(config.signals.logging);
        assert!(config.exceptions.global_handler);
        assert!(config.exceptions.filter.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_service_name() {
        for name in ["", "   "] {
            let config = TelemetryConfig::new(name);
            assert!(matches!(
                config.validate(),
                Err(TelemetryError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_validate_sampling_ratio_bounds() {
        for ratio in [0.0, 0.5, 1.0] {
            let config = TelemetryConfig {
                sampling_ratio: ratio,
                ..TelemetryConfig::default()
            };
            assert!(config.validate().is_ok(), "ratio {ratio} should be valid");
        }

        for ratio in [-0.1, 1.5, f64::NAN] {
            let config = TelemetryConfig {
                sampling_ratio: ratio,
                ..TelemetryConfig::default()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(TelemetryError::InvalidConfiguration(_))
                ),
                "ratio {ratio} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let mut config = TelemetryConfig::default();
        config.exporter.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.exporter.batch_delay = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_signal_endpoint_appends_path() {
        let exporter = http_exporter("https://api.example.com");

        assert_eq!(
            exporter.signal_endpoint(Signal::Traces).as_deref(),
            Some("https://api.example.com/v1/traces")
        );
        assert_eq!(
            exporter.signal_endpoint(Signal::Metrics).as_deref(),
            Some("https://api.example.com/v1/metrics")
        );
        assert_eq!(
            exporter.signal_endpoint(Signal::Logs).as_deref(),
            Some("https://api.example.com/v1/logs")
        );
    }

    #[test]
    fn test_http_signal_endpoint_does_not_double_append() {
        let exporter = http_exporter("https://api.example.com/v1/traces");
        assert_eq!(
            exporter.signal_endpoint(Signal::Traces).as_deref(),
            Some("https://api.example.com/v1/traces")
        );

        let exporter = http_exporter("https://api.example.com/V1/TRACES");
        assert_eq!(
            exporter.signal_endpoint(Signal::Traces).as_deref(),
            Some("https://api.example.com/V1/TRACES")
        );
    }

    #[test]
    fn test_http_signal_endpoint_trims_trailing_slash() {
        let exporter = http_exporter("http://collector:4318/");
        assert_eq!(
            exporter.signal_endpoint(Signal::Logs).as_deref(),
            Some("http://collector:4318/v1/logs")
        );
    }

    #[test]
    fn test_grpc_signal_endpoint_is_unchanged() {
        let exporter = ExporterConfig {
            endpoint: Some("http://collector:4317".to_string()),
            protocol: Protocol::Grpc,
            ..ExporterConfig::default()
        };
        assert_eq!(
            exporter.signal_endpoint(Signal::Traces).as_deref(),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn test_blank_endpoint_is_absent() {
        let exporter = http_exporter("  ");
        assert!(exporter.base_endpoint().is_none());
        assert!(exporter.signal_endpoint(Signal::Traces).is_none());
        assert!(exporter.uses_debug_output());

        let exporter = http_exporter("http://collector:4318");
        assert!(!exporter.uses_debug_output());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Protocol::Grpc.default_port(), 4317);
        assert_eq!(Protocol::HttpBinary.default_port(), 4318);
        assert_eq!(
            Protocol::HttpBinary.default_endpoint(),
            "http://localhost:4318"
        );
    }

    #[test]
    fn test_format_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "secret".to_string());
        headers.insert("authorization".to_string(), "Bearer abc".to_string());

        assert_eq!(
            format_headers(&headers),
            "authorization=Bearer abc,x-api-key=secret"
        );
        assert_eq!(format_headers(&HashMap::new()), "");
    }

    #[test]
    fn test_parse_headers_skips_malformed_pairs() {
        let headers = parse_headers("a=1, b = 2 ,broken,=empty");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(headers.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_attribute_value_conversion() {
        assert_eq!(Value::from(AttributeValue::from(true)), Value::Bool(true));
        assert_eq!(Value::from(AttributeValue::from(7_i64)), Value::I64(7));
        assert_eq!(Value::from(AttributeValue::from(0.5)), Value::F64(0.5));
        assert_eq!(
            Value::from(AttributeValue::from("x")),
            Value::String("x".into())
        );
    }

    #[test]
    fn test_exception_filter() {
        let filter = ExceptionFilter::new(|e| e.type_name() != "Cancelled");

        assert!(filter.allows(&TrackedException::new("IoError", "disk full")));
        assert!(!filter.allows(&TrackedException::new("Cancelled", "user cancelled")));
    }

    #[test]
    fn test_protocol_serialization() {
        assert_eq!(serde_json::to_string(&Protocol::Grpc).unwrap(), "\"grpc\"");
        assert_eq!(
            serde_json::to_string(&Protocol::HttpBinary).unwrap(),
            "\"http/protobuf\""
        );
        assert_eq!(
            serde_json::from_str::<Protocol>("\"http\"").unwrap(),
            Protocol::HttpBinary
        );
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let toml_content = r#"
service_name = "MyExtension"
sampling_ratio = 0.25

[exporter]
endpoint = "https://collector.example.com"
protocol = "http/protobuf"
timeout = 1000
batch_delay = 250

[exporter.headers]
x-api-key = "secret"

[signals]
metrics = false

[exceptions]
global_handler = false

[resource_attributes]
team = "tools"
build = 42
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        without_otel_env(|| {
            let config = TelemetryConfig::load_from_path(temp_file.path()).unwrap();

            assert_eq!(config.service_name, "MyExtension");
            assert_eq!(config.sampling_ratio, 0.25);
            assert_eq!(
                config.exporter.endpoint.as_deref(),
                Some("https://collector.example.com")
            );
            assert_eq!(config.exporter.protocol, Protocol::HttpBinary);
            assert_eq!(config.exporter.timeout, Duration::from_millis(1000));
            assert_eq!(config.exporter.batch_delay, Duration::from_millis(250));
            assert_eq!(config.exporter.headers_string(), "x-api-key=secret");
            assert!(config.signals.tracing);
            assert!(!config.signals.metrics);
            assert!(!config.exceptions.global_handler);
            assert_eq!(
                config.resource_attributes.get("team"),
                Some(&AttributeValue::String("tools".to_string()))
            );
            assert_eq!(
                config.resource_attributes.get("build"),
                Some(&AttributeValue::Int(42))
            );
        });
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        without_otel_env(|| {
            let config = TelemetryConfig::load_from_path("/nonexistent/path/telemetry.toml").unwrap();

            assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
            assert!(config.exporter.endpoint.is_none());
        });
    }

    #[test]
    #[serial]
    fn test_standard_otel_env() {
        temp_env::with_vars(
            [
                ("OTEL_SERVICE_NAME", Some("env-service")),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", Some("http://env-collector:4318")),
                ("OTEL_EXPORTER_OTLP_PROTOCOL", Some("http/protobuf")),
                ("OTEL_EXPORTER_OTLP_HEADERS", Some("a=1,b=2")),
                ("OTEL_EXPORTER_OTLP_TIMEOUT", Some("1500")),
                ("OTEL_BSP_SCHEDULE_DELAY", None),
                ("OTEL_TRACES_SAMPLER_ARG", Some("0.1")),
            ],
            || {
                let config = TelemetryConfig::from_env().unwrap();

                assert_eq!(config.service_name, "env-service");
                assert_eq!(
                    config.exporter.endpoint.as_deref(),
                    Some("http://env-collector:4318")
                );
                assert_eq!(config.exporter.protocol, Protocol::HttpBinary);
                assert_eq!(config.exporter.headers_string(), "a=1,b=2");
                assert_eq!(config.exporter.timeout, Duration::from_millis(1500));
                assert_eq!(config.exporter.batch_delay, Duration::from_millis(5_000));
                assert_eq!(config.sampling_ratio, 0.1);
            },
        );
    }

    #[test]
    #[serial]
    fn test_prefixed_env_overrides_standard_env() {
        temp_env::with_vars(
            [
                ("OTEL_SERVICE_NAME", Some("env-service")),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", Some("http://standard:4317")),
                ("VSIX_TELEMETRY_SERVICE_NAME", Some("prefixed-service")),
                ("VSIX_TELEMETRY_EXPORTER__ENDPOINT", Some("http://prefixed:4317")),
                ("VSIX_TELEMETRY_SIGNALS__LOGGING", Some("false")),
            ],
            || {
                let config = TelemetryConfig::from_env().unwrap();

                assert_eq!(config.service_name, "prefixed-service");
                assert_eq!(
                    config.exporter.endpoint.as_deref(),
                    Some("http://prefixed:4317")
                );
                assert!(!config.signals.logging);
            },
        );
    }
}
