//! Integration harness that runs an extension session end to end against the
//! process-wide telemetry instance:
//! - Extension load (initialise from layered configuration)
//! - Command, tool window and document activities with nested context
//! - Metrics, logging and exception tracking inside those activities
//! - Extension unload (shutdown) and reload
//!
//! All tests share [`Telemetry::global`], so they run serially.

use serial_test::serial;
use std::time::{Duration, Instant};
use vsix_telemetry::{
    KeyValue, SpanKind, Telemetry, TelemetryConfig, TelemetryError, TrackedException,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn extension_config(name: &str) -> TelemetryConfig {
    let mut config = TelemetryConfig::new(name);
    config.service_version = "4.2.0".to_string();
    config.exceptions.global_handler = false;
    config
}

/// Simulates the work an extension does while handling one command.
fn handle_format_command(telemetry: &Telemetry) {
    let started = Instant::now();
    let command = telemetry.start_command_activity("Edit.FormatDocument");
    let _command_scope = command.enter();

    {
        let window = telemetry.start_tool_window_activity("ErrorList", "Refresh");
        let _window_scope = window.enter();
        telemetry.log_information("refreshing error list");
    }

    let document = telemetry.start_document_activity("/src/Program.cs", "Format");
    {
        let _document_scope = document.enter();
        let parse_error = "12a".parse::<i32>().unwrap_err();
        telemetry.track_error(&parse_error, &[KeyValue::new("document.line", 42_i64)]);
    }
    telemetry.record_exception_on_activity(
        Some(&document),
        Some(&TrackedException::new("FormatterError", "formatter gave up")),
        false,
    );
    document.end();

    telemetry.record_command_execution("Edit.FormatDocument");
    telemetry.record_operation_duration(
        "Edit.FormatDocument",
        started.elapsed().as_secs_f64() * 1000.0,
    );
}

#[test]
#[serial]
fn test_extension_session_lifecycle() {
    let telemetry = Telemetry::global();
    telemetry.initialize(extension_config("FormatterExtension")).unwrap();

    assert!(matches!(
        telemetry.initialize(extension_config("Other")),
        Err(TelemetryError::AlreadyInitialized)
    ));

    handle_format_command(telemetry);

    let source = telemetry.tracer().unwrap();
    assert_eq!(source.name(), "FormatterExtension");
    assert_eq!(source.version(), "4.2.0");
    let counter = telemetry
        .get_or_create_counter::<u64>("vsix.commands.executed", None, None)
        .unwrap();
    counter.add(1, &[KeyValue::new("vsix.command.name", "Edit.Undo")]);

    telemetry.shutdown(SHUTDOWN_TIMEOUT).unwrap();
    assert!(!telemetry.is_initialized());
    assert!(source.is_disposed());
}

#[test]
#[serial]
fn test_instrumentation_before_load_is_silent() {
    let telemetry = Telemetry::global();
    assert!(!telemetry.is_initialized());

    handle_format_command(telemetry);

    let activity = telemetry.start_activity("Background.Index", SpanKind::Internal);
    assert!(!activity.is_recording());
    assert!(telemetry.get_or_create_histogram::<f64>("latency", None, None).is_none());
    assert!(matches!(telemetry.tracer(), Err(TelemetryError::NotInitialized)));
    telemetry.shutdown(SHUTDOWN_TIMEOUT).unwrap();
}

#[test]
#[serial]
fn test_reload_extension() {
    let telemetry = Telemetry::global();

    for generation in 0..3 {
        let name = format!("ReloadingExtension{generation}");
        telemetry.initialize(extension_config(&name)).unwrap();
        handle_format_command(telemetry);
        assert_eq!(telemetry.tracer().unwrap().name(), name);
        telemetry.shutdown(SHUTDOWN_TIMEOUT).unwrap();
    }
}

#[test]
#[serial]
fn test_signals_disabled_session() {
    let telemetry = Telemetry::global();
    let mut config = extension_config("QuietExtension");
    config.signals.tracing = false;
    config.signals.metrics = false;
    config.signals.logging = false;

    telemetry.initialize(config).unwrap();
    handle_format_command(telemetry);

    assert!(matches!(
        telemetry.tracer(),
        Err(TelemetryError::SignalDisabled(_))
    ));
    assert!(telemetry.exception_tracker().is_ok());
    assert!(!telemetry.start_command_activity("Edit.Undo").is_recording());

    telemetry.shutdown(SHUTDOWN_TIMEOUT).unwrap();
}
