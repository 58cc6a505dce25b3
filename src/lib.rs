//! VSIX telemetry workspace - integration tests for the telemetry lifecycle.
//!
//! This is a virtual package that provides workspace-level integration tests.
//! The actual functionality is provided by the workspace member crate:
//!
//! - `vsix-telemetry`: OpenTelemetry configuration and lifecycle management
//!   for IDE extensions
