//! Span source and activity handles.
//!
//! An [`Activity`] is either a live, recording span or an empty handle. Every
//! method on the empty handle is a no-op, so call sites never need to check
//! whether tracing is enabled or sampled.
//!
//! The ambient "current activity" is the OpenTelemetry [`Context`] of the
//! calling thread. [`Activity::enter`] makes an activity current for the
//! lifetime of the returned guard; activities started while it is current
//! become its children.

use crate::error::{Result, TelemetryError};
use opentelemetry::trace::{
    Span, SpanKind, Status, TraceContextExt as _, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, ContextGuard, InstrumentationScope, KeyValue};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;

/// Attribute keys attached by the host operation helpers.
pub mod keys {
    /// Command name.
    pub const COMMAND_NAME: &str = "vsix.command.name";
    /// Tool window name.
    pub const TOOL_WINDOW_NAME: &str = "vsix.toolwindow.name";
    /// Tool window operation.
    pub const TOOL_WINDOW_OPERATION: &str = "vsix.toolwindow.operation";
    /// Document path.
    pub const DOCUMENT_PATH: &str = "vsix.document.path";
    /// Document operation.
    pub const DOCUMENT_OPERATION: &str = "vsix.document.operation";
}

/// A span handle that may be empty.
///
/// Dropping a live activity ends its span.
#[derive(Debug, Default)]
pub struct Activity {
    context: Option<Context>,
}

impl Activity {
    /// Returns an empty handle.
    pub fn none() -> Self {
        Self { context: None }
    }

    /// Wraps a span, returning an empty handle if it is not recording.
    pub fn from_span<S>(span: S) -> Self
    where
        S: Span + Send + Sync + 'static,
    {
        if !span.is_recording() {
            return Self::none();
        }
        Self {
            context: Some(Context::current_with_span(span)),
        }
    }

    /// Whether the handle refers to a live span.
    pub fn is_recording(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(|cx| cx.span().is_recording())
    }

    /// The context carrying this activity's span, if any.
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Sets an attribute on the span.
    pub fn set_attribute(&self, attribute: KeyValue) {
        if let Some(cx) = &self.context {
            cx.span().set_attribute(attribute);
        }
    }

    /// Records a named event on the span.
    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        if let Some(cx) = &self.context {
            cx.span().add_event(name, attributes);
        }
    }

    /// Sets the span status.
    pub fn set_status(&self, status: Status) {
        if let Some(cx) = &self.context {
            cx.span().set_status(status);
        }
    }

    /// Marks the span as failed with the given description.
    pub fn set_error(&self, description: impl Into<Cow<'static, str>>) {
        self.set_status(Status::error(description));
    }

    /// Makes this activity the current one until the guard is dropped.
    ///
    /// Entering an empty handle keeps the current context unchanged.
    #[must_use = "the activity is only current while the guard is alive"]
    pub fn enter(&self) -> ContextGuard {
        match &self.context {
            Some(cx) => cx.clone().attach(),
            None => Context::current().attach(),
        }
    }

    /// Ends the span now.
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        if let Some(cx) = self.context.take() {
            cx.span().end();
        }
    }
}

/// Owns the named span source for an initialised telemetry session.
///
/// Clones share the same source. After [`dispose`](Self::dispose) every call
/// fails with [`TelemetryError::ObjectDisposed`].
#[derive(Clone)]
pub struct ActivitySourceProvider {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    name: String,
    version: String,
    tracer: RwLock<Option<SdkTracer>>,
}

impl ActivitySourceProvider {
    /// Creates a span source named `name` on the given provider.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        provider: &SdkTracerProvider,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        let scope = InstrumentationScope::builder(name.clone())
            .with_version(version.clone())
            .build();
        Self {
            inner: Arc::new(SourceInner {
                name,
                version,
                tracer: RwLock::new(Some(provider.tracer_with_scope(scope))),
            }),
        }
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Source version.
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Whether the source has been released.
    pub fn is_disposed(&self) -> bool {
        self.inner.tracer.read().is_none()
    }

    /// Starts an activity as a child of the current one.
    ///
    /// Returns an empty handle when the span is not sampled.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn start_activity(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
    ) -> Result<Activity> {
        self.start(name.into(), kind, Vec::new())
    }

    /// Starts an activity for a host command, named `Command: {command}`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn start_command_activity(&self, command_name: &str) -> Result<Activity> {
        self.start(
            format!("Command: {command_name}").into(),
            SpanKind::Internal,
            vec![KeyValue::new(keys::COMMAND_NAME, command_name.to_string())],
        )
    }

    /// Starts an activity for a tool window operation, named
    /// `ToolWindow: {window}.{operation}`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn start_tool_window_activity(&self, window_name: &str, operation: &str) -> Result<Activity> {
        self.start(
            format!("ToolWindow: {window_name}.{operation}").into(),
            SpanKind::Internal,
            vec![
                KeyValue::new(keys::TOOL_WINDOW_NAME, window_name.to_string()),
                KeyValue::new(keys::TOOL_WINDOW_OPERATION, operation.to_string()),
            ],
        )
    }

    /// Starts an activity for a document operation, named
    /// `Document: {operation}`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn start_document_activity(&self, document_path: &str, operation: &str) -> Result<Activity> {
        self.start(
            format!("Document: {operation}").into(),
            SpanKind::Internal,
            vec![
                KeyValue::new(keys::DOCUMENT_PATH, document_path.to_string()),
                KeyValue::new(keys::DOCUMENT_OPERATION, operation.to_string()),
            ],
        )
    }

    /// Releases the span source. Idempotent.
    pub fn dispose(&self) {
        self.inner.tracer.write().take();
    }

    fn start(
        &self,
        name: Cow<'static, str>,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
    ) -> Result<Activity> {
        let guard = self.inner.tracer.read();
        let tracer = guard
            .as_ref()
            .ok_or(TelemetryError::ObjectDisposed("activity source"))?;

        let span = tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start(tracer);

        Ok(Activity::from_span(span))
    }
}

impl std::fmt::Debug for ActivitySourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivitySourceProvider")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
