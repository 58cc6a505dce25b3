//! Exception tracking and the global panic hook.
//!
//! A [`TrackedException`] is the crate's portable view of a failure: an
//! error value, a panic, or something built by hand. The [`ExceptionTracker`]
//! turns it into an attribute set, records it on the ambient span and emits
//! it to the logging sink.

use crate::activity::Activity;
use crate::config::{ExceptionConfig, ExceptionFilter};
use crate::error::{Result, TelemetryError};
use crate::logger::TelemetryLogger;
use crate::resource::{self, HostEnvironment};
use opentelemetry::logs::Severity;
use opentelemetry::trace::{Status, TraceContextExt as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute as semconv;
use parking_lot::Mutex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Name of the span event and log event carrying an exception.
pub const EXCEPTION_EVENT: &str = "exception";

/// Attribute keys of the exception attribute set.
pub mod keys {
    use super::semconv;

    /// Exception type name.
    pub const TYPE: &str = semconv::EXCEPTION_TYPE;
    /// Exception message.
    pub const MESSAGE: &str = semconv::EXCEPTION_MESSAGE;
    /// Stack trace text.
    pub const STACKTRACE: &str = semconv::EXCEPTION_STACKTRACE;
    /// Type name of the inner (source) error.
    pub const INNER_TYPE: &str = "exception.inner.type";
    /// Message of the inner (source) error.
    pub const INNER_MESSAGE: &str = "exception.inner.message";
    /// Prefix of per-exception metadata entries.
    pub const DATA_PREFIX: &str = "exception.data.";
    /// Whether the exception escaped the span's scope.
    pub const ESCAPED: &str = "exception.escaped";
    /// Set on exceptions reported by the global hook.
    pub const UNHANDLED: &str = "exception.unhandled";
    /// Whether the process is going down with the exception.
    pub const IS_TERMINATING: &str = "exception.is_terminating";
    /// Whether host context could be collected.
    pub const CONTEXT_AVAILABLE: &str = "vsix.context_available";
}

/// A failure to be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedException {
    type_name: String,
    message: String,
    stack_trace: Option<String>,
    inner: Option<InnerException>,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InnerException {
    type_name: String,
    message: String,
}

impl TrackedException {
    /// Creates an exception from a type name and message.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
            inner: None,
            data: BTreeMap::new(),
        }
    }

    /// Creates an exception from a typed error. The inner exception is the
    /// error's `source()`.
    pub fn from_error<E: Error + 'static>(error: &E) -> Self {
        let mut exception = Self::new(std::any::type_name::<E>(), error.to_string());
        exception.inner = error.source().map(InnerException::from_error);
        exception
    }

    /// Creates an exception from a type-erased error.
    ///
    /// The concrete type is not known here, so the type name is read from the
    /// error's `Debug` output.
    pub fn from_dyn_error(error: &(dyn Error + 'static)) -> Self {
        let mut exception = Self::new(debug_type_name(error), error.to_string());
        exception.inner = error.source().map(InnerException::from_error);
        exception
    }

    /// Creates an exception from a panic, with the panic location as
    /// metadata and a backtrace when one can be captured.
    pub fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());

        let mut exception = Self::new("panic", message);
        if let Some(location) = info.location() {
            exception = exception.with_data("location", location.to_string());
        }
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            exception.stack_trace = Some(backtrace.to_string());
        }
        exception
    }

    /// Adds a metadata entry, reported as `exception.data.<key>`.
    pub fn with_data(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }

    /// Sets the stack trace text.
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Exception type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Exception message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace text, if any.
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Type name of the inner exception.
    pub fn inner_type_name(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.type_name.as_str())
    }

    /// Message of the inner exception.
    pub fn inner_message(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.message.as_str())
    }

    /// Metadata entries.
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }
}

impl InnerException {
    fn from_error(error: &(dyn Error + 'static)) -> Self {
        Self {
            type_name: debug_type_name(error),
            message: error.to_string(),
        }
    }
}

fn debug_type_name(error: &(dyn Error + 'static)) -> String {
    let debug = format!("{error:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.starts_with(char::is_uppercase) {
        name
    } else {
        "Error".to_string()
    }
}

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static;

/// The process-wide panic hook is installed once, on the first registration,
/// and reports to every registered tracker before running the hook it
/// replaced. It is restored when the last tracker unregisters.
struct PanicDispatch {
    previous: Option<Arc<PanicHook>>,
    trackers: Vec<(u64, Weak<TrackerInner>)>,
}

static PANIC_DISPATCH: Mutex<PanicDispatch> = Mutex::new(PanicDispatch {
    previous: None,
    trackers: Vec::new(),
});

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(0);

/// Records exceptions on spans and in the logging sink.
///
/// Clones share state. The global panic hook holds only weak references, so
/// dropping the last clone also unregisters the tracker.
#[derive(Clone)]
pub struct ExceptionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    filter: Option<ExceptionFilter>,
    include_host_context: bool,
    host: Option<Arc<dyn HostEnvironment>>,
    logger: TelemetryLogger,
    disposed: AtomicBool,
    id: u64,
}

impl ExceptionTracker {
    /// Creates a tracker that emits through `logger`.
    pub fn new(
        config: &ExceptionConfig,
        logger: TelemetryLogger,
        host: Option<Arc<dyn HostEnvironment>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                filter: config.filter.clone(),
                include_host_context: config.include_host_context,
                host,
                logger,
                disposed: AtomicBool::new(false),
                id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Records `exception` on the current span and logs it at error level.
    ///
    /// `None` and exceptions rejected by the filter are ignored. `extra`
    /// entries are merged last and overwrite built-in keys.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn track_exception(
        &self,
        exception: Option<&TrackedException>,
        extra: &[KeyValue],
    ) -> Result<()> {
        let Some(exception) = exception else {
            return Ok(());
        };
        self.ensure_live()?;
        if !self.allows(exception) {
            return Ok(());
        }

        let attributes = self.exception_attributes(exception, extra);

        let cx = Context::current();
        let span = cx.span();
        if span.is_recording() {
            span.add_event(EXCEPTION_EVENT, attributes.clone());
            span.set_status(Status::error(exception.message.clone()));
        }

        self.inner.logger.log_event(
            Severity::Error,
            EXCEPTION_EVENT,
            &format!("{}: {}", exception.type_name, exception.message),
            &attributes,
        );
        Ok(())
    }

    /// Tracks a typed error.
    ///
    /// # Errors
    ///
    /// See [`track_exception`](Self::track_exception).
    pub fn track_error<E: Error + 'static>(&self, error: &E, extra: &[KeyValue]) -> Result<()> {
        self.track_exception(Some(&TrackedException::from_error(error)), extra)
    }

    /// Records `exception` directly on `activity` and marks it failed.
    ///
    /// No-op if either argument is `None` or the filter rejects the exception.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn record_exception_on_activity(
        &self,
        activity: Option<&Activity>,
        exception: Option<&TrackedException>,
        escaped: bool,
    ) -> Result<()> {
        let (Some(activity), Some(exception)) = (activity, exception) else {
            return Ok(());
        };
        self.ensure_live()?;
        if !self.allows(exception) {
            return Ok(());
        }

        activity.add_event(
            EXCEPTION_EVENT,
            vec![
                KeyValue::new(keys::TYPE, exception.type_name.clone()),
                KeyValue::new(keys::MESSAGE, exception.message.clone()),
                KeyValue::new(
                    keys::STACKTRACE,
                    exception.stack_trace.clone().unwrap_or_default(),
                ),
                KeyValue::new(keys::ESCAPED, escaped),
            ],
        );
        activity.set_error(exception.message.clone());
        Ok(())
    }

    /// Routes panics to this tracker. The hook that was installed before
    /// the first tracker registered still runs after the trackers. Registering
    /// twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn register_global_exception_handler(&self) -> Result<()> {
        self.ensure_live()?;
        let mut dispatch = PANIC_DISPATCH.lock();
        if dispatch.trackers.iter().any(|(id, _)| *id == self.inner.id) {
            return Ok(());
        }

        if dispatch.previous.is_none() {
            // The hook cannot be swapped while unwinding.
            if std::thread::panicking() {
                return Ok(());
            }
            dispatch.previous = Some(Arc::from(panic::take_hook()));
            panic::set_hook(Box::new(dispatch_panic));
        }
        dispatch
            .trackers
            .push((self.inner.id, Arc::downgrade(&self.inner)));
        let registered = dispatch.trackers.len();
        drop(dispatch);

        tracing::debug!(
            target: "vsix_telemetry",
            trackers = registered,
            "registered global exception handler"
        );
        Ok(())
    }

    /// Stops routing panics to this tracker. Other registered trackers are
    /// unaffected; the last one to leave restores the previous hook. No-op if
    /// not registered.
    pub fn unregister_global_exception_handler(&self) {
        self.inner.unregister_hook();
    }

    /// Whether panics are routed to this tracker.
    pub fn is_global_handler_registered(&self) -> bool {
        PANIC_DISPATCH
            .lock()
            .trackers
            .iter()
            .any(|(id, _)| *id == self.inner.id)
    }

    /// Unregisters the hook and rejects later calls. Idempotent.
    pub fn dispose(&self) {
        self.inner.unregister_hook();
        self.inner.disposed.store(true, Ordering::Release);
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(TelemetryError::ObjectDisposed("exception tracker"));
        }
        Ok(())
    }

    fn allows(&self, exception: &TrackedException) -> bool {
        self.inner
            .filter
            .as_ref()
            .is_none_or(|filter| filter.allows(exception))
    }

    fn exception_attributes(&self, exception: &TrackedException, extra: &[KeyValue]) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(keys::TYPE, exception.type_name.clone()),
            KeyValue::new(keys::MESSAGE, exception.message.clone()),
            KeyValue::new(
                keys::STACKTRACE,
                exception.stack_trace.clone().unwrap_or_default(),
            ),
        ];

        if let Some(inner) = &exception.inner {
            attributes.push(KeyValue::new(keys::INNER_TYPE, inner.type_name.clone()));
            attributes.push(KeyValue::new(keys::INNER_MESSAGE, inner.message.clone()));
        }

        for (key, value) in &exception.data {
            attributes.push(KeyValue::new(
                format!("{}{key}", keys::DATA_PREFIX),
                value.clone(),
            ));
        }

        if self.inner.include_host_context {
            attributes.extend(self.host_context());
        }

        for attribute in extra {
            resource::upsert(&mut attributes, attribute.clone());
        }
        attributes
    }

    /// Host lookups may call back into the host application, which is not
    /// safe while unwinding. Any failure degrades to the marker.
    fn host_context(&self) -> Vec<KeyValue> {
        let unavailable = || vec![KeyValue::new(keys::CONTEXT_AVAILABLE, false)];

        let Some(host) = &self.inner.host else {
            return unavailable();
        };
        if std::thread::panicking() {
            return unavailable();
        }

        match panic::catch_unwind(AssertUnwindSafe(|| (host.host_version(), host.host_edition()))) {
            Ok((version, edition)) => {
                let mut context = Vec::with_capacity(3);
                if let Some(version) = version {
                    context.push(KeyValue::new(resource::keys::HOST_VERSION, version));
                }
                if let Some(edition) = edition {
                    context.push(KeyValue::new(resource::keys::HOST_EDITION, edition));
                }
                context.push(KeyValue::new(keys::CONTEXT_AVAILABLE, true));
                context
            }
            Err(_) => unavailable(),
        }
    }
}

impl TrackerInner {
    fn unregister_hook(&self) {
        let mut dispatch = PANIC_DISPATCH.lock();
        if !dispatch.trackers.iter().any(|(id, _)| *id == self.id) {
            return;
        }
        dispatch
            .trackers
            .retain(|(id, tracker)| *id != self.id && tracker.strong_count() > 0);

        // While unwinding the dispatcher stays installed; with no trackers it
        // only forwards to the previous hook.
        if dispatch.trackers.is_empty() && !std::thread::panicking() {
            if let Some(previous) = dispatch.previous.take() {
                drop(panic::take_hook());
                panic::set_hook(Box::new(move |info| previous(info)));
            }
        }
        drop(dispatch);

        tracing::debug!(target: "vsix_telemetry", "unregistered global exception handler");
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        self.unregister_hook();
    }
}

impl std::fmt::Debug for ExceptionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionTracker")
            .field("include_host_context", &self.inner.include_host_context)
            .field("has_filter", &self.inner.filter.is_some())
            .field("hook_registered", &self.is_global_handler_registered())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn dispatch_panic(info: &PanicHookInfo<'_>) {
    let (trackers, previous) = {
        let dispatch = PANIC_DISPATCH.lock();
        let trackers: Vec<_> = dispatch
            .trackers
            .iter()
            .map(|(_, tracker)| Weak::clone(tracker))
            .collect();
        (trackers, dispatch.previous.clone())
    };

    for tracker in &trackers {
        report_panic(tracker, info);
    }
    if let Some(previous) = previous {
        previous(info);
    }
}

fn report_panic(tracker: &Weak<TrackerInner>, info: &PanicHookInfo<'_>) {
    let Some(inner) = tracker.upgrade() else {
        return;
    };
    let tracker = ExceptionTracker { inner };
    let exception = TrackedException::from_panic(info);
    let _ = tracker.track_exception(
        Some(&exception),
        &[
            KeyValue::new(keys::UNHANDLED, true),
            KeyValue::new(keys::IS_TERMINATING, is_terminating()),
        ],
    );
}

/// A panic ends the process when it aborts or unwinds out of the main thread.
fn is_terminating() -> bool {
    cfg!(panic = "abort") || std::thread::current().name() == Some("main")
}
