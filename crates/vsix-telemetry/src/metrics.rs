//! Metrics provider and instrument registry.
//!
//! Instruments are cached by name. Asking for the same name, kind and numeric
//! type again returns the same `Arc` handle. Asking for an existing name with
//! a different kind or numeric type fails with
//! [`TelemetryError::InstrumentConflict`] and leaves the registry unchanged.

use crate::error::{Result, TelemetryError};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _, UpDownCounter};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the command execution counter.
pub const COMMAND_EXECUTIONS: &str = "vsix.commands.executed";

/// Name of the operation duration histogram.
pub const OPERATION_DURATION: &str = "vsix.operation.duration";

/// Name of the error counter.
pub const ERRORS: &str = "vsix.errors";

/// Attribute keys used by the convenience recorders.
pub mod keys {
    /// Command name.
    pub const COMMAND_NAME: &str = "vsix.command.name";
    /// Operation name.
    pub const OPERATION_NAME: &str = "vsix.operation.name";
    /// Error type.
    pub const ERROR_TYPE: &str = "error.type";
}

/// A registry entry. Public only so the sealed value traits can name it.
#[doc(hidden)]
#[derive(Clone)]
pub enum RegisteredInstrument {
    U64Counter(Arc<Counter<u64>>),
    F64Counter(Arc<Counter<f64>>),
    U64Histogram(Arc<Histogram<u64>>),
    F64Histogram(Arc<Histogram<f64>>),
    I64UpDownCounter(Arc<UpDownCounter<i64>>),
    F64UpDownCounter(Arc<UpDownCounter<f64>>),
}

impl RegisteredInstrument {
    fn kind(&self) -> &'static str {
        match self {
            RegisteredInstrument::U64Counter(_) => <u64 as CounterValue>::KIND,
            RegisteredInstrument::F64Counter(_) => <f64 as CounterValue>::KIND,
            RegisteredInstrument::U64Histogram(_) => <u64 as HistogramValue>::KIND,
            RegisteredInstrument::F64Histogram(_) => <f64 as HistogramValue>::KIND,
            RegisteredInstrument::I64UpDownCounter(_) => <i64 as UpDownCounterValue>::KIND,
            RegisteredInstrument::F64UpDownCounter(_) => <f64 as UpDownCounterValue>::KIND,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u64 {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
}

macro_rules! instrument_value {
    (
        $(#[$meta:meta])*
        $trait_name:ident, $instrument:ident: $($ty:ty => $method:ident, $variant:ident, $kind:literal);+ $(;)?
    ) => {
        $(#[$meta])*
        pub trait $trait_name: sealed::Sealed + Sized + 'static {
            #[doc(hidden)]
            const KIND: &'static str;
            #[doc(hidden)]
            fn build(
                meter: &Meter,
                name: &str,
                unit: Option<&str>,
                description: Option<&str>,
            ) -> $instrument<Self>;
            #[doc(hidden)]
            fn wrap(instrument: Arc<$instrument<Self>>) -> RegisteredInstrument;
            #[doc(hidden)]
            fn unwrap(instrument: &RegisteredInstrument) -> Option<Arc<$instrument<Self>>>;
        }

        $(
            impl $trait_name for $ty {
                const KIND: &'static str = $kind;

                fn build(
                    meter: &Meter,
                    name: &str,
                    unit: Option<&str>,
                    description: Option<&str>,
                ) -> $instrument<Self> {
                    let mut builder = meter.$method(name.to_string());
                    if let Some(unit) = unit {
                        builder = builder.with_unit(unit.to_string());
                    }
                    if let Some(description) = description {
                        builder = builder.with_description(description.to_string());
                    }
                    builder.build()
                }

                fn wrap(instrument: Arc<$instrument<Self>>) -> RegisteredInstrument {
                    RegisteredInstrument::$variant(instrument)
                }

                fn unwrap(instrument: &RegisteredInstrument) -> Option<Arc<$instrument<Self>>> {
                    match instrument {
                        RegisteredInstrument::$variant(instrument) => Some(Arc::clone(instrument)),
                        _ => None,
                    }
                }
            }
        )+
    };
}

instrument_value! {
    /// Numeric types a [`Counter`] can be created for.
    CounterValue, Counter:
    u64 => u64_counter, U64Counter, "counter<u64>";
    f64 => f64_counter, F64Counter, "counter<f64>";
}

instrument_value! {
    /// Numeric types a [`Histogram`] can be created for.
    HistogramValue, Histogram:
    u64 => u64_histogram, U64Histogram, "histogram<u64>";
    f64 => f64_histogram, F64Histogram, "histogram<f64>";
}

instrument_value! {
    /// Numeric types an [`UpDownCounter`] can be created for.
    UpDownCounterValue, UpDownCounter:
    i64 => i64_up_down_counter, I64UpDownCounter, "up_down_counter<i64>";
    f64 => f64_up_down_counter, F64UpDownCounter, "up_down_counter<f64>";
}

/// Owns the named instrument registry for an initialised telemetry session.
///
/// Clones share the same registry. All registry access is serialised under
/// one lock. After [`dispose`](Self::dispose) every call fails with
/// [`TelemetryError::ObjectDisposed`].
#[derive(Clone)]
pub struct MetricsProvider {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    name: String,
    meter: Meter,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    instruments: HashMap<String, RegisteredInstrument>,
    disposed: bool,
}

impl MetricsProvider {
    /// Creates a registry whose instruments belong to a meter named `name`.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        provider: &SdkMeterProvider,
    ) -> Self {
        let name = name.into();
        let scope = InstrumentationScope::builder(name.clone())
            .with_version(version.into())
            .build();
        Self {
            inner: Arc::new(MetricsInner {
                name,
                meter: provider.meter_with_scope(scope),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Meter name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The underlying meter, for instruments the registry does not cover.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn meter(&self) -> Result<Meter> {
        if self.inner.registry.lock().disposed {
            return Err(TelemetryError::ObjectDisposed("metrics provider"));
        }
        Ok(self.inner.meter.clone())
    }

    /// Number of registered instruments.
    pub fn instrument_count(&self) -> usize {
        self.inner.registry.lock().instruments.len()
    }

    /// Returns the counter registered under `name`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InstrumentConflict`] if `name` is registered
    /// with another kind or numeric type, or
    /// [`TelemetryError::ObjectDisposed`] after disposal.
    pub fn get_or_create_counter<T: CounterValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Result<Arc<Counter<T>>> {
        let build = |meter: &Meter| T::build(meter, name, unit, description);
        self.get_or_create(name, T::KIND, T::unwrap, build, T::wrap)
    }

    /// Returns the histogram registered under `name`, creating it on first use.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn get_or_create_histogram<T: HistogramValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Result<Arc<Histogram<T>>> {
        let build = |meter: &Meter| T::build(meter, name, unit, description);
        self.get_or_create(name, T::KIND, T::unwrap, build, T::wrap)
    }

    /// Returns the up-down counter registered under `name`, creating it on
    /// first use.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn get_or_create_up_down_counter<T: UpDownCounterValue>(
        &self,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Result<Arc<UpDownCounter<T>>> {
        let build = |meter: &Meter| T::build(meter, name, unit, description);
        self.get_or_create(name, T::KIND, T::unwrap, build, T::wrap)
    }

    /// Counter of executed host commands.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn command_execution_counter(&self) -> Result<Arc<Counter<u64>>> {
        self.get_or_create_counter(
            COMMAND_EXECUTIONS,
            Some("{command}"),
            Some("Number of commands executed"),
        )
    }

    /// Histogram of operation durations in milliseconds.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn operation_duration_histogram(&self) -> Result<Arc<Histogram<f64>>> {
        self.get_or_create_histogram(
            OPERATION_DURATION,
            Some("ms"),
            Some("Duration of extension operations"),
        )
    }

    /// Counter of errors raised by the extension.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn error_counter(&self) -> Result<Arc<Counter<u64>>> {
        self.get_or_create_counter(ERRORS, Some("{error}"), Some("Number of errors"))
    }

    /// Counts one execution of `command_name`.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn record_command_execution(&self, command_name: &str) -> Result<()> {
        self.command_execution_counter()?
            .add(1, &[KeyValue::new(keys::COMMAND_NAME, command_name.to_string())]);
        Ok(())
    }

    /// Records how long `operation` took, in milliseconds.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn record_operation_duration(&self, operation: &str, duration_ms: f64) -> Result<()> {
        self.operation_duration_histogram()?.record(
            duration_ms,
            &[KeyValue::new(keys::OPERATION_NAME, operation.to_string())],
        );
        Ok(())
    }

    /// Counts one error of `error_type`.
    ///
    /// # Errors
    ///
    /// See [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn record_error(&self, error_type: &str) -> Result<()> {
        self.error_counter()?
            .add(1, &[KeyValue::new(keys::ERROR_TYPE, error_type.to_string())]);
        Ok(())
    }

    /// Clears the registry. Later calls fail. Idempotent.
    pub fn dispose(&self) {
        let mut registry = self.inner.registry.lock();
        registry.instruments.clear();
        registry.disposed = true;
    }

    fn get_or_create<I>(
        &self,
        name: &str,
        requested: &'static str,
        unwrap: fn(&RegisteredInstrument) -> Option<Arc<I>>,
        build: impl FnOnce(&Meter) -> I,
        wrap: fn(Arc<I>) -> RegisteredInstrument,
    ) -> Result<Arc<I>> {
        let mut registry = self.inner.registry.lock();
        if registry.disposed {
            return Err(TelemetryError::ObjectDisposed("metrics provider"));
        }

        if let Some(existing) = registry.instruments.get(name) {
            return unwrap(existing).ok_or_else(|| TelemetryError::InstrumentConflict {
                name: name.to_string(),
                registered: existing.kind(),
                requested,
            });
        }

        let instrument = Arc::new(build(&self.inner.meter));
        registry
            .instruments
            .insert(name.to_string(), wrap(Arc::clone(&instrument)));
        Ok(instrument)
    }
}

impl std::fmt::Debug for MetricsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsProvider")
            .field("name", &self.inner.name)
            .field("instruments", &self.instrument_count())
            .finish()
    }
}
