//! Request scoped logger handle.
//!
//! A [`Logger`] bundles the [`Dispatch`] that receives spans and events with
//! an optional trace id that gets stamped on every record it writes. It is
//! attached to a request through [`LoggerExt::with_logger`] and read back
//! anywhere downstream with [`LoggerExt::logger`]. Attaching consumes the
//! request, so a parent scope can never observe the change.

use opentelemetry::trace::TraceContextExt;
use tracing::{dispatcher, Dispatch, Level, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
    trace_id: Option<String>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::current()
    }
}

impl Logger {
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            trace_id: None,
        }
    }

    /// Captures the dispatcher which is currently the default for this
    /// thread. Falls back to the global one, or a no-op if none is set.
    pub fn current() -> Self {
        Self::new(dispatcher::get_default(Dispatch::clone))
    }

    /// Runs `f` with this logger's dispatcher as the default one.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Derives a logger carrying the trace id of the current span, if that
    /// span belongs to a valid OpenTelemetry trace.
    pub fn with_trace_fields(&self) -> Self {
        let trace_id = self.in_scope(|| {
            let context = Span::current().context();
            let span = context.span();
            let span_context = span.span_context();

            span_context
                .is_valid()
                .then(|| span_context.trace_id().to_string())
        });

        Self {
            dispatch: self.dispatch.clone(),
            trace_id: trace_id.or_else(|| self.trace_id.clone()),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn is_debug(&self) -> bool {
        self.in_scope(|| tracing::enabled!(Level::DEBUG))
    }
}

/// Attaches and reads a [`Logger`] on a request-like value.
pub trait LoggerExt: Sized {
    /// Returns `self` carrying `logger`. Any logger attached earlier is
    /// shadowed.
    fn with_logger(self, logger: Logger) -> Self;

    /// Returns the nearest attached logger, or [`Logger::current`] when
    /// nothing was ever attached.
    fn logger(&self) -> Logger;
}

impl<B> LoggerExt for http::Request<B> {
    fn with_logger(mut self, logger: Logger) -> Self {
        self.extensions_mut().insert(logger);
        self
    }

    fn logger(&self) -> Logger {
        self.extensions()
            .get::<Logger>()
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(feature = "rpc")]
impl<T> LoggerExt for tonic::Request<T> {
    fn with_logger(mut self, logger: Logger) -> Self {
        self.extensions_mut().insert(logger);
        self
    }

    fn logger(&self) -> Logger {
        self.extensions()
            .get::<Logger>()
            .cloned()
            .unwrap_or_default()
    }
}
