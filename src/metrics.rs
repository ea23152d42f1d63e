//! Metrics seam.
//!
//! The middlewares never talk to a meter directly. They report through a
//! [`MetricsSink`], which is handed in via [`Config`](crate::config::Config).
//! [`OtelMetrics`] is the sink backed by an OpenTelemetry [`Meter`].

use std::{
    collections::HashMap,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use pin_project::pin_project;

pub const HTTP_REQUESTS_TOTAL: &str = "http_server_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_server_request_duration_seconds";

pub const GRPC_SERVER_STARTED: &str = "grpc_server_started_total";
pub const GRPC_SERVER_HANDLED: &str = "grpc_server_handled_total";
pub const GRPC_SERVER_MSG_RECEIVED: &str = "grpc_server_msg_received_total";
pub const GRPC_SERVER_MSG_SENT: &str = "grpc_server_msg_sent_total";
pub const GRPC_SERVER_HANDLING: &str = "grpc_server_handling_seconds";

pub const GRPC_CLIENT_STARTED: &str = "grpc_client_started_total";
pub const GRPC_CLIENT_HANDLED: &str = "grpc_client_handled_total";
pub const GRPC_CLIENT_MSG_RECEIVED: &str = "grpc_client_msg_received_total";
pub const GRPC_CLIENT_MSG_SENT: &str = "grpc_client_msg_sent_total";
pub const GRPC_CLIENT_HANDLING: &str = "grpc_client_handling_seconds";

const COUNTERS: &[(&str, &str)] = &[
    (HTTP_REQUESTS_TOTAL, "Total number of HTTP requests handled"),
    (GRPC_SERVER_STARTED, "Total number of RPCs started on the server"),
    (GRPC_SERVER_HANDLED, "Total number of RPCs completed on the server"),
    (GRPC_SERVER_MSG_RECEIVED, "Total number of stream messages received by the server"),
    (GRPC_SERVER_MSG_SENT, "Total number of stream messages sent by the server"),
    (GRPC_CLIENT_STARTED, "Total number of RPCs started by the client"),
    (GRPC_CLIENT_HANDLED, "Total number of RPCs completed by the client"),
    (GRPC_CLIENT_MSG_RECEIVED, "Total number of stream messages received by the client"),
    (GRPC_CLIENT_MSG_SENT, "Total number of stream messages sent by the client"),
];

const HISTOGRAMS: &[(&str, &str)] = &[
    (HTTP_REQUEST_DURATION, "HTTP request latency in seconds"),
    (GRPC_SERVER_HANDLING, "RPC handling latency on the server in seconds"),
    (GRPC_CLIENT_HANDLING, "RPC latency observed by the client in seconds"),
];

/// Receives metric observations. Implementations must tolerate concurrent
/// calls from many in-flight requests.
pub trait MetricsSink: Send + Sync + 'static {
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]);

    fn observe(&self, name: &'static str, seconds: f64, attributes: &[KeyValue]);
}

/// [`MetricsSink`] backed by OpenTelemetry instruments.
///
/// All instruments are registered once on construction. Observations for
/// unknown names are dropped with a debug event.
pub struct OtelMetrics {
    counters: HashMap<&'static str, Counter<u64>>,
    histograms: HashMap<&'static str, Histogram<f64>>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        let counters = COUNTERS
            .iter()
            .map(|(name, description)| {
                let counter = meter
                    .u64_counter(*name)
                    .with_description(*description)
                    .init();
                (*name, counter)
            })
            .collect();

        let histograms = HISTOGRAMS
            .iter()
            .map(|(name, description)| {
                let histogram = meter
                    .f64_histogram(*name)
                    .with_description(*description)
                    .init();
                (*name, histogram)
            })
            .collect();

        Self {
            counters,
            histograms,
        }
    }

    /// Uses the meter of the globally installed provider.
    pub fn global() -> Self {
        Self::new(&global::meter(env!("CARGO_PKG_NAME")))
    }
}

impl MetricsSink for OtelMetrics {
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]) {
        match self.counters.get(name) {
            Some(counter) => counter.add(value, attributes),
            None => tracing::debug!(name, "dropping observation for unknown counter"),
        }
    }

    fn observe(&self, name: &'static str, seconds: f64, attributes: &[KeyValue]) {
        match self.histograms.get(name) {
            Some(histogram) => histogram.record(seconds, attributes),
            None => tracing::debug!(name, "dropping observation for unknown histogram"),
        }
    }
}

/// Converts a latency into the unit used by every histogram.
pub(crate) fn seconds(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64()
}

/// Instruments and status values for one "handled" observation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HandledNames {
    pub(crate) counter: &'static str,
    pub(crate) histogram: &'static str,
    pub(crate) status_key: &'static str,
    /// Status recorded when the handler panics.
    pub(crate) on_panic: &'static str,
    /// Status recorded when the call is dropped before it completes.
    pub(crate) on_cancel: &'static str,
}

/// A single in-flight call. Records exactly one handled observation: either
/// through [`Handled::finish`] or, if the call never completes, on drop.
pub struct Handled {
    metrics: Arc<dyn MetricsSink>,
    names: HandledNames,
    labels: Vec<KeyValue>,
    histogram: bool,
    start: Instant,
    finished: bool,
}

impl Handled {
    pub(crate) fn start(
        metrics: Arc<dyn MetricsSink>,
        names: HandledNames,
        labels: Vec<KeyValue>,
        histogram: bool,
    ) -> Self {
        Self {
            metrics,
            names,
            labels,
            histogram,
            start: Instant::now(),
            finished: false,
        }
    }

    pub(crate) fn finish(&mut self, status: String) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }

        let mut labels = std::mem::take(&mut self.labels);
        labels.push(KeyValue::new(self.names.status_key, status));

        self.metrics.add(self.names.counter, 1, &labels);
        if self.histogram {
            self.metrics.observe(self.names.histogram, seconds(self.start.elapsed()), &labels);
        }
    }
}

impl Drop for Handled {
    fn drop(&mut self) {
        self.finish(self.names.on_cancel.to_owned());
    }
}

/// Future that records a [`Handled`] observation once the inner future has
/// produced its final result.
///
/// A panic while polling the inner future is recorded with the panic status
/// and then resumed, so it keeps travelling to whatever fault boundary sits
/// above.
#[pin_project]
pub struct ObservedFuture<F: Future> {
    #[pin]
    inner: F,
    handled: Handled,
    classify: fn(&F::Output) -> String,
}

impl<F: Future> ObservedFuture<F> {
    pub(crate) fn new(inner: F, handled: Handled, classify: fn(&F::Output) -> String) -> Self {
        Self {
            inner,
            handled,
            classify,
        }
    }
}

impl<F: Future> Future for ObservedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut inner = this.inner;

        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                this.handled.finish((this.classify)(&output));
                Poll::Ready(output)
            }
            Err(payload) => {
                this.handled.finish(this.handled.names.on_panic.to_owned());
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Appends the configured constant labels to the per-call ones.
pub(crate) fn with_const_labels(
    mut labels: Vec<KeyValue>,
    constant: &[KeyValue],
) -> Vec<KeyValue> {
    labels.extend_from_slice(constant);
    labels
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::noop::NoopMeterProvider;
    use opentelemetry::metrics::MeterProvider;

    use super::*;

    #[test]
    fn every_instrument_is_registered() {
        let meter = NoopMeterProvider::new().meter("test");
        let metrics = OtelMetrics::new(&meter);

        assert_eq!(metrics.counters.len(), COUNTERS.len());
        assert_eq!(metrics.histograms.len(), HISTOGRAMS.len());

        metrics.add(GRPC_SERVER_HANDLED, 1, &[KeyValue::new("grpc_code", "OK")]);
        metrics.observe(HTTP_REQUEST_DURATION, 0.25, &[]);
        metrics.add("unknown", 1, &[]);
    }

    #[test]
    fn const_labels_are_appended() {
        let labels = with_const_labels(
            vec![KeyValue::new("grpc_method", "SayHello")],
            &[KeyValue::new("yyy", "server")],
        );

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].key.as_str(), "yyy");
    }

    #[derive(Default)]
    struct Counting {
        added: std::sync::Mutex<Vec<(String, String)>>,
        observed: std::sync::atomic::AtomicUsize,
    }

    impl MetricsSink for Counting {
        fn add(&self, name: &'static str, _value: u64, attributes: &[KeyValue]) {
            let status = attributes
                .last()
                .map(|kv| kv.value.to_string())
                .unwrap_or_default();
            self.added.lock().unwrap().push((name.to_owned(), status));
        }

        fn observe(&self, _name: &'static str, _seconds: f64, _attributes: &[KeyValue]) {
            self.observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    const NAMES: HandledNames = HandledNames {
        counter: HTTP_REQUESTS_TOTAL,
        histogram: HTTP_REQUEST_DURATION,
        status_key: "http.status_code",
        on_panic: "500",
        on_cancel: "499",
    };

    #[test]
    fn handled_records_once() {
        let sink = Arc::new(Counting::default());
        let mut handled = Handled::start(sink.clone(), NAMES, Vec::new(), true);
        handled.finish("200".to_owned());
        drop(handled);

        assert_eq!(
            *sink.added.lock().unwrap(),
            vec![(HTTP_REQUESTS_TOTAL.to_owned(), "200".to_owned())]
        );
        assert_eq!(sink.observed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_call_is_recorded_as_cancelled() {
        let sink = Arc::new(Counting::default());
        drop(Handled::start(sink.clone(), NAMES, Vec::new(), false));

        assert_eq!(sink.added.lock().unwrap()[0].1, "499");
        assert_eq!(sink.observed.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_is_recorded_and_resumed() {
        let sink = Arc::new(Counting::default());
        let handled = Handled::start(sink.clone(), NAMES, Vec::new(), false);
        let future = ObservedFuture::new(
            async { panic!("handler exploded") },
            handled,
            |_: &()| "200".to_owned(),
        );

        let result = crate::recovery::catch_panic(future).await;

        assert!(result.is_err());
        assert_eq!(sink.added.lock().unwrap()[0].1, "500");
    }
}
