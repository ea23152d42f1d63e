use std::{fmt, sync::Arc};

use opentelemetry::KeyValue;

use crate::{
    context::Logger,
    metrics::{MetricsSink, OtelMetrics},
};

/// Decides which requests are too noisy to deserve a span.
///
/// The predicate receives the request method and path. For RPC calls the
/// method is always `POST` and the path is the full method name, e.g.
/// `/grpc.health.v1.Health/Check`.
#[derive(Clone)]
pub struct NoiseFilter(Arc<dyn Fn(&str, &str) -> bool + Send + Sync>);

impl NoiseFilter {
    pub fn new(predicate: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Never filters anything.
    pub fn none() -> Self {
        Self::new(|_, _| false)
    }

    pub fn is_noise(&self, method: &str, path: &str) -> bool {
        (self.0)(method, path)
    }
}

/// Skips `GET /health*`.
impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new(|method, path| {
            method == http::Method::GET.as_str() && path.starts_with("/health")
        })
    }
}

impl fmt::Debug for NoiseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoiseFilter")
    }
}

/// Options shared by every middleware of a chain.
///
/// A chain holds the config behind an [`Arc`] and never changes it after
/// construction.
///
/// ```ignore
/// let config = Config::new()
///     .with_request_body()
///     .with_handled_histogram(true)
///     .with_const_labels([KeyValue::new("yyy", "server")]);
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) logger: Logger,
    pub(crate) noise_filter: NoiseFilter,
    pub(crate) capture_request_body: bool,
    pub(crate) capture_response_body: bool,
    pub(crate) body_capture_limit: Option<usize>,
    pub(crate) const_labels: Vec<KeyValue>,
    pub(crate) handled_histogram: bool,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logger: Logger::current(),
            noise_filter: NoiseFilter::default(),
            capture_request_body: false,
            capture_response_body: false,
            body_capture_limit: None,
            const_labels: Vec::new(),
            handled_histogram: false,
            metrics: Arc::new(OtelMetrics::global()),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_noise_filter(mut self, filter: NoiseFilter) -> Self {
        self.noise_filter = filter;
        self
    }

    /// Copies the request body into the `request` log field.
    pub fn with_request_body(mut self) -> Self {
        self.capture_request_body = true;
        self
    }

    /// Copies the response body into the `response` log field.
    pub fn with_response_body(mut self) -> Self {
        self.capture_response_body = true;
        self
    }

    /// Caps how many bytes of each captured body end up in the log record.
    /// The bytes delivered to the caller are never truncated.
    ///
    /// Without a cap the diagnostic copy grows with the body.
    pub fn with_body_capture_limit(mut self, limit: usize) -> Self {
        self.body_capture_limit = Some(limit);
        self
    }

    pub fn with_const_labels(mut self, labels: impl IntoIterator<Item = KeyValue>) -> Self {
        self.const_labels.extend(labels);
        self
    }

    /// Records a latency histogram in addition to the handled counter.
    pub fn with_handled_histogram(mut self, enabled: bool) -> Self {
        self.handled_histogram = enabled;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("logger", &self.logger)
            .field("noise_filter", &self.noise_filter)
            .field("capture_request_body", &self.capture_request_body)
            .field("capture_response_body", &self.capture_response_body)
            .field("body_capture_limit", &self.body_capture_limit)
            .field("const_labels", &self.const_labels)
            .field("handled_histogram", &self.handled_histogram)
            .finish_non_exhaustive()
    }
}
