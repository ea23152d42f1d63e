use std::{
    sync::Arc,
    task::{Context, Poll},
};

use axum::extract::MatchedPath;
use http::{Request, Response};
use opentelemetry::KeyValue;
use tower::Service;
use tower_layer::Layer;

use crate::{
    config::Config,
    metrics::{self, Handled, HandledNames, ObservedFuture},
};

/// Route label used when the router did not match a route pattern.
pub const NO_PATH: &str = "<no-path>";

const NAMES: HandledNames = HandledNames {
    counter: metrics::HTTP_REQUESTS_TOTAL,
    histogram: metrics::HTTP_REQUEST_DURATION,
    status_key: "http.status_code",
    on_panic: "500",
    on_cancel: "499",
};

/// Records one request counter increment, and optionally one latency
/// observation, per request.
///
/// The route label is the matched route pattern rather than the raw path,
/// which keeps cardinality low.
#[derive(Clone, Debug)]
pub struct MetricsLayer {
    config: Arc<Config>,
}

impl MetricsLayer {
    pub fn new(config: Config) -> Self {
        Self::from_shared(Arc::new(config))
    }

    pub fn from_shared(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ObservedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or(NO_PATH, MatchedPath::as_str)
            .to_owned();

        let labels = metrics::with_const_labels(
            vec![
                KeyValue::new("http.method", request.method().to_string()),
                KeyValue::new("http.route", route),
            ],
            &self.config.const_labels,
        );

        let handled = Handled::start(
            self.config.metrics.clone(),
            NAMES,
            labels,
            self.config.handled_histogram,
        );

        ObservedFuture::new(self.inner.call(request), handled, classify)
    }
}

fn classify<B, E>(result: &Result<Response<B>, E>) -> String {
    match result {
        Ok(response) => response.status().as_str().to_owned(),
        Err(_) => NAMES.on_panic.to_owned(),
    }
}
