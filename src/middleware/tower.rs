use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use http::{Request, Response};
use pin_project::pin_project;
use tower::Service;
use tower_layer::Layer;
use tracing::Span;

use crate::{config::Config, http_injector};

/// Starts or continues a span for every request, unless the configured
/// [`NoiseFilter`](crate::config::NoiseFilter) marks the request as noise.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run, even before general logging layers.
///
/// The `TraceLayer` will not log http requests. That is the job of the
/// [`EnvelopeLayer`](super::envelope::EnvelopeLayer).
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(TraceLayer::new(config));
/// ```
#[derive(Clone, Debug)]
pub struct TraceLayer {
    config: Arc<Config>,
}

impl TraceLayer {
    pub fn new(config: Config) -> Self {
        Self::from_shared(Arc::new(config))
    }

    pub fn from_shared(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService {
            service,
            config: self.config.clone(),
        }
    }
}

/// This service implements the Trace behavior
#[derive(Clone, Debug)]
pub struct TraceService<S> {
    service: S,
    config: Arc<Config>,
}

impl<S, Body, ResBody> Service<Request<Body>> for TraceService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
{
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let noise = self
            .config
            .noise_filter
            .is_noise(request.method().as_str(), request.uri().path());

        let span = if noise {
            Span::none()
        } else {
            self.config.logger.in_scope(|| {
                http_injector::extract_opentelemetry_context_from_request(&request)
            })
        };

        let future = {
            let _guard = span.enter();
            self.service.call(request)
        };

        ResponseFuture { future, span }
    }
}

/// Polls the inner future inside the request span and records the final
/// status on it.
#[pin_project]
pub struct ResponseFuture<F> {
    #[pin]
    future: F,
    span: Span,
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.span.enter();

        let result = ready!(this.future.poll(cx));
        match &result {
            Ok(response) => {
                let status = response.status();
                this.span.record("http.response.status_code", status.as_u16());
                if status.is_server_error() {
                    this.span.record("otel.status_code", "Error");
                }
            }
            Err(_) => {
                this.span.record("otel.status_code", "Error");
            }
        }

        Poll::Ready(result)
    }
}
