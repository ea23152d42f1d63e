//! Interceptors for unary calls.
//!
//! Every service here speaks `tonic::Request<Req>` in and
//! `tonic::Response<Resp>` out, with [`Status`] as the error. The
//! [`RpcMethod`] of the call is read from the request extensions and falls
//! back to [`RpcMethod::unknown`].

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures_util::future::BoxFuture;
use pin_project::pin_project;
use serde::Serialize;
use tonic::{Code, Request, Response, Status};
use tower::Service;
use tower_layer::Layer;
use tracing::Span;

use super::{call_labels, call_span, code_name, finalize_span, RpcMethod, Side, StreamKind};
use crate::{
    config::Config,
    context::LoggerExt,
    metrics::{Handled, ObservedFuture},
    record::{Envelope, RequestMeta},
    recovery::{self, Recovered},
};

fn rpc_method<T>(request: &Request<T>) -> RpcMethod {
    request
        .extensions()
        .get::<RpcMethod>()
        .cloned()
        .unwrap_or_else(RpcMethod::unknown)
}

/// Starts a span per call and links it to the remote trace.
#[derive(Clone, Debug)]
pub struct UnaryTraceLayer {
    config: Arc<Config>,
    side: Side,
}

impl UnaryTraceLayer {
    pub fn new(config: Arc<Config>, side: Side) -> Self {
        Self { config, side }
    }
}

impl<S> Layer<S> for UnaryTraceLayer {
    type Service = UnaryTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryTraceService {
            inner,
            config: self.config.clone(),
            side: self.side,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UnaryTraceService<S> {
    inner: S,
    config: Arc<Config>,
    side: Side,
}

impl<S, Req, Resp> Service<Request<Req>> for UnaryTraceService<S>
where
    S: Service<Request<Req>, Response = Response<Resp>, Error = Status>,
{
    type Response = Response<Resp>;
    type Error = Status;
    type Future = TracedCall<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Req>) -> Self::Future {
        let method = rpc_method(&request);
        let span = call_span(&self.config, self.side, &method, request.metadata_mut());

        let future = {
            let _guard = span.enter();
            self.inner.call(request)
        };

        TracedCall::new(future, span)
    }
}

/// Polls a call inside its span and records the final status on it.
#[pin_project]
pub struct TracedCall<F> {
    #[pin]
    future: F,
    span: Span,
}

impl<F> TracedCall<F> {
    pub(crate) fn new(future: F, span: Span) -> Self {
        Self { future, span }
    }
}

impl<F, T> Future for TracedCall<F>
where
    F: Future<Output = Result<T, Status>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.span.enter();

        let result = ready!(this.future.poll(cx));
        finalize_span(this.span, &result);

        Poll::Ready(result)
    }
}

/// Recovery, timing and access logging for unary calls.
///
/// A panicking handler is answered with an `INTERNAL` status. Request and
/// response messages are written to the record as JSON when capture is
/// enabled in the [`Config`].
#[derive(Clone, Debug)]
pub struct UnaryEnvelopeLayer {
    config: Arc<Config>,
}

impl UnaryEnvelopeLayer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for UnaryEnvelopeLayer {
    type Service = UnaryEnvelopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryEnvelopeService {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UnaryEnvelopeService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S, Req, Resp> Service<Request<Req>> for UnaryEnvelopeService<S>
where
    S: Service<Request<Req>, Response = Response<Resp>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Serialize + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    type Response = Response<Resp>;
    type Error = Status;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let logger = config.logger.with_trace_fields();
            let mut envelope = Envelope::open(
                logger.clone(),
                request_meta(&request),
                config.body_capture_limit,
            );

            if config.capture_request_body {
                match serde_json::to_vec(request.get_ref()) {
                    Ok(json) => envelope.capture_request(&json),
                    Err(error) => envelope.fail(format!("encoding request message: {error}")),
                }
            }

            let request = request.with_logger(logger.clone());
            let capture_backtrace = logger.is_debug();

            match recovery::catch_panic(async move { inner.call(request).await }).await {
                Ok(Ok(response)) => {
                    if config.capture_response_body {
                        match serde_json::to_vec(response.get_ref()) {
                            Ok(json) => envelope.capture_response(&json),
                            Err(error) => {
                                envelope.fail(format!("encoding response message: {error}"))
                            }
                        }
                    }
                    envelope.complete();
                    Ok(response)
                }
                Ok(Err(status)) => {
                    envelope.set_status(code_name(status.code()));
                    envelope.fail(status.message());
                    envelope.complete();
                    Err(status)
                }
                Err(payload) => {
                    let recovered = Recovered::from_payload(payload, capture_backtrace);
                    let status = Status::internal(recovered.diagnostic());

                    envelope.set_status(code_name(Code::Internal));
                    envelope.recover(recovered);
                    Err(status)
                }
            }
        })
    }
}

fn request_meta<T>(request: &Request<T>) -> RequestMeta {
    let method = rpc_method(request);

    let user_agent = request
        .metadata()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let ip = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    RequestMeta {
        protocol: "RPC",
        method: StreamKind::Unary.as_str().to_owned(),
        path: method.full_method(),
        user_agent,
        req_header: format!("{:?}", request.metadata()),
        ip,
    }
}

/// Counts started and handled calls, and optionally observes their latency.
#[derive(Clone, Debug)]
pub struct UnaryMetricsLayer {
    config: Arc<Config>,
    side: Side,
}

impl UnaryMetricsLayer {
    pub fn new(config: Arc<Config>, side: Side) -> Self {
        Self { config, side }
    }
}

impl<S> Layer<S> for UnaryMetricsLayer {
    type Service = UnaryMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UnaryMetricsService {
            inner,
            config: self.config.clone(),
            side: self.side,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UnaryMetricsService<S> {
    inner: S,
    config: Arc<Config>,
    side: Side,
}

impl<S, Req, Resp> Service<Request<Req>> for UnaryMetricsService<S>
where
    S: Service<Request<Req>, Response = Response<Resp>, Error = Status>,
{
    type Response = Response<Resp>;
    type Error = Status;
    type Future = ObservedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let names = self.side.metrics();
        let labels = call_labels(&rpc_method(&request), StreamKind::Unary, &self.config);

        self.config.metrics.add(names.started, 1, &labels);
        let handled = Handled::start(
            self.config.metrics.clone(),
            names.handled,
            labels,
            self.config.handled_histogram,
        );

        ObservedFuture::new(self.inner.call(request), handled, classify)
    }
}

pub(crate) fn classify<T>(result: &Result<T, Status>) -> String {
    match result {
        Ok(_) => code_name(Code::Ok).to_owned(),
        Err(status) => code_name(status.code()).to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use tower::{service_fn, ServiceExt};

    use super::*;

    #[test]
    fn method_defaults_to_unknown() {
        let request = Request::new(());
        assert_eq!(rpc_method(&request), RpcMethod::unknown());
    }

    #[test]
    fn meta_uses_full_method_and_user_agent() {
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(RpcMethod::parse("/helloworld.HelloService/SayHello"));
        request
            .metadata_mut()
            .insert("user-agent", "grpc-rust/0.11".parse().unwrap());

        let meta = request_meta(&request);

        assert_eq!(meta.protocol, "RPC");
        assert_eq!(meta.method, "unary");
        assert_eq!(meta.path, "/helloworld.HelloService/SayHello");
        assert_eq!(meta.user_agent, "grpc-rust/0.11");
        assert!(meta.ip.is_empty());
    }

    #[test]
    fn classify_uses_code_names() {
        assert_eq!(classify(&Ok::<(), Status>(())), "OK");
        assert_eq!(
            classify(&Err::<(), _>(Status::not_found("missing"))),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn handler_errors_pass_through_the_envelope() {
        let service = UnaryEnvelopeLayer::new(Arc::new(Config::new())).layer(service_fn(
            |_: Request<String>| async { Err::<Response<String>, _>(Status::unavailable("down")) },
        ));

        let status = service
            .oneshot(Request::new("ping".to_owned()))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "down");
    }
}
