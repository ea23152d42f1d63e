//! Recovery, timing and access logging for HTTP handlers.

use std::{
    fmt::Display,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body, extract::ConnectInfo};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{header::USER_AGENT, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::Service;
use tower_layer::Layer;

use crate::{
    capture::{self, status_text},
    config::Config,
    context::LoggerExt,
    record::{Envelope, RequestMeta},
    recovery::{self, Recovered},
};

/// Wraps one handler invocation with timing, panic recovery and exactly one
/// access log record.
///
/// A panicking handler is answered with `500 Internal Server Error` so the
/// layers above observe the failure. The record is written at debug level
/// for a handled request and at error level for an inner service error, a
/// recovered panic, or a cancelled request.
#[derive(Clone, Debug)]
pub struct EnvelopeLayer {
    config: Arc<Config>,
}

impl EnvelopeLayer {
    pub fn new(config: Config) -> Self {
        Self::from_shared(Arc::new(config))
    }

    pub fn from_shared(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for EnvelopeLayer {
    type Service = EnvelopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EnvelopeService {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EnvelopeService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> Service<Request<Body>> for EnvelopeService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The clone is not guaranteed to be ready, `self.inner` is.
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

            let mut request = request.with_logger(logger.clone());
            if config.capture_request_body {
                let (parts, body) = request.into_parts();
                let bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(error) => {
                        envelope.fail(format!("reading request body: {error}"));
                        Bytes::new()
                    }
                };
                envelope.capture_request(&bytes);
                request = Request::from_parts(parts, Body::from(bytes));
            }

            let capture_backtrace = logger.is_debug();
            match recovery::catch_panic(async move { inner.call(request).await }).await {
                Ok(Ok(response)) => Ok(capture::record_response(
                    envelope,
                    response,
                    config.capture_response_body,
                )),
                Ok(Err(error)) => {
                    envelope.set_status(status_text(StatusCode::INTERNAL_SERVER_ERROR));
                    envelope.fail(&error);
                    envelope.complete();
                    Err(error)
                }
                Err(payload) => {
                    envelope.set_status(status_text(StatusCode::INTERNAL_SERVER_ERROR));
                    envelope.recover(Recovered::from_payload(payload, capture_backtrace));

                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        })
    }
}

fn request_meta(request: &Request<Body>) -> RequestMeta {
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let path = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_owned(), ToString::to_string);

    RequestMeta {
        protocol: "HTTP",
        method: request.method().to_string(),
        path,
        user_agent,
        req_header: format!("{:?}", request.headers()),
        ip,
    }
}
