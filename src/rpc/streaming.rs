//! Interceptors for streaming calls.
//!
//! A streaming handler is a `Service<RpcStream<In, Out>>` that resolves once
//! the handler is done with the stream. The interceptors register
//! [`StreamObserver`]s on the stream before handing it on, so individual
//! messages are seen without ever being buffered or altered.

use std::{
    sync::Arc,
    task::{Context, Poll},
    time::SystemTime,
};

use opentelemetry::KeyValue;
use tonic::Status;
use tower::Service;
use tower_layer::Layer;
use tracing::Span;

use super::{
    call_labels, call_span,
    stream::{Direction, RpcStream, StreamObserver},
    unary::{classify, TracedCall},
    RpcMethod, Side,
};
use crate::{
    config::Config,
    context::{Logger, LoggerExt},
    metrics::{Handled, MetricsSink, ObservedFuture},
};

fn rpc_method<In, Out>(stream: &RpcStream<In, Out>) -> RpcMethod {
    stream
        .extensions()
        .get::<RpcMethod>()
        .cloned()
        .unwrap_or_else(RpcMethod::unknown)
}

/// Starts a span per streaming call. Every message is added to it as a
/// debug event carrying its sequence number and timestamp.
#[derive(Clone, Debug)]
pub struct StreamTraceLayer {
    config: Arc<Config>,
    side: Side,
}

impl StreamTraceLayer {
    pub fn new(config: Arc<Config>, side: Side) -> Self {
        Self { config, side }
    }
}

impl<S> Layer<S> for StreamTraceLayer {
    type Service = StreamTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StreamTraceService {
            inner,
            config: self.config.clone(),
            side: self.side,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamTraceService<S> {
    inner: S,
    config: Arc<Config>,
    side: Side,
}

impl<S, In, Out> Service<RpcStream<In, Out>> for StreamTraceService<S>
where
    S: Service<RpcStream<In, Out>, Response = (), Error = Status>,
{
    type Response = ();
    type Error = Status;
    type Future = TracedCall<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut stream: RpcStream<In, Out>) -> Self::Future {
        let method = rpc_method(&stream);
        let span = call_span(&self.config, self.side, &method, stream.metadata_mut());

        let future = {
            let _guard = span.enter();
            let logger = self.config.logger.with_trace_fields();

            if !span.is_disabled() {
                stream.observe(Arc::new(SpanEvents {
                    span: span.clone(),
                    logger: logger.clone(),
                }));
            }

            self.inner.call(stream.with_logger(logger))
        };

        TracedCall::new(future, span)
    }
}

struct SpanEvents {
    span: Span,
    logger: Logger,
}

impl StreamObserver for SpanEvents {
    fn on_message(&self, direction: Direction, sequence: u64, at: SystemTime) {
        self.logger.in_scope(|| {
            self.span.in_scope(|| match direction {
                Direction::Sent => tracing::debug!(sequence, at = ?at, "message sent"),
                Direction::Received => tracing::debug!(sequence, at = ?at, "message received"),
            })
        });
    }
}

/// Counts started and handled streaming calls as well as every message sent
/// and received.
///
/// There is no recovery here. A panicking handler is counted as `INTERNAL`
/// and the panic keeps unwinding.
#[derive(Clone, Debug)]
pub struct StreamMetricsLayer {
    config: Arc<Config>,
    side: Side,
}

impl StreamMetricsLayer {
    pub fn new(config: Arc<Config>, side: Side) -> Self {
        Self { config, side }
    }
}

impl<S> Layer<S> for StreamMetricsLayer {
    type Service = StreamMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StreamMetricsService {
            inner,
            config: self.config.clone(),
            side: self.side,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamMetricsService<S> {
    inner: S,
    config: Arc<Config>,
    side: Side,
}

impl<S, In, Out> Service<RpcStream<In, Out>> for StreamMetricsService<S>
where
    S: Service<RpcStream<In, Out>, Response = (), Error = Status>,
{
    type Response = ();
    type Error = Status;
    type Future = ObservedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut stream: RpcStream<In, Out>) -> Self::Future {
        let names = self.side.metrics();
        let method = rpc_method(&stream);
        let labels = call_labels(&method, method.kind(), &self.config);

        self.config.metrics.add(names.started, 1, &labels);
        stream.observe(Arc::new(MessageCounter {
            metrics: self.config.metrics.clone(),
            sent: names.msg_sent,
            received: names.msg_received,
            labels: labels.clone(),
        }));

        let handled = Handled::start(
            self.config.metrics.clone(),
            names.handled,
            labels,
            self.config.handled_histogram,
        );

        ObservedFuture::new(self.inner.call(stream), handled, classify)
    }
}

struct MessageCounter {
    metrics: Arc<dyn MetricsSink>,
    sent: &'static str,
    received: &'static str,
    labels: Vec<KeyValue>,
}

impl StreamObserver for MessageCounter {
    fn on_message(&self, direction: Direction, _sequence: u64, _at: SystemTime) {
        let name = match direction {
            Direction::Sent => self.sent,
            Direction::Received => self.received,
        };
        self.metrics.add(name, 1, &self.labels);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tower::{service_fn, ServiceExt};

    use super::*;
    use crate::rpc::{stream, StreamKind};

    #[derive(Default)]
    struct Recording {
        added: Mutex<Vec<&'static str>>,
    }

    impl MetricsSink for Recording {
        fn add(&self, name: &'static str, _value: u64, _attributes: &[KeyValue]) {
            self.added.lock().unwrap().push(name);
        }

        fn observe(&self, _name: &'static str, _seconds: f64, _attributes: &[KeyValue]) {}
    }

    #[tokio::test]
    async fn messages_are_counted_per_direction() {
        let sink = Arc::new(Recording::default());
        let config = Arc::new(Config::new().with_metrics(sink.clone()));

        let (mut client, mut server) = stream::channel::<u32, u32>(8);
        server.extensions_mut().insert(
            RpcMethod::parse("/helloworld.HelloService/SayHelloBidiStream")
                .with_kind(StreamKind::BidiStream),
        );

        client.send(1).await.unwrap();
        client.send(2).await.unwrap();
        client.close_send();

        let service = StreamMetricsLayer::new(config, Side::Server).layer(service_fn(
            |mut stream: RpcStream<u32, u32>| async move {
                while let Some(message) = stream.recv().await {
                    stream.send(message? * 10).await?;
                }
                Ok::<_, Status>(())
            },
        ));

        service.oneshot(server).await.unwrap();

        let added = sink.added.lock().unwrap();
        let count = |name| added.iter().filter(|added| **added == name).count();
        assert_eq!(count(crate::metrics::GRPC_SERVER_STARTED), 1);
        assert_eq!(count(crate::metrics::GRPC_SERVER_MSG_RECEIVED), 2);
        assert_eq!(count(crate::metrics::GRPC_SERVER_MSG_SENT), 2);
        assert_eq!(count(crate::metrics::GRPC_SERVER_HANDLED), 1);
    }
}
