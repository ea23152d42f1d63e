//! RPC interceptor chains.
//!
//! Two chains exist per side:
//!
//! - the unary chain ([`UnaryChainLayer`]): tracing, recovery with access
//!   log, metrics. This mirrors the HTTP chain.
//! - the streaming chain ([`StreamChainLayer`]): tracing and metrics only.
//!
//! The streaming chain has no recovery layer. A panic inside a streaming
//! handler propagates and terminates that stream, leaving it to the
//! transport's own fault handling.

use std::{fmt, sync::Arc};

use ::tower::ServiceBuilder;
use opentelemetry::KeyValue;
use tonic::Code;
use tower_layer::Layer;
use tracing::{field::Empty, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{config::Config, http_injector, metrics};

pub mod stream;
pub mod streaming;
pub mod unary;

pub use stream::{
    join_bidi, Direction, RpcStream, StreamObserver, StreamReceiver, StreamSender, StreamState,
};
pub use streaming::{StreamMetricsLayer, StreamTraceLayer};
pub use unary::{UnaryEnvelopeLayer, UnaryMetricsLayer, UnaryTraceLayer};

/// Which end of the call the chain is installed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Shape of the call, used as the `grpc_type` label.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamKind {
    #[default]
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ClientStream => "client_stream",
            Self::ServerStream => "server_stream",
            Self::BidiStream => "bidi_stream",
        }
    }
}

/// Identity of the called method, carried as a request extension by the
/// transport binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcMethod {
    service: String,
    method: String,
    kind: StreamKind,
}

impl RpcMethod {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind: StreamKind::Unary,
        }
    }

    /// Parses a full method name like `/helloworld.HelloService/SayHello`.
    /// Anything that does not have this shape yields `unknown` parts.
    pub fn parse(full_method: &str) -> Self {
        let trimmed = full_method.strip_prefix('/').unwrap_or(full_method);
        match trimmed.split_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Self::new(service, method)
            }
            _ => Self::unknown(),
        }
    }

    pub fn unknown() -> Self {
        Self::new("unknown", "unknown")
    }

    pub fn with_kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

/// Canonical upper case name of a status code, e.g. `OK` or `INTERNAL`.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Metric names for one side of a call.
pub(crate) struct SideMetrics {
    pub(crate) started: &'static str,
    pub(crate) msg_received: &'static str,
    pub(crate) msg_sent: &'static str,
    pub(crate) handled: metrics::HandledNames,
}

impl Side {
    pub(crate) fn metrics(self) -> SideMetrics {
        let (started, handled, msg_received, msg_sent, handling) = match self {
            Self::Server => (
                metrics::GRPC_SERVER_STARTED,
                metrics::GRPC_SERVER_HANDLED,
                metrics::GRPC_SERVER_MSG_RECEIVED,
                metrics::GRPC_SERVER_MSG_SENT,
                metrics::GRPC_SERVER_HANDLING,
            ),
            Self::Client => (
                metrics::GRPC_CLIENT_STARTED,
                metrics::GRPC_CLIENT_HANDLED,
                metrics::GRPC_CLIENT_MSG_RECEIVED,
                metrics::GRPC_CLIENT_MSG_SENT,
                metrics::GRPC_CLIENT_HANDLING,
            ),
        };

        SideMetrics {
            started,
            msg_received,
            msg_sent,
            handled: metrics::HandledNames {
                counter: handled,
                histogram: handling,
                status_key: "grpc_code",
                on_panic: code_name(Code::Internal),
                on_cancel: code_name(Code::Cancelled),
            },
        }
    }

    fn span_kind(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// `grpc_type`, `grpc_service` and `grpc_method` plus the constant labels.
pub(crate) fn call_labels(method: &RpcMethod, kind: StreamKind, config: &Config) -> Vec<KeyValue> {
    metrics::with_const_labels(
        vec![
            KeyValue::new("grpc_type", kind.as_str()),
            KeyValue::new("grpc_service", method.service().to_owned()),
            KeyValue::new("grpc_method", method.method().to_owned()),
        ],
        &config.const_labels,
    )
}

/// Creates the span for one call, or [`Span::none`] for noise.
///
/// On the server the remote parent is extracted from `metadata`. On the
/// client the new span's context is injected into `metadata` so the server
/// can continue the trace. Other metadata entries are left alone.
pub(crate) fn call_span(
    config: &Config,
    side: Side,
    method: &RpcMethod,
    metadata: &mut tonic::metadata::MetadataMap,
) -> Span {
    let full_method = method.full_method();
    if config.noise_filter.is_noise("POST", &full_method) {
        return Span::none();
    }

    config.logger.in_scope(|| {
        let span = tracing::info_span!(
            "RPC call",
            otel.name = %format!("{}/{}", method.service(), method.method()),
            otel.kind = side.span_kind(),
            otel.status_code = Empty,
            rpc.system = "grpc",
            rpc.service = method.service(),
            rpc.method = method.method(),
            rpc.grpc.kind = method.kind().as_str(),
            rpc.grpc.status_code = Empty,
        );

        match side {
            Side::Server => {
                span.set_parent(http_injector::extract_context_from_metadata(metadata));
            }
            Side::Client => {
                http_injector::inject_context_into_metadata(&span.context(), metadata);
            }
        }

        span
    })
}

/// Records the final status of a call on its span.
pub(crate) fn finalize_span<T>(span: &Span, result: &Result<T, tonic::Status>) {
    let code = match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };

    span.record("rpc.grpc.status_code", code_name(code));
    if code != Code::Ok {
        span.record("otel.status_code", "Error");
    }
}

/// Unary chain: tracing, recovery with access log, metrics.
#[derive(Clone, Debug)]
pub struct UnaryChainLayer {
    config: Arc<Config>,
    side: Side,
}

impl<S> Layer<S> for UnaryChainLayer {
    type Service =
        unary::UnaryTraceService<unary::UnaryEnvelopeService<unary::UnaryMetricsService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(UnaryTraceLayer::new(self.config.clone(), self.side))
            .layer(UnaryEnvelopeLayer::new(self.config.clone()))
            .layer(UnaryMetricsLayer::new(self.config.clone(), self.side))
            .service(inner)
    }
}

/// Streaming chain: tracing and metrics, no recovery.
#[derive(Clone, Debug)]
pub struct StreamChainLayer {
    config: Arc<Config>,
    side: Side,
}

impl<S> Layer<S> for StreamChainLayer {
    type Service = streaming::StreamTraceService<streaming::StreamMetricsService<S>>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(StreamTraceLayer::new(self.config.clone(), self.side))
            .layer(StreamMetricsLayer::new(self.config.clone(), self.side))
            .service(inner)
    }
}

pub fn unary_server_chain(config: Config) -> UnaryChainLayer {
    UnaryChainLayer {
        config: Arc::new(config),
        side: Side::Server,
    }
}

pub fn unary_client_chain(config: Config) -> UnaryChainLayer {
    UnaryChainLayer {
        config: Arc::new(config),
        side: Side::Client,
    }
}

pub fn stream_server_chain(config: Config) -> StreamChainLayer {
    StreamChainLayer {
        config: Arc::new(config),
        side: Side::Server,
    }
}

pub fn stream_client_chain(config: Config) -> StreamChainLayer {
    StreamChainLayer {
        config: Arc::new(config),
        side: Side::Client,
    }
}
