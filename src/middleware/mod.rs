//! HTTP middleware chain.
//!
//! Execution order:
//!  * span creation and trace context extraction via [`TraceLayer`]
//!  * recovery, timing and access log via [`EnvelopeLayer`]
//!  * metrics via [`MetricsLayer`]
//!
//! [`ServerMiddlewareLayer`] applies all three in this order, the first being
//! the outermost. Each layer is public as well, so a different arrangement
//! (e.g. metrics outermost) can be put together with
//! [`ServiceBuilder`].

use std::sync::Arc;

use ::tower::ServiceBuilder;
use tower_layer::Layer;

use crate::config::Config;

pub mod envelope;
pub mod metrics;
pub mod tower;

pub use self::tower::{TraceLayer, TraceService};
pub use envelope::{EnvelopeLayer, EnvelopeService};
pub use metrics::{MetricsLayer, MetricsService};

/// All essential HTTP server middlewares in a single [`Layer`].
///
/// ```ignore
/// let app = Router::new()
///     .route("/hello", post(hello))
///     .layer(ServerMiddlewareLayer::new(telemetry.config().with_request_body()));
/// ```
#[derive(Clone, Debug)]
pub struct ServerMiddlewareLayer {
    config: Arc<Config>,
}

impl ServerMiddlewareLayer {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for ServerMiddlewareLayer {
    type Service = TraceService<EnvelopeService<MetricsService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(TraceLayer::from_shared(self.config.clone()))
            .layer(EnvelopeLayer::from_shared(self.config.clone()))
            .layer(MetricsLayer::from_shared(self.config.clone()))
            .service(inner)
    }
}

/// Shorthand for [`ServerMiddlewareLayer::new`].
pub fn server_middleware_all(config: Config) -> ServerMiddlewareLayer {
    ServerMiddlewareLayer::new(config)
}
