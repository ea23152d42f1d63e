//! # Trace middleware
//! This crate wraps HTTP handlers and RPC methods with tracing, panic
//! recovery, access logging and metrics.
//!
//! ## Setup
//! Tracing, metrics and logs can be set up using [`setup::setup`]. This should
//! be the first call of any server binary. The returned
//! [`setup::Telemetry`] hands out a [`Config`] bound to the installed
//! pipelines.
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from [`http::Request`]s and RPC metadata.
//!
//! ## HTTP
//! When using [`tower`] based http frameworks like [`axum`](https://docs.rs/axum/latest/axum),
//! [`middleware::ServerMiddlewareLayer`] applies tracing, recovery with
//! access log, and metrics in this order.
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.
//!
//! ## RPC
//! [`rpc`] provides the same chain for unary calls and a tracing plus
//! metrics chain for streaming calls.
//!
//! ## Request scoped logger
//! Every wrapped request carries a [`Logger`], reachable through
//! [`LoggerExt::logger`].

#[cfg(feature = "http")]
pub mod capture;
pub mod config;
pub mod context;
pub mod http_injector;
pub mod metrics;
#[cfg(feature = "http")]
pub mod middleware;
mod record;
pub mod recovery;
#[cfg(feature = "rpc")]
pub mod rpc;
pub mod setup;

pub use config::{Config, NoiseFilter};
pub use context::{Logger, LoggerExt};
pub use metrics::{MetricsSink, OtelMetrics};
