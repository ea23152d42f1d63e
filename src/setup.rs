use std::{env, sync::Arc};

use opentelemetry::{
    global,
    logs::LogError,
    metrics::{MeterProvider, MetricsError},
    trace::TraceError,
    KeyValue,
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{logs, metrics::SdkMeterProvider, runtime, Resource};
use tracing_core::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Registry,
};

use crate::{config::Config, context::Logger, metrics::OtelMetrics};

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to install the trace pipeline")]
    Trace(#[from] TraceError),

    #[error("failed to install the metrics pipeline")]
    Metrics(#[from] MetricsError),

    #[error("failed to install the log pipeline")]
    Logs(#[from] LogError),

    #[error("a global subscriber is already installed")]
    Subscriber(#[from] TryInitError),
}

/// Handle on the installed pipelines.
///
/// Hands out middleware [`Config`]s bound to the installed meter and
/// subscriber, and flushes everything on [`Telemetry::teardown`].
#[derive(Debug)]
pub struct Telemetry {
    service: String,
    meter_provider: SdkMeterProvider,
    logger: Logger,
}

impl Telemetry {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Middleware configuration reporting to the installed pipelines.
    pub fn config(&self) -> Config {
        let meter = self.meter_provider.meter(self.service.clone());

        Config::new()
            .with_logger(self.logger.clone())
            .with_metrics(Arc::new(OtelMetrics::new(&meter)))
    }

    /// Flushes and shuts down every pipeline. Should be the last call of a
    /// server binary.
    pub fn teardown(self) -> Result<(), SetupError> {
        tracing::info!("stopping server");

        let metrics = self.meter_provider.shutdown();
        global::shutdown_logger_provider();
        global::shutdown_tracer_provider();

        metrics.map_err(SetupError::from)
    }
}

/// Sets up tracing, metrics and logging via otlp exporter.
/// The service name can be configured using the env var `SERVICE_NAME`,
/// otherwise the cargo name will be used. By default, everything is exported to `http://localhost:4317`.
/// This can be changed via env var `OTEL_EXPORTER_OTLP_ENDPOINT`.
///
/// This should generally be the first statement of any server binary's main
/// function. The log level defaults to `info` and follows `RUST_LOG`.
pub fn setup() -> Result<Telemetry, SetupError> {
    let service = env::var("SERVICE_NAME").unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_owned());
    let endpoint =
        env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());

    let meter_provider = init_metrics(&service, &endpoint)?;
    // needs to run before init_tracer
    init_logs(&service, &endpoint)?;
    init_tracer(&service, &endpoint)?;

    tracing::info!(service = %service, endpoint = %endpoint, "starting server");

    Ok(Telemetry {
        service,
        meter_provider,
        logger: Logger::current(),
    })
}

fn resource(service: &str) -> Resource {
    Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        service.to_owned(),
    )])
}

fn init_tracer(service: &str, endpoint: &str) -> Result<(), SetupError> {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource(service)))
        .install_batch(runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let log_layer = OpenTelemetryTracingBridge::new(&global::logger_provider());
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(telemetry)
        .with(log_layer)
        .try_init()?;

    Ok(())
}

fn init_metrics(service: &str, endpoint: &str) -> Result<SdkMeterProvider, MetricsError> {
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_resource(resource(service))
        .build()?;

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

fn init_logs(service: &str, endpoint: &str) -> Result<(), LogError> {
    opentelemetry_otlp::new_pipeline()
        .logging()
        .with_log_config(logs::Config::default().with_resource(resource(service)))
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .install_batch(runtime::Tokio)?;

    Ok(())
}
