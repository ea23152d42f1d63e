use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use trace_middleware::{middleware::ServerMiddlewareLayer, setup, Logger};

async fn hello(Extension(logger): Extension<Logger>, body: String) -> String {
    logger.in_scope(|| {
        tracing::info!(%body, trace_id = logger.trace_id(), "saying hello");
    });
    format!("Hello {body}")
}

async fn explode() -> &'static str {
    panic!("this handler always fails")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = setup::setup()?;

    let config = telemetry
        .config()
        .with_request_body()
        .with_response_body()
        .with_handled_histogram(true);

    let app = Router::new()
        .route("/hello", post(hello))
        .route("/panic", get(explode))
        .route("/health", get(|| async { "ok" }))
        .layer(ServerMiddlewareLayer::new(config));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    telemetry.teardown()?;
    Ok(())
}
