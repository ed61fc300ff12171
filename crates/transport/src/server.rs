use std::net::SocketAddr;
use std::sync::Arc;

use engine::Dispatcher;

use crate::router::app_router;

pub async fn serve_http(
    dispatcher: Arc<Dispatcher>,
    addr: &str,
    prefixes: &[String],
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("fn runtime listening on {}", listener.local_addr()?);
    tracing::info!("function routes mounted at {}", prefixes.join(", "));

    let app = app_router(dispatcher, prefixes);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
