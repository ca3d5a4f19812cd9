use anyhow::Result;
use pos_relay_server::bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    // Bootstrap the application (config, logging, relay, router, listener)
    let app = bootstrap::setup().await?;

    tracing::info!("HTTP server listening on http://{}", app.bind_address);

    let relay = app.relay.clone();
    axum::serve(app.listener, app.router)
        .with_graceful_shutdown(bootstrap::shutdown_signal(relay))
        .await?;

    Ok(())
}
