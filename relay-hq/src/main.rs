use std::sync::Arc;

use anyhow::Context;
use relay_hq::Hub;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port: u16 = match std::env::var("PORT") {
        Ok(raw) => raw.parse().context("invalid PORT")?,
        Err(_) => 8080,
    };

    let hub = Arc::new(Hub::new());
    let app = relay_hq::router(hub);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, "hq listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
