use anyhow::Context;

use pharmastock_api::app::{build_app, services};
use pharmastock_api::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    pharmastock_observability::init(&config.log);

    let services = services::build_services(&config)
        .await
        .context("failed to initialise the inventory store")?;
    let app = build_app(services, config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
