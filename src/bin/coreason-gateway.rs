use std::sync::Arc;

use secrecy::ExposeSecret;

use coreason_gateway::budget::RedisBudgetStore;
use coreason_gateway::secrets::VaultClient;
use coreason_gateway::{observability, AppState, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    observability::init_tracing(settings.log_json);
    tracing::info!("starting coreason gateway");

    let budget_store = RedisBudgetStore::connect(&settings.redis_url)?;
    budget_store.ping().await?;
    tracing::info!("budget store reachable");

    let mut vault = VaultClient::new(settings.vault_addr.clone())?;
    vault
        .authenticate(
            &settings.vault_role_id,
            settings.vault_secret_id.expose_secret(),
        )
        .await?;
    tracing::info!("secret store authenticated");

    let state = AppState::from_settings(&settings, Arc::new(budget_store), Arc::new(vault));
    let app = coreason_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    tracing::info!(addr = %settings.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
