//! banana-gateway server entry point.
//!
//! Wires the ledger store, the outbound clients, and the service layer,
//! then serves the REST API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use secrecy::ExposeSecret;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use banana_gateway::api;
use banana_gateway::app_state::{AppState, Collaborators};
use banana_gateway::config::{GatewayConfig, LogFormat};
use banana_gateway::persistence::LedgerStore;
use banana_gateway::persistence::memory::MemoryLedger;
use banana_gateway::persistence::postgres::PostgresLedger;
use banana_gateway::upstream::{ChatImageClient, CheckoutClient, HostedAuthClient};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn ledger_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    if !config.persistence_enabled {
        tracing::warn!("PERSISTENCE_ENABLED=false: using the in-process ledger, balances are lost on restart");
        return Ok(Arc::new(MemoryLedger::new()));
    }
    let store = PostgresLedger::connect(
        &config.database_url,
        config.database_max_connections,
        config.database_min_connections,
        Duration::from_secs(config.database_connect_timeout_secs),
    )
    .await
    .context("connecting to PostgreSQL")?;
    store.migrate().await.context("running migrations")?;
    tracing::info!("ledger store ready (PostgreSQL)");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    init_tracing(config.log_format);
    tracing::info!(addr = %config.listen_addr, "starting banana-gateway");

    let pricing = config.pricing_table().context("loading pricing table")?;
    tracing::info!(
        generation_cost = pricing.generation_cost,
        offers = pricing.offers.len(),
        "pricing table loaded"
    );
    if config.payment_webhook_secret.is_none() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET is not set: webhook signatures are not verified");
    }
    if config.upstream_api_key.expose_secret().is_empty() {
        tracing::warn!("UPSTREAM_API_KEY is not set: generation requests will be rejected upstream");
    }

    // Build outbound clients
    let identity = HostedAuthClient::new(
        config.auth_base_url.clone(),
        config.auth_api_key.clone(),
        Duration::from_secs(config.auth_timeout_secs),
    )
    .context("building auth client")?;
    let chat = Arc::new(ChatImageClient::new(
        config.upstream_base_url.clone(),
        config.upstream_api_key.clone(),
        config.site_url.clone(),
        config.site_name.clone(),
        Duration::from_secs(config.upstream_timeout_secs),
    )
    .context("building generation client")?);
    let payments =
        CheckoutClient::new(config.payment_client_config()).context("building payment client")?;

    // Build application state
    let store = ledger_store(&config).await?;
    let with_admin = config.admin_token.is_some();
    let app_state = AppState::new(
        store,
        Collaborators {
            identity: Arc::new(identity),
            generator: Arc::<ChatImageClient>::clone(&chat),
            analyzer: chat,
            payments: Arc::new(payments),
        },
        config.state_options(pricing),
    );

    // Build router
    let app = Router::new()
        .merge(api::build_router(with_admin))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, admin = with_admin, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
