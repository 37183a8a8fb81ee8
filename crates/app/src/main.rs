mod auth;
mod invoices;
mod problem;
mod revalidate;
mod router;
mod telemetry;
mod views;

use std::net::SocketAddr;

use tracing::info;

use invoice_dash_identity::IdentityClient;
use invoice_dash_storage::Database;
use invoice_dash_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database ready");

    let identity =
        IdentityClient::new(config.identity_provider_url.clone(), reqwest::Client::new());
    let state = router::AppState::new(metrics, database, identity);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
