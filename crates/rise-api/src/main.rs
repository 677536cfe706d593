//! Rise ingress API binary.

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;

use rise_api::{router, ApiConfig, AppState};
use rise_core::env::{self, RiseEnv};
use rise_deployer::PostgresStore;
use rise_state::PostgresBus;
use rise_store::ObjectTransfer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env::init_tracing();

    let rise_env = RiseEnv::from_env();
    info!(environment = %rise_env, "Rise API starting");

    let config = ApiConfig::load()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;

    let state = AppState {
        store: Arc::new(PostgresStore::from_pool(pool.clone()).await?),
        transfer: Arc::new(ObjectTransfer::new(config.store.clone())),
        bus: Arc::new(PostgresBus::from_pool(pool).await?),
        config: Arc::new(config.clone()),
    };

    let app = router(state)
        .layer(axum::middleware::from_fn(rise_api::auth::gateway_identity))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    info!(listen = %config.server.listen, "accepting connections");

    axum::serve(listener, app).await?;
    Ok(())
}
