//! Rise deploy worker binary.
//!
//! Consumes the deploy queue and publishes deployments.

use std::sync::Arc;

use tracing::info;

use rise_core::env::{self, RiseEnv};
use rise_deployer::worker::DeployWorker;
use rise_deployer::{DeployerConfig, NoopTracker, PostgresStore, Tracker};
use rise_state::{PostgresBus, PostgresLock};
use rise_store::ObjectTransfer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env::init_tracing();

    let rise_env = RiseEnv::from_env();
    info!(environment = %rise_env, "Rise deploy worker starting");

    let config = DeployerConfig::load()?;

    // S3 credentials must come from the environment outside tests.
    if rise_env != RiseEnv::Test
        && config.store.storage_type == "s3"
        && config.store.access_key_id.is_none()
        && std::env::var("AWS_ACCESS_KEY_ID").is_err()
    {
        return Err("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables are required".into());
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;

    let store = Arc::new(PostgresStore::from_pool(pool.clone()).await?);
    let locks = Arc::new(PostgresLock::from_pool(pool.clone()));
    let bus = Arc::new(PostgresBus::from_pool(pool).await?);
    let transfer = Arc::new(ObjectTransfer::new(config.store.clone()));

    let tracker: Arc<dyn Tracker> = match &config.analytics.endpoint {
        Some(endpoint) => Arc::new(rise_deployer::HttpTracker::new(endpoint)),
        None => Arc::new(NoopTracker),
    };

    let worker = DeployWorker::new(
        store,
        locks,
        transfer,
        bus,
        tracker,
        config.bucket.clone(),
        config.limits.clone(),
    );

    info!(
        bucket = %config.bucket.name,
        region = %config.bucket.region,
        "consuming deploy queue"
    );

    worker.run().await?;
    Ok(())
}
