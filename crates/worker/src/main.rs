use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use larder_infra::{
    EngineConfig, ExpirySweep, InMemoryBomCatalog, InMemoryInventoryStore, InventoryStore,
    MovementLedger, PostgresInventoryStore, ReservationCoordinator, SweepHandle,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    larder_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    tracing::info!(
        reservation_ttl_secs = config.reservation_ttl.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        cost_scale = config.cost_scale,
        shortfall = ?config.component_shortfall,
        "starting larder worker"
    );

    let sweep = match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresInventoryStore::new(pool, config.cost_policy())?;
            store.migrate().await?;
            start_sweep(store, &config)?
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            start_sweep(InMemoryInventoryStore::with_cost_policy(config.cost_policy()), &config)?
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || sweep.shutdown()).await?;
    tracing::info!("larder worker stopped");
    Ok(())
}

fn start_sweep<S>(store: S, config: &EngineConfig) -> anyhow::Result<SweepHandle>
where
    S: InventoryStore + MovementLedger + 'static,
{
    let coordinator = ReservationCoordinator::new(store, InMemoryBomCatalog::new())
        .with_shortfall_policy(config.component_shortfall);
    let handle = ExpirySweep::new(Arc::new(coordinator), config.reservation_ttl)
        .with_lookback(config.sweep_lookback)
        .spawn(config.sweep_interval)
        .context("failed to spawn expiry sweep")?;
    Ok(handle)
}
