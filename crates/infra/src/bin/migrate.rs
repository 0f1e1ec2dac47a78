//! Apply the order engine schema to the database named by `DATABASE_URL`.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use orderdesk_infra::{EngineConfig, apply_schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderdesk_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    apply_schema(&pool).await.context("schema migration failed")?;
    tracing::info!("order engine schema is up to date");
    Ok(())
}
