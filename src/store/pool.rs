use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

/// Connect to the configured database (sqlite or postgres) through the
/// sqlx `Any` driver and apply the schema bootstrap.
#[tracing::instrument(skip(url), err)]
pub async fn connect(backend: &str, url: &str) -> anyhow::Result<AnyPool> {
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await?;

    tracing::info!(backend, "connected to database");

    super::bootstrap::run(&pool).await?;
    tracing::info!("schema bootstrap applied");

    Ok(pool)
}
