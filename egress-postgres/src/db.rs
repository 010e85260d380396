use egress_config::shared::PgConnectionConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connects to the catalog database with a bounded connection pool.
pub async fn connect_to_catalog(
    config: &PgConnectionConfig,
    max_connections: u32,
) -> sqlx::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(config.with_db())
        .await
}
