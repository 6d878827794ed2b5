//! Пул соединений Postgres и миграции схемы броней.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;

static MIGRATOR: Migrator = sqlx::migrate!("./src/migrations");

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Таймаут ожидания соединения из пула берется из конфига: его истечение
    /// превращается в `StorageError::Unavailable`, а не в конфликт.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        info!(
            pool_size = config.pool_size,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "Database pool ready"
        );
        Ok(Database { pool })
    }

    pub async fn migrate(&self) -> Result<(), MigrateError> {
        info!(
            migrations = MIGRATOR.iter().count(),
            "Applying reservation schema migrations"
        );
        MIGRATOR.run(&self.pool).await?;
        info!("Migrations completed");
        Ok(())
    }
}
