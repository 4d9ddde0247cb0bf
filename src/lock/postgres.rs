use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use super::{LockError, LockService};

/// Lock service backed by a `service_locks` table shared by all broker processes.
///
/// A lock row can be taken over once its `expires_at` has passed, which bounds
/// how long a crashed broker can block an instance.
#[derive(Clone)]
pub struct PostgresLockService {
    pool: PgPool,
}

impl PostgresLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply the lock table migration
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to lock database")?;

        let service = Self::new(pool);
        service.migrate().await?;
        Ok(service)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run lock table migrations")?;
        info!("Lock table migrations applied");
        Ok(())
    }
}

fn unavailable(err: sqlx::Error) -> LockError {
    LockError::Unavailable(Box::new(err))
}

#[async_trait]
impl LockService for PostgresLockService {
    async fn lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let result = sqlx::query(
            r#"
            INSERT INTO service_locks (key, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key)
            DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE service_locks.owner = EXCLUDED.owner
               OR service_locks.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(LockError::Collision {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM service_locks WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
