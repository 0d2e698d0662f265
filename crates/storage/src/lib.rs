//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub mod directory;
pub mod messaging;

pub use sqlx::PgPool;

pub use directory::{DirectoryRepository, PropertyContext, TimelineClient};
pub use messaging::{MessagingRepository, NewConversation, NewMessage};

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Build a pool without opening a connection until first use.
pub fn connect_lazy(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(database_url)?;
    Ok(StoragePool::new(pool))
}

/// Apply the bundled migrations to the connected database.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool.pool()).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::env;

    use super::{connect, migrate, StoragePool};

    /// Connect to the test database when one is configured.
    pub async fn test_pool(test_name: &str) -> anyhow::Result<Option<StoragePool>> {
        let database_url =
            match env::var("HOMEWARD_TEST_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
                Ok(url) => url,
                Err(_) => {
                    eprintln!(
                        "skipping {test_name}: set HOMEWARD_TEST_DATABASE_URL or DATABASE_URL"
                    );
                    return Ok(None);
                }
            };
        let pool = connect(&database_url).await?;
        migrate(&pool).await?;
        Ok(Some(pool))
    }
}
