//! Relay storage.

mod api;
pub use api::StorageApi;

pub mod crypt;

mod memory;
pub use memory::InMemoryStorage;

mod pg;
pub use pg::PgStorage;

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Relay storage interface. Cheap to clone; all components share one
/// backend.
#[derive(Debug, Clone)]
pub struct RelayStorage {
    inner: Arc<dyn StorageApi>,
}

impl RelayStorage {
    /// Creates [`RelayStorage`] with a Postgres backend, connecting the
    /// writer and reader pools separately.
    pub async fn connect_pg(
        writer_url: &str,
        reader_url: &str,
        secret: &str,
    ) -> Result<Self, crate::error::StorageError> {
        let writer = PgPoolOptions::new().max_connections(10).connect(writer_url).await?;
        let reader = PgPoolOptions::new().max_connections(10).connect(reader_url).await?;
        Ok(Self { inner: Arc::new(PgStorage::new(writer, reader, secret)) })
    }

    /// Creates [`RelayStorage`] with an in-memory backend. Used for testing
    /// only.
    pub fn in_memory(secret: &str) -> Self {
        Self { inner: Arc::new(InMemoryStorage::new(secret)) }
    }
}

impl std::ops::Deref for RelayStorage {
    type Target = dyn StorageApi;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}
