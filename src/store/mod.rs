pub mod postgres;

use thiserror::Error;

use crate::{query::QueryPlan, tile::TileKey};

#[cfg(test)]
use mockall::automock;

pub use self::postgres::PgTileStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not get a database connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("could not create the connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("tile {0} does not fit the database's integer range")]
    CoordinateOutOfRange(TileKey),
}

impl StoreError {
    /// Whether the database could not be reached at all, as opposed to a query failing
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Pool(_))
    }
}

/// Spatial database that renders tiles.
///
/// Payloads are opaque vector tile bytes; `None` means the query produced no row
/// or a NULL tile.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait TileStore: Send + Sync {
    async fn fetch_tile(
        &self,
        key: TileKey,
        plan: QueryPlan,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// checks that a connection can be acquired and used
    async fn ping(&self) -> Result<(), StoreError>;
}
