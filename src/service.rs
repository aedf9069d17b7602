use std::{collections::hash_map::Entry, sync::Arc};

use ahash::HashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    cache::TileCache,
    query::QuerySelector,
    store::{StoreError, TileStore},
    tile::TileKey,
};

#[derive(Error, Debug)]
pub enum TileError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Shared(#[from] Arc<TileError>),
}

impl TileError {
    /// The underlying error, looking through errors shared between coalesced requests
    pub fn root(&self) -> &TileError {
        match self {
            TileError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.root(), TileError::Store(err) if err.is_unavailable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

type Flight = Arc<OnceCell<Result<Bytes, Arc<TileError>>>>;
type InFlight = Mutex<HashMap<TileKey, Flight>>;

/// A caller's share of an in-flight render.
///
/// Dropping it, whether the render finished or the request was cancelled,
/// takes the render out of the map once it is done or nobody else waits on it.
struct FlightGuard<'a> {
    in_flight: &'a InFlight,
    key: TileKey,
    cell: Flight,
}

impl<'a> FlightGuard<'a> {
    fn join(in_flight: &'a InFlight, key: TileKey) -> Self {
        let cell = match in_flight.lock().entry(key) {
            Entry::Occupied(entry) => {
                tracing::debug!("waiting for render already in flight");
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(Flight::default()).clone(),
        };

        Self {
            in_flight,
            key,
            cell,
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        // release our reference while locked, so the count seen by the next guard is exact
        let cell = std::mem::take(&mut self.cell);

        let is_current = in_flight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));
        // two references left means the map's and ours
        if is_current && (cell.initialized() || Arc::strong_count(&cell) == 2) {
            in_flight.remove(&self.key);
        }

        drop(cell);
    }
}

/// Serves tiles from the cache, rendering them with the store on a miss.
///
/// Neither lock (the cache's or the in-flight map's) is held while the store is
/// queried. Store failures are returned to the caller and never cached.
pub struct TileService<S> {
    cache: TileCache,
    selector: QuerySelector,
    store: S,
    /// misses currently being rendered, so concurrent requests for a tile share one query
    in_flight: InFlight,
    coalesce_misses: bool,
}

impl<S: TileStore> TileService<S> {
    pub fn new(cache: TileCache, selector: QuerySelector, store: S) -> Self {
        Self {
            cache,
            selector,
            store,
            in_flight: Default::default(),
            coalesce_misses: true,
        }
    }

    /// When disabled, every concurrent miss queries the store on its own
    pub fn coalesce_misses(mut self, enabled: bool) -> Self {
        self.coalesce_misses = enabled;
        self
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[tracing::instrument(skip_all, fields(tile = %key))]
    pub async fn get_tile(&self, key: TileKey) -> Result<(Bytes, CacheStatus), TileError> {
        if let Some(payload) = self.cache.get(&key) {
            tracing::debug!(bytes = payload.len(), "cache hit");
            return Ok((payload, CacheStatus::Hit));
        }

        let payload = if self.coalesce_misses {
            self.render_coalesced(key).await?
        } else {
            self.render(key).await?
        };

        tracing::debug!(bytes = payload.len(), "cache miss");
        Ok((payload, CacheStatus::Miss))
    }

    async fn render_coalesced(&self, key: TileKey) -> Result<Bytes, TileError> {
        let flight = FlightGuard::join(&self.in_flight, key);

        let result = flight
            .cell
            .get_or_init(|| async { self.render(key).await.map_err(Arc::new) })
            .await
            .clone();

        Ok(result?)
    }

    async fn render(&self, key: TileKey) -> Result<Bytes, TileError> {
        let plan = self.selector.select(key.zoom, key.mode);
        tracing::debug!(plan = plan.name(), "querying store");

        let payload = match self.store.fetch_tile(key, plan).await {
            Ok(payload) => payload.map(Bytes::from).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, plan = plan.name(), "failed to render tile");
                return Err(err.into());
            }
        };

        self.cache.set(key, payload.clone());
        Ok(payload)
    }
}
