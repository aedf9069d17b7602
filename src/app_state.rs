use std::path::PathBuf;

use crate::{
    cache::TileCache,
    config::Config,
    service::TileService,
    store::{PgTileStore, TileStore},
};

pub struct AppState<S = PgTileStore> {
    pub tiles: TileService<S>,
    pub static_dir: PathBuf,
    pub max_zoom: u32,
    pub cache_control: String,
}

impl<S: TileStore> AppState<S> {
    pub fn new(config: &Config, store: S) -> Self {
        let cache = TileCache::new(config.cache.capacity, config.cache.ttl);
        let tiles = TileService::new(cache, config.selector, store)
            .coalesce_misses(config.cache.coalesce_misses);

        AppState {
            tiles,
            static_dir: config.static_dir.clone(),
            max_zoom: config.max_zoom,
            cache_control: config.cache_control(),
        }
    }
}
