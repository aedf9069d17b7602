use std::{
    fmt::Display, net::SocketAddr, num::NonZeroUsize, path::PathBuf, str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::{
    query::{ClusterGrid, QueryConfigError, QuerySelector, ReferencePoint},
    store::postgres::DbConfig,
    tile::ZOOM_LIMIT,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("query settings: {0}")]
    Query(#[from] QueryConfigError),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
    pub coalesce_misses: bool,
}

/// Everything the server reads from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub static_dir: PathBuf,
    pub db: DbConfig,
    pub cache: CacheConfig,
    pub max_zoom: u32,
    pub selector: QuerySelector,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the config through `lookup`, using the default for unset variables.
    /// A variable that is set but can't be parsed is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let pool_min: usize = env.get("DB_POOL_MIN", 1)?;
        let pool_max: usize = env.get("DB_POOL_MAX", 16)?;
        if pool_max == 0 || pool_max < pool_min {
            return Err(ConfigError::Invalid {
                name: "DB_POOL_MAX",
                value: pool_max.to_string(),
                reason: format!("must be at least 1 and at least DB_POOL_MIN ({pool_min})"),
            });
        }

        let db = DbConfig {
            url: env.get(
                "DB_URL",
                "postgresql://psql:password@db:5432/mydatabase".to_string(),
            )?,
            pool_min,
            pool_max,
            timeout: Duration::from_secs(env.get("DB_POOL_TIMEOUT_SECONDS", 5)?),
        };

        let cache = CacheConfig {
            capacity: env.get("TILE_CACHE_CAPACITY", NonZeroUsize::MIN.saturating_add(9_999))?,
            ttl: Duration::from_secs(env.get("TILE_CACHE_TTL_SECONDS", 300)?),
            coalesce_misses: env.get("TILE_COALESCE_MISSES", true)?,
        };

        let max_zoom: u32 = env.get("TILE_MAX_ZOOM", 22)?;
        if max_zoom > ZOOM_LIMIT {
            return Err(ConfigError::Invalid {
                name: "TILE_MAX_ZOOM",
                value: max_zoom.to_string(),
                reason: format!("must be at most {ZOOM_LIMIT}"),
            });
        }

        let grid = ClusterGrid::new(
            env.get("CLUSTER_GRID_BASE_METERS", 100_000.0)?,
            env.get("CLUSTER_GRID_STEP_METERS", 8_000.0)?,
            env.get("CLUSTER_GRID_MIN_METERS", 1_000.0)?,
        )?;
        let reference = ReferencePoint::new(
            env.get("REFERENCE_LON", 0.0)?,
            env.get("REFERENCE_LAT", 0.0)?,
        )?;
        let selector = QuerySelector::new(env.get("CLUSTER_MAX_ZOOM", 11)?, grid, reference);

        Ok(Self {
            bind_addr: env.get("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            static_dir: env.get("STATIC_DIR", PathBuf::from("frontend"))?,
            db,
            cache,
            max_zoom,
            selector,
        })
    }

    /// `Cache-Control` value for served tiles
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache.ttl.as_secs())
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.0)(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }
}
