use std::time::Duration;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use super::{StoreError, TileStore};
use crate::{query::QueryPlan, tile::TileKey};

/// Points in the tile with their distance in metres to the reference point ($4, $5)
const RAW_SQL: &str = "
WITH
    env AS (
        SELECT ST_TileEnvelope($1, $2, $3) AS geom_3857,
               ST_Transform(ST_TileEnvelope($1, $2, $3), 4326) AS geom_4326
    ),
    reference AS (
        SELECT ST_SetSRID(ST_MakePoint($4, $5), 4326)::geography AS geog
    ),
    mvtgeom AS (
        SELECT
            p.id,
            ST_Distance(p.geom::geography, reference.geog) AS distance_m,
            ST_AsMVTGeom(ST_Transform(p.geom, 3857), env.geom_3857, 4096, 64, true) AS geom
        FROM public.points p
        CROSS JOIN env
        CROSS JOIN reference
        WHERE p.geom && env.geom_4326 AND ST_Intersects(p.geom, env.geom_4326)
    )
SELECT ST_AsMVT(mvtgeom.*, 'points', 4096, 'geom') AS mvt FROM mvtgeom;
";

/// One feature per grid cell of $4 metres, at the centroid of its points
const CLUSTER_SQL: &str = "
WITH
    env AS (
        SELECT ST_TileEnvelope($1, $2, $3) AS geom_3857,
               ST_Transform(ST_TileEnvelope($1, $2, $3), 4326) AS geom_4326
    ),
    pts AS (
        SELECT ST_Transform(p.geom, 3857) AS geom
        FROM public.points p
        CROSS JOIN env
        WHERE p.geom && env.geom_4326 AND ST_Intersects(p.geom, env.geom_4326)
    ),
    clusters AS (
        SELECT ST_Centroid(ST_Collect(pts.geom)) AS geom, count(*) AS point_count
        FROM pts
        GROUP BY ST_SnapToGrid(pts.geom, $4::float8)
    ),
    mvtgeom AS (
        SELECT
            clusters.point_count,
            ST_AsMVTGeom(clusters.geom, env.geom_3857, 4096, 64, true) AS geom
        FROM clusters
        CROSS JOIN env
    )
SELECT ST_AsMVT(mvtgeom.*, 'points', 4096, 'geom') AS mvt FROM mvtgeom;
";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub pool_min: usize,
    pub pool_max: usize,
    /// how long to wait for a free connection, and for a new one to connect
    pub timeout: Duration,
}

/// [`TileStore`] backed by PostGIS through a connection pool.
///
/// Connections go back to the pool when the pooled object is dropped, so every
/// exit path of a query releases its connection.
#[derive(Clone)]
pub struct PgTileStore {
    pool: Pool,
}

impl PgTileStore {
    /// Builds the pool. No connection is opened until [`PgTileStore::warm_up`] or
    /// the first query.
    pub fn new(config: &DbConfig) -> Result<Self, StoreError> {
        let mut pool_config = PoolConfig::new(config.pool_max);
        pool_config.timeouts.wait = Some(config.timeout);
        pool_config.timeouts.create = Some(config.timeout);

        let mut cfg = Config::new();
        cfg.url = Some(config.url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(pool_config);

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        Ok(Self { pool })
    }

    /// Opens `min` connections at once and hands them back to the pool, so they
    /// stay around as idle connections
    pub async fn warm_up(&self, min: usize) -> Result<(), StoreError> {
        let mut conns = Vec::with_capacity(min);
        for _ in 0..min {
            conns.push(self.pool.get().await?);
        }

        tracing::info!(connections = conns.len(), "database pool warmed up");
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }
}

/// The backend takes tile coordinates as signed 32 bit integers
fn signed_coords(key: TileKey) -> Result<(i32, i32, i32), StoreError> {
    let convert = |v: u32| i32::try_from(v).map_err(|_| StoreError::CoordinateOutOfRange(key));
    Ok((convert(key.zoom)?, convert(key.x)?, convert(key.y)?))
}

#[async_trait::async_trait]
impl TileStore for PgTileStore {
    async fn fetch_tile(
        &self,
        key: TileKey,
        plan: QueryPlan,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let (z, x, y) = signed_coords(key)?;
        let conn = self.pool.get().await?;

        let row = match plan {
            QueryPlan::Cluster { grid_meters } => {
                let stmt = conn.prepare_cached(CLUSTER_SQL).await?;
                conn.query_opt(&stmt, &[&z, &x, &y, &grid_meters]).await?
            }
            QueryPlan::Raw { reference } => {
                let stmt = conn.prepare_cached(RAW_SQL).await?;
                conn.query_opt(&stmt, &[&z, &x, &y, &reference.lon, &reference.lat])
                    .await?
            }
        };

        match row {
            Some(row) => Ok(row.try_get::<_, Option<Vec<u8>>>(0)?),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }
}
