use thiserror::Error;

use crate::tile::RenderMode;

#[derive(Error, Debug, PartialEq)]
pub enum QueryConfigError {
    #[error("grid step must be a finite non-negative number, got {0}")]
    Step(f64),
    #[error("grid floor must be a finite positive number, got {0}")]
    Floor(f64),
    #[error("grid base must be a finite number, got {0}")]
    Base(f64),
    #[error("reference point {lon},{lat} is not a valid lon/lat")]
    ReferencePoint { lon: f64, lat: f64 },
}

/// Sizing of the clustering buckets: `max(min, base - step * zoom)` metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterGrid {
    base_meters: f64,
    step_meters: f64,
    min_meters: f64,
}

impl ClusterGrid {
    pub fn new(
        base_meters: f64,
        step_meters: f64,
        min_meters: f64,
    ) -> Result<Self, QueryConfigError> {
        if !base_meters.is_finite() {
            return Err(QueryConfigError::Base(base_meters));
        }
        // a negative step would make buckets grow when zooming in
        if !step_meters.is_finite() || step_meters < 0.0 {
            return Err(QueryConfigError::Step(step_meters));
        }
        if !min_meters.is_finite() || min_meters <= 0.0 {
            return Err(QueryConfigError::Floor(min_meters));
        }

        Ok(Self {
            base_meters,
            step_meters,
            min_meters,
        })
    }

    pub fn meters_at(&self, zoom: u32) -> f64 {
        (self.base_meters - self.step_meters * f64::from(zoom)).max(self.min_meters)
    }
}

/// Point that raw features measure their distance from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePoint {
    pub lon: f64,
    pub lat: f64,
}

impl ReferencePoint {
    pub fn new(lon: f64, lat: f64) -> Result<Self, QueryConfigError> {
        if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
            return Err(QueryConfigError::ReferencePoint { lon, lat });
        }
        Ok(Self { lon, lat })
    }
}

/// Which backend query to run for a tile, with its parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryPlan {
    Cluster { grid_meters: f64 },
    Raw { reference: ReferencePoint },
}

impl QueryPlan {
    pub fn name(&self) -> &'static str {
        match self {
            QueryPlan::Cluster { .. } => "cluster",
            QueryPlan::Raw { .. } => "raw",
        }
    }
}

/// Chooses between the clustering and the raw point query.
///
/// Clustering only applies up to `cluster_max_zoom`; past it every request gets
/// raw points, even when clustering was asked for. Zoom is not validated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuerySelector {
    cluster_max_zoom: u32,
    grid: ClusterGrid,
    reference: ReferencePoint,
}

impl QuerySelector {
    pub fn new(cluster_max_zoom: u32, grid: ClusterGrid, reference: ReferencePoint) -> Self {
        Self {
            cluster_max_zoom,
            grid,
            reference,
        }
    }

    pub fn select(&self, zoom: u32, mode: RenderMode) -> QueryPlan {
        match mode {
            RenderMode::Cluster if zoom <= self.cluster_max_zoom => QueryPlan::Cluster {
                grid_meters: self.grid.meters_at(zoom),
            },
            _ => QueryPlan::Raw {
                reference: self.reference,
            },
        }
    }

    pub fn cluster_max_zoom(&self) -> u32 {
        self.cluster_max_zoom
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn selector() -> QuerySelector {
        QuerySelector::new(
            11,
            ClusterGrid::new(100_000.0, 8_000.0, 1_000.0).unwrap(),
            ReferencePoint::new(0.0, 0.0).unwrap(),
        )
    }

    #[test]
    fn test_threshold() {
        let s = selector();

        assert!(matches!(
            s.select(11, RenderMode::Cluster),
            QueryPlan::Cluster { .. }
        ));
        assert!(matches!(s.select(12, RenderMode::Cluster), QueryPlan::Raw { .. }));
        for zoom in [0, 5, 11, 12, 22] {
            assert!(matches!(s.select(zoom, RenderMode::Raw), QueryPlan::Raw { .. }));
        }
    }

    #[test]
    fn test_grid_sizes() {
        let s = selector();

        assert_eq!(
            s.select(0, RenderMode::Cluster),
            QueryPlan::Cluster {
                grid_meters: 100_000.0
            }
        );
        assert_eq!(
            s.select(10, RenderMode::Cluster),
            QueryPlan::Cluster {
                grid_meters: 20_000.0
            }
        );
    }

    #[test]
    fn test_grid_floor() {
        let grid = ClusterGrid::new(10_000.0, 2_000.0, 500.0).unwrap();

        assert_eq!(grid.meters_at(4), 2_000.0);
        assert_eq!(grid.meters_at(5), 500.0);
        assert_eq!(grid.meters_at(u32::MAX), 500.0);
    }

    #[test]
    fn test_raw_uses_reference_point() {
        let reference = ReferencePoint::new(13.4, 52.5).unwrap();
        let s = QuerySelector::new(
            11,
            ClusterGrid::new(100_000.0, 8_000.0, 1_000.0).unwrap(),
            reference,
        );

        assert_eq!(s.select(14, RenderMode::Cluster), QueryPlan::Raw { reference });
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(
            ClusterGrid::new(1000.0, -1.0, 10.0),
            Err(QueryConfigError::Step(-1.0))
        );
        assert_eq!(
            ClusterGrid::new(1000.0, 1.0, 0.0),
            Err(QueryConfigError::Floor(0.0))
        );
        assert!(ClusterGrid::new(f64::NAN, 1.0, 1.0).is_err());
        assert!(ReferencePoint::new(181.0, 0.0).is_err());
        assert!(ReferencePoint::new(0.0, -90.5).is_err());
    }

    proptest! {
        #[test]
        fn prop_grid_never_grows_when_zooming_in(
            base in 0.0f64..1e7,
            step in 0.0f64..1e6,
            min in 1.0f64..1e4,
            z1 in 0u32..=11,
            z2 in 0u32..=11,
        ) {
            let (lo, hi) = (z1.min(z2), z1.max(z2));
            let grid = ClusterGrid::new(base, step, min).unwrap();
            let s = QuerySelector::new(11, grid, ReferencePoint::new(0.0, 0.0).unwrap());

            let QueryPlan::Cluster { grid_meters: at_lo } = s.select(lo, RenderMode::Cluster) else {
                panic!("expected cluster plan at zoom {lo}");
            };
            let QueryPlan::Cluster { grid_meters: at_hi } = s.select(hi, RenderMode::Cluster) else {
                panic!("expected cluster plan at zoom {hi}");
            };

            prop_assert!(at_lo >= at_hi);
            prop_assert!(at_hi >= min);
        }
    }
}
