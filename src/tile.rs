use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Highest zoom level the request layer will ever accept, regardless of config.
/// Keeps `2^zoom` and the tile indices inside the backend's signed 32-bit range.
pub const ZOOM_LIMIT: u32 = 30;

/// How the points of a tile should be rendered
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Cluster,
    Raw,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Cluster => "cluster",
            RenderMode::Raw => "raw",
        }
    }
}

/// Identity of a cacheable tile.
///
/// Coordinates are not range checked here; see [`validate_tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
    pub mode: RenderMode,
}

impl TileKey {
    pub fn new(zoom: u32, x: u32, y: u32, mode: RenderMode) -> Self {
        Self { zoom, x, y, mode }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} ({})", self.zoom, self.x, self.y, self.mode.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidTile {
    #[error("zoom {zoom} is above the maximum of {max}")]
    ZoomTooLarge { zoom: u32, max: u32 },
    #[error("tile {x}/{y} is outside the {size}x{size} grid of zoom {zoom}")]
    OutOfGrid { zoom: u32, x: u32, y: u32, size: u64 },
}

/// Checks a requested tile against the slippy map grid.
///
/// `max_zoom` is clamped to [`ZOOM_LIMIT`].
pub fn validate_tile(zoom: u32, x: u32, y: u32, max_zoom: u32) -> Result<(), InvalidTile> {
    let max = max_zoom.min(ZOOM_LIMIT);
    if zoom > max {
        return Err(InvalidTile::ZoomTooLarge { zoom, max });
    }

    let size = 1u64 << zoom;
    if u64::from(x) >= size || u64::from(y) >= size {
        return Err(InvalidTile::OutOfGrid { zoom, x, y, size });
    }

    Ok(())
}
