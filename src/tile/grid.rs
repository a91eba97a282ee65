//! Partition of a level into display-safe tiles.

/// Default tile side in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 512;

/// Tile coordinates within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub level: usize,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub const fn new(level: usize, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }
}

/// Pixel rectangle of a tile, in level pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    /// Same rectangle in level-0 pixels.
    pub fn to_level0(&self, downsample: f64) -> Region {
        Region {
            x: self.x as f64 * downsample,
            y: self.y as f64 * downsample,
            width: self.width as f64 * downsample,
            height: self.height as f64 * downsample,
        }
    }
}

/// An axis-aligned region with fractional bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region spanning two corners.
    pub fn from_corners(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self::new(x0.min(x1), y0.min(y1), (x1 - x0).abs(), (y1 - y0).abs())
    }

    /// Divide every coordinate by `downsample`: level-0 to level pixels.
    pub fn scaled(&self, downsample: f64) -> Region {
        Region {
            x: self.x / downsample,
            y: self.y / downsample,
            width: self.width / downsample,
            height: self.height / downsample,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// Tile layout of one level.
///
/// Tiles exactly partition the level: interior tiles are `tile_size` square,
/// tiles on the right and bottom edges are cut to the level extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    level: usize,
    width: u32,
    height: u32,
    tile_size: u32,
}

impl TileGrid {
    pub fn new(level: usize, width: u32, height: u32, tile_size: u32) -> Self {
        Self {
            level,
            width,
            height,
            tile_size: tile_size.max(1),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Level extent in pixels.
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn tiles_x(&self) -> u32 {
        self.width.div_ceil(self.tile_size)
    }

    pub fn tiles_y(&self) -> u32 {
        self.height.div_ceil(self.tile_size)
    }

    /// Pixel rectangle of a tile, or `None` outside the grid.
    pub fn tile_rect(&self, x: u32, y: u32) -> Option<TileRect> {
        if x >= self.tiles_x() || y >= self.tiles_y() {
            return None;
        }
        let (px, py) = (x * self.tile_size, y * self.tile_size);
        Some(TileRect {
            x: px,
            y: py,
            width: self.tile_size.min(self.width - px),
            height: self.tile_size.min(self.height - py),
        })
    }

    /// Minimal set of tiles intersecting `region` (level pixels), row-major.
    ///
    /// The region is clamped to the level first; a region entirely outside
    /// yields no tiles.
    pub fn covering(&self, region: &Region) -> Vec<TileCoord> {
        if !region.is_finite() || self.width == 0 || self.height == 0 {
            return Vec::new();
        }

        let x0 = region.x.max(0.0).floor();
        let y0 = region.y.max(0.0).floor();
        let x1 = (region.x + region.width).min(self.width as f64).ceil();
        let y1 = (region.y + region.height).min(self.height as f64).ceil();
        if x1 <= x0 || y1 <= y0 {
            return Vec::new();
        }

        let ts = self.tile_size;
        let (tx0, ty0) = (x0 as u32 / ts, y0 as u32 / ts);
        let (tx1, ty1) = ((x1 as u32 - 1) / ts, (y1 as u32 - 1) / ts);

        let mut tiles = Vec::with_capacity(((tx1 - tx0 + 1) * (ty1 - ty0 + 1)) as usize);
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                tiles.push(TileCoord::new(self.level, tx, ty));
            }
        }
        tiles
    }
}
