//! Tiling and viewport scheduling.
//!
//! # Architecture
//!
//! The scheduler sits between the presentation surface and the raster:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Presentation surface           │
//! └────────────────────┬────────────────────┘
//!                      │ set_viewport / frame
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             TileScheduler               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │  DisplayMapper  │  │
//! │  │  (resident   │  │  (samples →     │  │
//! │  │   samples)   │  │   8-bit)        │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ loader task
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │     PyramidBuilder  →  RasterStore      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileGrid`]: partition of a level into tiles, covering sets for regions
//! - [`TileCache`]: LRU cache of resident tiles with size-based eviction
//! - [`TileScheduler`]: viewport to level and tiles, background loading, frames

mod cache;
mod grid;
mod scheduler;

pub use cache::{ResidentTile, TileCache, TileKey, DEFAULT_TILE_CACHE_CAPACITY};
pub use grid::{Region, TileCoord, TileGrid, TileRect, DEFAULT_TILE_SIZE};
pub use scheduler::{
    Frame, FrameTile, SchedulerConfig, SchedulerState, TileEvent, TileScheduler, TileStatus,
    ViewportPlan, ViewportRequest,
};
