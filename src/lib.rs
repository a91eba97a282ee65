//! # pyramid-label
//!
//! Tiled multi-resolution viewing and polygon annotation of very large,
//! high-bit-depth rasters.
//!
//! Rasters of tens of thousands of pixels per side, with up to 32-bit
//! samples, are kept at full precision in a store on disk. Display happens
//! through a lazily built pyramid and a viewport-driven tile scheduler that
//! maps only what is visible to 8-bit, so every contrast change re-maps the
//! original samples. Label polygons live in level-0 pixel space, independent
//! of the displayed level, and are written out as labels files and masks.
//!
//! ## Features
//!
//! - **Full-precision store**: 8 to 64-bit integer and float samples, gray or RGB
//! - **Lazy pyramid**: area-averaged levels built on demand and persisted
//! - **Tile scheduling**: minimal tile cover per viewport, background loading,
//!   size-bounded residency
//! - **Display mapping**: clip, rescale and gamma to 8-bit without touching the source
//! - **Annotation**: validated polygon editing, class masks, geo-coordinates
//!
//! ## Architecture
//!
//! - [`io`] - Byte-range access to files and memory
//! - [`raster`] - Store layout, manifest and windowed sample reads
//! - [`pyramid`] - Level ladder layout and the lazy builder
//! - [`display`] - Full-precision to 8-bit mapping
//! - [`tile`] - Tile grid, resident cache and the viewport scheduler
//! - [`annotation`] - Label polygons, templates, labels files, masks, overlays
//! - [`config`] - CLI and pipeline configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pyramid_label::{
//!     DataLocator, PyramidBuilder, PyramidConfig, RasterStore, Region, SchedulerConfig,
//!     TileScheduler, ViewportRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RasterStore::open("scene.store", &DataLocator::new("data")).await?;
//!     let builder = PyramidBuilder::new(PyramidConfig::default());
//!     let scheduler =
//!         TileScheduler::new(Arc::new(store), Arc::new(builder), SchedulerConfig::default()).await;
//!
//!     scheduler
//!         .set_viewport(ViewportRequest {
//!             downsample: 8.0,
//!             region: Region::new(0.0, 0.0, 4096.0, 4096.0),
//!         })
//!         .await?;
//!     scheduler.settle().await;
//!
//!     let frame = scheduler.frame().await;
//!     println!("{} of {} tiles ready", frame.ready_count(), frame.tiles.len());
//!     Ok(())
//! }
//! ```

pub mod annotation;
pub mod config;
pub mod display;
pub mod error;
pub mod io;
pub mod pyramid;
pub mod raster;
pub mod tile;

// Re-export commonly used types
pub use annotation::{
    BoundingRect, ClassCodes, FieldDescriptor, FieldValue, GeoTransform, LabelDocument, LabelId,
    LabelItem, LabelsFormat, Mask, OverlayItem, Point, Template,
};
pub use config::{Cli, Command, PipelineConfig};
pub use display::{map_window, DisplayBuffer, DisplayTransform, PixelFormat};
pub use error::{
    AnnotationError, BoundsError, DisplayError, FormatError, GeometryError, IoError,
    LabelsError, NotFoundError, PyramidError, ReadError, StorageError, TemplateError, TileError,
};
pub use io::{FileRangeReader, MemoryReader, RangeReader};
pub use pyramid::{PyramidBuilder, PyramidConfig, PyramidLayout, PyramidLevel};
pub use raster::{
    create_dataset, import_image, ColorMode, DataLocator, NewDataset, RasterInfo, RasterStore,
    SampleRange, SampleType, SampleWindow,
};
pub use tile::{
    Frame, Region, SchedulerConfig, TileCache, TileGrid, TileScheduler, TileStatus,
    ViewportRequest,
};
