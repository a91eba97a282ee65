//! Full-precision raster storage.
//!
//! A store is a directory with a `store.json` manifest and raw little-endian
//! sample files:
//!
//! ```text
//! store/
//!   store.json
//!   data.raw                 # level 0, row-major, channel-interleaved
//!   pyramid/data/1.raw       # persisted pyramid levels
//!   pyramid/data/2.raw
//! ```
//!
//! [`RasterStore`] opens one dataset of a store and serves windowed reads of
//! any of its available levels as `f64` samples.

mod create;
mod level_file;
pub mod manifest;
mod sample;
mod store;

pub use create::{create_dataset, import_image, NewDataset};
pub(crate) use level_file::LevelFile;
pub use manifest::SampleRange;
pub use sample::{ColorMode, SampleType};
pub use store::{DataLocator, LevelData, Persistence, RasterInfo, RasterStore, SampleWindow};
