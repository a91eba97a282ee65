//! Multi-resolution pyramid.
//!
//! Levels are derived from level 0 by repeated integer area averaging and
//! built lazily, the first time a viewport or caller needs them. Built levels
//! are persisted next to the source so later sessions skip the work.
//!
//! [`PyramidLayout`] answers geometry questions without touching data;
//! [`PyramidBuilder`] produces the levels.

mod builder;
mod layout;

pub use builder::{area_average, PyramidBuilder, PyramidConfig, PyramidLevel};
pub use layout::PyramidLayout;
pub use crate::raster::Persistence;
