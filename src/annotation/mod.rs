//! Polygon annotation in level-0 pixel space.
//!
//! Label items are edited through [`LabelDocument`], described by a
//! [`Template`], and written to labels files with [`save_labels`]. Masks,
//! bounding rectangles and geographic coordinates are derived from the
//! stored level-0 vertices and never depend on the displayed level.

mod document;
mod geo;
mod geometry;
mod labels;
mod mask;
mod overlay;
mod template;

pub use document::{FieldValue, LabelDocument, LabelId, LabelItem};
pub use geo::{to_geo_coordinates, GeoTransform};
pub use geometry::{covered_pixels, fill_spans, level_position, BoundingRect, Point};
pub use labels::{
    labels_from_json, labels_to_json, load_labels, save_labels, LabelsContext, LabelsFormat,
    POLYGON_ITEM_TYPE,
};
pub use mask::{ClassCodes, Mask};
pub use overlay::{load_overlay, parse_overlay, LineStyle, OverlayItem, DEFAULT_OVERLAY_COLOR};
pub use template::{
    FieldDescriptor, ItemStyle, OutputKeys, OutputOptions, StyleOverrides, Template,
};
