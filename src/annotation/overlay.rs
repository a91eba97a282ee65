//! Read-only overlay items.
//!
//! Overlays are reference shapes drawn over the image and never edited.
//! An item is a polygon when its first vertex equals its last, otherwise a
//! polyline.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::geometry::Point;
use crate::error::{IoError, LabelsError};

pub const DEFAULT_OVERLAY_COLOR: [u8; 4] = [255, 0, 255, 255];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineStyle {
    #[default]
    Solid,
    Dashed,
    Dotted,
}

impl LineStyle {
    /// Parse a style name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "solid" => Some(LineStyle::Solid),
            "dashed" => Some(LineStyle::Dashed),
            "dotted" => Some(LineStyle::Dotted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem {
    pub vertices: Vec<Point>,
    pub color: [u8; 4],
    pub style: LineStyle,
    /// `None` draws with the label line width
    pub line_width: Option<f64>,
}

impl OverlayItem {
    pub fn is_closed(&self) -> bool {
        self.vertices.len() > 1 && self.vertices.first() == self.vertices.last()
    }
}

#[derive(Deserialize)]
struct RawOverlay {
    vertices: Option<Vec<Point>>,
    overlay_item_vertices: Option<Vec<Point>>,
    color: Option<[u8; 4]>,
    style: Option<String>,
    line_width: Option<f64>,
}

/// Parse an overlay file's JSON value.
///
/// # Errors
///
/// `LabelsError::InvalidRecord` when a record is not an object of the
/// expected shape or has no vertices.
pub fn parse_overlay(value: &Value) -> Result<Vec<OverlayItem>, LabelsError> {
    let records = value
        .as_array()
        .ok_or_else(|| LabelsError::Json("overlay file must hold a JSON array".to_string()))?;

    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let invalid = |reason: String| LabelsError::InvalidRecord { index, reason };
            let raw: RawOverlay =
                serde_json::from_value(record.clone()).map_err(|e| invalid(e.to_string()))?;

            let vertices = raw
                .vertices
                .or(raw.overlay_item_vertices)
                .ok_or_else(|| invalid("missing vertices".to_string()))?;
            if vertices.iter().any(|p| !p.is_finite()) {
                return Err(invalid("vertex coordinates must be finite".to_string()));
            }

            let style = match raw.style.as_deref() {
                None => LineStyle::Solid,
                Some(name) => LineStyle::parse(name).unwrap_or_else(|| {
                    warn!(index, style = name, "Unknown overlay line style, drawing solid");
                    LineStyle::Solid
                }),
            };

            Ok(OverlayItem {
                vertices,
                color: raw.color.unwrap_or(DEFAULT_OVERLAY_COLOR),
                style,
                line_width: raw.line_width,
            })
        })
        .collect()
}

pub async fn load_overlay(path: impl AsRef<Path>) -> Result<Vec<OverlayItem>, LabelsError> {
    let text = tokio::fs::read_to_string(path.as_ref())
        .await
        .map_err(IoError::from)?;
    let value: Value = serde_json::from_str(&text).map_err(|e| LabelsError::Json(e.to_string()))?;
    parse_overlay(&value)
}
