//! Pixel to geographic coordinate conversion.

use serde::{Deserialize, Serialize};

use super::geometry::Point;
use crate::error::GeometryError;

/// A 3x3 projective transform from pixel space to geographic coordinates.
///
/// Stored row-major. Two-row affine matrices are accepted on input and
/// completed with `[0, 0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct GeoTransform([[f64; 3]; 3]);

impl GeoTransform {
    pub fn new(matrix: [[f64; 3]; 3]) -> Result<Self, String> {
        if matrix.iter().flatten().any(|v| !v.is_finite()) {
            return Err("matrix entries must be finite".to_string());
        }
        Ok(Self(matrix))
    }

    /// Parse a transform from an arbitrary JSON attribute value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }

    pub fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.0
    }

    /// Geographic position of the centre of the pixel at `point`.
    ///
    /// Returns `None` when the projective divisor vanishes.
    pub fn apply(&self, point: Point) -> Option<[f64; 2]> {
        let v = [point.x + 0.5, point.y + 0.5, 1.0];
        let row = |r: &[f64; 3]| r[0] * v[0] + r[1] * v[1] + r[2] * v[2];

        let w = row(&self.0[2]);
        if w == 0.0 || !w.is_finite() {
            return None;
        }
        Some([row(&self.0[0]) / w, row(&self.0[1]) / w])
    }
}

impl TryFrom<Vec<Vec<f64>>> for GeoTransform {
    type Error = String;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        if !(rows.len() == 2 || rows.len() == 3) {
            return Err(format!("expected 2 or 3 rows, got {}", rows.len()));
        }

        let mut matrix = [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        for (i, row) in rows.iter().enumerate() {
            matrix[i] = row
                .as_slice()
                .try_into()
                .map_err(|_| format!("row {i} has {} entries, expected 3", row.len()))?;
        }
        Self::new(matrix)
    }
}

impl From<GeoTransform> for Vec<Vec<f64>> {
    fn from(t: GeoTransform) -> Self {
        t.0.iter().map(|r| r.to_vec()).collect()
    }
}

/// Convert polygon vertices to geographic coordinates.
///
/// # Errors
///
/// Returns `GeometryError::DegenerateProjection` naming the first vertex whose
/// projective divisor is zero.
pub fn to_geo_coordinates(
    transform: &GeoTransform,
    vertices: &[Point],
) -> Result<Vec<[f64; 2]>, GeometryError> {
    vertices
        .iter()
        .enumerate()
        .map(|(index, p)| {
            transform
                .apply(*p)
                .ok_or(GeometryError::DegenerateProjection { index })
        })
        .collect()
}
