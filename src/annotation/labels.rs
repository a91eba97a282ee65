//! Reading and writing labels files.
//!
//! A labels file is a JSON array with one record per label item, in creation
//! order. Each record carries the item id, its type, the vertices with the
//! closing vertex repeated, and one key per template field. Optional keys
//! hold covered pixels, the bounding rectangle, geographic vertices and the
//! image file name.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use super::document::{FieldValue, LabelDocument, LabelId, LabelItem};
use super::geo::{to_geo_coordinates, GeoTransform};
use super::geometry::Point;
use super::template::{OutputKeys, StyleOverrides, Template};
use crate::error::{AnnotationError, IoError, LabelsError};

/// Value of the item type key; polygons are the only label item type.
pub const POLYGON_ITEM_TYPE: &str = "polygon";

const LEGACY_UUID_KEY: &str = "overlay_item_uuid";
const LEGACY_VERTICES_KEY: &str = "overlay_item_vertices";

/// Key names and optional content of a labels file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelsFormat {
    pub keys: OutputKeys,
    pub include_pixels: bool,
    pub include_bounding_rect: bool,
}

impl LabelsFormat {
    pub fn from_template(template: &Template) -> Self {
        Self {
            keys: template.outputs.keys.clone(),
            include_pixels: template.outputs.include_mask,
            include_bounding_rect: template.outputs.include_bounding_rect,
        }
    }
}

/// Per-image values written alongside every record.
#[derive(Debug, Clone, Default)]
pub struct LabelsContext {
    pub image_filename: Option<String>,
    pub geo_transform: Option<GeoTransform>,
}

// ============================================================================
// Writing
// ============================================================================

/// Serialize a document to its labels JSON value.
///
/// # Errors
///
/// Returns `LabelsError::Annotation` when a vertex cannot be projected to
/// geographic coordinates.
pub fn labels_to_json(
    doc: &LabelDocument,
    format: &LabelsFormat,
    context: &LabelsContext,
) -> Result<Value, LabelsError> {
    let keys = &format.keys;

    let records = doc
        .items()
        .enumerate()
        .map(|(index, item)| {
            let mut record = Map::new();
            record.insert(keys.uuid.clone(), Value::String(item.id().to_string()));
            record.insert(keys.item_type.clone(), Value::from(POLYGON_ITEM_TYPE));
            record.insert(keys.vertices.clone(), json(&item.closed_vertices()));

            for (name, value) in item.fields() {
                record.insert(name.clone(), json(value));
            }
            if let Some(style) = item.style() {
                record.insert(keys.style.clone(), json(style));
            }
            if format.include_pixels {
                record.insert(keys.pixels.clone(), json(&item.covered_pixels()));
            }
            if format.include_bounding_rect {
                record.insert(
                    keys.bounding_rect.clone(),
                    json(&item.bounding_rect().corners()),
                );
            }
            if let Some(transform) = &context.geo_transform {
                let geo = to_geo_coordinates(transform, &item.closed_vertices()).map_err(
                    |e| LabelsError::Annotation {
                        index,
                        source: e.into(),
                    },
                )?;
                record.insert(keys.geo_transform.clone(), json(transform));
                record.insert(keys.geo_vertices.clone(), json(&geo));
            }
            if let Some(name) = &context.image_filename {
                record.insert(keys.image_filename.clone(), Value::from(name.as_str()));
            }

            Ok(Value::Object(record))
        })
        .collect::<Result<Vec<_>, LabelsError>>()?;

    Ok(Value::Array(records))
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Value {
    // every type written here serializes to plain JSON
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Write a labels file.
pub async fn save_labels(
    path: impl AsRef<Path>,
    doc: &LabelDocument,
    format: &LabelsFormat,
    context: &LabelsContext,
) -> Result<(), LabelsError> {
    let value = labels_to_json(doc, format, context)?;
    let text = serde_json::to_string_pretty(&value).map_err(|e| LabelsError::Json(e.to_string()))?;

    tokio::fs::write(path.as_ref(), text)
        .await
        .map_err(IoError::from)?;

    debug!(
        path = %path.as_ref().display(),
        items = doc.len(),
        "Saved labels"
    );
    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

/// Rebuild a document from labels JSON.
///
/// Ids and vertex order are kept as written. Legacy `overlay_item_uuid` and
/// `overlay_item_vertices` keys are read when the configured keys are absent.
/// Derived keys (pixels, bounding rect, geo data) are ignored; every other
/// key is a field value.
pub fn labels_from_json(value: &Value, format: &LabelsFormat) -> Result<LabelDocument, LabelsError> {
    let keys = &format.keys;
    let records = value
        .as_array()
        .ok_or_else(|| LabelsError::Json("labels file must hold a JSON array".to_string()))?;

    let mut doc = LabelDocument::new();
    for (index, record) in records.iter().enumerate() {
        let invalid = |reason: String| LabelsError::InvalidRecord { index, reason };
        let record = record
            .as_object()
            .ok_or_else(|| invalid("expected an object".to_string()))?;

        if let Some(kind) = record.get(&keys.item_type) {
            if !kind
                .as_str()
                .is_some_and(|k| k.eq_ignore_ascii_case(POLYGON_ITEM_TYPE))
            {
                return Err(invalid(format!("unsupported item type {kind}")));
            }
        }

        let id = match record.get(&keys.uuid).or_else(|| record.get(LEGACY_UUID_KEY)) {
            Some(Value::String(s)) => s
                .parse::<LabelId>()
                .map_err(|e| invalid(format!("invalid uuid {s:?}: {e}")))?,
            Some(other) => return Err(invalid(format!("invalid uuid {other}"))),
            None => LabelId::new_v4(),
        };

        let vertices: Vec<Point> = record
            .get(&keys.vertices)
            .or_else(|| record.get(LEGACY_VERTICES_KEY))
            .ok_or_else(|| invalid(format!("missing {}", keys.vertices)))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| invalid(format!("invalid vertices: {e}")))
            })?;

        let style = record
            .get(&keys.style)
            .map(|v| serde_json::from_value::<StyleOverrides>(v.clone()))
            .transpose()
            .map_err(|e| invalid(format!("invalid style: {e}")))?;

        let reserved = keys.reserved();
        let fields = record
            .iter()
            .filter(|(k, _)| {
                !reserved.contains(&k.as_str()) && *k != LEGACY_UUID_KEY && *k != LEGACY_VERTICES_KEY
            })
            .map(|(k, v)| {
                serde_json::from_value::<FieldValue>(v.clone())
                    .map(|value| (k.clone(), value))
                    .map_err(|_| invalid(format!("field {k:?} has unsupported value {v}")))
            })
            .collect::<Result<_, _>>()?;

        let annotation = |source: AnnotationError| LabelsError::Annotation { index, source };
        let item = LabelItem::new(id, vertices, fields)
            .map_err(|e| annotation(e.into()))?
            .with_style(style);
        doc.insert_item(item).map_err(|e| annotation(e.into()))?;
    }

    doc.clear_history();
    Ok(doc)
}

/// Read a labels file.
pub async fn load_labels(
    path: impl AsRef<Path>,
    format: &LabelsFormat,
) -> Result<LabelDocument, LabelsError> {
    let text = tokio::fs::read_to_string(path.as_ref())
        .await
        .map_err(IoError::from)?;
    let value: Value = serde_json::from_str(&text).map_err(|e| LabelsError::Json(e.to_string()))?;
    let doc = labels_from_json(&value, format)?;

    debug!(
        path = %path.as_ref().display(),
        items = doc.len(),
        "Loaded labels"
    );
    Ok(doc)
}
