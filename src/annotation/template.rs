//! Annotation templates.
//!
//! A template describes the fields an analyst fills in for every label item,
//! where the image lives inside its store, how label items are drawn, and
//! how the labels file is written. It is read once and resolved into typed
//! values; nothing downstream looks at raw JSON.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use super::document::FieldValue;
use super::mask::ClassCodes;
use crate::error::{IoError, TemplateError};
use crate::raster::DataLocator;

// ============================================================================
// Fields
// ============================================================================

/// One input field of the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDescriptor {
    /// Free text (`lineedit`)
    FreeText {
        label: String,
        tooltip: Option<String>,
    },
    /// Exactly one of a fixed set of options (`combobox`)
    Combobox {
        label: String,
        options: Vec<String>,
        tooltip: Option<String>,
    },
    /// Any subset of a fixed set of options (`checklist`)
    Checklist {
        label: String,
        options: Vec<String>,
        tooltip: Option<String>,
    },
}

impl FieldDescriptor {
    pub fn label(&self) -> &str {
        match self {
            FieldDescriptor::FreeText { label, .. }
            | FieldDescriptor::Combobox { label, .. }
            | FieldDescriptor::Checklist { label, .. } => label,
        }
    }

    pub fn tooltip(&self) -> Option<&str> {
        match self {
            FieldDescriptor::FreeText { tooltip, .. }
            | FieldDescriptor::Combobox { tooltip, .. }
            | FieldDescriptor::Checklist { tooltip, .. } => tooltip.as_deref(),
        }
    }

    /// Value a new label item starts with.
    pub fn default_value(&self) -> FieldValue {
        match self {
            FieldDescriptor::FreeText { .. } => FieldValue::Text(String::new()),
            FieldDescriptor::Combobox { options, .. } => {
                FieldValue::Text(options.first().cloned().unwrap_or_default())
            }
            FieldDescriptor::Checklist { options, .. } => {
                FieldValue::Checks(options.iter().map(|o| (o.clone(), false)).collect())
            }
        }
    }

    /// Check that a value has the shape this field expects.
    pub fn accepts(&self, value: &FieldValue) -> Result<(), TemplateError> {
        let unknown = |value: &str| TemplateError::UnknownOption {
            field: self.label().to_string(),
            value: value.to_string(),
        };
        match (self, value) {
            (FieldDescriptor::FreeText { .. }, FieldValue::Text(_)) => Ok(()),
            (FieldDescriptor::Combobox { options, .. }, FieldValue::Text(v)) => {
                if options.iter().any(|o| o == v) {
                    Ok(())
                } else {
                    Err(unknown(v))
                }
            }
            (FieldDescriptor::Checklist { options, .. }, FieldValue::Checks(checks)) => {
                match checks.keys().find(|k| !options.contains(k)) {
                    Some(k) => Err(unknown(k)),
                    None => Ok(()),
                }
            }
            (_, FieldValue::Text(v)) => Err(unknown(v)),
            (_, FieldValue::Checks(_)) => Err(unknown("<checklist>")),
        }
    }
}

// ============================================================================
// Style
// ============================================================================

/// Drawing style of label items.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemStyle {
    pub line_width: f64,
    pub vertex_diameter: f64,
    pub line_color: [u8; 4],
    pub vertex_color: [u8; 4],
}

impl Default for ItemStyle {
    fn default() -> Self {
        Self {
            line_width: 1.0,
            vertex_diameter: 3.0,
            line_color: [255, 0, 255, 150],
            vertex_color: [0, 0, 255, 255],
        }
    }
}

impl ItemStyle {
    /// This style with any set override applied.
    pub fn with_overrides(&self, overrides: &StyleOverrides) -> Self {
        Self {
            line_width: overrides.line_width.unwrap_or(self.line_width),
            vertex_diameter: overrides.vertex_diameter.unwrap_or(self.vertex_diameter),
            line_color: overrides.line_color.unwrap_or(self.line_color),
            vertex_color: overrides.vertex_color.unwrap_or(self.vertex_color),
        }
    }
}

/// Partial style, as given in a template or on a single item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_diameter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_color: Option<[u8; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_color: Option<[u8; 4]>,
}

// ============================================================================
// Outputs
// ============================================================================

/// Key names used in the labels file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputKeys {
    pub uuid: String,
    pub vertices: String,
    pub item_type: String,
    pub pixels: String,
    pub bounding_rect: String,
    pub style: String,
    pub geo_transform: String,
    pub geo_vertices: String,
    pub image_filename: String,
}

impl Default for OutputKeys {
    fn default() -> Self {
        Self {
            uuid: "label_item_uuid".to_string(),
            vertices: "label_item_vertices".to_string(),
            item_type: "label_item_type".to_string(),
            pixels: "label_item_pixels".to_string(),
            bounding_rect: "label_item_bounding_rect".to_string(),
            style: "label_item_style".to_string(),
            geo_transform: "geo_transform".to_string(),
            geo_vertices: "geo_vertices".to_string(),
            image_filename: "image_filename".to_string(),
        }
    }
}

impl OutputKeys {
    /// Apply `default_output_keys` overrides. `overlay_item_*` names are
    /// accepted for the uuid and vertices keys.
    fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        let pick = |names: &[&str]| names.iter().find_map(|n| overrides.get(*n)).cloned();

        if let Some(k) = pick(&["label_item_uuid", "overlay_item_uuid"]) {
            self.uuid = k;
        }
        if let Some(k) = pick(&["label_item_vertices", "overlay_item_vertices"]) {
            self.vertices = k;
        }
        if let Some(k) = pick(&["label_item_type"]) {
            self.item_type = k;
        }
        if let Some(k) = pick(&["label_item_pixels"]) {
            self.pixels = k;
        }
        if let Some(k) = pick(&["label_item_bounding_rect"]) {
            self.bounding_rect = k;
        }
        if let Some(k) = pick(&["geo_transform"]) {
            self.geo_transform = k;
        }
        if let Some(k) = pick(&["geo_vertices"]) {
            self.geo_vertices = k;
        }
        if let Some(k) = pick(&["image_filename"]) {
            self.image_filename = k;
        }
        self
    }

    /// Every key the labels format owns; anything else in a record is a field.
    pub fn reserved(&self) -> [&str; 9] {
        [
            &self.uuid,
            &self.vertices,
            &self.item_type,
            &self.pixels,
            &self.bounding_rect,
            &self.style,
            &self.geo_transform,
            &self.geo_vertices,
            &self.image_filename,
        ]
    }
}

/// What the labels file and mask export contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputOptions {
    /// Write covered pixels per item and export a class mask
    pub include_mask: bool,
    pub include_bounding_rect: bool,
    /// Combobox field that classifies the mask
    pub mask_label: Option<String>,
    pub labels_extension: String,
    pub keys: OutputKeys,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            include_mask: false,
            include_bounding_rect: false,
            mask_label: None,
            labels_extension: ".labels.json".to_string(),
            keys: OutputKeys::default(),
        }
    }
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub fields: Vec<FieldDescriptor>,
    pub locator: DataLocator,
    pub style: ItemStyle,
    pub outputs: OutputOptions,
}

#[derive(Deserialize)]
struct RawTemplate {
    template_info: Option<Vec<RawField>>,
    image_info: Option<RawImageInfo>,
    label_item_options: Option<StyleOverrides>,
    overlay_item_options: Option<StyleOverrides>,
    outputs_options: Option<RawOutputs>,
}

#[derive(Deserialize)]
struct RawField {
    #[serde(rename = "type")]
    kind: String,
    label: String,
    #[serde(default)]
    options: Vec<String>,
    tooltip: Option<String>,
}

#[derive(Deserialize)]
struct RawImageInfo {
    data_path: String,
    geo_transform: Option<String>,
}

#[derive(Deserialize)]
struct RawOutputs {
    #[serde(default, deserialize_with = "flag")]
    include_mask: bool,
    #[serde(default, deserialize_with = "flag")]
    include_bounding_rect: bool,
    mask_label: Option<String>,
    default_labels_extension: Option<String>,
    #[serde(default)]
    default_output_keys: BTreeMap<String, String>,
}

/// Accept `true`, `"true"` and their false counterparts.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s.eq_ignore_ascii_case("true"),
    })
}

impl Template {
    /// Parse and resolve a template.
    ///
    /// # Errors
    ///
    /// - `MissingKey` when `template_info` or `image_info` is absent
    /// - `UnknownFieldType` for a field type other than lineedit, combobox
    ///   or checklist
    pub fn from_json(text: &str) -> Result<Self, TemplateError> {
        let raw: RawTemplate =
            serde_json::from_str(text).map_err(|e| TemplateError::Json(e.to_string()))?;

        let raw_fields = raw
            .template_info
            .ok_or(TemplateError::MissingKey("template_info"))?;
        let image = raw
            .image_info
            .ok_or(TemplateError::MissingKey("image_info"))?;

        let fields = raw_fields
            .into_iter()
            .map(|f| {
                let RawField {
                    kind,
                    label,
                    options,
                    tooltip,
                } = f;
                match kind.to_ascii_lowercase().as_str() {
                    "lineedit" => Ok(FieldDescriptor::FreeText { label, tooltip }),
                    "combobox" => Ok(FieldDescriptor::Combobox {
                        label,
                        options,
                        tooltip,
                    }),
                    "checklist" => Ok(FieldDescriptor::Checklist {
                        label,
                        options,
                        tooltip,
                    }),
                    _ => Err(TemplateError::UnknownFieldType { label, kind }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let locator = DataLocator {
            data_path: image.data_path,
            geo_transform_key: Some(image.geo_transform.unwrap_or_else(|| "geo_transform".to_string())),
        };

        // legacy overlay_item_options first so label_item_options wins
        let mut style = ItemStyle::default();
        for overrides in [raw.overlay_item_options, raw.label_item_options].iter().flatten() {
            style = style.with_overrides(overrides);
        }

        let outputs = match raw.outputs_options {
            Some(o) => OutputOptions {
                include_mask: o.include_mask,
                include_bounding_rect: o.include_bounding_rect,
                mask_label: o.mask_label,
                labels_extension: o
                    .default_labels_extension
                    .unwrap_or_else(|| OutputOptions::default().labels_extension),
                keys: OutputKeys::default().with_overrides(&o.default_output_keys),
            },
            None => OutputOptions::default(),
        };

        Ok(Self {
            fields,
            locator,
            style,
            outputs,
        })
    }

    /// Read and resolve a template file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let text = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(IoError::from)?;
        Self::from_json(&text)
    }

    pub fn field(&self, label: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.label() == label)
    }

    /// Initial field values of a new label item.
    pub fn default_values(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|f| (f.label().to_string(), f.default_value()))
            .collect()
    }

    /// Mask class codes of a combobox field: option position + 1, with 0 as
    /// background.
    pub fn class_codes(&self, label: &str) -> Result<ClassCodes, TemplateError> {
        match self.field(label) {
            Some(FieldDescriptor::Combobox { options, .. }) => Ok(ClassCodes::from_options(options)),
            Some(_) => Err(TemplateError::NotCategorical(label.to_string())),
            None => Err(TemplateError::UnknownField(label.to_string())),
        }
    }

    /// Class codes of the template's `mask_label` field, if one is set.
    pub fn mask_codes(&self) -> Option<Result<ClassCodes, TemplateError>> {
        self.outputs
            .mask_label
            .as_deref()
            .map(|label| self.class_codes(label))
    }
}
