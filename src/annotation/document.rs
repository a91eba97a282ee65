//! The annotation document: label polygons and their edits.
//!
//! All vertices are level-0 pixel coordinates. Every edit is validated on a
//! candidate vertex list and only committed when it passes, so a failed edit
//! leaves the document exactly as it was.
//!
//! Committed edits are recorded as their inverse on an undo stack, so any
//! sequence of edits can be stepped back and forth with
//! [`LabelDocument::undo`] and [`LabelDocument::redo`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::geo::{to_geo_coordinates, GeoTransform};
use super::geometry::{covered_pixels, BoundingRect, Point};
use super::mask::{rasterize, ClassCodes, Mask};
use super::template::StyleOverrides;
use crate::error::{AnnotationError, GeometryError, NotFoundError};

// ============================================================================
// Identifiers and Values
// ============================================================================

/// Unique identifier of a label item (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(Uuid);

impl LabelId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for LabelId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LabelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Value of one template field on a label item.
///
/// Free text and combobox fields hold text; checklists map each option to
/// whether it is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Checks(BTreeMap<String, bool>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Checks(_) => None,
        }
    }
}

// ============================================================================
// Label Item
// ============================================================================

/// A closed polygon with its field values.
///
/// The polygon is implicitly closed: the last vertex connects back to the
/// first, which is never repeated in `vertices`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelItem {
    id: LabelId,
    vertices: Vec<Point>,
    fields: BTreeMap<String, FieldValue>,
    style: Option<StyleOverrides>,
}

impl LabelItem {
    /// Build an item from raw vertices.
    ///
    /// Consecutive duplicates are collapsed and a trailing copy of the first
    /// vertex is treated as the closing vertex.
    ///
    /// # Errors
    ///
    /// - `NonFiniteVertex` if any coordinate is NaN or infinite
    /// - `TooFewVertices` if fewer than 3 distinct vertices remain
    pub fn new(
        id: LabelId,
        vertices: Vec<Point>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<Self, GeometryError> {
        Ok(Self {
            id,
            vertices: normalize(vertices)?,
            fields,
            style: None,
        })
    }

    pub fn with_style(mut self, style: Option<StyleOverrides>) -> Self {
        self.style = style;
        self
    }

    pub fn id(&self) -> LabelId {
        self.id
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    /// Vertices with the first one repeated at the end.
    pub fn closed_vertices(&self) -> Vec<Point> {
        let mut closed = self.vertices.clone();
        closed.extend(self.vertices.first().copied());
        closed
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn style(&self) -> Option<&StyleOverrides> {
        self.style.as_ref()
    }

    pub fn bounding_rect(&self) -> BoundingRect {
        // `new` guarantees at least 3 vertices
        BoundingRect::of(&self.vertices).unwrap_or(BoundingRect {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
        })
    }

    pub fn covered_pixels(&self) -> Vec<[i64; 2]> {
        covered_pixels(&self.vertices)
    }

    fn vertex_not_found(&self, index: usize) -> NotFoundError {
        NotFoundError::Vertex {
            id: self.id,
            index,
            count: self.vertices.len(),
        }
    }
}

fn normalize(vertices: Vec<Point>) -> Result<Vec<Point>, GeometryError> {
    if vertices.iter().any(|p| !p.is_finite()) {
        return Err(GeometryError::NonFiniteVertex);
    }

    let mut out: Vec<Point> = Vec::with_capacity(vertices.len());
    for p in vertices {
        if out.last() != Some(&p) {
            out.push(p);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }

    let distinct = distinct_count(&out);
    if distinct < 3 {
        return Err(GeometryError::TooFewVertices { count: distinct });
    }
    Ok(out)
}

/// Number of distinct points. Signed zeros compare equal.
fn distinct_count(vertices: &[Point]) -> usize {
    vertices
        .iter()
        .map(|p| ((p.x + 0.0).to_bits(), (p.y + 0.0).to_bits()))
        .collect::<HashSet<_>>()
        .len()
}

/// Check an edited vertex list without repairing it.
fn validate_edit(vertices: &[Point]) -> Result<(), GeometryError> {
    if vertices.iter().any(|p| !p.is_finite()) {
        return Err(GeometryError::NonFiniteVertex);
    }
    if vertices.len() < 3 {
        return Err(GeometryError::TooFewVertices {
            count: vertices.len(),
        });
    }
    let n = vertices.len();
    if let Some(i) = (0..n).find(|&i| vertices[i] == vertices[(i + 1) % n]) {
        return Err(GeometryError::DuplicateConsecutiveVertex { index: (i + 1) % n });
    }
    let distinct = distinct_count(vertices);
    if distinct < 3 {
        return Err(GeometryError::TooFewVertices { count: distinct });
    }
    Ok(())
}

// ============================================================================
// Edit History
// ============================================================================

/// A reversible change to a document.
///
/// Applying an edit yields the edit that reverts it.
#[derive(Debug, Clone)]
enum Edit {
    Insert { position: usize, item: LabelItem },
    Remove { id: LabelId },
    Vertices { id: LabelId, vertices: Vec<Point> },
    Field {
        id: LabelId,
        name: String,
        value: Option<FieldValue>,
    },
    Style {
        id: LabelId,
        style: Option<StyleOverrides>,
    },
    Replace { items: Vec<LabelItem> },
}

#[derive(Debug, Clone)]
struct History {
    undo: Vec<Edit>,
    redo: Vec<Edit>,
    /// Undo depth at the last save; `None` once that state is unreachable
    clean: Option<usize>,
}

impl Default for History {
    fn default() -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            clean: Some(0),
        }
    }
}

impl History {
    fn record(&mut self, inverse: Edit) {
        if self.clean.is_some_and(|depth| depth > self.undo.len()) {
            self.clean = None;
        }
        self.undo.push(inverse);
        self.redo.clear();
    }
}

// ============================================================================
// Document
// ============================================================================

/// Ordered collection of label items.
///
/// Items keep their creation order, which is also their paint order: later
/// items are drawn on top and win when rasterized into a mask.
#[derive(Debug, Clone, Default)]
pub struct LabelDocument {
    items: Vec<LabelItem>,
    index: HashMap<LabelId, usize>,
    history: History,
}

impl LabelDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in creation order.
    pub fn items(&self) -> impl Iterator<Item = &LabelItem> {
        self.items.iter()
    }

    pub fn item(&self, id: LabelId) -> Result<&LabelItem, NotFoundError> {
        self.index
            .get(&id)
            .map(|&i| &self.items[i])
            .ok_or(NotFoundError::Item(id))
    }

    fn item_mut(&mut self, id: LabelId) -> Result<&mut LabelItem, NotFoundError> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.items[i]),
            None => Err(NotFoundError::Item(id)),
        }
    }

    /// Add a new polygon with a fresh id and no field values.
    pub fn add_polygon(&mut self, vertices: Vec<Point>) -> Result<LabelId, GeometryError> {
        self.add_polygon_with_fields(vertices, BTreeMap::new())
    }

    /// Add a new polygon with a fresh id and initial field values.
    pub fn add_polygon_with_fields(
        &mut self,
        vertices: Vec<Point>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<LabelId, GeometryError> {
        let item = LabelItem::new(LabelId::new_v4(), vertices, fields)?;
        let id = item.id();
        self.push(item);
        self.history.record(Edit::Remove { id });
        Ok(id)
    }

    /// Append an existing item, keeping its id.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if an item with the same id is already present.
    pub fn insert_item(&mut self, item: LabelItem) -> Result<LabelId, GeometryError> {
        if self.index.contains_key(&item.id) {
            return Err(GeometryError::DuplicateId(item.id));
        }
        let id = item.id();
        self.push(item);
        self.history.record(Edit::Remove { id });
        Ok(id)
    }

    fn push(&mut self, item: LabelItem) {
        self.insert_at(self.items.len(), item);
    }

    fn insert_at(&mut self, position: usize, item: LabelItem) {
        let position = position.min(self.items.len());
        for slot in self.index.values_mut() {
            if *slot >= position {
                *slot += 1;
            }
        }
        self.index.insert(item.id, position);
        self.items.insert(position, item);
    }

    fn take(&mut self, id: LabelId) -> Result<(usize, LabelItem), NotFoundError> {
        let position = self.index.remove(&id).ok_or(NotFoundError::Item(id))?;
        let item = self.items.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok((position, item))
    }

    pub fn remove_item(&mut self, id: LabelId) -> Result<LabelItem, NotFoundError> {
        let (position, item) = self.take(id)?;
        self.history.record(Edit::Insert {
            position,
            item: item.clone(),
        });
        Ok(item)
    }

    /// Replace every item with the items of `other`, as one undoable edit.
    pub fn replace_items(&mut self, other: LabelDocument) {
        let previous = self.swap_items(other.items);
        self.history.record(Edit::Replace { items: previous });
    }

    fn swap_items(&mut self, items: Vec<LabelItem>) -> Vec<LabelItem> {
        let previous = std::mem::replace(&mut self.items, items);
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id, i))
            .collect();
        previous
    }

    /// Apply a vertex edit to a candidate copy and commit it if valid.
    fn edit_vertices(
        &mut self,
        id: LabelId,
        edit: impl FnOnce(&LabelItem, &mut Vec<Point>) -> Result<(), AnnotationError>,
    ) -> Result<(), AnnotationError> {
        let item = self.item_mut(id)?;
        let mut candidate = item.vertices.clone();
        edit(item, &mut candidate)?;
        validate_edit(&candidate)?;
        let previous = std::mem::replace(&mut item.vertices, candidate);
        self.history.record(Edit::Vertices {
            id,
            vertices: previous,
        });
        Ok(())
    }

    /// Insert a vertex on the edge nearest to `position`.
    ///
    /// Returns the index of the new vertex. Inserting on the closing edge
    /// appends after the last vertex.
    pub fn add_vertex(&mut self, id: LabelId, position: Point) -> Result<usize, AnnotationError> {
        let vertices = self.item(id)?.vertices();
        let n = vertices.len();
        let nearest = (0..n)
            .map(|i| (i, position.distance_to_segment(&vertices[i], &vertices[(i + 1) % n])))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let index = nearest + 1;
        self.insert_vertex(id, index, position)?;
        Ok(index)
    }

    /// Insert a vertex before `index`; `index == len` appends.
    pub fn insert_vertex(
        &mut self,
        id: LabelId,
        index: usize,
        position: Point,
    ) -> Result<(), AnnotationError> {
        self.edit_vertices(id, |item, vertices| {
            if index > vertices.len() {
                return Err(item.vertex_not_found(index).into());
            }
            vertices.insert(index, position);
            Ok(())
        })
    }

    pub fn move_vertex(
        &mut self,
        id: LabelId,
        index: usize,
        position: Point,
    ) -> Result<(), AnnotationError> {
        self.edit_vertices(id, |item, vertices| {
            let slot = vertices
                .get_mut(index)
                .ok_or_else(|| item.vertex_not_found(index))?;
            *slot = position;
            Ok(())
        })
    }

    /// Remove a vertex.
    ///
    /// # Errors
    ///
    /// `MinimumVertices` if the polygon has only 3 vertices left.
    pub fn delete_vertex(&mut self, id: LabelId, index: usize) -> Result<(), AnnotationError> {
        self.edit_vertices(id, |item, vertices| {
            if index >= vertices.len() {
                return Err(item.vertex_not_found(index).into());
            }
            if vertices.len() <= 3 {
                return Err(GeometryError::MinimumVertices { id: item.id }.into());
            }
            vertices.remove(index);
            Ok(())
        })
    }

    pub fn set_field(
        &mut self,
        id: LabelId,
        name: impl Into<String>,
        value: FieldValue,
    ) -> Result<(), NotFoundError> {
        let name = name.into();
        let previous = self.item_mut(id)?.fields.insert(name.clone(), value);
        self.history.record(Edit::Field {
            id,
            name,
            value: previous,
        });
        Ok(())
    }

    pub fn set_style(
        &mut self,
        id: LabelId,
        style: Option<StyleOverrides>,
    ) -> Result<(), NotFoundError> {
        let previous = std::mem::replace(&mut self.item_mut(id)?.style, style);
        self.history.record(Edit::Style {
            id,
            style: previous,
        });
        Ok(())
    }

    // ----- Undo and Redo -----

    /// Revert the most recent edit. Returns false when there is nothing to undo.
    ///
    /// # Errors
    ///
    /// `NotFoundError` if the recorded edit no longer matches the document, in
    /// which case the history is cleared.
    pub fn undo(&mut self) -> Result<bool, NotFoundError> {
        let Some(edit) = self.history.undo.pop() else {
            return Ok(false);
        };
        let inverse = self.apply_or_reset(edit)?;
        self.history.redo.push(inverse);
        Ok(true)
    }

    /// Re-apply the most recently undone edit. Returns false when there is
    /// nothing to redo.
    pub fn redo(&mut self) -> Result<bool, NotFoundError> {
        let Some(edit) = self.history.redo.pop() else {
            return Ok(false);
        };
        let inverse = self.apply_or_reset(edit)?;
        self.history.undo.push(inverse);
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        !self.history.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.history.redo.is_empty()
    }

    /// Forget all recorded edits and treat the current state as saved.
    pub fn clear_history(&mut self) {
        self.history = History::default();
    }

    /// Record the current state as the saved one.
    pub fn mark_saved(&mut self) {
        self.history.clean = Some(self.history.undo.len());
    }

    /// Whether the document differs from the last saved state.
    pub fn is_modified(&self) -> bool {
        self.history.clean != Some(self.history.undo.len())
    }

    fn apply_or_reset(&mut self, edit: Edit) -> Result<Edit, NotFoundError> {
        match self.apply(edit) {
            Ok(inverse) => Ok(inverse),
            Err(e) => {
                self.clear_history();
                Err(e)
            }
        }
    }

    /// Apply a recorded edit and return its inverse.
    fn apply(&mut self, edit: Edit) -> Result<Edit, NotFoundError> {
        Ok(match edit {
            Edit::Insert { position, item } => {
                let id = item.id;
                self.insert_at(position, item);
                Edit::Remove { id }
            }
            Edit::Remove { id } => {
                let (position, item) = self.take(id)?;
                Edit::Insert { position, item }
            }
            Edit::Vertices { id, vertices } => {
                let previous = std::mem::replace(&mut self.item_mut(id)?.vertices, vertices);
                Edit::Vertices {
                    id,
                    vertices: previous,
                }
            }
            Edit::Field { id, name, value } => {
                let fields = &mut self.item_mut(id)?.fields;
                let previous = match value {
                    Some(value) => fields.insert(name.clone(), value),
                    None => fields.remove(&name),
                };
                Edit::Field {
                    id,
                    name,
                    value: previous,
                }
            }
            Edit::Style { id, style } => {
                let previous = std::mem::replace(&mut self.item_mut(id)?.style, style);
                Edit::Style {
                    id,
                    style: previous,
                }
            }
            Edit::Replace { items } => Edit::Replace {
                items: self.swap_items(items),
            },
        })
    }

    pub fn bounding_rect(&self, id: LabelId) -> Result<BoundingRect, NotFoundError> {
        Ok(self.item(id)?.bounding_rect())
    }

    pub fn covered_pixels(&self, id: LabelId) -> Result<Vec<[i64; 2]>, NotFoundError> {
        Ok(self.item(id)?.covered_pixels())
    }

    /// Geographic coordinates of an item's vertices.
    ///
    /// `Ok(None)` when the raster has no geo-transform.
    pub fn geo_vertices(
        &self,
        id: LabelId,
        transform: Option<&GeoTransform>,
    ) -> Result<Option<Vec<[f64; 2]>>, AnnotationError> {
        let item = self.item(id)?;
        match transform {
            Some(t) => Ok(Some(to_geo_coordinates(t, item.vertices())?)),
            None => Ok(None),
        }
    }

    /// Rasterize all items into a class mask.
    ///
    /// `shape` is `(height, width)` of the target level and `downsample` its
    /// factor relative to level 0. Items whose `class_field` value has no code
    /// are skipped.
    pub fn rasterize_mask(
        &self,
        class_field: &str,
        codes: &ClassCodes,
        shape: (usize, usize),
        downsample: f64,
    ) -> Mask {
        rasterize(&self.items, class_field, codes, shape, downsample)
    }
}
