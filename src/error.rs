use thiserror::Error;

use crate::annotation::LabelId;

/// I/O errors that can occur when reading raster bytes from storage
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from the local filesystem
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(err.to_string())
        } else {
            IoError::Io(err.to_string())
        }
    }
}

/// Errors raised while opening a raster store.
///
/// Fatal to opening that image, but never affects other open state.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the manifest or sample file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Manifest could not be parsed
    #[error("Invalid store manifest: {0}")]
    Manifest(String),

    /// The data locator names a dataset that is not in the store
    #[error("Dataset not found: {0}")]
    MissingDataset(String),

    /// Array is not shaped `[h, w]` or `[h, w, c]`
    #[error("Unsupported array rank {rank}: expected [height, width] or [height, width, channels]")]
    UnsupportedShape { rank: usize },

    /// Array has a channel count other than 1 or 3
    #[error("Unsupported channel count {0}: only 1 (grayscale) or 3 (RGB) are supported")]
    UnsupportedChannels(usize),

    /// Sample type is not one of the supported numeric types
    #[error("Unsupported sample type: {0}")]
    UnsupportedDtype(String),

    /// Explicit colour mode attribute is unknown or contradicts the channel count
    #[error("Unsupported color mode {mode:?} for {channels}-channel data")]
    UnsupportedColorMode { mode: String, channels: usize },

    /// Width or height is zero or does not fit tile coordinates
    #[error("Invalid raster extent {width}x{height}")]
    InvalidExtent { width: u64, height: u64 },

    /// Sample file length does not match the declared shape
    #[error("Sample file size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Geo-transform attribute is not a 3x3 matrix of finite numbers
    #[error("Invalid geo-transform: {0}")]
    InvalidGeoTransform(String),
}

/// A window request that falls outside a level's extent.
///
/// This is a programmer error: the tile scheduler clamps every window before
/// it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Window ({x}, {y}) {width}x{height} is outside level {level} extent {level_width}x{level_height}"
)]
pub struct BoundsError {
    pub level: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub level_width: u32,
    pub level_height: u32,
}

/// Errors returned by windowed reads.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// Level has not been built yet
    #[error("Level {level} is not available (store has {available} level(s))")]
    LevelUnavailable { level: usize, available: usize },

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The store was closed while the read was pending
    #[error("Raster store is closed")]
    Closed,
}

/// A pyramid level or manifest could not be persisted.
///
/// Not fatal: the level stays usable in memory for the current session.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Could not write {path}: {message}")]
    Write { path: String, message: String },

    #[error("Could not update manifest: {0}")]
    Manifest(String),
}

/// Errors from converting a picture file into a raster store
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    #[error("Could not decode {path}: {message}")]
    Decode { path: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors that can occur while building pyramid levels
#[derive(Debug, Clone, Error)]
pub enum PyramidError {
    /// Requested level lies beyond the ladder for this raster
    #[error("Level {level} out of range (max level is {max_level})")]
    LevelOutOfRange { level: usize, max_level: usize },

    /// Reading the finer level failed
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// The store was closed while building
    #[error("Pyramid build cancelled")]
    Cancelled,

    /// A blocking averaging task failed to complete
    #[error("Pyramid worker failed: {0}")]
    Worker(String),
}

/// Errors that can occur while loading a tile
#[derive(Debug, Clone, Error)]
pub enum TileError {
    #[error("Invalid level {level} (max level is {max_level})")]
    InvalidLevel { level: usize, max_level: usize },

    #[error("Invalid viewport: {0}")]
    InvalidViewport(String),

    #[error("Pyramid error: {0}")]
    Pyramid(#[from] PyramidError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// Scheduler has been closed
    #[error("Scheduler is closed")]
    Closed,
}

/// Errors from the display mapping layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DisplayError {
    #[error("Invalid display transform: {0}")]
    InvalidTransform(String),

    #[error("Display buffer does not match its {width}x{height} extent")]
    BufferShape { width: u32, height: u32 },
}

/// An annotation edit violated a polygon constraint.
///
/// The document is left unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("A polygon needs at least 3 distinct vertices, got {count}")]
    TooFewVertices { count: usize },

    #[error("Vertex {index} would duplicate its neighbour")]
    DuplicateConsecutiveVertex { index: usize },

    #[error("Deleting a vertex of {id} would leave fewer than 3 vertices")]
    MinimumVertices { id: LabelId },

    #[error("Vertex coordinates must be finite")]
    NonFiniteVertex,

    #[error("Label item {0} already exists")]
    DuplicateId(LabelId),

    #[error("Projective transform is degenerate at vertex {index}")]
    DegenerateProjection { index: usize },
}

/// An annotation operation referenced an unknown item or vertex.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotFoundError {
    #[error("Label item {0} not found")]
    Item(LabelId),

    #[error("Vertex {index} not found on {id} ({count} vertices)")]
    Vertex {
        id: LabelId,
        index: usize,
        count: usize,
    },
}

/// Errors from editing the annotation document
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnnotationError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),
}

/// Errors from loading or resolving an annotation template
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Invalid template JSON: {0}")]
    Json(String),

    #[error("Template is missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Unrecognized field type {kind:?} for field {label:?}")]
    UnknownFieldType { label: String, kind: String },

    #[error("Field {0:?} is not defined in the template")]
    UnknownField(String),

    #[error("Field {0:?} is not a combobox; only combobox fields can classify a mask")]
    NotCategorical(String),

    #[error("Value {value:?} is not an option of field {field:?}")]
    UnknownOption { field: String, value: String },
}

/// Errors from reading or writing labels, overlay and mask files
#[derive(Debug, Clone, Error)]
pub enum LabelsError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Record {index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("Record {index}: {source}")]
    Annotation {
        index: usize,
        #[source]
        source: AnnotationError,
    },

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}
