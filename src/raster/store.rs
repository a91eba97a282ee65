//! Full-precision raster store.
//!
//! A `RasterStore` is one open dataset of a store directory together with the
//! pyramid levels built for it so far. Level 0 is the source array; coarser
//! levels are installed by the [`PyramidBuilder`](crate::pyramid::PyramidBuilder).
//!
//! Reads return `f64` samples regardless of the stored type, so display and
//! mask code never deals with sample encodings.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ndarray::Array3;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::level_file::LevelFile;
use super::manifest::{self, DatasetEntry, LevelEntry, PyramidEntry, SampleRange};
use super::sample::{ColorMode, SampleType};
use crate::annotation::GeoTransform;
use crate::error::{BoundsError, FormatError, IoError, ReadError, StorageError};
use crate::io::{FileRangeReader, MemoryReader, RangeReader};

/// Rows are scanned in strips of at most this many samples when computing
/// the sample range.
const SCAN_STRIP_SAMPLES: u64 = 4 * 1024 * 1024;

// =============================================================================
// Locator and Info
// =============================================================================

/// Where to find the image inside a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLocator {
    /// Dataset name in the manifest
    pub data_path: String,

    /// Key of the geo-transform under the store attributes.
    ///
    /// When unset, or missing from the store, the dataset's own
    /// `geo_transform` attribute is used if present.
    pub geo_transform_key: Option<String>,
}

impl DataLocator {
    pub fn new(data_path: impl Into<String>) -> Self {
        Self {
            data_path: data_path.into(),
            geo_transform_key: None,
        }
    }

    pub fn with_geo_transform(mut self, key: impl Into<String>) -> Self {
        self.geo_transform_key = Some(key.into());
        self
    }
}

/// Immutable description of an open raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub sample_type: SampleType,
    pub color_mode: ColorMode,
    pub geo_transform: Option<GeoTransform>,
}

impl RasterInfo {
    /// Bytes per pixel (all channels).
    pub fn pixel_bytes(&self) -> usize {
        self.channels * self.sample_type.size_bytes()
    }

    /// Expected byte size of a level of the given extent.
    pub fn level_bytes(&self, width: u32, height: u32) -> u64 {
        width as u64 * height as u64 * self.pixel_bytes() as u64
    }
}

// =============================================================================
// Levels
// =============================================================================

/// Where the samples of a level live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    /// The source array
    Source,

    /// Written next to the source and registered in the manifest
    Stored,

    /// Built for this session only; persisting it failed
    InMemory { reason: String },
}

/// One resolution level of an open raster.
pub struct LevelData {
    pub level: usize,
    pub width: u32,
    pub height: u32,
    pub persistence: Persistence,
    reader: Arc<dyn RangeReader>,
}

impl LevelData {
    fn new(
        level: usize,
        width: u32,
        height: u32,
        persistence: Persistence,
        reader: Arc<dyn RangeReader>,
    ) -> Self {
        Self {
            level,
            width,
            height,
            persistence,
            reader,
        }
    }

    /// In-memory level built from encoded samples.
    pub(crate) fn in_memory(
        level: usize,
        width: u32,
        height: u32,
        bytes: Bytes,
        reason: String,
    ) -> Self {
        let reader = MemoryReader::new(bytes, format!("memory://level/{level}"));
        Self::new(
            level,
            width,
            height,
            Persistence::InMemory { reason },
            Arc::new(reader),
        )
    }
}

impl std::fmt::Debug for LevelData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelData")
            .field("level", &self.level)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("persistence", &self.persistence)
            .field("source", &self.reader.identifier())
            .finish()
    }
}

struct LevelTable {
    /// Downsample factor between consecutive levels, once any exist
    factor: Option<u32>,
    levels: Vec<Arc<LevelData>>,
}

// =============================================================================
// Sample Window
// =============================================================================

/// Full-precision samples of a rectangular window of one level.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    pub level: usize,
    pub x: u32,
    pub y: u32,
    /// Shape `(height, width, channels)`
    pub data: Array3<f64>,
}

impl SampleWindow {
    pub fn width(&self) -> u32 {
        self.data.dim().1 as u32
    }

    pub fn height(&self) -> u32 {
        self.data.dim().0 as u32
    }

    pub fn channels(&self) -> usize {
        self.data.dim().2
    }

    /// Min and max over all samples, ignoring NaN.
    pub fn range(&self) -> Option<SampleRange> {
        SampleRange::extend(None, self.data.iter().copied())
    }

    /// Approximate heap size in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }
}

// =============================================================================
// Raster Store
// =============================================================================

/// One open raster and its pyramid levels.
pub struct RasterStore {
    root: PathBuf,
    dataset: String,
    id: Arc<str>,
    info: RasterInfo,
    entry: DatasetEntry,
    table: RwLock<LevelTable>,
    sample_range: RwLock<Option<SampleRange>>,
    manifest_lock: Mutex<()>,
    closed: AtomicBool,
}

impl RasterStore {
    /// Open a dataset of a store directory.
    ///
    /// Persisted pyramid levels are attached when their source fingerprint
    /// matches the dataset; a stale pyramid is discarded.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` when the manifest is unreadable, the dataset is
    /// missing, or its shape, sample type or colour mode is unsupported.
    pub async fn open(root: impl AsRef<Path>, locator: &DataLocator) -> Result<Self, FormatError> {
        Self::open_inner(root.as_ref(), locator, None).await
    }

    /// Open a dataset whose level-0 samples are read through `source`
    /// instead of the store's data file.
    ///
    /// The manifest still describes the dataset and pyramid levels are still
    /// persisted under `root`.
    pub async fn open_with_source(
        root: impl AsRef<Path>,
        locator: &DataLocator,
        source: Arc<dyn RangeReader>,
    ) -> Result<Self, FormatError> {
        Self::open_inner(root.as_ref(), locator, Some(source)).await
    }

    async fn open_inner(
        root: &Path,
        locator: &DataLocator,
        source: Option<Arc<dyn RangeReader>>,
    ) -> Result<Self, FormatError> {
        let root = root.to_path_buf();
        let manifest = manifest::load(&root).await?;

        let entry = manifest
            .datasets
            .get(&locator.data_path)
            .cloned()
            .ok_or_else(|| FormatError::MissingDataset(locator.data_path.clone()))?;

        let (height, width, channels) = match entry.shape.as_slice() {
            [h, w] => (*h, *w, 1usize),
            [h, w, c] => (*h, *w, *c as usize),
            other => return Err(FormatError::UnsupportedShape { rank: other.len() }),
        };
        if !(channels == 1 || channels == 3) {
            return Err(FormatError::UnsupportedChannels(channels));
        }
        if width == 0 || height == 0 || width > u32::MAX as u64 || height > u32::MAX as u64 {
            return Err(FormatError::InvalidExtent { width, height });
        }

        let sample_type: SampleType = entry.dtype.parse()?;
        let explicit_mode = entry.attrs.get("color_mode").and_then(|v| v.as_str());
        let color_mode = ColorMode::resolve(explicit_mode, channels)?;

        let geo_value = locator
            .geo_transform_key
            .as_ref()
            .and_then(|key| manifest.attributes.get(key))
            .or_else(|| entry.attrs.get("geo_transform"));
        let geo_transform = geo_value
            .map(GeoTransform::from_value)
            .transpose()
            .map_err(FormatError::InvalidGeoTransform)?;

        let info = RasterInfo {
            width: width as u32,
            height: height as u32,
            channels,
            sample_type,
            color_mode,
            geo_transform,
        };

        let source: Arc<dyn RangeReader> = match source {
            Some(source) => source,
            None => Arc::new(FileRangeReader::open(root.join(&entry.file)).await?),
        };
        let expected = info.level_bytes(info.width, info.height);
        if source.size() != expected {
            return Err(FormatError::SizeMismatch {
                expected,
                actual: source.size(),
            });
        }

        let id: Arc<str> = Arc::from(format!("{}#{}", root.display(), locator.data_path));
        let level0 = Arc::new(LevelData::new(
            0,
            info.width,
            info.height,
            Persistence::Source,
            source,
        ));

        let store = Self {
            root,
            dataset: locator.data_path.clone(),
            id,
            info,
            entry,
            table: RwLock::new(LevelTable {
                factor: None,
                levels: vec![level0],
            }),
            sample_range: RwLock::new(None),
            manifest_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        match manifest.pyramids.get(&store.dataset) {
            Some(pyramid) if pyramid.source == store.entry.fingerprint() => {
                store.attach_persisted(pyramid).await;
            }
            Some(_) => {
                warn!(
                    raster = %store.id,
                    "Source changed since its pyramid was built; discarding stale pyramid"
                );
                store.discard_persisted().await;
            }
            None => {}
        }

        info!(
            raster = %store.id,
            width = store.info.width,
            height = store.info.height,
            channels = store.info.channels,
            dtype = %store.info.sample_type,
            "Opened raster"
        );

        Ok(store)
    }

    async fn attach_persisted(&self, pyramid: &PyramidEntry) {
        let mut table = self.table.write().await;
        let (mut width, mut height) = (self.info.width, self.info.height);
        let factor = pyramid.downsample.max(1);

        for (i, level) in pyramid.levels.iter().enumerate() {
            width /= factor;
            height /= factor;
            if level.level != i + 1 || level.width != width || level.height != height {
                warn!(raster = %self.id, level = level.level, "Pyramid level out of sequence, ignoring rest");
                break;
            }

            let reader = match FileRangeReader::open(self.root.join(&level.file)).await {
                Ok(r) if r.size() == self.info.level_bytes(width, height) => r,
                Ok(_) | Err(_) => {
                    warn!(raster = %self.id, level = level.level, "Pyramid level file missing or truncated, ignoring rest");
                    break;
                }
            };

            table.levels.push(Arc::new(LevelData::new(
                level.level,
                width,
                height,
                Persistence::Stored,
                Arc::new(reader),
            )));
        }

        if table.levels.len() > 1 {
            table.factor = Some(factor);
            debug!(raster = %self.id, levels = table.levels.len() - 1, "Attached persisted pyramid levels");
        }
        drop(table);

        *self.sample_range.write().await = pyramid.sample_range;
    }

    /// Remove the persisted pyramid of this dataset. Failures are logged.
    async fn discard_persisted(&self) {
        let _guard = self.manifest_lock.lock().await;
        let dataset = self.dataset.clone();
        if let Err(e) = manifest::update(&self.root, |m| {
            m.pyramids.remove(&dataset);
        })
        .await
        {
            warn!(raster = %self.id, error = %e, "Could not remove stale pyramid from manifest");
        }

        let dir = self.root.join("pyramid").join(&self.dataset);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(raster = %self.id, error = %e, "Could not remove stale pyramid files");
            }
        }
    }

    // ----- Accessors -----

    /// Identity of this raster, used to key caches and ladder locks.
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Number of levels currently available (at least 1).
    pub async fn level_count(&self) -> usize {
        self.table.read().await.levels.len()
    }

    pub async fn level(&self, level: usize) -> Option<Arc<LevelData>> {
        self.table.read().await.levels.get(level).cloned()
    }

    /// Factor between the attached pyramid levels, if any are attached.
    pub async fn pyramid_factor(&self) -> Option<u32> {
        self.table.read().await.factor
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(raster = %self.id, "Closed raster");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ----- Reads -----

    /// Read a window of full-precision samples.
    ///
    /// # Arguments
    ///
    /// * `level` - Pyramid level (0 = source)
    /// * `x`, `y` - Top-left corner in level pixels
    /// * `width`, `height` - Window extent in level pixels
    ///
    /// # Errors
    ///
    /// Returns `ReadError::Bounds` if the window is empty or leaves the level;
    /// windows are never zero-padded.
    pub async fn read_window(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<SampleWindow, ReadError> {
        if self.is_closed() {
            return Err(ReadError::Closed);
        }

        let data = {
            let table = self.table.read().await;
            match table.levels.get(level) {
                Some(data) => Arc::clone(data),
                None => {
                    return Err(ReadError::LevelUnavailable {
                        level,
                        available: table.levels.len(),
                    })
                }
            }
        };

        let fits = |origin: u32, extent: u32, limit: u32| {
            extent > 0 && origin as u64 + extent as u64 <= limit as u64
        };
        if !fits(x, width, data.width) || !fits(y, height, data.height) {
            return Err(BoundsError {
                level,
                x,
                y,
                width,
                height,
                level_width: data.width,
                level_height: data.height,
            }
            .into());
        }

        let pixel = self.info.pixel_bytes() as u64;
        let stride = data.width as u64 * pixel;
        let offset = y as u64 * stride + x as u64 * pixel;
        let run = width as usize * pixel as usize;

        let bytes = data
            .reader
            .read_strided(offset, run, stride, height as usize)
            .await?;

        let mut samples = Vec::new();
        self.info.sample_type.decode(&bytes, &mut samples);

        let shape = (height as usize, width as usize, self.info.channels);
        let array = Array3::from_shape_vec(shape, samples)
            .map_err(|e| ReadError::Io(IoError::Io(e.to_string())))?;

        Ok(SampleWindow {
            level,
            x,
            y,
            data: array,
        })
    }

    /// Min and max over all source samples.
    ///
    /// Taken from the manifest or the pyramid build when known; otherwise the
    /// source is scanned once and the result persisted best-effort.
    pub async fn sample_range(&self) -> Result<SampleRange, ReadError> {
        if let Some(range) = *self.sample_range.read().await {
            return Ok(range);
        }

        let (width, height) = (self.info.width, self.info.height);
        let per_row = width as u64 * self.info.channels as u64;
        let strip = (SCAN_STRIP_SAMPLES / per_row).clamp(1, height as u64) as u32;

        let mut range = None;
        let mut y = 0;
        while y < height {
            let rows = strip.min(height - y);
            let window = self.read_window(0, 0, y, width, rows).await?;
            range = SampleRange::extend(range, window.data.iter().copied());
            y += rows;
        }

        // An all-NaN raster maps as if it were constant zero
        let range = range.unwrap_or(SampleRange { min: 0.0, max: 0.0 });
        self.record_sample_range(range).await;
        Ok(range)
    }

    /// Sample range if already known, without scanning.
    pub async fn known_sample_range(&self) -> Option<SampleRange> {
        *self.sample_range.read().await
    }

    /// Cache the source sample range and persist it if a pyramid entry exists.
    pub(crate) async fn record_sample_range(&self, range: SampleRange) {
        *self.sample_range.write().await = Some(range);

        let _guard = self.manifest_lock.lock().await;
        let dataset = self.dataset.clone();
        let result = manifest::update(&self.root, |m| {
            if let Some(p) = m.pyramids.get_mut(&dataset) {
                p.sample_range = Some(range);
            }
        })
        .await;
        if let Err(e) = result {
            warn!(raster = %self.id, error = %e, "Could not persist sample range");
        }
    }

    // ----- Pyramid Installation -----

    /// Drop all pyramid levels and start a ladder with a new factor.
    pub(crate) async fn reset_pyramid(&self, factor: u32) {
        let mut table = self.table.write().await;
        table.levels.truncate(1);
        table.factor = Some(factor);
    }

    /// Start the file a pyramid level is streamed into.
    pub(crate) async fn create_level_file(
        &self,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<LevelFile, StorageError> {
        let path = self.root.join(manifest::level_file(&self.dataset, level));
        LevelFile::create(path, width, height, self.info.pixel_bytes()).await
    }

    /// Commit a fully written level file and register it in the manifest.
    ///
    /// The returned level reads back from the committed file.
    pub(crate) async fn persist_level(
        &self,
        level: usize,
        width: u32,
        height: u32,
        factor: u32,
        written: LevelFile,
    ) -> Result<LevelData, StorageError> {
        let file = manifest::level_file(&self.dataset, level);
        let path = written.commit().await?;

        {
            let _guard = self.manifest_lock.lock().await;
            let fingerprint = self.entry.fingerprint();
            let dataset = self.dataset.clone();
            let sample_range = *self.sample_range.read().await;
            manifest::update(&self.root, move |m| {
                let entry = m.pyramids.entry(dataset).or_insert_with(|| PyramidEntry {
                    source: fingerprint.clone(),
                    downsample: factor,
                    sample_range: None,
                    levels: Vec::new(),
                });
                if entry.source != fingerprint || entry.downsample != factor {
                    entry.source = fingerprint;
                    entry.downsample = factor;
                    entry.levels.clear();
                }
                entry.levels.retain(|l| l.level < level);
                entry.levels.push(LevelEntry {
                    level,
                    width,
                    height,
                    file,
                });
                if entry.sample_range.is_none() {
                    entry.sample_range = sample_range;
                }
            })
            .await?;
        }

        let reader = FileRangeReader::open(&path)
            .await
            .map_err(|e| StorageError::Write {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(LevelData::new(
            level,
            width,
            height,
            Persistence::Stored,
            Arc::new(reader),
        ))
    }

    /// Append a built level to the level table.
    ///
    /// Levels are installed strictly in order; installing a level that is
    /// already present returns the existing one.
    pub(crate) async fn install_level(&self, data: LevelData) -> Arc<LevelData> {
        let mut table = self.table.write().await;
        if let Some(existing) = table.levels.get(data.level) {
            return Arc::clone(existing);
        }
        debug_assert_eq!(data.level, table.levels.len());
        let data = Arc::new(data);
        table.levels.push(Arc::clone(&data));
        data
    }
}

impl std::fmt::Debug for RasterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterStore")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}
