//! Lazy construction of pyramid levels.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use ndarray::{Array3, ArrayView3};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::layout::PyramidLayout;
use crate::config::PipelineConfig;
use crate::error::{PyramidError, ReadError, StorageError};
use crate::raster::{
    LevelData, LevelFile, Persistence, RasterInfo, RasterStore, SampleRange, SampleType,
};

// =============================================================================
// Configuration
// =============================================================================

/// Settings that shape a pyramid ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidConfig {
    /// Integer downsample factor between consecutive levels
    pub factor: u32,

    /// Levels are added while the longest side exceeds this length
    pub min_level_length: u32,

    /// Side of the square blocks of the finer level processed at once
    pub block_size: u32,

    /// When false, only level 0 exists
    pub enabled: bool,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for PyramidConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            factor: config.downsample_factor,
            min_level_length: config.min_level_length,
            block_size: config.block_size,
            enabled: !config.no_pyramid,
        }
    }
}

/// A level as seen by callers of [`PyramidBuilder::ensure_level`].
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLevel {
    pub level: usize,
    pub downsample: f64,
    pub width: u32,
    pub height: u32,
    pub persistence: Persistence,
}

impl PyramidLevel {
    fn from_data(data: &LevelData, factor: u32) -> Self {
        Self {
            level: data.level,
            downsample: (factor as f64).powi(data.level as i32),
            width: data.width,
            height: data.height,
            persistence: data.persistence.clone(),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds pyramid levels on demand.
///
/// Each level is the area average of the level directly above it. Builds for
/// one raster serialize on that raster's ladder lock, so concurrent requests
/// for any of its levels never compute a level twice.
pub struct PyramidBuilder {
    config: PyramidConfig,
    ladders: Mutex<HashMap<Arc<str>, Arc<Mutex<()>>>>,
}

impl PyramidBuilder {
    pub fn new(config: PyramidConfig) -> Self {
        Self {
            config,
            ladders: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Ladder geometry for a raster under this builder's configuration.
    pub fn layout(&self, info: &RasterInfo) -> PyramidLayout {
        PyramidLayout::new(
            info.width,
            info.height,
            self.config.factor,
            self.config.min_level_length,
            self.config.enabled,
        )
    }

    /// Make sure level `level` of `store` exists, building missing levels in
    /// increasing order.
    ///
    /// Repeated calls return the already-built level without rebuilding.
    ///
    /// # Errors
    ///
    /// - `LevelOutOfRange` if the ladder has no such level
    /// - `Cancelled` if the store was closed during the build
    /// - `Read` if reading the finer level failed
    pub async fn ensure_level(
        &self,
        store: &RasterStore,
        level: usize,
    ) -> Result<PyramidLevel, PyramidError> {
        let layout = self.layout(store.info());
        let factor = layout.factor();
        if level > layout.max_level() {
            return Err(PyramidError::LevelOutOfRange {
                level,
                max_level: layout.max_level(),
            });
        }

        // Fast path: already built with our factor
        if let Some(data) = self.existing(store, level, factor).await {
            return Ok(PyramidLevel::from_data(&data, factor));
        }

        let ladder = self.ladder(store).await;
        let _guard = ladder.lock().await;

        if level > 0 {
            match store.pyramid_factor().await {
                Some(f) if f != factor => {
                    info!(raster = %store.id(), old = f, new = factor, "Pyramid factor changed, rebuilding ladder");
                    store.reset_pyramid(factor).await;
                }
                None => store.reset_pyramid(factor).await,
                _ => {}
            }
        }

        let mut built = store.level_count().await;
        while built <= level {
            if store.is_closed() {
                return Err(PyramidError::Cancelled);
            }
            self.build_level(store, &layout, built).await?;
            built += 1;
        }

        let data = store.level(level).await.ok_or(PyramidError::Cancelled)?;
        Ok(PyramidLevel::from_data(&data, factor))
    }

    /// Build every level of the ladder.
    pub async fn build_all(&self, store: &RasterStore) -> Result<Vec<PyramidLevel>, PyramidError> {
        let max_level = self.layout(store.info()).max_level();
        self.ensure_level(store, max_level).await?;

        let mut levels = Vec::with_capacity(max_level + 1);
        for level in 0..=max_level {
            levels.push(self.ensure_level(store, level).await?);
        }
        Ok(levels)
    }

    async fn existing(&self, store: &RasterStore, level: usize, factor: u32) -> Option<Arc<LevelData>> {
        if level == 0 {
            return store.level(0).await;
        }
        if store.pyramid_factor().await != Some(factor) {
            return None;
        }
        store.level(level).await
    }

    async fn ladder(&self, store: &RasterStore) -> Arc<Mutex<()>> {
        let mut ladders = self.ladders.lock().await;
        ladders
            .entry(Arc::clone(store.id()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build `level` from `level - 1`, then persist it or keep it in memory.
    ///
    /// Blocks are streamed into the level file as they are averaged. If the
    /// file cannot be written the level is rebuilt into memory instead.
    async fn build_level(
        &self,
        store: &RasterStore,
        layout: &PyramidLayout,
        level: usize,
    ) -> Result<(), PyramidError> {
        let factor = layout.factor();
        let (width, height) = layout
            .dimensions(level)
            .ok_or(PyramidError::LevelOutOfRange {
                level,
                max_level: layout.max_level(),
            })?;
        let pixel = store.info().pixel_bytes();

        let mut sink = match store.create_level_file(level, width, height).await {
            Ok(file) => LevelSink::File(file),
            Err(e) => {
                warn!(raster = %store.id(), level, error = %e, "Could not create pyramid level file, keeping it in memory");
                LevelSink::memory(width, height, pixel, e.to_string())
            }
        };

        loop {
            let blocks = match self.fill(store, level, width, height, factor, &mut sink).await {
                Ok(blocks) => blocks,
                Err(Failure::Pyramid(e)) => {
                    sink.discard().await;
                    return Err(e);
                }
                Err(Failure::Storage(e)) => {
                    warn!(raster = %store.id(), level, error = %e, "Could not write pyramid level, rebuilding it in memory");
                    sink.discard().await;
                    sink = LevelSink::memory(width, height, pixel, e.to_string());
                    continue;
                }
            };

            match sink.finish(store, level, width, height, factor).await {
                Ok(data) => {
                    let persistence = data.persistence.clone();
                    store.install_level(data).await;
                    info!(raster = %store.id(), level, width, height, blocks, ?persistence, "Built pyramid level");
                    return Ok(());
                }
                Err(e) => {
                    warn!(raster = %store.id(), level, error = %e, "Could not persist pyramid level, rebuilding it in memory");
                    sink = LevelSink::memory(width, height, pixel, e.to_string());
                }
            }
        }
    }

    /// Average every block of `level - 1` into `sink`, returning the block count.
    async fn fill(
        &self,
        store: &RasterStore,
        level: usize,
        width: u32,
        height: u32,
        factor: u32,
        sink: &mut LevelSink,
    ) -> Result<usize, Failure> {
        let info = store.info();
        let f = factor as usize;
        let sample_type = info.sample_type;
        let block = (self.config.block_size.max(factor) / factor * factor) as usize;
        let (src_w, src_h) = (width as usize * f, height as usize * f);
        let track_range = level == 1;

        let mut range = None;
        let mut blocks = 0usize;

        for by in (0..src_h).step_by(block) {
            for bx in (0..src_w).step_by(block) {
                if store.is_closed() {
                    return Err(PyramidError::Cancelled.into());
                }

                let bw = block.min(src_w - bx);
                let bh = block.min(src_h - by);
                let window = read(store, level - 1, bx, by, bw, bh).await?;

                let encoded = tokio::task::spawn_blocking(move || {
                    EncodedBlock::average(window, f, sample_type, track_range)
                })
                .await
                .map_err(|e| PyramidError::Worker(e.to_string()))?;

                if let Some(r) = encoded.range {
                    range = SampleRange::extend(range, [r.min, r.max]);
                }
                let (ox, oy) = ((bx / f) as u32, (by / f) as u32);
                let (ow, oh) = (encoded.width, encoded.height);
                sink.write_block(ox, oy, encoded).await?;

                blocks += 1;
                debug!(raster = %store.id(), level, x = ox, y = oy, width = ow, height = oh, "Built pyramid block");
            }
        }

        if track_range {
            // Trailing rows and columns are dropped from the level but still
            // belong to the source range
            let (pw, ph) = (info.width as usize, info.height as usize);
            if src_w < pw {
                range = scan_range(store, range, src_w, 0, pw - src_w, ph, block).await?;
            }
            if src_h < ph {
                range = scan_range(store, range, 0, src_h, src_w, ph - src_h, block).await?;
            }
            if let Some(range) = range {
                store.record_sample_range(range).await;
            }
        }

        Ok(blocks)
    }
}

// =============================================================================
// Level Sinks
// =============================================================================

/// Why filling a level stopped.
enum Failure {
    /// The build itself failed or was cancelled
    Pyramid(PyramidError),

    /// The level file could not be written
    Storage(StorageError),
}

impl From<PyramidError> for Failure {
    fn from(e: PyramidError) -> Self {
        Failure::Pyramid(e)
    }
}

impl From<StorageError> for Failure {
    fn from(e: StorageError) -> Self {
        Failure::Storage(e)
    }
}

/// One averaged block, encoded in the raster's sample type.
struct EncodedBlock {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
    range: Option<SampleRange>,
}

impl EncodedBlock {
    fn average(window: Array3<f64>, factor: usize, sample_type: SampleType, track_range: bool) -> Self {
        let range = if track_range {
            SampleRange::extend(None, window.iter().copied())
        } else {
            None
        };
        let averaged = area_average(window.view(), factor);
        let (height, width, _) = averaged.dim();
        Self {
            width: width as u32,
            height: height as u32,
            bytes: sample_type.encode_all(averaged.iter().copied()),
            range,
        }
    }
}

/// Where a level under construction is written.
enum LevelSink {
    File(LevelFile),
    Memory {
        bytes: Vec<u8>,
        row_bytes: usize,
        pixel_bytes: usize,
        reason: String,
    },
}

impl LevelSink {
    fn memory(width: u32, height: u32, pixel_bytes: usize, reason: String) -> Self {
        let row_bytes = width as usize * pixel_bytes;
        LevelSink::Memory {
            bytes: vec![0u8; row_bytes * height as usize],
            row_bytes,
            pixel_bytes,
            reason,
        }
    }

    async fn write_block(&mut self, x: u32, y: u32, block: EncodedBlock) -> Result<(), StorageError> {
        match self {
            LevelSink::File(file) => file.write_block(x, y, block.width, block.bytes).await,
            LevelSink::Memory {
                bytes,
                row_bytes,
                pixel_bytes,
                ..
            } => {
                let block_row = block.width as usize * *pixel_bytes;
                if block_row == 0 {
                    return Ok(());
                }
                for (i, row) in block.bytes.chunks_exact(block_row).enumerate() {
                    let start = (y as usize + i) * *row_bytes + x as usize * *pixel_bytes;
                    bytes[start..start + block_row].copy_from_slice(row);
                }
                Ok(())
            }
        }
    }

    async fn finish(
        self,
        store: &RasterStore,
        level: usize,
        width: u32,
        height: u32,
        factor: u32,
    ) -> Result<LevelData, StorageError> {
        match self {
            LevelSink::File(file) => store.persist_level(level, width, height, factor, file).await,
            LevelSink::Memory { bytes, reason, .. } => Ok(LevelData::in_memory(
                level,
                width,
                height,
                Bytes::from(bytes),
                reason,
            )),
        }
    }

    async fn discard(self) {
        if let LevelSink::File(file) = self {
            file.discard().await;
        }
    }
}

async fn read(
    store: &RasterStore,
    level: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> Result<Array3<f64>, PyramidError> {
    match store
        .read_window(level, x as u32, y as u32, width as u32, height as u32)
        .await
    {
        Ok(window) => Ok(window.data),
        Err(ReadError::Closed) => Err(PyramidError::Cancelled),
        Err(e) => Err(e.into()),
    }
}

async fn scan_range(
    store: &RasterStore,
    mut range: Option<SampleRange>,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    block: usize,
) -> Result<Option<SampleRange>, PyramidError> {
    if width == 0 || height == 0 {
        return Ok(range);
    }
    for by in (y..y + height).step_by(block) {
        for bx in (x..x + width).step_by(block) {
            let bw = block.min(x + width - bx);
            let bh = block.min(y + height - by);
            let window = read(store, 0, bx, by, bw, bh).await?;
            range = SampleRange::extend(range, window.iter().copied());
        }
    }
    Ok(range)
}

/// Average non-overlapping `factor` x `factor` blocks of each channel.
///
/// Trailing rows and columns that do not fill a whole block are dropped.
pub fn area_average(window: ArrayView3<'_, f64>, factor: usize) -> Array3<f64> {
    let (h, w, c) = window.dim();
    let (oh, ow) = (h / factor, w / factor);
    let area = (factor * factor) as f64;

    let mut out = Array3::<f64>::zeros((oh, ow, c));
    for ((y, x, ch), value) in out.indexed_iter_mut() {
        let (y0, x0) = (y * factor, x * factor);
        let mut sum = 0.0;
        for dy in 0..factor {
            for dx in 0..factor {
                sum += window[[y0 + dy, x0 + dx, ch]];
            }
        }
        *value = sum / area;
    }
    out
}
