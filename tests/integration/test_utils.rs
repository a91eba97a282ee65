//! Test utilities for integration tests.
//!
//! This module provides a tracking range reader and helpers for writing small
//! stores into temporary directories.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;

use pyramid_label::error::IoError;
use pyramid_label::io::RangeReader;
use pyramid_label::{
    create_dataset, DataLocator, NewDataset, Point, PyramidConfig, RasterStore, SampleType,
};

// =============================================================================
// Range Reader with Request Tracking
// =============================================================================

/// An in-memory range reader that records every read request.
pub struct TrackingReader {
    data: Bytes,
    request_count: Arc<AtomicUsize>,
    requests: Arc<RwLock<Vec<(u64, usize)>>>,
    delay: Option<Duration>,
}

impl TrackingReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            request_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
            delay: None,
        }
    }

    /// Make every read take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn get_requests(&self) -> Vec<(u64, usize)> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl RangeReader for TrackingReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push((offset, len));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        "tracking"
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Sample value at `(x, y)` of the test gradient.
pub fn gradient_value(x: u32, y: u32) -> f64 {
    ((x * 7 + y * 13) % 4096) as f64
}

/// Row-major gradient of a single-channel raster.
pub fn gradient(width: u32, height: u32) -> Vec<f64> {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| gradient_value(x, y)))
        .collect()
}

/// Write a `data` dataset with the given samples into a new temporary store.
pub async fn create_store(
    width: u32,
    height: u32,
    channels: usize,
    sample_type: SampleType,
    values: Vec<f64>,
) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), "data", width, height, channels, sample_type, values).await;
    dir
}

pub async fn write_dataset(
    root: &Path,
    name: &str,
    width: u32,
    height: u32,
    channels: usize,
    sample_type: SampleType,
    values: Vec<f64>,
) {
    let desc = NewDataset::new(name, width, height, channels, sample_type);
    create_dataset(root, &desc, &sample_type.encode_all(values))
        .await
        .unwrap();
}

/// A 16-bit gradient store.
pub async fn gradient_store(width: u32, height: u32) -> TempDir {
    create_store(width, height, 1, SampleType::U16, gradient(width, height)).await
}

pub async fn open(root: &Path) -> RasterStore {
    RasterStore::open(root, &DataLocator::new("data")).await.unwrap()
}

/// Open the default dataset of a store with its source served by a
/// [`TrackingReader`] that waits `delay` per read.
pub async fn open_slow(root: &Path, delay: Duration) -> RasterStore {
    let bytes = std::fs::read(root.join("data.raw")).unwrap();
    let source = TrackingReader::new(bytes).with_delay(delay);
    RasterStore::open_with_source(root, &DataLocator::new("data"), Arc::new(source))
        .await
        .unwrap()
}

/// Pyramid settings that give several levels on small rasters.
pub fn small_pyramid() -> PyramidConfig {
    PyramidConfig {
        factor: 2,
        min_level_length: 8,
        block_size: 16,
        enabled: true,
    }
}

// =============================================================================
// Geometry
// =============================================================================

pub fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Point> {
    vec![
        Point::new(x0, y0),
        Point::new(x1, y0),
        Point::new(x1, y1),
        Point::new(x0, y1),
    ]
}
