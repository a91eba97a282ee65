//! Store and windowed read integration tests.
//!
//! Tests verify:
//! - Reads return exactly the requested shape and values
//! - Out-of-extent windows fail without padding
//! - Unsupported layouts are rejected on open
//! - Strided reads issue one request per row

use pyramid_label::io::RangeReader;
use pyramid_label::raster::manifest;
use pyramid_label::{
    ColorMode, DataLocator, FormatError, RasterStore, ReadError, SampleType,
};

use super::test_utils::{create_store, gradient_store, gradient_value, open, TrackingReader};

#[tokio::test]
async fn test_read_window_exact_shape() {
    let dir = gradient_store(100, 80).await;
    let store = open(dir.path()).await;

    let window = store.read_window(0, 10, 20, 30, 5).await.unwrap();
    assert_eq!(window.data.dim(), (5, 30, 1));
    assert_eq!(window.data[[0, 0, 0]], gradient_value(10, 20));
    assert_eq!(window.data[[4, 29, 0]], gradient_value(39, 24));

    // touching the far edge is still inside
    let edge = store.read_window(0, 99, 79, 1, 1).await.unwrap();
    assert_eq!(edge.data[[0, 0, 0]], gradient_value(99, 79));
}

#[tokio::test]
async fn test_read_window_out_of_bounds() {
    let dir = gradient_store(100, 80).await;
    let store = open(dir.path()).await;

    for (x, y, w, h) in [(90, 0, 11, 1), (0, 80, 1, 1), (0, 0, 0, 5), (u32::MAX, 0, 2, 1)] {
        match store.read_window(0, x, y, w, h).await {
            Err(ReadError::Bounds(e)) => {
                assert_eq!((e.level_width, e.level_height), (100, 80));
            }
            other => panic!("expected bounds error, got {other:?}"),
        }
    }

    assert!(matches!(
        store.read_window(1, 0, 0, 1, 1).await,
        Err(ReadError::LevelUnavailable { level: 1, available: 1 })
    ));
}

#[tokio::test]
async fn test_rgb_float_store() {
    let values: Vec<f64> = (0..4 * 3 * 3).map(|v| v as f64 * 0.25).collect();
    let dir = create_store(4, 3, 3, SampleType::F32, values).await;
    let store = open(dir.path()).await;

    assert_eq!(store.info().color_mode, ColorMode::Rgb);
    let window = store.read_window(0, 1, 1, 2, 2).await.unwrap();
    assert_eq!(window.data.dim(), (2, 2, 3));
    // pixel (1, 1) starts at sample (1 * 4 + 1) * 3
    assert_eq!(window.data[[0, 0, 0]], 15.0 * 0.25);
    assert_eq!(window.data[[0, 0, 2]], 17.0 * 0.25);
}

#[tokio::test]
async fn test_rejects_unsupported_layouts() {
    let dir = gradient_store(8, 8).await;

    manifest::update(dir.path(), |m| {
        let entry = m.datasets.get_mut("data").unwrap();
        entry.shape = vec![8, 4, 2];
    })
    .await
    .unwrap();
    assert!(matches!(
        RasterStore::open(dir.path(), &DataLocator::new("data")).await,
        Err(FormatError::UnsupportedChannels(2))
    ));

    manifest::update(dir.path(), |m| {
        let entry = m.datasets.get_mut("data").unwrap();
        entry.shape = vec![8, 8];
        entry.dtype = "complex64".to_string();
    })
    .await
    .unwrap();
    assert!(matches!(
        RasterStore::open(dir.path(), &DataLocator::new("data")).await,
        Err(FormatError::UnsupportedDtype(_))
    ));

    assert!(matches!(
        RasterStore::open(dir.path(), &DataLocator::new("missing")).await,
        Err(FormatError::MissingDataset(_))
    ));
}

#[tokio::test]
async fn test_explicit_color_mode_must_match() {
    let dir = gradient_store(8, 8).await;
    manifest::update(dir.path(), |m| {
        let entry = m.datasets.get_mut("data").unwrap();
        entry
            .attrs
            .insert("color_mode".to_string(), serde_json::json!("RGB"));
    })
    .await
    .unwrap();

    assert!(matches!(
        RasterStore::open(dir.path(), &DataLocator::new("data")).await,
        Err(FormatError::UnsupportedColorMode { channels: 1, .. })
    ));
}

#[tokio::test]
async fn test_sample_range_scan() {
    let dir = gradient_store(64, 64).await;
    let store = open(dir.path()).await;

    assert!(store.known_sample_range().await.is_none());
    let range = store.sample_range().await.unwrap();
    assert_eq!(range.min, 0.0);
    assert_eq!(range.max, gradient_value(63, 63));
    assert_eq!(store.known_sample_range().await, Some(range));
}

#[tokio::test]
async fn test_strided_read_one_request_per_row() {
    let reader = TrackingReader::new((0..=255u8).collect());

    let bytes = reader.read_strided(18, 4, 16, 3).await.unwrap();
    assert_eq!(&bytes[..], &[18, 19, 20, 21, 34, 35, 36, 37, 50, 51, 52, 53]);
    assert_eq!(reader.request_count(), 3);
    assert_eq!(reader.get_requests().await, vec![(18, 4), (34, 4), (50, 4)]);

    // contiguous rows collapse into one read
    reader.read_strided(0, 16, 16, 4).await.unwrap();
    assert_eq!(reader.request_count(), 4);
}
