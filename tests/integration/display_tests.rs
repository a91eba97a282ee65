//! Display mapping integration tests.
//!
//! Tests verify:
//! - Re-mapping with a new transform recovers detail clipped by the old one
//! - Transform changes never alter the full-precision samples
//! - Level controls and auto levels derive the expected transforms

use std::sync::Arc;

use pyramid_label::{
    map_window, DisplayTransform, PixelFormat, PyramidBuilder, Region, SampleType,
    SchedulerConfig, TileScheduler, TileStatus, ViewportRequest,
};

use super::test_utils::{create_store, open, small_pyramid};

/// A 16-bit raster whose right half sits just above 60000.
fn two_band_values() -> Vec<f64> {
    (0..16)
        .flat_map(|_| (0..16).map(|x| if x < 8 { 100.0 + x as f64 } else { 60000.0 + x as f64 }))
        .collect()
}

async fn scheduler(root: &std::path::Path) -> TileScheduler {
    TileScheduler::new(
        Arc::new(open(root).await),
        Arc::new(PyramidBuilder::new(small_pyramid())),
        SchedulerConfig {
            tile_size: 16,
            cache_capacity: 1024 * 1024,
        },
    )
    .await
}

fn ready(status: &TileStatus) -> &pyramid_label::DisplayBuffer {
    match status {
        TileStatus::Ready(buffer) => buffer,
        other => panic!("tile not ready: {other:?}"),
    }
}

#[tokio::test]
async fn test_remap_recovers_clipped_detail() {
    let dir = create_store(16, 16, 1, SampleType::U16, two_band_values()).await;
    let store = open(dir.path()).await;
    let window = store.read_window(0, 0, 0, 16, 1).await.unwrap();

    let dark = DisplayTransform::new(0.0, 1000.0, 1.0).unwrap();
    let first = map_window(&window, &dark);
    // the bright half is saturated
    assert!(first.data[8..].iter().all(|&v| v == 255));

    let bright = DisplayTransform::new(60000.0, 60015.0, 1.0).unwrap();
    let second = map_window(&window, &bright);
    assert!(second.data[8] < second.data[15]);
    assert!(second.data[..8].iter().all(|&v| v == 0));

    // reading again gives the same samples
    let again = store.read_window(0, 0, 0, 16, 1).await.unwrap();
    assert_eq!(again, window);
}

#[tokio::test]
async fn test_transform_change_keeps_samples() {
    let dir = create_store(16, 16, 1, SampleType::U16, two_band_values()).await;
    let scheduler = scheduler(dir.path()).await;

    scheduler
        .set_viewport(ViewportRequest {
            downsample: 1.0,
            region: Region::new(0.0, 0.0, 16.0, 16.0),
        })
        .await
        .unwrap();
    scheduler.settle().await;

    scheduler
        .set_transform(DisplayTransform::new(0.0, 1000.0, 1.0).unwrap())
        .await;
    let dark = scheduler.frame().await;
    let dark_buffer = ready(&dark.tiles[0].status).clone();
    assert_eq!(dark_buffer.format, PixelFormat::Gray8);
    assert_eq!(dark_buffer.data[15], 255);

    scheduler
        .set_transform(DisplayTransform::new(60000.0, 60015.0, 1.0).unwrap())
        .await;
    let bright = scheduler.frame().await;
    let bright_buffer = ready(&bright.tiles[0].status);
    assert_eq!(bright_buffer.data[15], 255);
    assert!(bright_buffer.data[8] < bright_buffer.data[15]);

    // back to the first transform gives the first rendering exactly
    scheduler
        .set_transform(DisplayTransform::new(0.0, 1000.0, 1.0).unwrap())
        .await;
    let restored = scheduler.frame().await;
    assert_eq!(ready(&restored.tiles[0].status), &dark_buffer);
    scheduler.close().await;
}

#[tokio::test]
async fn test_auto_levels_uses_visible_samples() {
    let dir = create_store(16, 16, 1, SampleType::U16, two_band_values()).await;
    let scheduler = scheduler(dir.path()).await;

    // only the dark half is visible
    scheduler
        .set_viewport(ViewportRequest {
            downsample: 1.0,
            region: Region::new(0.0, 0.0, 8.0, 16.0),
        })
        .await
        .unwrap();
    scheduler.settle().await;

    let transform = scheduler.auto_levels().await.unwrap();
    assert_eq!(transform.clip_low(), 100.0);
    assert_eq!(transform.clip_high(), 107.0);
    assert_eq!(scheduler.transform().await, transform);
    scheduler.close().await;
}

#[test]
fn test_levels_gamma() {
    let centred = DisplayTransform::from_levels(0.0, 50.0, 100.0).unwrap();
    assert_eq!(centred.gamma(), 1.0);

    let dark_mid = DisplayTransform::from_levels(0.0, 25.0, 100.0).unwrap();
    assert!(dark_mid.gamma() > 1.0);
    assert!(dark_mid.map(50.0) > centred.map(50.0));

    let bright_mid = DisplayTransform::from_levels(1000.0, 1075.0, 1100.0).unwrap();
    assert!(bright_mid.gamma() < 1.0);

    assert!(DisplayTransform::from_levels(10.0, 10.0, 10.0).is_err());
}

#[tokio::test]
async fn test_export_png() {
    let dir = create_store(16, 16, 1, SampleType::U16, two_band_values()).await;
    let store = open(dir.path()).await;
    let window = store.read_window(0, 4, 4, 8, 4).await.unwrap();

    let buffer = map_window(&window, &DisplayTransform::auto(&window));
    let image = buffer.to_image().unwrap();

    let out = tempfile::tempdir().unwrap();
    let path = out.path().join("view.png");
    image.save(&path).unwrap();

    let decoded = image::open(&path).unwrap().to_luma8();
    assert_eq!(decoded.dimensions(), (8, 4));
    assert_eq!(decoded.get_pixel(0, 0).0[0], 0);
    assert_eq!(decoded.get_pixel(7, 0).0[0], 255);
}
