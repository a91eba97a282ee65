//! Viewport scheduling integration tests.
//!
//! Tests verify:
//! - A 40000 x 30000 raster resolves its level-3 viewport to one tile
//! - Covering sets are gap-free and single-level
//! - Per-tile failures are contained and retried
//! - Resident memory stays within the configured budget
//! - Completion events reach subscribers
//! - Superseded viewports and closing leave no stale tiles behind

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pyramid_label::tile::{SchedulerState, TileEvent, TileKey};
use pyramid_label::{
    PyramidBuilder, PyramidLayout, RasterStore, Region, SchedulerConfig, TileGrid, TileScheduler,
    TileStatus, ViewportRequest,
};

use super::test_utils::{gradient_store, open, open_slow, small_pyramid};

/// Per-read delay of the slow source.
const SLOW_READ: Duration = Duration::from_millis(2);

async fn scheduler(
    root: &std::path::Path,
    tile_size: u32,
    cache_capacity: usize,
) -> TileScheduler {
    scheduler_for(Arc::new(open(root).await), tile_size, cache_capacity).await
}

async fn scheduler_for(
    store: Arc<RasterStore>,
    tile_size: u32,
    cache_capacity: usize,
) -> TileScheduler {
    let builder = Arc::new(PyramidBuilder::new(small_pyramid()));
    TileScheduler::new(
        store,
        builder,
        SchedulerConfig {
            tile_size,
            cache_capacity,
        },
    )
    .await
}

fn viewport(downsample: f64, x: f64, y: f64, w: f64, h: f64) -> ViewportRequest {
    ViewportRequest {
        downsample,
        region: Region::new(x, y, w, h),
    }
}

#[test]
fn test_large_raster_level3_single_tile() {
    let layout = PyramidLayout::new(40000, 30000, 2, 1024, true);
    let level = layout.best_level_for_downsample(8.0);
    assert_eq!(level, 3);

    let (w, h) = layout.dimensions(level).unwrap();
    assert_eq!((w, h), (5000, 3750));

    let grid = TileGrid::new(level, w, h, 512);
    let tiles = grid.covering(&Region::new(0.0, 0.0, 512.0, 512.0));
    assert_eq!(tiles.len(), 1);
    assert_eq!((tiles[0].level, tiles[0].x, tiles[0].y), (3, 0, 0));

    let rect = grid.tile_rect(0, 0).unwrap();
    assert_eq!((rect.x, rect.y, rect.width, rect.height), (0, 0, 512, 512));
}

#[tokio::test]
async fn test_cover_is_gap_free_and_single_level() {
    let dir = gradient_store(100, 70).await;
    let scheduler = scheduler(dir.path(), 16, 64 * 1024 * 1024).await;

    let plan = scheduler
        .set_viewport(viewport(2.0, 10.0, 6.0, 70.0, 50.0))
        .await
        .unwrap();
    assert_eq!(plan.level, 1);
    scheduler.settle().await;

    let frame = scheduler.frame().await;
    assert!(frame.is_complete());
    assert!(frame.tiles.iter().all(|t| t.coord.level == 1));

    // every visible level pixel lies in exactly one tile
    let (x0, y0) = (plan.region.x.floor() as u32, plan.region.y.floor() as u32);
    let x1 = (plan.region.x + plan.region.width).ceil() as u32;
    let y1 = (plan.region.y + plan.region.height).ceil() as u32;
    for y in y0..y1 {
        for x in x0..x1 {
            let hits = frame
                .tiles
                .iter()
                .filter(|t| {
                    let r = t.rect;
                    x >= r.x && x < r.x + r.width && y >= r.y && y < r.y + r.height
                })
                .count();
            assert_eq!(hits, 1, "pixel ({x}, {y})");
        }
    }
    scheduler.close().await;
}

#[tokio::test]
async fn test_region_partly_outside_is_clamped() {
    let dir = gradient_store(40, 40).await;
    let scheduler = scheduler(dir.path(), 16, 64 * 1024 * 1024).await;

    let plan = scheduler
        .set_viewport(viewport(1.0, -50.0, 35.0, 200.0, 100.0))
        .await
        .unwrap();
    assert_eq!(plan.tiles.len(), 3);
    scheduler.settle().await;

    let frame = scheduler.frame().await;
    assert_eq!(frame.failed_count(), 0);
    assert!(frame.is_complete());
    scheduler.close().await;
}

#[tokio::test]
async fn test_failed_tiles_are_contained_and_retried() {
    let dir = gradient_store(64, 64).await;
    PyramidBuilder::new(small_pyramid())
        .build_all(&open(dir.path()).await)
        .await
        .unwrap();

    let scheduler = scheduler(dir.path(), 16, 64 * 1024 * 1024).await;

    // cut level 1 (32 x 32 u16) after its first 16 rows
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("pyramid/data/1.raw"))
        .unwrap();
    file.set_len(32 * 16 * 2).unwrap();

    scheduler
        .set_viewport(viewport(2.0, 0.0, 0.0, 64.0, 64.0))
        .await
        .unwrap();
    scheduler.settle().await;

    let frame = scheduler.frame().await;
    assert_eq!(frame.tiles.len(), 4);
    assert_eq!(frame.ready_count(), 2);
    assert_eq!(frame.failed_count(), 2);
    assert_eq!(scheduler.state().await, SchedulerState::LevelSelected { level: 1 });

    assert_eq!(scheduler.retry_failed().await.unwrap(), 2);
    scheduler.settle().await;
    assert_eq!(scheduler.frame().await.failed_count(), 2);
    scheduler.close().await;
}

#[tokio::test]
async fn test_resident_memory_is_bounded() {
    let dir = gradient_store(128, 128).await;
    // one 16 x 16 single-channel tile holds 2 KiB of f64 samples
    let capacity = 3 * 2048;
    let scheduler = scheduler(dir.path(), 16, capacity).await;

    scheduler
        .set_viewport(viewport(1.0, 0.0, 0.0, 128.0, 128.0))
        .await
        .unwrap();
    scheduler.settle().await;

    assert!(scheduler.cache().size().await <= capacity);
    assert!(scheduler.cache().len().await <= 3);

    let frame = scheduler.frame().await;
    assert_eq!(frame.tiles.len(), 64);
    assert!(frame.pending_count() > 0);
    scheduler.close().await;
}

#[tokio::test]
async fn test_events_report_loads() {
    let dir = gradient_store(32, 32).await;
    let scheduler = scheduler(dir.path(), 16, 64 * 1024 * 1024).await;
    let mut events = scheduler.subscribe();

    let plan = scheduler
        .set_viewport(viewport(2.0, 0.0, 0.0, 32.0, 32.0))
        .await
        .unwrap();
    scheduler.settle().await;

    let mut loaded = HashSet::new();
    let mut level_ready = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TileEvent::Loaded { epoch, coord } => {
                assert_eq!(epoch, plan.epoch);
                loaded.insert(coord);
            }
            TileEvent::LevelReady { level, .. } => level_ready |= level == 1,
            TileEvent::Failed { reason, .. } => panic!("unexpected failure: {reason}"),
        }
    }
    assert!(level_ready);
    assert_eq!(loaded, plan.tiles.iter().copied().collect());
    scheduler.close().await;
}

#[tokio::test]
async fn test_pan_keeps_resident_tiles() {
    let dir = gradient_store(64, 64).await;
    let scheduler = scheduler(dir.path(), 16, 64 * 1024 * 1024).await;

    scheduler
        .set_viewport(viewport(1.0, 0.0, 0.0, 32.0, 32.0))
        .await
        .unwrap();
    scheduler.settle().await;
    assert_eq!(scheduler.cache().len().await, 4);

    // same level: tiles outside the new view stay resident until evicted
    let plan = scheduler
        .set_viewport(viewport(1.0, 16.0, 0.0, 32.0, 32.0))
        .await
        .unwrap();
    assert_eq!(plan.tiles.len(), 4);
    scheduler.settle().await;
    assert_eq!(scheduler.cache().len().await, 6);

    let frame = scheduler.frame().await;
    assert!(frame.is_complete());
    assert!(matches!(frame.tiles[0].status, TileStatus::Ready(_)));
    scheduler.close().await;
}

#[tokio::test]
async fn test_superseded_viewport_drops_stale_tiles() {
    let dir = gradient_store(64, 64).await;
    let store = Arc::new(open_slow(dir.path(), SLOW_READ).await);
    let scheduler = scheduler_for(Arc::clone(&store), 32, 64 * 1024 * 1024).await;
    let mut events = scheduler.subscribe();

    let first = scheduler
        .set_viewport(viewport(1.0, 0.0, 0.0, 64.0, 64.0))
        .await
        .unwrap();
    assert_eq!((first.level, first.tiles.len()), (0, 4));

    // let the loader start on the first tile, then move on before it lands
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = scheduler
        .set_viewport(viewport(2.0, 0.0, 0.0, 64.0, 64.0))
        .await
        .unwrap();
    assert_eq!((second.level, second.tiles.len()), (1, 1));
    scheduler.settle().await;

    let mut loaded = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            TileEvent::Loaded { epoch, coord } => {
                assert_ne!(epoch, first.epoch, "stale tile {coord:?} reported");
                loaded.push((epoch, coord));
            }
            TileEvent::Failed { reason, .. } => panic!("unexpected failure: {reason}"),
            TileEvent::LevelReady { .. } => {}
        }
    }
    assert_eq!(loaded, vec![(second.epoch, second.tiles[0])]);

    // only the tile of the current plan is resident
    assert_eq!(scheduler.cache().len().await, 1);
    assert!(
        scheduler
            .cache()
            .contains(&TileKey::new(Arc::clone(store.id()), 1, 0, 0))
            .await
    );
    for coord in &first.tiles {
        let key = TileKey::new(Arc::clone(store.id()), coord.level, coord.x, coord.y);
        assert!(!scheduler.cache().contains(&key).await);
    }
    assert_eq!(scheduler.state().await, SchedulerState::TilesResident { level: 1 });
    scheduler.close().await;
}

#[tokio::test]
async fn test_close_drops_in_flight_loads() {
    let dir = gradient_store(64, 64).await;
    let store = Arc::new(open_slow(dir.path(), SLOW_READ).await);
    let scheduler = scheduler_for(Arc::clone(&store), 16, 64 * 1024 * 1024).await;
    let mut events = scheduler.subscribe();

    // level 2 needs levels 1 and 2 built from the slow source
    let plan = scheduler
        .set_viewport(viewport(4.0, 0.0, 0.0, 64.0, 64.0))
        .await
        .unwrap();
    assert_eq!(plan.level, 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.close().await;

    assert_eq!(scheduler.state().await, SchedulerState::Idle);
    assert!(scheduler.cache().is_empty().await);
    assert!(scheduler.frame().await.tiles.is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(
            matches!(event, TileEvent::LevelReady { .. }),
            "unexpected event after close: {event:?}"
        );
    }

    // the interrupted build installed nothing and left no partial file
    assert_eq!(store.level_count().await, 1);
    let pyramid = dir.path().join("pyramid/data");
    if pyramid.exists() {
        let names: Vec<_> = std::fs::read_dir(&pyramid)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert!(names.is_empty(), "{names:?}");
    }
}
