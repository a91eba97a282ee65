//! Pyramid building integration tests.
//!
//! Tests verify:
//! - Level extents are floor-divided and values are area averages
//! - ensure_level is idempotent and returns identical bytes
//! - Persisted levels are reattached on reopen without rebuilding
//! - Stale pyramids are discarded when the source changes
//! - Unwritable stores degrade to in-memory levels
//! - Levels are written block by block with no partial files left behind

use pyramid_label::pyramid::Persistence;
use pyramid_label::raster::manifest;
use pyramid_label::{PyramidBuilder, PyramidConfig, PyramidError, SampleType};

use super::test_utils::{
    create_store, gradient, gradient_store, gradient_value, open, small_pyramid, write_dataset,
};

#[tokio::test]
async fn test_floor_extents_and_area_average() {
    let dir = gradient_store(37, 21).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());

    let level = builder.ensure_level(&store, 2).await.unwrap();
    assert_eq!((level.width, level.height), (9, 5));
    assert_eq!(level.downsample, 4.0);
    assert_eq!(store.level_count().await, 3);

    let l1 = store.level(1).await.unwrap();
    assert_eq!((l1.width, l1.height), (18, 10));

    // level 1 pixel (3, 2) averages source pixels (6..8, 4..6)
    let window = store.read_window(1, 3, 2, 1, 1).await.unwrap();
    let expected = (gradient_value(6, 4)
        + gradient_value(7, 4)
        + gradient_value(6, 5)
        + gradient_value(7, 5))
        / 4.0;
    assert_eq!(window.data[[0, 0, 0]], expected.round());
}

#[tokio::test]
async fn test_ensure_level_idempotent() {
    let dir = gradient_store(64, 48).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());

    let first = builder.ensure_level(&store, 2).await.unwrap();
    let bytes_before = tokio::fs::read(dir.path().join("pyramid/data/2.raw"))
        .await
        .unwrap();
    let modified = tokio::fs::metadata(dir.path().join("pyramid/data/2.raw"))
        .await
        .unwrap()
        .modified()
        .unwrap();

    let second = builder.ensure_level(&store, 2).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.persistence, Persistence::Stored);

    let bytes_after = tokio::fs::read(dir.path().join("pyramid/data/2.raw"))
        .await
        .unwrap();
    assert_eq!(bytes_before, bytes_after);
    let modified_after = tokio::fs::metadata(dir.path().join("pyramid/data/2.raw"))
        .await
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(modified, modified_after);

    let a = store.read_window(2, 0, 0, 16, 12).await.unwrap();
    let b = store.read_window(2, 0, 0, 16, 12).await.unwrap();
    assert_eq!(a.data, b.data);
}

#[tokio::test]
async fn test_concurrent_requests_build_once() {
    let dir = gradient_store(64, 64).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());

    let (a, b, c) = tokio::join!(
        builder.ensure_level(&store, 3),
        builder.ensure_level(&store, 1),
        builder.ensure_level(&store, 2),
    );
    assert_eq!(a.unwrap().width, 8);
    assert_eq!(b.unwrap().width, 32);
    assert_eq!(c.unwrap().width, 16);
    assert_eq!(store.level_count().await, 4);
}

#[tokio::test]
async fn test_reopen_attaches_persisted_levels() {
    let dir = gradient_store(64, 64).await;
    {
        let store = open(dir.path()).await;
        let builder = PyramidBuilder::new(small_pyramid());
        builder.build_all(&store).await.unwrap();
    }

    let store = open(dir.path()).await;
    assert_eq!(store.level_count().await, 4);
    assert_eq!(store.pyramid_factor().await, Some(2));
    assert_eq!(
        store.level(3).await.unwrap().persistence,
        Persistence::Stored
    );
    // sample range was recorded while building level 1
    assert_eq!(
        store.known_sample_range().await.map(|r| r.max),
        Some(gradient_value(63, 63))
    );

    let builder = PyramidBuilder::new(small_pyramid());
    let level = builder.ensure_level(&store, 3).await.unwrap();
    assert_eq!(level.persistence, Persistence::Stored);
}

#[tokio::test]
async fn test_factor_change_rebuilds() {
    let dir = gradient_store(81, 81).await;
    let store = open(dir.path()).await;

    PyramidBuilder::new(small_pyramid())
        .ensure_level(&store, 1)
        .await
        .unwrap();

    let builder = PyramidBuilder::new(PyramidConfig {
        factor: 3,
        ..small_pyramid()
    });
    let level = builder.ensure_level(&store, 2).await.unwrap();
    assert_eq!((level.width, level.height), (9, 9));
    assert_eq!(level.downsample, 9.0);
    assert_eq!(store.pyramid_factor().await, Some(3));
}

#[tokio::test]
async fn test_stale_pyramid_discarded() {
    let dir = gradient_store(32, 32).await;
    {
        let store = open(dir.path()).await;
        PyramidBuilder::new(small_pyramid())
            .build_all(&store)
            .await
            .unwrap();
    }

    // replace the source with a different shape, keeping the old pyramid entry
    let pyramid = manifest::load(dir.path()).await.unwrap().pyramids["data"].clone();
    write_dataset(dir.path(), "data", 40, 24, 1, SampleType::U16, gradient(40, 24)).await;
    manifest::update(dir.path(), |m| {
        m.pyramids.insert("data".to_string(), pyramid);
    })
    .await
    .unwrap();

    let store = open(dir.path()).await;
    assert_eq!(store.level_count().await, 1);
    assert!(manifest::load(dir.path())
        .await
        .unwrap()
        .pyramids
        .get("data")
        .is_none());
}

#[tokio::test]
async fn test_level_out_of_range() {
    let dir = gradient_store(32, 32).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());

    assert!(matches!(
        builder.ensure_level(&store, 9).await,
        Err(PyramidError::LevelOutOfRange { level: 9, max_level: 2 })
    ));

    let flat = PyramidBuilder::new(PyramidConfig {
        enabled: false,
        ..small_pyramid()
    });
    let level0 = flat.ensure_level(&store, 0).await.unwrap();
    assert_eq!(level0.persistence, Persistence::Source);
    assert!(flat.ensure_level(&store, 1).await.is_err());
}

#[tokio::test]
async fn test_closed_store_cancels_build() {
    let dir = gradient_store(64, 64).await;
    let store = open(dir.path()).await;
    store.close();

    let result = PyramidBuilder::new(small_pyramid())
        .ensure_level(&store, 2)
        .await;
    assert!(matches!(result, Err(PyramidError::Cancelled)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unwritable_store_keeps_levels_in_memory() {
    use std::os::unix::fs::PermissionsExt;

    let dir = create_store(32, 32, 1, SampleType::U8, vec![7.0; 32 * 32]).await;
    let store = open(dir.path()).await;

    let perms = std::fs::Permissions::from_mode(0o555);
    std::fs::set_permissions(dir.path(), perms).unwrap();

    let result = PyramidBuilder::new(small_pyramid())
        .ensure_level(&store, 1)
        .await;

    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    // root ignores directory permissions, in which case the level is stored
    let level = result.unwrap();
    match &level.persistence {
        Persistence::InMemory { reason } => assert!(!reason.is_empty()),
        Persistence::Stored => {}
        other => panic!("unexpected persistence {other:?}"),
    }
    let window = store.read_window(1, 0, 0, 16, 16).await.unwrap();
    assert!(window.data.iter().all(|&v| v == 7.0));
}

#[tokio::test]
async fn test_level_written_block_by_block() {
    // level 1 is 32 x 32, assembled from sixteen 8 x 8 blocks
    let dir = gradient_store(64, 64).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());

    let level = builder.ensure_level(&store, 1).await.unwrap();
    assert_eq!(level.persistence, Persistence::Stored);

    let window = store.read_window(1, 0, 0, 32, 32).await.unwrap();
    for y in 0..32u32 {
        for x in 0..32u32 {
            let expected = (gradient_value(2 * x, 2 * y)
                + gradient_value(2 * x + 1, 2 * y)
                + gradient_value(2 * x, 2 * y + 1)
                + gradient_value(2 * x + 1, 2 * y + 1))
                / 4.0;
            assert_eq!(window.data[[y as usize, x as usize, 0]], expected.round(), "({x}, {y})");
        }
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("pyramid/data"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
