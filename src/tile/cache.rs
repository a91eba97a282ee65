//! Resident tile cache.
//!
//! Holds the full-precision samples of loaded tiles together with the last
//! 8-bit rendering made from them. A transform change only invalidates the
//! rendering; the samples stay resident and are re-mapped on the next frame.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total size of resident tiles in bytes (samples plus
//! rendering) and evicts least-recently-displayed entries when the capacity
//! is exceeded.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::RwLock;

use crate::display::DisplayBuffer;
use crate::raster::SampleWindow;

/// Default cache capacity: 256MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 10_000;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for resident tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Raster identifier
    pub raster: Arc<str>,

    /// Pyramid level (0 = source)
    pub level: usize,

    pub tile_x: u32,
    pub tile_y: u32,
}

impl TileKey {
    pub fn new(raster: impl Into<Arc<str>>, level: usize, tile_x: u32, tile_y: u32) -> Self {
        Self {
            raster: raster.into(),
            level,
            tile_x,
            tile_y,
        }
    }
}

// =============================================================================
// Resident Tile
// =============================================================================

/// A loaded tile.
#[derive(Debug, Clone)]
pub struct ResidentTile {
    /// Full-precision samples, shared with readers of the cache
    pub samples: Arc<SampleWindow>,

    /// Rendering and the transform revision it was made with
    pub rendered: Option<(u64, DisplayBuffer)>,
}

impl ResidentTile {
    pub fn new(samples: SampleWindow) -> Self {
        Self {
            samples: Arc::new(samples),
            rendered: None,
        }
    }

    /// Rendering made with transform `revision`, if there is one.
    pub fn rendered_at(&self, revision: u64) -> Option<&DisplayBuffer> {
        match &self.rendered {
            Some((r, buffer)) if *r == revision => Some(buffer),
            _ => None,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.samples.byte_size() + self.rendered.as_ref().map_or(0, |(_, b)| b.byte_size())
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct Inner {
    lru: LruCache<TileKey, ResidentTile>,
    size: usize,
}

impl Inner {
    fn evict_to(&mut self, max_size: usize) -> usize {
        let mut evicted = 0;
        while self.size > max_size {
            match self.lru.pop_lru() {
                Some((_, tile)) => {
                    self.size = self.size.saturating_sub(tile.byte_size());
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// LRU cache for resident tiles with size-based capacity.
///
/// # Thread Safety
///
/// The cache is thread-safe and can be shared across async tasks via `Arc`.
/// All mutation goes through a single write lock.
pub struct TileCache {
    inner: RwLock<Inner>,

    /// Maximum total size in bytes
    max_size: usize,
}

impl TileCache {
    /// Create a new tile cache with default capacity (256MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a new tile cache with specified capacity and maximum entries.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of resident tiles in bytes
    /// * `max_entries` - Maximum number of entries in the cache
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(Inner {
                lru: LruCache::new(entries),
                size: 0,
            }),
            max_size,
        }
    }

    /// Get a tile and mark it as recently displayed.
    pub async fn get(&self, key: &TileKey) -> Option<ResidentTile> {
        let mut inner = self.inner.write().await;
        inner.lru.get(key).cloned()
    }

    /// Check if a tile is resident without updating LRU order.
    pub async fn contains(&self, key: &TileKey) -> bool {
        self.inner.read().await.lru.contains(key)
    }

    /// Store a tile.
    ///
    /// If the cache is over capacity after insertion, least-recently-displayed
    /// entries are evicted until it is within capacity. Returns the number of
    /// evicted tiles.
    pub async fn put(&self, key: TileKey, tile: ResidentTile) -> usize {
        let tile_size = tile.byte_size();
        let mut inner = self.inner.write().await;

        if let Some(old) = inner.lru.peek(&key) {
            let old_size = old.byte_size();
            inner.size = inner.size.saturating_sub(old_size);
        }

        // `push` hands back either the replaced entry (counted above) or one
        // pushed out by the entry bound
        if let Some((evicted_key, evicted)) = inner.lru.push(key.clone(), tile) {
            if evicted_key != key {
                inner.size = inner.size.saturating_sub(evicted.byte_size());
            }
        }
        inner.size += tile_size;

        inner.evict_to(self.max_size)
    }

    /// Attach a rendering to a resident tile.
    ///
    /// Does nothing if the tile was evicted in the meantime.
    pub async fn set_rendered(&self, key: &TileKey, revision: u64, buffer: DisplayBuffer) {
        let mut inner = self.inner.write().await;
        let Some(tile) = inner.lru.peek_mut(key) else {
            return;
        };

        let old = tile.byte_size();
        tile.rendered = Some((revision, buffer));
        let new = tile.byte_size();

        inner.size = inner.size.saturating_sub(old) + new;
        inner.evict_to(self.max_size);
    }

    /// Drop every tile for which `keep` returns false. Returns the number of
    /// removed tiles.
    pub async fn retain(&self, mut keep: impl FnMut(&TileKey) -> bool) -> usize {
        let mut inner = self.inner.write().await;
        let doomed: Vec<TileKey> = inner
            .lru
            .iter()
            .filter(|(k, _)| !keep(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            if let Some(tile) = inner.lru.pop(key) {
                inner.size = inner.size.saturating_sub(tile.byte_size());
            }
        }
        doomed.len()
    }

    /// Remove a tile. Returns it if it was resident.
    pub async fn remove(&self, key: &TileKey) -> Option<ResidentTile> {
        let mut inner = self.inner.write().await;
        let tile = inner.lru.pop(key)?;
        inner.size = inner.size.saturating_sub(tile.byte_size());
        Some(tile)
    }

    /// Clear all entries from the cache.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.lru.clear();
        inner.size = 0;
    }

    /// Get the current number of resident tiles.
    pub async fn len(&self) -> usize {
        self.inner.read().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.lru.is_empty()
    }

    /// Get the current total size of resident tiles in bytes.
    pub async fn size(&self) -> usize {
        self.inner.read().await.size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
