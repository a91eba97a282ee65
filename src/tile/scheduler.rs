//! Viewport-driven tile scheduling.
//!
//! The scheduler turns a viewport (a region of level-0 pixels and a display
//! density) into one pyramid level and the minimal set of tiles covering the
//! region. Missing tiles are loaded by a single background task; callers ask
//! [`TileScheduler::frame`] what to draw now and may listen for
//! [`TileEvent`]s to know when to ask again.
//!
//! # Epochs
//!
//! Every viewport change bumps an epoch. Queued loads from an older epoch are
//! skipped when dequeued, and results that arrive after the epoch moved on
//! are dropped, so a fast pan never leaves stale tiles behind.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cache::{ResidentTile, TileCache, TileKey};
use super::grid::{Region, TileCoord, TileGrid, TileRect};
use crate::config::PipelineConfig;
use crate::display::{map_window, DisplayBuffer, DisplayTransform};
use crate::error::TileError;
use crate::pyramid::{Persistence, PyramidBuilder, PyramidLayout};
use crate::raster::{RasterStore, SampleRange};

const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Public Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Tile side in level pixels
    pub tile_size: u32,

    /// Budget for resident tiles in bytes
    pub cache_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for SchedulerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            tile_size: config.tile_size,
            cache_capacity: config.cache_capacity,
        }
    }
}

/// What the presentation surface is showing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRequest {
    /// Level-0 pixels per display pixel
    pub downsample: f64,

    /// Visible region in level-0 pixels
    pub region: Region,
}

/// Level and tiles chosen for a viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportPlan {
    pub epoch: u64,
    pub level: usize,
    /// Downsample of `level` relative to level 0
    pub downsample: f64,
    /// Visible region in level pixels
    pub region: Region,
    pub grid: TileGrid,
    pub tiles: Vec<TileCoord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No viewport, or closed
    Idle,
    /// A level is chosen and some of its tiles are still missing
    LevelSelected { level: usize },
    /// Every tile of the viewport is resident
    TilesResident { level: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TileStatus {
    Ready(DisplayBuffer),
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameTile {
    pub coord: TileCoord,
    /// Pixel rectangle in level pixels
    pub rect: TileRect,
    pub status: TileStatus,
}

/// Everything to draw for the current viewport, all at one level.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub level: usize,
    pub downsample: f64,
    pub tiles: Vec<FrameTile>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            level: 0,
            downsample: 1.0,
            tiles: Vec::new(),
        }
    }

    pub fn ready_count(&self) -> usize {
        self.count(|s| matches!(s, TileStatus::Ready(_)))
    }

    pub fn pending_count(&self) -> usize {
        self.count(|s| matches!(s, TileStatus::Pending))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|s| matches!(s, TileStatus::Failed(_)))
    }

    pub fn is_complete(&self) -> bool {
        self.ready_count() == self.tiles.len()
    }

    fn count(&self, f: impl Fn(&TileStatus) -> bool) -> usize {
        self.tiles.iter().filter(|t| f(&t.status)).count()
    }
}

/// Completion notifications from the background loader.
#[derive(Debug, Clone, PartialEq)]
pub enum TileEvent {
    Loaded {
        epoch: u64,
        coord: TileCoord,
    },
    Failed {
        epoch: u64,
        coord: TileCoord,
        reason: String,
    },
    LevelReady {
        level: usize,
        persistence: Persistence,
    },
}

// =============================================================================
// Shared State
// =============================================================================

struct LoadRequest {
    epoch: u64,
    coord: TileCoord,
    rect: TileRect,
}

#[derive(Default)]
struct ViewState {
    plan: Option<ViewportPlan>,
    failures: HashMap<TileCoord, String>,
    /// Tiles queued for loading and the epoch they were queued in
    queued: HashMap<TileCoord, u64>,
    ready_levels: HashSet<usize>,
}

struct Shared {
    store: Arc<RasterStore>,
    builder: Arc<PyramidBuilder>,
    layout: PyramidLayout,
    tile_size: u32,
    cache: TileCache,
    view: Mutex<ViewState>,
    epoch: AtomicU64,
    /// Current transform and its revision
    transform: RwLock<(u64, DisplayTransform)>,
    events: broadcast::Sender<TileEvent>,
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn key(&self, coord: TileCoord) -> TileKey {
        TileKey::new(Arc::clone(self.store.id()), coord.level, coord.x, coord.y)
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn emit(&self, event: TileEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn load(&self, req: LoadRequest) {
        if !self.is_current(req.epoch) {
            debug!(level = req.coord.level, x = req.coord.x, y = req.coord.y, "Skipping stale tile request");
            return;
        }

        let level = match self.builder.ensure_level(&self.store, req.coord.level).await {
            Ok(level) => level,
            Err(e) => return self.fail(&req, e.into()).await,
        };

        let window = match self
            .store
            .read_window(req.coord.level, req.rect.x, req.rect.y, req.rect.width, req.rect.height)
            .await
        {
            Ok(window) => window,
            Err(e) => return self.fail(&req, e.into()).await,
        };

        let mut view = self.view.lock().await;
        if view.ready_levels.insert(level.level) {
            self.emit(TileEvent::LevelReady {
                level: level.level,
                persistence: level.persistence,
            });
        }
        if !self.is_current(req.epoch) {
            debug!(level = req.coord.level, x = req.coord.x, y = req.coord.y, "Dropping late tile");
            return;
        }

        self.cache
            .put(self.key(req.coord), ResidentTile::new(window))
            .await;
        if view.queued.get(&req.coord) == Some(&req.epoch) {
            view.queued.remove(&req.coord);
        }
        drop(view);

        debug!(level = req.coord.level, x = req.coord.x, y = req.coord.y, "Loaded tile");
        self.emit(TileEvent::Loaded {
            epoch: req.epoch,
            coord: req.coord,
        });
    }

    async fn fail(&self, req: &LoadRequest, error: TileError) {
        let mut view = self.view.lock().await;
        if !self.is_current(req.epoch) {
            return;
        }

        let reason = error.to_string();
        warn!(level = req.coord.level, x = req.coord.x, y = req.coord.y, error = %reason, "Tile load failed");
        view.failures.insert(req.coord, reason.clone());
        if view.queued.get(&req.coord) == Some(&req.epoch) {
            view.queued.remove(&req.coord);
        }
        drop(view);

        self.emit(TileEvent::Failed {
            epoch: req.epoch,
            coord: req.coord,
            reason,
        });
    }
}

async fn run_loader(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<LoadRequest>) {
    while let Some(req) = rx.recv().await {
        shared.load(req).await;
        if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            shared.idle.notify_waiters();
        }
    }
    debug!("Tile loader stopped");
}

// =============================================================================
// Tile Scheduler
// =============================================================================

/// Decides which tiles of which level to show, loads them in the background
/// and renders them under the current display transform.
///
/// Must be created inside a tokio runtime.
pub struct TileScheduler {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::UnboundedSender<LoadRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TileScheduler {
    /// Create a scheduler for an open raster and start its loader task.
    ///
    /// The initial transform spans the raster's known sample range, or the
    /// full range of its sample type when none is recorded yet.
    pub async fn new(
        store: Arc<RasterStore>,
        builder: Arc<PyramidBuilder>,
        config: SchedulerConfig,
    ) -> Self {
        let layout = builder.layout(store.info());
        let range = match store.known_sample_range().await {
            Some(range) => range,
            None => default_range(&store),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            store,
            builder,
            layout,
            tile_size: config.tile_size,
            cache: TileCache::with_capacity(config.cache_capacity),
            view: Mutex::new(ViewState::default()),
            epoch: AtomicU64::new(0),
            transform: RwLock::new((0, DisplayTransform::full_range(range))),
            events,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let worker = tokio::spawn(run_loader(Arc::clone(&shared), rx));

        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.shared.layout
    }

    pub fn cache(&self) -> &TileCache {
        &self.shared.cache
    }

    /// Show a new viewport.
    ///
    /// Selects the coarsest level that still has at least the requested
    /// density, evicts tiles of any other level, and queues every missing or
    /// previously failed tile of the covering set.
    ///
    /// # Errors
    ///
    /// - `InvalidViewport` for a non-positive downsample or non-finite region
    /// - `Closed` after [`TileScheduler::close`]
    pub async fn set_viewport(&self, request: ViewportRequest) -> Result<ViewportPlan, TileError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TileError::Closed);
        }
        if !(request.downsample.is_finite() && request.downsample > 0.0) {
            return Err(TileError::InvalidViewport(format!(
                "downsample must be positive, got {}",
                request.downsample
            )));
        }
        if !request.region.is_finite() {
            return Err(TileError::InvalidViewport(
                "region must be finite".to_string(),
            ));
        }

        let layout = &self.shared.layout;
        let level = layout.best_level_for_downsample(request.downsample);
        let (width, height) = layout.dimensions(level).ok_or(TileError::InvalidLevel {
            level,
            max_level: layout.max_level(),
        })?;
        let downsample = layout.downsample(level).unwrap_or(1.0);

        let grid = TileGrid::new(level, width, height, self.shared.tile_size);
        let region = request.region.scaled(downsample);
        let tiles = grid.covering(&region);

        let mut view = self.shared.view.lock().await;
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let previous = view.plan.as_ref().map(|p| p.level);
        if previous != Some(level) {
            let evicted = self.shared.cache.retain(|k| k.level == level).await;
            view.failures.retain(|coord, _| coord.level == level);
            debug!(level, evicted, "Switched level");
        }
        view.queued.clear();

        let mut requests = Vec::new();
        for &coord in &tiles {
            if self.shared.cache.contains(&self.shared.key(coord)).await {
                continue;
            }
            view.failures.remove(&coord);
            if let Some(rect) = grid.tile_rect(coord.x, coord.y) {
                view.queued.insert(coord, epoch);
                requests.push(LoadRequest { epoch, coord, rect });
            }
        }

        let queued = requests.len();
        self.enqueue(requests).await?;

        let plan = ViewportPlan {
            epoch,
            level,
            downsample,
            region,
            grid,
            tiles,
        };
        view.plan = Some(plan.clone());
        drop(view);

        debug!(epoch, level, tiles = plan.tiles.len(), queued, "Viewport planned");
        Ok(plan)
    }

    async fn enqueue(&self, requests: Vec<LoadRequest>) -> Result<(), TileError> {
        let queue = self.queue.lock().await;
        let tx = queue.as_ref().ok_or(TileError::Closed)?;
        for req in requests {
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            if tx.send(req).is_err() {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(TileError::Closed);
            }
        }
        Ok(())
    }

    /// Queue the failed tiles of the current viewport again.
    ///
    /// Returns the number of tiles queued.
    pub async fn retry_failed(&self) -> Result<usize, TileError> {
        let mut view = self.shared.view.lock().await;
        let Some(plan) = view.plan.clone() else {
            return Ok(0);
        };
        let epoch = self.shared.epoch.load(Ordering::SeqCst);

        let mut requests = Vec::new();
        for &coord in &plan.tiles {
            if view.failures.remove(&coord).is_none() {
                continue;
            }
            if let Some(rect) = plan.grid.tile_rect(coord.x, coord.y) {
                view.queued.insert(coord, epoch);
                requests.push(LoadRequest { epoch, coord, rect });
            }
        }

        let count = requests.len();
        self.enqueue(requests).await?;
        Ok(count)
    }

    /// Tiles to draw now, with their load status.
    ///
    /// Resident tiles are rendered under the current transform; a rendering is
    /// reused until the transform changes. Tiles of the viewport that were
    /// evicted since they loaded are queued again and reported as pending.
    pub async fn frame(&self) -> Frame {
        let (plan, failures) = {
            let view = self.shared.view.lock().await;
            match &view.plan {
                Some(plan) => (plan.clone(), view.failures.clone()),
                None => return Frame::empty(),
            }
        };
        let (revision, transform) = *self.shared.transform.read().await;

        let mut tiles = Vec::with_capacity(plan.tiles.len());
        let mut missing = Vec::new();
        for &coord in &plan.tiles {
            let Some(rect) = plan.grid.tile_rect(coord.x, coord.y) else {
                continue;
            };
            let key = self.shared.key(coord);

            let status = match self.shared.cache.get(&key).await {
                Some(tile) => match tile.rendered_at(revision) {
                    Some(buffer) => TileStatus::Ready(buffer.clone()),
                    None => {
                        let buffer = map_window(&tile.samples, &transform);
                        self.shared
                            .cache
                            .set_rendered(&key, revision, buffer.clone())
                            .await;
                        TileStatus::Ready(buffer)
                    }
                },
                None => match failures.get(&coord) {
                    Some(reason) => TileStatus::Failed(reason.clone()),
                    None => {
                        missing.push(coord);
                        TileStatus::Pending
                    }
                },
            };
            tiles.push(FrameTile {
                coord,
                rect,
                status,
            });
        }

        if !missing.is_empty() {
            self.requeue_missing(&plan, missing).await;
        }

        Frame {
            level: plan.level,
            downsample: plan.downsample,
            tiles,
        }
    }

    /// Queue tiles of the current plan that are neither resident, failed nor
    /// already queued.
    async fn requeue_missing(&self, plan: &ViewportPlan, missing: Vec<TileCoord>) {
        let mut view = self.shared.view.lock().await;
        if !self.shared.is_current(plan.epoch) {
            return;
        }

        let mut requests = Vec::new();
        for coord in missing {
            if view.queued.contains_key(&coord) || view.failures.contains_key(&coord) {
                continue;
            }
            if self.shared.cache.contains(&self.shared.key(coord)).await {
                continue;
            }
            if let Some(rect) = plan.grid.tile_rect(coord.x, coord.y) {
                view.queued.insert(coord, plan.epoch);
                requests.push(LoadRequest {
                    epoch: plan.epoch,
                    coord,
                    rect,
                });
            }
        }

        let count = requests.len();
        if count == 0 {
            return;
        }
        match self.enqueue(requests).await {
            Ok(()) => debug!(epoch = plan.epoch, count, "Queued evicted tiles again"),
            Err(e) => debug!(error = %e, "Could not queue evicted tiles"),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        if self.shared.closed.load(Ordering::SeqCst) {
            return SchedulerState::Idle;
        }
        let view = self.shared.view.lock().await;
        let Some(plan) = &view.plan else {
            return SchedulerState::Idle;
        };

        for &coord in &plan.tiles {
            if !self.shared.cache.contains(&self.shared.key(coord)).await {
                return SchedulerState::LevelSelected { level: plan.level };
            }
        }
        SchedulerState::TilesResident { level: plan.level }
    }

    pub async fn transform(&self) -> DisplayTransform {
        self.shared.transform.read().await.1
    }

    /// Replace the display transform.
    ///
    /// Resident samples are kept; renderings are redone lazily on the next
    /// frame.
    pub async fn set_transform(&self, transform: DisplayTransform) {
        let mut current = self.shared.transform.write().await;
        *current = (current.0 + 1, transform);
        debug!(
            revision = current.0,
            low = transform.clip_low(),
            high = transform.clip_high(),
            gamma = transform.gamma(),
            "Display transform changed"
        );
    }

    /// Set the transform from the samples currently visible.
    ///
    /// Only resident tiles contribute. Returns `None`, leaving the transform
    /// unchanged, while nothing visible is resident.
    pub async fn auto_levels(&self) -> Option<DisplayTransform> {
        let plan = self.shared.view.lock().await.plan.clone()?;
        let r = plan.region;

        let mut range: Option<SampleRange> = None;
        for &coord in &plan.tiles {
            let Some(tile) = self.shared.cache.get(&self.shared.key(coord)).await else {
                continue;
            };
            let w = &tile.samples;
            let (h, wd, _) = w.data.dim();

            // visible part of the tile, in tile-local pixels
            let x0 = (r.x.floor() - w.x as f64).clamp(0.0, wd as f64) as usize;
            let y0 = (r.y.floor() - w.y as f64).clamp(0.0, h as f64) as usize;
            let x1 = ((r.x + r.width).ceil() - w.x as f64).clamp(0.0, wd as f64) as usize;
            let y1 = ((r.y + r.height).ceil() - w.y as f64).clamp(0.0, h as f64) as usize;
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            let visible = w.data.slice(ndarray::s![y0..y1, x0..x1, ..]);
            range = SampleRange::extend(range, visible.iter().copied());
        }

        let transform = DisplayTransform::full_range(range?);
        self.set_transform(transform).await;
        Some(transform)
    }

    /// Receive completion events of background loads.
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until no loads are queued or running.
    pub async fn settle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop loading, drop resident tiles and close the raster.
    ///
    /// Pending loads are abandoned; a pyramid build in progress stops at its
    /// next block.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut view = self.shared.view.lock().await;
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            view.plan = None;
            view.failures.clear();
            view.queued.clear();
        }
        self.shared.store.close();
        self.queue.lock().await.take();

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Tile loader ended abnormally");
            }
        }
        self.shared.cache.clear().await;
        debug!(raster = %self.shared.store.id(), "Scheduler closed");
    }
}

/// Transform range before any samples have been seen.
fn default_range(store: &RasterStore) -> SampleRange {
    let sample_type = store.info().sample_type;
    if sample_type.is_float() {
        SampleRange { min: 0.0, max: 1.0 }
    } else {
        let (min, max) = sample_type.value_range();
        SampleRange { min, max }
    }
}
