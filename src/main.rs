//! pyramid-label - tiled viewing and polygon annotation of very large rasters.
//!
//! This binary exposes the pipeline as subcommands over a store directory.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use image::RgbaImage;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyramid_label::{
    annotation::{load_labels, LabelsFormat, Template},
    config::{
        BuildConfig, Cli, Command, ExportMaskConfig, ImportConfig, InfoConfig, RenderConfig,
        StoreArgs,
    },
    display::DisplayTransform,
    pyramid::{PyramidBuilder, PyramidConfig},
    raster::{import_image, DataLocator, RasterStore},
    tile::{Region, SchedulerConfig, TileScheduler, TileStatus, ViewportRequest},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Info(config) => run_info(config).await,
        Command::Import(config) => run_import(config).await,
        Command::BuildPyramid(config) => run_build(config).await,
        Command::Render(config) => run_render(config).await,
        Command::ExportMask(config) => run_export_mask(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pyramid_label=debug"
    } else {
        "pyramid_label=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(args: &StoreArgs) -> Option<RasterStore> {
    match RasterStore::open(&args.store, &DataLocator::new(&args.dataset)).await {
        Ok(store) => Some(store),
        Err(e) => {
            error!("Could not open {}/{}: {}", args.store.display(), args.dataset, e);
            None
        }
    }
}

// =============================================================================
// Info Command
// =============================================================================

async fn run_info(config: InfoConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(store) = open_store(&config.store).await else {
        return ExitCode::FAILURE;
    };

    let info = store.info();
    let layout = PyramidBuilder::new(PyramidConfig::from(&config.pipeline)).layout(info);

    println!("Dataset: {}", store.dataset());
    println!("  Size: {} x {}", info.width, info.height);
    println!("  Channels: {} ({:?})", info.channels, info.color_mode);
    println!("  Sample type: {}", info.sample_type);
    match &info.geo_transform {
        Some(t) => println!("  Geo-transform: {:?}", t.matrix()),
        None => println!("  Geo-transform: none"),
    }
    match store.known_sample_range().await {
        Some(r) => println!("  Sample range: {} .. {}", r.min, r.max),
        None => println!("  Sample range: not yet computed"),
    }

    println!();
    println!("Pyramid (factor {}):", layout.factor());
    for level in 0..layout.level_count() {
        let (w, h) = layout.dimensions(level).unwrap_or((0, 0));
        let state = match store.level(level).await {
            Some(data) => format!("{:?}", data.persistence),
            None => "not built".to_string(),
        };
        println!("  Level {level}: {w} x {h}  [{state}]");
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Import Command
// =============================================================================

async fn run_import(config: ImportConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::fs::create_dir_all(&config.store.store).await {
        error!("Could not create {}: {}", config.store.store.display(), e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = import_image(&config.image, &config.store.store, &config.store.dataset).await
    {
        error!("Import failed: {}", e);
        return ExitCode::FAILURE;
    }

    if config.build_pyramid {
        let build = BuildConfig {
            store: config.store,
            pipeline: config.pipeline,
        };
        return run_build(build).await;
    }
    ExitCode::SUCCESS
}

// =============================================================================
// Build Command
// =============================================================================

async fn run_build(config: BuildConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(store) = open_store(&config.store).await else {
        return ExitCode::FAILURE;
    };

    let builder = PyramidBuilder::new(PyramidConfig::from(&config.pipeline));
    match builder.build_all(&store).await {
        Ok(levels) => {
            for level in &levels {
                info!(
                    "Level {}: {} x {} (downsample {}) {:?}",
                    level.level, level.width, level.height, level.downsample, level.persistence
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Pyramid build failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Render Command
// =============================================================================

async fn run_render(config: RenderConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(store) = open_store(&config.store).await else {
        return ExitCode::FAILURE;
    };

    let region = Region::new(
        config.x,
        config.y,
        config.width.unwrap_or(store.info().width as f64 - config.x),
        config.height.unwrap_or(store.info().height as f64 - config.y),
    );

    let scheduler = TileScheduler::new(
        Arc::new(store),
        Arc::new(PyramidBuilder::new(PyramidConfig::from(&config.pipeline))),
        SchedulerConfig::from(&config.pipeline),
    )
    .await;

    let result = render(&scheduler, &config, region).await;
    scheduler.close().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Render failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn render(
    scheduler: &TileScheduler,
    config: &RenderConfig,
    region: Region,
) -> Result<(), String> {
    let plan = scheduler
        .set_viewport(ViewportRequest {
            downsample: config.downsample,
            region,
        })
        .await
        .map_err(|e| e.to_string())?;
    scheduler.settle().await;

    if config.auto_levels {
        if scheduler.auto_levels().await.is_none() {
            warn!("No resident tiles to derive levels from");
        }
    } else {
        let (low, high) = match (config.clip_low, config.clip_high) {
            (Some(low), Some(high)) => (low, high),
            _ => {
                let t = scheduler.transform().await;
                (t.clip_low(), t.clip_high())
            }
        };
        let transform =
            DisplayTransform::new(low, high, config.gamma).map_err(|e| e.to_string())?;
        scheduler.set_transform(transform).await;
    }

    // output covers the visible region at the chosen level
    let r = plan.region;
    let x0 = r.x.floor().max(0.0) as i64;
    let y0 = r.y.floor().max(0.0) as i64;
    let (level_width, level_height) = plan.grid.extent();
    let x1 = ((r.x + r.width).ceil() as i64).min(level_width as i64);
    let y1 = ((r.y + r.height).ceil() as i64).min(level_height as i64);
    if x1 <= x0 || y1 <= y0 {
        return Err("region does not overlap the raster".to_string());
    }

    let mut canvas = RgbaImage::new((x1 - x0) as u32, (y1 - y0) as u32);
    let frame = scheduler.frame().await;
    for tile in &frame.tiles {
        match &tile.status {
            TileStatus::Ready(buffer) => {
                let Some(img) = RgbaImage::from_raw(buffer.width, buffer.height, buffer.to_rgba8())
                else {
                    continue;
                };
                image::imageops::replace(
                    &mut canvas,
                    &img,
                    tile.rect.x as i64 - x0,
                    tile.rect.y as i64 - y0,
                );
            }
            TileStatus::Failed(reason) => {
                warn!("Tile {:?} failed: {}", tile.coord, reason);
            }
            TileStatus::Pending => {
                warn!("Tile {:?} was evicted before rendering", tile.coord);
            }
        }
    }

    canvas.save(&config.output).map_err(|e| e.to_string())?;
    info!(
        "Rendered level {} ({} x {}) to {}",
        frame.level,
        canvas.width(),
        canvas.height(),
        config.output.display()
    );
    Ok(())
}

// =============================================================================
// Export Mask Command
// =============================================================================

async fn run_export_mask(config: ExportMaskConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match export_mask(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Mask export failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn export_mask(config: &ExportMaskConfig) -> Result<(), String> {
    let template = Template::load(&config.template)
        .await
        .map_err(|e| e.to_string())?;
    let store = RasterStore::open(&config.store, &template.locator)
        .await
        .map_err(|e| e.to_string())?;

    let format = LabelsFormat::from_template(&template);
    let doc = load_labels(&config.labels, &format)
        .await
        .map_err(|e| e.to_string())?;

    let field = config
        .class_field
        .clone()
        .or_else(|| template.outputs.mask_label.clone())
        .ok_or("No class field: set --class-field or outputs_options.mask_label")?;
    let codes = template.class_codes(&field).map_err(|e| e.to_string())?;

    let layout = PyramidBuilder::new(PyramidConfig::from(&config.pipeline)).layout(store.info());
    let (width, height) = layout
        .dimensions(config.level)
        .ok_or_else(|| format!("Level {} is beyond the pyramid", config.level))?;
    let downsample = layout.downsample(config.level).unwrap_or(1.0);

    let mask = doc.rasterize_mask(&field, &codes, (height as usize, width as usize), downsample);
    let output = config.output_path();
    mask.save_csv(&output).await.map_err(|e| e.to_string())?;

    info!(
        "Wrote {} x {} mask of {} item(s) to {}",
        width,
        height,
        doc.len(),
        output.display()
    );
    Ok(())
}
