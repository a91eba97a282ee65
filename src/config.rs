//! Configuration for the pipeline and the command-line tool.
//!
//! [`PipelineConfig`] holds the settings shared by pyramid building and tile
//! scheduling. The binary flattens it into every subcommand, so each setting
//! can be given as a flag or as a `PL_`-prefixed environment variable:
//!
//! - `PL_TILE_SIZE` - Tile side in level pixels (default: 512)
//! - `PL_CACHE_CAPACITY` - Resident tile budget in bytes (default: 256 MiB)
//! - `PL_DOWNSAMPLE_FACTOR` - Factor between pyramid levels (default: 2)
//! - `PL_MIN_LEVEL_LENGTH` - Stop adding levels below this side (default: 1024)
//! - `PL_BLOCK_SIZE` - Block side used while building levels (default: 4096)
//! - `PL_NO_PYRAMID` - Serve level 0 only
//! - `PL_STORE` - Store directory for every subcommand
//! - `PL_DATASET` - Dataset name inside the store (default: data)

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::tile::{DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_TILE_SIZE};

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_DOWNSAMPLE_FACTOR: u32 = 2;

pub const DEFAULT_MIN_LEVEL_LENGTH: u32 = 1024;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

pub const DEFAULT_DATASET: &str = "data";

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Settings for pyramid building and tile scheduling.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Tile side in level pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "PL_TILE_SIZE")]
    pub tile_size: u32,

    /// Budget for resident full-precision tiles, in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "PL_CACHE_CAPACITY")]
    pub cache_capacity: usize,

    /// Integer downsample factor between consecutive pyramid levels.
    #[arg(long, default_value_t = DEFAULT_DOWNSAMPLE_FACTOR, env = "PL_DOWNSAMPLE_FACTOR")]
    pub downsample_factor: u32,

    /// Levels are added while the longest side exceeds this length.
    #[arg(long, default_value_t = DEFAULT_MIN_LEVEL_LENGTH, env = "PL_MIN_LEVEL_LENGTH")]
    pub min_level_length: u32,

    /// Side of the square blocks processed at once while building a level.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, env = "PL_BLOCK_SIZE")]
    pub block_size: u32,

    /// Disable the pyramid and serve level 0 only.
    #[arg(long, default_value_t = false, env = "PL_NO_PYRAMID")]
    pub no_pyramid: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            downsample_factor: DEFAULT_DOWNSAMPLE_FACTOR,
            min_level_length: DEFAULT_MIN_LEVEL_LENGTH,
            block_size: DEFAULT_BLOCK_SIZE,
            no_pyramid: false,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size < 16 || self.tile_size > 8192 {
            return Err("tile_size must be between 16 and 8192".to_string());
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be greater than 0".to_string());
        }
        if self.downsample_factor < 2 {
            return Err("downsample_factor must be at least 2".to_string());
        }
        if self.min_level_length == 0 {
            return Err("min_level_length must be greater than 0".to_string());
        }
        if self.block_size < self.downsample_factor {
            return Err("block_size must be at least downsample_factor".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// pyramid-label - tiled viewing and polygon annotation of very large rasters.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyramid-label")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Describe a dataset and its pyramid.
    Info(InfoConfig),

    /// Convert a picture file into a store dataset.
    Import(ImportConfig),

    /// Build and persist every pyramid level of a dataset.
    BuildPyramid(BuildConfig),

    /// Render a region of a dataset to a PNG.
    Render(RenderConfig),

    /// Rasterize a labels file into a CSV class mask.
    ExportMask(ExportMaskConfig),
}

/// Which dataset of which store to open.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct StoreArgs {
    /// Store directory.
    #[arg(long, env = "PL_STORE")]
    pub store: PathBuf,

    /// Dataset name inside the store.
    #[arg(long, default_value = DEFAULT_DATASET, env = "PL_DATASET")]
    pub dataset: String,
}

impl StoreArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.dataset.is_empty() {
            return Err("Dataset name is required. Set --dataset or PL_DATASET".to_string());
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl InfoConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.store.validate()?;
        self.pipeline.validate()
    }
}

#[derive(Args, Debug, Clone)]
pub struct ImportConfig {
    /// Picture to import (PNG or TIFF).
    pub image: PathBuf,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Build the pyramid right after importing.
    #[arg(long, default_value_t = false)]
    pub build_pyramid: bool,

    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl ImportConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.image.is_file() {
            return Err(format!("Image not found: {}", self.image.display()));
        }
        self.store.validate()?;
        self.pipeline.validate()
    }
}

#[derive(Args, Debug, Clone)]
pub struct BuildConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.store.validate()?;
        if self.pipeline.no_pyramid {
            return Err("--no-pyramid leaves nothing to build".to_string());
        }
        self.pipeline.validate()
    }
}

#[derive(Args, Debug, Clone)]
pub struct RenderConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Left edge of the region, in level-0 pixels.
    #[arg(long, default_value_t = 0.0)]
    pub x: f64,

    /// Top edge of the region, in level-0 pixels.
    #[arg(long, default_value_t = 0.0)]
    pub y: f64,

    /// Region width in level-0 pixels; defaults to the raster width.
    #[arg(long)]
    pub width: Option<f64>,

    /// Region height in level-0 pixels; defaults to the raster height.
    #[arg(long)]
    pub height: Option<f64>,

    /// Level-0 pixels per output pixel.
    #[arg(long, default_value_t = 1.0)]
    pub downsample: f64,

    /// Lower clip value; samples at or below render black.
    #[arg(long, requires = "clip_high")]
    pub clip_low: Option<f64>,

    /// Upper clip value; samples at or above render white.
    #[arg(long, requires = "clip_low")]
    pub clip_high: Option<f64>,

    /// Contrast gamma applied after clipping.
    #[arg(long, default_value_t = 1.0)]
    pub gamma: f64,

    /// Derive clip values from the rendered region.
    #[arg(long, default_value_t = false, conflicts_with_all = ["clip_low", "clip_high"])]
    pub auto_levels: bool,

    /// Output PNG path.
    #[arg(short, long)]
    pub output: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.store.validate()?;
        self.pipeline.validate()?;

        if !(self.downsample.is_finite() && self.downsample > 0.0) {
            return Err("downsample must be a positive number".to_string());
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(format!("{name} must be a positive number"));
                }
            }
        }
        if let (Some(low), Some(high)) = (self.clip_low, self.clip_high) {
            if high <= low {
                return Err("clip_high must be greater than clip_low".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportMaskConfig {
    /// Labels file to rasterize.
    pub labels: PathBuf,

    /// Annotation template the labels were made with.
    #[arg(long, env = "PL_TEMPLATE")]
    pub template: PathBuf,

    /// Store directory; the dataset comes from the template.
    #[arg(long, env = "PL_STORE")]
    pub store: PathBuf,

    /// Combobox field that classifies the mask; defaults to the template's
    /// mask_label.
    #[arg(long)]
    pub class_field: Option<String>,

    /// Pyramid level whose extent the mask takes.
    #[arg(long, default_value_t = 0)]
    pub level: usize,

    /// Output CSV path; defaults to `<labels stem>.mask.csv`.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl ExportMaskConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.labels.is_file() {
            return Err(format!("Labels file not found: {}", self.labels.display()));
        }
        if !self.template.is_file() {
            return Err(format!("Template not found: {}", self.template.display()));
        }
        self.pipeline.validate()
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| mask_path_for(&self.labels))
    }
}

/// `<dir>/<stem>.mask.csv`, where the stem drops every extension
/// (`scene.labels.json` gives `scene.mask.csv`).
pub fn mask_path_for(labels: &Path) -> PathBuf {
    let name = labels
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    labels.with_file_name(format!("{stem}.mask.csv"))
}

// =============================================================================
// Tests
// =============================================================================
