//! The `store.json` manifest of a raster store directory.
//!
//! The manifest lists datasets (shape, sample type, sample file, attributes),
//! store-wide attributes such as geo-transforms, and any pyramid levels that
//! were built and persisted for a dataset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FormatError, IoError, StorageError};

/// File name of the manifest inside a store directory.
pub const MANIFEST_FILE: &str = "store.json";

/// Current manifest version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,

    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetEntry>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pyramids: BTreeMap<String, PyramidEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            datasets: BTreeMap::new(),
            attributes: BTreeMap::new(),
            pyramids: BTreeMap::new(),
        }
    }
}

/// One array in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// `[height, width]` or `[height, width, channels]`
    pub shape: Vec<u64>,
    pub dtype: String,
    /// Sample file, relative to the store directory
    pub file: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

impl DatasetEntry {
    pub fn fingerprint(&self) -> SourceFingerprint {
        SourceFingerprint {
            shape: self.shape.clone(),
            dtype: self.dtype.clone(),
        }
    }
}

/// Identity of the source a pyramid was built from.
///
/// A pyramid whose fingerprint no longer matches its dataset is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub shape: Vec<u64>,
    pub dtype: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRange {
    pub min: f64,
    pub max: f64,
}

impl SampleRange {
    /// Fold a batch of samples into a running range. NaN samples are skipped.
    pub fn extend(
        range: Option<SampleRange>,
        samples: impl IntoIterator<Item = f64>,
    ) -> Option<SampleRange> {
        samples.into_iter().filter(|v| !v.is_nan()).fold(range, |acc, v| {
            Some(match acc {
                Some(r) => SampleRange {
                    min: r.min.min(v),
                    max: r.max.max(v),
                },
                None => SampleRange { min: v, max: v },
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidEntry {
    pub source: SourceFingerprint,
    /// Integer downsample factor between consecutive levels
    pub downsample: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_range: Option<SampleRange>,
    #[serde(default)]
    pub levels: Vec<LevelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelEntry {
    pub level: usize,
    pub width: u32,
    pub height: u32,
    pub file: String,
}

/// Relative path of a persisted pyramid level.
pub fn level_file(dataset: &str, level: usize) -> String {
    format!("pyramid/{dataset}/{level}.raw")
}

pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

// =============================================================================
// Load / Save
// =============================================================================

/// Read and parse the manifest of a store directory.
pub async fn load(root: &Path) -> Result<Manifest, FormatError> {
    let path = manifest_path(root);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(IoError::from)?;
    let manifest: Manifest =
        serde_json::from_str(&text).map_err(|e| FormatError::Manifest(e.to_string()))?;

    if manifest.version > MANIFEST_VERSION {
        return Err(FormatError::Manifest(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    Ok(manifest)
}

/// Like [`load`], but a missing manifest yields an empty one.
pub async fn load_or_default(root: &Path) -> Result<Manifest, StorageError> {
    match load(root).await {
        Ok(m) => Ok(m),
        Err(FormatError::Io(IoError::NotFound(_))) => Ok(Manifest::default()),
        Err(e) => Err(StorageError::Manifest(e.to_string())),
    }
}

/// Write the manifest atomically: a temporary file is renamed over the old one
/// so readers never see a half-written manifest.
pub async fn save(root: &Path, manifest: &Manifest) -> Result<(), StorageError> {
    let text = serde_json::to_vec_pretty(manifest)
        .map_err(|e| StorageError::Manifest(e.to_string()))?;
    write_atomic(&manifest_path(root), &text).await
}

/// Load, modify and save the manifest.
///
/// Callers serialize updates to one store; see `RasterStore`.
pub async fn update<F>(root: &Path, f: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut Manifest),
{
    let mut manifest = load_or_default(root).await?;
    f(&mut manifest);
    save(root, &manifest).await
}

/// Write `bytes` to `path` via a sibling temporary file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let write_err = |e: std::io::Error| StorageError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    Ok(())
}
