//! Writing datasets into a store directory.

use std::path::Path;

use image::DynamicImage;
use tracing::info;

use super::manifest::{self, DatasetEntry};
use super::sample::SampleType;
use crate::annotation::GeoTransform;
use crate::error::{ImportError, StorageError};

/// Description of a dataset to write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDataset {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub sample_type: SampleType,
    /// Explicit colour mode attribute, e.g. `I;16` or `RGB`
    pub color_mode: Option<String>,
    pub geo_transform: Option<GeoTransform>,
}

impl NewDataset {
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        channels: usize,
        sample_type: SampleType,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            channels,
            sample_type,
            color_mode: None,
            geo_transform: None,
        }
    }

    pub fn with_color_mode(mut self, mode: impl Into<String>) -> Self {
        self.color_mode = Some(mode.into());
        self
    }

    pub fn with_geo_transform(mut self, transform: GeoTransform) -> Self {
        self.geo_transform = Some(transform);
        self
    }

    fn byte_len(&self) -> u64 {
        self.width as u64
            * self.height as u64
            * self.channels as u64
            * self.sample_type.size_bytes() as u64
    }

    fn shape(&self) -> Vec<u64> {
        if self.channels == 1 {
            vec![self.height as u64, self.width as u64]
        } else {
            vec![self.height as u64, self.width as u64, self.channels as u64]
        }
    }
}

/// Write a dataset and register it in the store manifest.
///
/// `samples` holds little-endian, row-major, channel-interleaved samples.
/// Any pyramid previously built for a dataset of the same name is removed.
pub async fn create_dataset(
    root: &Path,
    dataset: &NewDataset,
    samples: &[u8],
) -> Result<(), StorageError> {
    let file = format!("{}.raw", dataset.name);
    let path = root.join(&file);

    if samples.len() as u64 != dataset.byte_len() {
        return Err(StorageError::Write {
            path: path.display().to_string(),
            message: format!(
                "expected {} bytes of samples, got {}",
                dataset.byte_len(),
                samples.len()
            ),
        });
    }

    manifest::write_atomic(&path, samples).await?;

    let mut attrs = std::collections::BTreeMap::new();
    if let Some(mode) = &dataset.color_mode {
        attrs.insert("color_mode".to_string(), serde_json::Value::from(mode.as_str()));
    }
    if let Some(geo) = &dataset.geo_transform {
        let value = serde_json::to_value(geo).map_err(|e| StorageError::Manifest(e.to_string()))?;
        attrs.insert("geo_transform".to_string(), value);
    }

    let entry = DatasetEntry {
        shape: dataset.shape(),
        dtype: dataset.sample_type.name().to_string(),
        file,
        attrs,
    };
    let name = dataset.name.clone();
    manifest::update(root, move |m| {
        m.pyramids.remove(&name);
        m.datasets.insert(name, entry);
    })
    .await?;

    // Stale level files would otherwise survive until the next open
    let _ = tokio::fs::remove_dir_all(root.join("pyramid").join(&dataset.name)).await;

    Ok(())
}

/// Convert a picture file into a dataset of a store.
///
/// 8-bit and 16-bit gray and RGB pictures keep their sample type; float
/// pictures become `float32` RGB. Alpha is dropped. The source colour mode is
/// recorded as the dataset's `color_mode` attribute.
pub async fn import_image(
    image_path: &Path,
    root: &Path,
    name: &str,
) -> Result<NewDataset, ImportError> {
    let path = image_path.to_path_buf();
    let decode_err = |message: String| ImportError::Decode {
        path: image_path.display().to_string(),
        message,
    };

    let img = tokio::task::spawn_blocking(move || image::open(&path))
        .await
        .map_err(|e| decode_err(e.to_string()))?
        .map_err(|e| decode_err(e.to_string()))?;

    let (width, height) = (img.width(), img.height());
    let (channels, sample_type, mode, samples) = convert(img);

    let dataset = NewDataset::new(name, width, height, channels, sample_type).with_color_mode(mode);
    create_dataset(root, &dataset, &samples).await?;

    info!(
        source = %image_path.display(),
        dataset = name,
        width,
        height,
        dtype = %sample_type,
        "Imported image"
    );
    Ok(dataset)
}

fn convert(img: DynamicImage) -> (usize, SampleType, &'static str, Vec<u8>) {
    fn le<T: Copy, const N: usize>(values: &[T], f: impl Fn(T) -> [u8; N]) -> Vec<u8> {
        values.iter().flat_map(|v| f(*v)).collect()
    }

    match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_) => {
            (1, SampleType::U8, "L", img.to_luma8().into_raw())
        }
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => {
            let raw = img.to_luma16().into_raw();
            (1, SampleType::U16, "I;16", le(&raw, u16::to_le_bytes))
        }
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
            let raw = img.to_rgb16().into_raw();
            (3, SampleType::U16, "RGB", le(&raw, u16::to_le_bytes))
        }
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            let raw = img.to_rgb32f().into_raw();
            (3, SampleType::F32, "RGB", le(&raw, f32::to_le_bytes))
        }
        other => (3, SampleType::U8, "RGB", other.to_rgb8().into_raw()),
    }
}
