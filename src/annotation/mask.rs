//! Class masks rasterized from label polygons.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use ndarray::Array2;

use super::document::{FieldValue, LabelItem};
use super::geometry::{fill_spans, level_position, Point};
use crate::error::{IoError, LabelsError};

/// Integer code of each class value, plus the code of unlabelled pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCodes {
    codes: BTreeMap<String, i32>,
    background: i32,
}

impl ClassCodes {
    pub fn new(background: i32) -> Self {
        Self {
            codes: BTreeMap::new(),
            background,
        }
    }

    /// Codes `1..=n` for the options in order, background `0`.
    pub fn from_options<S: AsRef<str>>(options: &[S]) -> Self {
        options
            .iter()
            .zip(1..)
            .fold(Self::new(0), |codes, (option, code)| codes.with(option.as_ref(), code))
    }

    pub fn with(mut self, value: impl Into<String>, code: i32) -> Self {
        self.codes.insert(value.into(), code);
        self
    }

    pub fn code(&self, value: &str) -> Option<i32> {
        self.codes.get(value).copied()
    }

    pub fn background(&self) -> i32 {
        self.background
    }
}

/// A 2-D grid of class codes, indexed `[row, column]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array2<i32>,
    downsample: f64,
}

impl Mask {
    pub fn data(&self) -> &Array2<i32> {
        &self.data
    }

    /// Downsample of the level this mask was rasterized at.
    pub fn downsample(&self) -> f64 {
        self.downsample
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn get(&self, x: usize, y: usize) -> Option<i32> {
        self.data.get((y, x)).copied()
    }

    /// Number of pixels holding `code`.
    pub fn count(&self, code: i32) -> usize {
        self.data.iter().filter(|&&c| c == code).count()
    }

    /// Write one comma-separated line per row.
    pub fn write_csv<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        let mut line = String::new();
        for row in self.data.rows() {
            line.clear();
            for (i, code) in row.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                line.push_str(&code.to_string());
            }
            line.push('\n');
            out.write_all(line.as_bytes())?;
        }
        out.flush()
    }

    pub async fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), LabelsError> {
        let mut buf = Vec::with_capacity(self.data.len() * 2);
        self.write_csv(&mut buf).map_err(IoError::from)?;
        tokio::fs::write(path.as_ref(), buf)
            .await
            .map_err(IoError::from)?;
        Ok(())
    }
}

/// Paint items into a mask of `shape` (height, width) in order, so later
/// items overwrite earlier ones.
pub(crate) fn rasterize(
    items: &[LabelItem],
    class_field: &str,
    codes: &ClassCodes,
    shape: (usize, usize),
    downsample: f64,
) -> Mask {
    let (height, width) = shape;
    let mut data = Array2::from_elem(shape, codes.background());

    for item in items {
        let Some(code) = item
            .field(class_field)
            .and_then(FieldValue::as_text)
            .and_then(|value| codes.code(value))
        else {
            continue;
        };

        let scaled: Vec<Point> = item
            .vertices()
            .iter()
            .map(|&p| level_position(p, downsample))
            .collect();

        fill_spans(&scaled, 0..height as i64, |y, x0, x1| {
            let x0 = x0.clamp(0, width as i64) as usize;
            let x1 = x1.clamp(0, width as i64) as usize;
            data.row_mut(y as usize)
                .slice_mut(ndarray::s![x0..x1])
                .fill(code);
        });
    }

    Mask { data, downsample }
}
