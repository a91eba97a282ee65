use crate::error::DisplayError;
use crate::raster::{SampleRange, SampleWindow};

/// Gamma is clamped to this range when derived from a midtone position.
pub const MIN_GAMMA: f64 = 0.01;
pub const MAX_GAMMA: f64 = 9.99;

/// How full-precision samples map to 8-bit display values.
///
/// Samples at or below `clip_low` map to 0, at or above `clip_high` to 255.
/// In between they are rescaled linearly and raised to `1 / gamma`, so a
/// gamma above 1 lifts the midtones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayTransform {
    clip_low: f64,
    clip_high: f64,
    gamma: f64,
}

impl DisplayTransform {
    /// # Errors
    ///
    /// Returns `DisplayError::InvalidTransform` unless all values are finite,
    /// `clip_high > clip_low` and `gamma > 0`.
    pub fn new(clip_low: f64, clip_high: f64, gamma: f64) -> Result<Self, DisplayError> {
        if !(clip_low.is_finite() && clip_high.is_finite() && gamma.is_finite()) {
            return Err(DisplayError::InvalidTransform(
                "values must be finite".to_string(),
            ));
        }
        if clip_high <= clip_low {
            return Err(DisplayError::InvalidTransform(format!(
                "clip high {clip_high} must exceed clip low {clip_low}"
            )));
        }
        if gamma <= 0.0 {
            return Err(DisplayError::InvalidTransform(format!(
                "gamma {gamma} must be positive"
            )));
        }
        Ok(Self {
            clip_low,
            clip_high,
            gamma,
        })
    }

    /// Transform from a levels control: black point, midtone, white point.
    ///
    /// The midtone position is measured within `[shadow, highlight]`: the
    /// centre gives gamma 1, the black end up to 9.99, the white end down to
    /// 0.01. A slider bounded by the visible sample range rather than by the
    /// chosen black and white points should use
    /// [`DisplayTransform::from_levels_in`].
    pub fn from_levels(shadow: f64, mid: f64, highlight: f64) -> Result<Self, DisplayError> {
        Self::from_levels_in(
            shadow,
            mid,
            highlight,
            SampleRange {
                min: shadow,
                max: highlight,
            },
        )
    }

    /// Levels transform with the midtone position measured within `range`,
    /// the span of the samples the control was set against.
    ///
    /// A constant range leaves the gamma at 1.
    pub fn from_levels_in(
        shadow: f64,
        mid: f64,
        highlight: f64,
        range: SampleRange,
    ) -> Result<Self, DisplayError> {
        let span = range.max - range.min;
        let position = if span > 0.0 { (mid - range.min) / span } else { 0.5 };
        Self::new(shadow, highlight, gamma_for_midtone(position))
    }

    /// Linear transform spanning a sample range.
    ///
    /// A constant range is widened by one so the mapping stays defined.
    pub fn full_range(range: SampleRange) -> Self {
        let (lo, hi) = if range.max > range.min {
            (range.min, range.max)
        } else {
            (range.min, range.min + 1.0)
        };
        Self {
            clip_low: lo,
            clip_high: hi,
            gamma: 1.0,
        }
    }

    /// Auto levels: black at the window minimum, white at its maximum and the
    /// midtone centred between them.
    pub fn auto(window: &SampleWindow) -> Self {
        Self::full_range(window.range().unwrap_or(SampleRange { min: 0.0, max: 1.0 }))
    }

    pub fn clip_low(&self) -> f64 {
        self.clip_low
    }

    pub fn clip_high(&self) -> f64 {
        self.clip_high
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Map one sample to a display byte.
    #[inline]
    pub fn map(&self, value: f64) -> u8 {
        let mut t = (value - self.clip_low) / (self.clip_high - self.clip_low);
        if t.is_nan() {
            return 0;
        }
        t = t.clamp(0.0, 1.0);
        if self.gamma != 1.0 {
            t = t.powf(1.0 / self.gamma);
        }
        (t * 255.0).round() as u8
    }
}

/// Gamma for a midtone at `position` in `[0, 1]`.
fn gamma_for_midtone(position: f64) -> f64 {
    if position < 0.5 {
        (1.0 + 9.0 * (1.0 - 2.0 * position)).min(MAX_GAMMA)
    } else if position > 0.5 {
        (1.0 - (2.0 * position - 1.0)).max(MIN_GAMMA)
    } else {
        1.0
    }
}
