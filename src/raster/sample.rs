//! Sample types and colour modes of stored rasters.

use std::fmt;
use std::str::FromStr;

use crate::error::FormatError;

// =============================================================================
// Sample Type
// =============================================================================

/// Numeric type of one stored sample.
///
/// Samples are stored little-endian. Names follow the usual array-library
/// spelling (`uint16`, `float32`, ...) so stores written by other tools open
/// without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    /// Size of one sample in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    /// Canonical name as written to the manifest.
    pub const fn name(self) -> &'static str {
        match self {
            SampleType::U8 => "uint8",
            SampleType::I8 => "int8",
            SampleType::U16 => "uint16",
            SampleType::I16 => "int16",
            SampleType::U32 => "uint32",
            SampleType::I32 => "int32",
            SampleType::F32 => "float32",
            SampleType::F64 => "float64",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, SampleType::F32 | SampleType::F64)
    }

    /// Representable range of the type, used to clamp averaged samples.
    pub fn value_range(self) -> (f64, f64) {
        match self {
            SampleType::U8 => (0.0, u8::MAX as f64),
            SampleType::I8 => (i8::MIN as f64, i8::MAX as f64),
            SampleType::U16 => (0.0, u16::MAX as f64),
            SampleType::I16 => (i16::MIN as f64, i16::MAX as f64),
            SampleType::U32 => (0.0, u32::MAX as f64),
            SampleType::I32 => (i32::MIN as f64, i32::MAX as f64),
            SampleType::F32 => (f32::MIN as f64, f32::MAX as f64),
            SampleType::F64 => (f64::MIN, f64::MAX),
        }
    }

    /// Decode a little-endian byte buffer into `f64` samples.
    ///
    /// Trailing bytes that do not fill a whole sample are ignored.
    pub fn decode(self, bytes: &[u8], out: &mut Vec<f64>) {
        let size = self.size_bytes();
        out.reserve(bytes.len() / size);
        for chunk in bytes.chunks_exact(size) {
            out.push(self.decode_one(chunk));
        }
    }

    fn decode_one(self, b: &[u8]) -> f64 {
        match self {
            SampleType::U8 => b[0] as f64,
            SampleType::I8 => b[0] as i8 as f64,
            SampleType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            SampleType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            SampleType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            SampleType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            SampleType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            SampleType::F64 => {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }

    /// Encode one value as little-endian bytes of this type.
    ///
    /// Integer types round to nearest and saturate at the type bounds.
    pub fn encode(self, value: f64, out: &mut Vec<u8>) {
        let (lo, hi) = self.value_range();
        let int = if self.is_float() {
            value
        } else {
            value.round().clamp(lo, hi)
        };
        match self {
            SampleType::U8 => out.push(int as u8),
            SampleType::I8 => out.push(int as i8 as u8),
            SampleType::U16 => out.extend_from_slice(&(int as u16).to_le_bytes()),
            SampleType::I16 => out.extend_from_slice(&(int as i16).to_le_bytes()),
            SampleType::U32 => out.extend_from_slice(&(int as u32).to_le_bytes()),
            SampleType::I32 => out.extend_from_slice(&(int as i32).to_le_bytes()),
            SampleType::F32 => out.extend_from_slice(&(int as f32).to_le_bytes()),
            SampleType::F64 => out.extend_from_slice(&int.to_le_bytes()),
        }
    }

    /// Encode a run of values; see [`SampleType::encode`].
    pub fn encode_all(self, values: impl IntoIterator<Item = f64>) -> Vec<u8> {
        let mut out = Vec::new();
        for v in values {
            self.encode(v, &mut out);
        }
        out
    }
}

impl FromStr for SampleType {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept numpy-style byte-order prefixes for little-endian or native
        let name = s.trim_start_matches(['<', '=', '|']);
        let ty = match name.to_ascii_lowercase().as_str() {
            "uint8" | "u1" => SampleType::U8,
            "int8" | "i1" => SampleType::I8,
            "uint16" | "u2" => SampleType::U16,
            "int16" | "i2" => SampleType::I16,
            "uint32" | "u4" => SampleType::U32,
            "int32" | "i4" => SampleType::I32,
            "float32" | "f4" => SampleType::F32,
            "float64" | "f8" => SampleType::F64,
            _ => return Err(FormatError::UnsupportedDtype(s.to_string())),
        };
        Ok(ty)
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Colour Mode
// =============================================================================

/// How samples are presented: one gray ramp or three colour channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Grayscale,
    Rgb,
}

impl ColorMode {
    pub const fn channels(self) -> usize {
        match self {
            ColorMode::Grayscale => 1,
            ColorMode::Rgb => 3,
        }
    }

    /// Resolve the colour mode of a dataset.
    ///
    /// An explicit attribute always wins over inference from the channel
    /// count; an explicit mode that contradicts the channel count is rejected.
    pub fn resolve(explicit: Option<&str>, channels: usize) -> Result<Self, FormatError> {
        let inferred = match channels {
            1 => ColorMode::Grayscale,
            3 => ColorMode::Rgb,
            n => return Err(FormatError::UnsupportedChannels(n)),
        };

        let Some(mode) = explicit else {
            return Ok(inferred);
        };

        let named = match mode {
            "L" | "I" | "I;16" | "I;16B" | "I;16L" | "F" | "1" | "gray" | "grayscale" => {
                ColorMode::Grayscale
            }
            "RGB" | "rgb" => ColorMode::Rgb,
            _ => {
                return Err(FormatError::UnsupportedColorMode {
                    mode: mode.to_string(),
                    channels,
                })
            }
        };

        if named.channels() != channels {
            return Err(FormatError::UnsupportedColorMode {
                mode: mode.to_string(),
                channels,
            });
        }
        Ok(named)
    }
}
