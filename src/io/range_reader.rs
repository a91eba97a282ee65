use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::IoError;

/// Trait for reading byte ranges from a sample file.
///
/// This abstraction lets the raster store read arbitrary windows of a level
/// without loading the whole level. Implementations must be thread-safe.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Read `count` runs of `len` bytes, the first at `offset` and each
    /// following one `stride` bytes after the previous.
    ///
    /// This is the access pattern of a window over a row-major raster: one
    /// run per row. The runs are concatenated in order.
    async fn read_strided(
        &self,
        offset: u64,
        len: usize,
        stride: u64,
        count: usize,
    ) -> Result<Bytes, IoError> {
        if count == 1 || stride == len as u64 {
            return self.read_exact_at(offset, len * count).await;
        }

        let mut out = BytesMut::with_capacity(len * count);
        for row in 0..count as u64 {
            let run = self.read_exact_at(offset + row * stride, len).await?;
            out.extend_from_slice(&run);
        }
        Ok(out.freeze())
    }

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging and cache keys).
    ///
    /// For files this is the path on disk.
    fn identifier(&self) -> &str;
}

/// Check that `offset..offset + len` lies inside a resource of `size` bytes.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<(), IoError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(IoError::RangeOutOfBounds {
            offset,
            requested: len,
            size,
        }),
    }
}
