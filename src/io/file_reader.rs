use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::range_reader::check_range;
use super::RangeReader;
use crate::error::IoError;

/// Local-file implementation of RangeReader.
///
/// Reads run on the blocking thread pool so large windows never stall the
/// async runtime. The file size is captured once when the reader is opened;
/// sample files are immutable after they are written.
#[derive(Clone)]
pub struct FileRangeReader {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    size: u64,
    identifier: String,
}

impl FileRangeReader {
    /// Open a file for ranged reads.
    ///
    /// Returns `IoError::NotFound` if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let (file, size) = tokio::task::spawn_blocking(move || -> Result<_, IoError> {
            let file = File::open(&open_path)?;
            let size = file.metadata()?.len();
            Ok((file, size))
        })
        .await
        .map_err(|e| IoError::Io(e.to_string()))??;

        let identifier = path.display().to_string();
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
            size,
            identifier,
        })
    }

    /// Get the path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_runs(
        &self,
        offset: u64,
        len: usize,
        stride: u64,
        count: usize,
    ) -> Result<Bytes, IoError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> Result<Bytes, IoError> {
            let mut file = file
                .lock()
                .map_err(|_| IoError::Io("file handle poisoned".to_string()))?;
            let mut out = BytesMut::zeroed(len * count);
            for (row, chunk) in out.chunks_mut(len.max(1)).take(count).enumerate() {
                file.seek(SeekFrom::Start(offset + row as u64 * stride))?;
                file.read_exact(chunk)?;
            }
            Ok(out.freeze())
        })
        .await
        .map_err(|e| IoError::Io(e.to_string()))?
    }
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len as u64, self.size)?;

        if len == 0 {
            return Ok(Bytes::new());
        }

        self.read_runs(offset, len, len as u64, 1).await
    }

    async fn read_strided(
        &self,
        offset: u64,
        len: usize,
        stride: u64,
        count: usize,
    ) -> Result<Bytes, IoError> {
        if count == 0 || len == 0 {
            return Ok(Bytes::new());
        }
        let last = offset + stride * (count as u64 - 1);
        check_range(last, len as u64, self.size)?;

        self.read_runs(offset, len, stride, count).await
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
