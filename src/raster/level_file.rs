//! Block-wise writing of pyramid level files.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;

/// A level file being written one block at a time.
///
/// Samples go to a temporary file next to the final path, which only appears
/// once [`LevelFile::commit`] renames it into place. Writes run on the
/// blocking thread pool.
pub(crate) struct LevelFile {
    path: PathBuf,
    tmp: PathBuf,
    file: Arc<Mutex<File>>,
    row_bytes: u64,
    pixel_bytes: u64,
}

fn write_error(path: &Path, e: impl std::fmt::Display) -> StorageError {
    StorageError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

impl LevelFile {
    /// Create the temporary file, sized for the whole level.
    pub(crate) async fn create(
        path: PathBuf,
        width: u32,
        height: u32,
        pixel_bytes: usize,
    ) -> Result<Self, StorageError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let row_bytes = width as u64 * pixel_bytes as u64;
        let len = row_bytes * height as u64;

        let create_path = tmp.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            if let Some(parent) = create_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&create_path)?;
            file.set_len(len)?;
            Ok(file)
        })
        .await
        .map_err(|e| write_error(&path, e))?
        .map_err(|e| write_error(&path, e))?;

        Ok(Self {
            path,
            tmp,
            file: Arc::new(Mutex::new(file)),
            row_bytes,
            pixel_bytes: pixel_bytes as u64,
        })
    }

    /// Write encoded rows of a block whose top-left pixel is `(x, y)` and
    /// whose rows are `width` pixels long.
    pub(crate) async fn write_block(
        &self,
        x: u32,
        y: u32,
        width: u32,
        rows: Vec<u8>,
    ) -> Result<(), StorageError> {
        let file = Arc::clone(&self.file);
        let (row_bytes, pixel_bytes) = (self.row_bytes, self.pixel_bytes);
        let block_row = (width as u64 * pixel_bytes) as usize;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = file
                .lock()
                .map_err(|_| std::io::Error::other("file handle poisoned"))?;
            for (i, row) in rows.chunks_exact(block_row.max(1)).enumerate() {
                let offset = (y as u64 + i as u64) * row_bytes + x as u64 * pixel_bytes;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(row)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| write_error(&self.tmp, e))?
        .map_err(|e| write_error(&self.tmp, e))
    }

    /// Flush the samples to disk and move the file to its final path.
    ///
    /// On failure the temporary file is removed.
    pub(crate) async fn commit(self) -> Result<PathBuf, StorageError> {
        let file = Arc::clone(&self.file);
        let (tmp, path) = (self.tmp.clone(), self.path.clone());

        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = file
                .lock()
                .map_err(|_| std::io::Error::other("file handle poisoned"))?;
            file.flush()?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(self.path),
            Ok(Err(e)) => {
                let err = write_error(&self.path, e);
                self.discard().await;
                Err(err)
            }
            Err(e) => {
                let err = write_error(&self.path, e);
                self.discard().await;
                Err(err)
            }
        }
    }

    /// Remove the temporary file.
    pub(crate) async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.tmp).await;
    }
}
