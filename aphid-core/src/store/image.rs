//! Memory-mapped disk image files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{error, info};

use super::flusher::ImageFlusher;
use super::sector_store::{sector_range, Sector, SectorStore, SECTOR_SIZE};
use super::spare_table::{make_spare_table, IMAGE_SIZE_P5};
use crate::error::{AphidError, AphidResult};

/// A disk image file mapped into memory for reading and writing.
///
/// The mapping is flushed and closed when the image is closed or dropped.
/// Writes reach the file through the attached `ImageFlusher`, or
/// synchronously when no flusher is attached.
pub struct Image {
    path: PathBuf,
    map: Arc<RwLock<MmapMut>>,
    byte_len: u64,
    spare_table: Sector,
    flusher: Option<ImageFlusher>,
    closed: bool,
    _file: File,
}

impl Image {
    /// Create a zero-filled 5 MB ProFile disk image at `path`.
    /// Refuses to overwrite an existing file.
    pub fn create(path: impl AsRef<Path>) -> AphidResult<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(AphidError::ImageExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(IMAGE_SIZE_P5)?;
        file.sync_all()?;
        info!("Created the empty disk image file {}.", path.display());
        Ok(())
    }

    /// Open and map the disk image at `path`.
    pub fn open(path: impl AsRef<Path>) -> AphidResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let byte_len = file.metadata()?.len();
        info!(
            "Mapping the {}-byte disk image file {}.",
            byte_len,
            path.display()
        );
        let spare_table = make_spare_table(byte_len);

        // SAFETY: the mapping is only ever accessed through `self.map`, and
        // nothing else in this process writes to the image file while the
        // session holds it.
        let map = unsafe { MmapOptions::new().len(byte_len as usize).map_mut(&file)? };

        Ok(Self {
            path: path.to_path_buf(),
            map: Arc::new(RwLock::new(map)),
            byte_len,
            spare_table,
            flusher: None,
            closed: false,
            _file: file,
        })
    }

    /// Path this image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attach a background flusher that syncs no more often than `delay`.
    pub fn attach_flusher(&mut self, delay: Duration) -> AphidResult<()> {
        self.detach_flusher();
        let map = Arc::clone(&self.map);
        self.flusher = Some(ImageFlusher::spawn(delay, move || {
            map.read().unwrap_or_else(PoisonError::into_inner).flush()
        })?);
        Ok(())
    }

    /// Stop the background flusher, if any. Does not flush.
    pub fn detach_flusher(&mut self) {
        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop();
        }
    }

    /// Synchronously flush the whole mapping to the image file.
    pub fn flush(&self) -> AphidResult<()> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }

    /// Stop the flusher, flush, and close the image.
    pub fn close(mut self) -> AphidResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> AphidResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.detach_flusher();
        self.flush()?;
        info!("Final disk image data flush complete. Disk image file closed.");
        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("Final flush of {} failed: {}", self.path.display(), e);
        }
    }
}

impl SectorStore for Image {
    fn byte_len(&self) -> u64 {
        self.byte_len
    }

    fn spare_table(&self) -> &Sector {
        &self.spare_table
    }

    fn get_sector(&self, sector: u32) -> Sector {
        let mut data = [0u8; SECTOR_SIZE];
        if let Some(range) = sector_range(self.byte_len, sector) {
            let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
            data.copy_from_slice(&map[range]);
        }
        data
    }

    fn put_sector(&mut self, sector: u32, data: &[u8]) -> AphidResult<()> {
        if data.len() != SECTOR_SIZE {
            return Err(AphidError::InvalidSectorLength {
                sector,
                length: data.len(),
            });
        }
        let Some(range) = sector_range(self.byte_len, sector) else {
            return Ok(());
        };

        self.map.write().unwrap_or_else(PoisonError::into_inner)[range].copy_from_slice(data);
        match &self.flusher {
            Some(flusher) => flusher.dirty(),
            None => self.flush()?,
        }
        Ok(())
    }
}
