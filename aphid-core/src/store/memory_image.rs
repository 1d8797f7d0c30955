//! In-memory disk image implementation.

use super::sector_store::{sector_range, Sector, SectorStore, SECTOR_SIZE};
use super::spare_table::make_spare_table;
use crate::error::{AphidError, AphidResult};

/// Simple in-memory disk image.
#[derive(Clone)]
pub struct MemoryImage {
    data: Vec<u8>,
    spare_table: Sector,
}

impl MemoryImage {
    /// Create a zero-filled image of `byte_len` bytes.
    pub fn new(byte_len: usize) -> Self {
        Self::with_data(vec![0; byte_len])
    }

    /// Create with initial contents.
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let spare_table = make_spare_table(data.len() as u64);
        Self { data, spare_table }
    }

    /// Raw image contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl SectorStore for MemoryImage {
    fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn spare_table(&self) -> &Sector {
        &self.spare_table
    }

    fn get_sector(&self, sector: u32) -> Sector {
        let mut data = [0u8; SECTOR_SIZE];
        if let Some(range) = sector_range(self.byte_len(), sector) {
            data.copy_from_slice(&self.data[range]);
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
        if let Some(range) = sector_range(self.byte_len(), sector) {
            self.data[range].copy_from_slice(data);
        }
        Ok(())
    }
}
