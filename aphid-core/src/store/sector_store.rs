//! SectorStore trait - sector-level interface to a disk image.

use std::ops::Range;

use crate::error::AphidResult;

/// Sector size in bytes. Cf. "block size" in spare tables.
pub const SECTOR_SIZE: usize = 532;

/// One sector of opaque payload.
pub type Sector = [u8; SECTOR_SIZE];

/// Storage interface for the disk image being served.
/// Sector indices are 24-bit ProFile block numbers.
pub trait SectorStore: Send {
    /// Size of the backing image in bytes.
    fn byte_len(&self) -> u64;

    /// Spare table for this image, computed once from its size.
    fn spare_table(&self) -> &Sector;

    /// Read a sector. Out-of-range sectors read as zeros.
    fn get_sector(&self, sector: u32) -> Sector;

    /// Write a sector. Out-of-range sectors are silently ignored.
    /// `data` must be exactly `SECTOR_SIZE` bytes long.
    fn put_sector(&mut self, sector: u32, data: &[u8]) -> AphidResult<()>;
}

/// Byte range of `sector` within an image of `byte_len` bytes, if all of it
/// is inside the image.
pub(crate) fn sector_range(byte_len: u64, sector: u32) -> Option<Range<usize>> {
    let start = u64::from(sector) * SECTOR_SIZE as u64;
    let end = start + SECTOR_SIZE as u64;
    if end > byte_len {
        return None;
    }
    Some(start as usize..end as usize)
}

/// Zero-pad or truncate `data` to exactly one sector.
///
/// # Examples
/// ```
/// use aphid_core::store::{to_sector, SECTOR_SIZE};
/// let sector = to_sector(b"HALT");
/// assert_eq!(&sector[..4], b"HALT");
/// assert!(sector[4..].iter().all(|&b| b == 0));
/// assert_eq!(to_sector(&[7u8; 600]), [7u8; SECTOR_SIZE]);
/// ```
pub fn to_sector(data: &[u8]) -> Sector {
    let mut sector = [0u8; SECTOR_SIZE];
    let len = data.len().min(SECTOR_SIZE);
    sector[..len].copy_from_slice(&data[..len]);
    sector
}
