//! Spare table synthesis for sector $FFFFFF.
//!
//! A read from a ProFile's block $FFFFFF returns the "spare table": drive
//! type, geometry, and the (always empty) lists of spare and bad blocks. Ours
//! also carries a signature identifying the drive as a Cameo/Aphid.

use tracing::info;

use super::sector_store::{Sector, SECTOR_SIZE};

/// 5 MB ProFile hard drive image size in bytes.
pub const IMAGE_SIZE_P5: u64 = 5_175_296;

/// 10 MB ProFile hard drive image size in bytes.
pub const IMAGE_SIZE_P10: u64 = 10_350_592;

/// Device ID and protocol version appended to the spare table. Bump the
/// number for incompatible changes to $FFFFFD writes or extension protocols.
pub const CAMEO_APHID_ID: &[u8; 16] = b"Cameo/Aphid 0001";

/// Drive identity announced to the Apple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveModel {
    /// 5 MB ProFile. Also used for images of unusual sizes.
    ProFile,
    /// 10 MB ProFile.
    ProFile10,
}

impl DriveModel {
    /// Choose the identity for an image of `byte_len` bytes.
    pub fn from_image_len(byte_len: u64) -> Self {
        if byte_len == IMAGE_SIZE_P10 {
            Self::ProFile10
        } else {
            Self::ProFile
        }
    }

    fn device_name(self) -> &'static [u8; 13] {
        match self {
            Self::ProFile => b"PROFILE      ",
            Self::ProFile10 => b"PROFILE 10M  ",
        }
    }

    fn device_number(self) -> [u8; 3] {
        match self {
            Self::ProFile => [0x00, 0x00, 0x00],
            Self::ProFile10 => [0x00, 0x00, 0x10],
        }
    }

    fn firmware_revision(self) -> [u8; 2] {
        match self {
            Self::ProFile => [0x03, 0x98],
            Self::ProFile10 => [0x04, 0x04],
        }
    }
}

/// Compute the spare table for a disk image of `byte_len` bytes.
pub fn make_spare_table(byte_len: u64) -> Sector {
    let model = DriveModel::from_image_len(byte_len);
    let num_blocks = (byte_len / SECTOR_SIZE as u64) as u32;
    info!("Using {:?} headers for this disk image file.", model);

    let mut table = Vec::with_capacity(SECTOR_SIZE);
    table.extend_from_slice(model.device_name());
    table.extend_from_slice(&model.device_number());
    table.extend_from_slice(&model.firmware_revision());
    table.extend_from_slice(&num_blocks.to_be_bytes()[1..]); // 24-bit block count
    table.extend_from_slice(&(SECTOR_SIZE as u16).to_be_bytes());
    table.push(0x20); // Spare blocks on device
    table.push(0x00); // Spare blocks allocated
    table.push(0x00); // Bad blocks allocated
    table.extend_from_slice(&[0xFF; 3]); // End of spare block list
    table.extend_from_slice(&[0xFF; 3]); // End of bad block list
    table.extend_from_slice(CAMEO_APHID_ID);

    let mut sector = [0u8; SECTOR_SIZE];
    sector[..table.len()].copy_from_slice(&table);
    sector
}
