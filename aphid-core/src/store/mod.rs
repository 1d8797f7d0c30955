//! Sector-addressed storage for the emulated drive.
//!
//! This module provides the layered storage architecture:
//! - `SectorStore`: Sector get/put interface the engine talks to
//! - `Image`: Memory-mapped disk image file
//! - `MemoryImage`: In-memory implementation
//! - `ImageFlusher`: Debounced background durability for `Image`

mod flusher;
mod image;
mod memory_image;
mod sector_store;
mod spare_table;

pub use flusher::ImageFlusher;
pub use image::Image;
pub use memory_image::MemoryImage;
pub use sector_store::{to_sector, Sector, SectorStore, SECTOR_SIZE};
pub use spare_table::{make_spare_table, DriveModel, CAMEO_APHID_ID, IMAGE_SIZE_P10, IMAGE_SIZE_P5};
