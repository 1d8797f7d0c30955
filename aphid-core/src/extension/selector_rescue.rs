//! Selector rescue block (conventionally `$FFFEFC`).
//!
//! Serves the zipped Selector drive images kept on read-only storage, and
//! can reinstall `profile.image` from them. Reads act on the parameter word:
//!
//! - `$FFFF`: restore `profile.image` in the working directory from the
//!   ProFile archive (keeping any old copy as `profile.backup-N.image`),
//!   then start a new session on it.
//! - `$0XXX`, `$1XXX`, `$2XXX`: block `XXX` of the ProFile, 3.5 inch, or
//!   Twiggy Selector image. Blocks past the end read as zeros.
//! - Anything higher reads as zeros.
//!
//! Writes are ignored.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use tracing::{info, warn};
use zip::ZipArchive;

use super::{Extension, ExtensionContext, Output, Request};
use crate::error::AphidResult;
use crate::store::{to_sector, Sector, SECTOR_SIZE};

/// ProFile Selector image archive.
pub const PROFILE_ARCHIVE: &str = "selector.image.zip";
/// 3.5 inch floppy Selector image archive.
pub const SONY_ARCHIVE: &str = "selector.3.5inch.dc42.zip";
/// Twiggy floppy Selector image archive.
pub const TWIGGY_ARCHIVE: &str = "selector.twiggy.zip";

/// Name of the image restored into the working directory.
pub const RESTORED_IMAGE: &str = "profile.image";

const RESTORE_WORD: u16 = 0xFFFF;

pub(super) fn plugin(context: &ExtensionContext) -> AphidResult<Box<dyn Extension>> {
    Ok(Box::new(SelectorRescue::new(
        &context.selector_dir,
        &context.working_dir,
    )))
}

/// Reads and restores Selector drive images.
pub struct SelectorRescue {
    selector_dir: PathBuf,
    working_dir: PathBuf,
    images: HashMap<&'static str, Vec<u8>>,
}

impl SelectorRescue {
    pub fn new(selector_dir: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            selector_dir: selector_dir.into(),
            working_dir: working_dir.into(),
            images: HashMap::new(),
        }
    }

    /// Block `block` of the image in `archive`, or zeros if the archive is
    /// missing or the image is too short.
    fn image_block(&mut self, archive: &'static str, block: u16) -> AphidResult<Sector> {
        if !self.images.contains_key(archive) {
            let path = self.selector_dir.join(archive);
            if !path.exists() {
                warn!("Selector rescue: failed to read {}", path.display());
                return Ok([0; SECTOR_SIZE]);
            }
            self.images.insert(archive, unzip_first(&path)?);
            info!("Selector rescue: loaded {}", path.display());
        }

        let image = self.images.get(archive).map(Vec::as_slice).unwrap_or_default();
        let start = (block as usize * SECTOR_SIZE).min(image.len());
        let end = (start + SECTOR_SIZE).min(image.len());
        Ok(to_sector(&image[start..end]))
    }

    /// Reinstall `profile.image` and end the session so the next one uses it.
    fn restore(&self) -> AphidResult<Output> {
        let archive = self.selector_dir.join(PROFILE_ARCHIVE);
        if !archive.exists() {
            warn!("Selector restore abandoned: {} missing", archive.display());
            return Ok(Output::None);
        }
        let data = unzip_first(&archive)?;

        let target = self.working_dir.join(RESTORED_IMAGE);
        if target.exists() {
            let stats = statvfs(self.working_dir.as_path())?;
            let free = stats.block_size() as u64 * stats.blocks_available() as u64;
            if data.len() as u64 > free {
                warn!("Selector restore abandoned: insufficient drive space");
                return Ok(Output::None);
            }

            let backup = (0..)
                .map(|i| self.working_dir.join(format!("profile.backup-{i}.image")))
                .find(|candidate| !candidate.exists())
                .unwrap_or_else(|| self.working_dir.join("profile.backup.image"));
            info!(
                "Selector restore: moving {} to {}",
                target.display(),
                backup.display()
            );
            fs::rename(&target, &backup)?;
        }

        fs::write(&target, &data)?;
        info!(
            "Selector restore: wrote {} from {}",
            target.display(),
            archive.display()
        );
        info!("Selector restore: triggering a new emulation session");
        Ok(Output::end_session(format!("IMAGE:{RESTORED_IMAGE}")))
    }
}

impl Extension for SelectorRescue {
    fn handle(&mut self, request: &Request<'_>) -> AphidResult<Output> {
        if !request.is_read() {
            warn!(
                "Selector rescue: ignoring non-read operation {:02X}",
                request.operation as u8
            );
            return Ok(Output::None);
        }

        let word = request.parameter_word();
        let block = word & 0x0FFF;
        let sector = match word {
            RESTORE_WORD => return self.restore(),
            0x0000..=0x0FFF => self.image_block(PROFILE_ARCHIVE, block)?,
            0x1000..=0x1FFF => self.image_block(SONY_ARCHIVE, block)?,
            0x2000..=0x2FFF => self.image_block(TWIGGY_ARCHIVE, block)?,
            _ => [0; SECTOR_SIZE],
        };
        Ok(Output::Data(sector))
    }
}

/// Contents of the first file in a Zip archive.
fn unzip_first(path: &Path) -> AphidResult<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut entry = archive.by_index(0)?;
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Operation;
    use std::io::Write;
    use zip::ZipWriter;

    fn write_archive(path: &Path, name: &str, contents: &[u8]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        writer.start_file::<_, ()>(name, Default::default()).unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
    }

    fn read(word: u16) -> Request<'static> {
        let [retry_count, sparing_threshold] = word.to_be_bytes();
        Request {
            operation: Operation::Read,
            address: 0xFFFEFC,
            retry_count,
            sparing_threshold,
            payload: None,
        }
    }

    fn image() -> Vec<u8> {
        let mut data = vec![0x11u8; SECTOR_SIZE];
        data.extend(vec![0x22u8; 100]);
        data
    }

    #[test]
    fn test_serves_image_blocks() {
        let selector = tempfile::tempdir().unwrap();
        write_archive(&selector.path().join(PROFILE_ARCHIVE), "selector.image", &image());
        write_archive(&selector.path().join(TWIGGY_ARCHIVE), "selector.twiggy.dc42", &[0x33; 10]);
        let mut rescue = SelectorRescue::new(selector.path(), selector.path());

        assert_eq!(rescue.handle(&read(0x0000)).unwrap(), Output::Data([0x11; SECTOR_SIZE]));

        let Output::Data(partial) = rescue.handle(&read(0x0001)).unwrap() else {
            panic!("expected data");
        };
        assert!(partial[..100].iter().all(|&b| b == 0x22));
        assert!(partial[100..].iter().all(|&b| b == 0));

        assert_eq!(rescue.handle(&read(0x0FFF)).unwrap(), Output::Data([0; SECTOR_SIZE]));
        let Output::Data(twiggy) = rescue.handle(&read(0x2000)).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(&twiggy[..10], &[0x33; 10]);
        assert_eq!(twiggy[10], 0);
    }

    #[test]
    fn test_missing_archives_and_high_words_read_zeros() {
        let selector = tempfile::tempdir().unwrap();
        let mut rescue = SelectorRescue::new(selector.path(), selector.path());
        for word in [0x0000, 0x1234, 0x2FFF, 0x3000, 0xFFFE] {
            assert_eq!(rescue.handle(&read(word)).unwrap(), Output::Data([0; SECTOR_SIZE]));
        }
        assert_eq!(rescue.handle(&read(0xFFFF)).unwrap(), Output::None);
    }

    #[test]
    fn test_restore_backs_up_and_ends_session() {
        let selector = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_archive(&selector.path().join(PROFILE_ARCHIVE), "selector.image", &image());
        fs::write(work.path().join(RESTORED_IMAGE), b"old").unwrap();
        fs::write(work.path().join("profile.backup-0.image"), b"older").unwrap();

        let mut rescue = SelectorRescue::new(selector.path(), work.path());
        let Output::EndSession(conclusion) = rescue.handle(&read(0xFFFF)).unwrap() else {
            panic!("expected the session to end");
        };

        assert_eq!(&conclusion[..19], b"IMAGE:profile.image");
        assert_eq!(conclusion[19], 0);
        assert_eq!(fs::read(work.path().join(RESTORED_IMAGE)).unwrap(), image());
        assert_eq!(fs::read(work.path().join("profile.backup-1.image")).unwrap(), b"old");
        assert_eq!(fs::read(work.path().join("profile.backup-0.image")).unwrap(), b"older");
    }

    #[test]
    fn test_writes_are_ignored() {
        let selector = tempfile::tempdir().unwrap();
        let mut rescue = SelectorRescue::new(selector.path(), selector.path());
        let data = [0u8; SECTOR_SIZE];
        let write = Request {
            operation: Operation::Write,
            payload: Some(&data),
            ..read(0xFFFF)
        };
        assert_eq!(rescue.handle(&write).unwrap(), Output::None);
    }
}
