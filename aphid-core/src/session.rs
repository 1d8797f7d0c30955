//! Back-to-back emulation sessions.
//!
//! A session loads the extensions, maps the disk image, and runs the
//! transaction loop until it concludes. The conclusion decides whether
//! another session follows and which image it serves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info};

use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::conclusion::{interpret_in, Directive};
use crate::engine::{EngineConfig, ProfileEmulator, SessionEnd};
use crate::error::AphidResult;
use crate::extension::{ExtensionContext, ExtensionEntry, ExtensionRegistry, BUILTIN};
use crate::store::Image;
use crate::ExitReason;

/// Settings shared by every session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Image served by the first session.
    pub image_path: PathBuf,
    /// Delay between image flushes.
    pub flush_delay: Duration,
    pub engine: EngineConfig,
    /// Handed to every extension factory. Its working directory is also
    /// where `IMAGE:` conclusions look for images.
    pub extensions: ExtensionContext,
    /// Extensions to load at the start of each session.
    pub extension_table: Vec<ExtensionEntry>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("profile.image"),
            flush_delay: Duration::from_secs(4),
            engine: EngineConfig::default(),
            extensions: ExtensionContext::default(),
            extension_table: BUILTIN.to_vec(),
        }
    }
}

/// Run sessions until one halts, the token is cancelled, or something
/// goes wrong.
pub fn run_sessions<C: Channel>(
    channel: &mut C,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> ExitReason {
    let mut image_path = config.image_path.clone();
    loop {
        match run_session(channel, &image_path, config, cancel) {
            Ok(SessionEnd::Interrupted) => return ExitReason::Interrupted,
            Ok(SessionEnd::Concluded(conclusion)) => {
                info!("Emulation session ended. Processing conclusion...");
                match interpret_in(&config.extensions.working_dir, &image_path, &conclusion) {
                    Directive::Halt => return ExitReason::Halted,
                    Directive::Continue(next) => image_path = next,
                }
            }
            Err(e) => {
                error!("Emulation session failed: {}", e);
                return ExitReason::Error(e.to_string());
            }
        }
    }
}

/// Run one session on `image_path`.
///
/// The image is flushed and closed, and the extensions closed, however the
/// session ends.
pub fn run_session<C: Channel>(
    channel: &mut C,
    image_path: &Path,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> AphidResult<SessionEnd> {
    info!("Loading \"magic block\" extensions...");
    let extensions = ExtensionRegistry::load(&config.extension_table, &config.extensions);

    info!("Starting emulation with image file {}...", image_path.display());
    let mut image = Image::open(image_path)?;
    image.attach_flusher(config.flush_delay)?;

    let mut emulator = ProfileEmulator::new(channel, image)
        .with_config(config.engine.clone())
        .with_extensions(extensions);
    let end = emulator.run(cancel);

    let (_, image, mut extensions) = emulator.into_parts();
    let closed = image.close();
    extensions.close();
    let end = end?;
    closed?;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedChannel;
    use crate::command::{addr, Command, Operation};
    use crate::framer::FETCH_HALF;
    use crate::store::{to_sector, Sector, SECTOR_SIZE};

    fn config(dir: &Path, image: &str) -> SessionConfig {
        SessionConfig {
            image_path: dir.join(image),
            flush_delay: Duration::from_millis(10),
            extensions: ExtensionContext {
                working_dir: dir.to_path_buf(),
                ..ExtensionContext::default()
            },
            extension_table: Vec::new(),
            ..SessionConfig::default()
        }
    }

    fn queue_write(channel: &mut ScriptedChannel, command: Command, data: &Sector) {
        channel.queue(command.encode().to_vec());
        channel.queue(data[..FETCH_HALF].to_vec());
        channel.queue(data[FETCH_HALF..].to_vec());
    }

    fn conclude(channel: &mut ScriptedChannel, text: &[u8]) {
        let command = Command {
            operation: Operation::Write,
            address: addr::CONCLUSION,
            retry_count: addr::CONCLUSION_RETRY_COUNT,
            sparing_threshold: addr::CONCLUSION_SPARING_THRESHOLD,
        };
        queue_write(channel, command, &to_sector(text));
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ScriptedChannel::new();
        let reason = run_sessions(&mut channel, &config(dir.path(), "nope.image"), &CancelToken::new());
        assert!(matches!(reason, ExitReason::Error(_)));
        assert!(!reason.is_intentional());
    }

    #[test]
    fn test_interrupt_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.image"), vec![0u8; 4 * SECTOR_SIZE]).unwrap();
        let cancel = CancelToken::new();
        let mut channel = ScriptedChannel::new();
        channel.cancel_when_drained(&cancel);

        let reason = run_sessions(&mut channel, &config(dir.path(), "a.image"), &cancel);
        assert_eq!(reason, ExitReason::Interrupted);
        assert!(reason.is_intentional());
    }

    #[test]
    fn test_conclusion_switches_images_then_halts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.image"), vec![0u8; 4 * SECTOR_SIZE]).unwrap();
        std::fs::write(dir.path().join("b.image"), vec![0u8; 4 * SECTOR_SIZE]).unwrap();

        let mut channel = ScriptedChannel::new();
        conclude(&mut channel, b"IMAGE:b.image");
        let write = Command {
            operation: Operation::Write,
            address: 1,
            retry_count: 0,
            sparing_threshold: 0,
        };
        queue_write(&mut channel, write, &[0xB1; SECTOR_SIZE]);
        conclude(&mut channel, b"HALT");

        let reason = run_sessions(&mut channel, &config(dir.path(), "a.image"), &CancelToken::new());
        assert_eq!(reason, ExitReason::Halted);

        let a = std::fs::read(dir.path().join("a.image")).unwrap();
        let b = std::fs::read(dir.path().join("b.image")).unwrap();
        assert!(a.iter().all(|&byte| byte == 0));
        assert!(b[SECTOR_SIZE..2 * SECTOR_SIZE].iter().all(|&byte| byte == 0xB1));
    }
}
