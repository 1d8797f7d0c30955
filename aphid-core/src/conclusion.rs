//! What to do after an emulation session concludes.
//!
//! The conclusion is text up to the first NUL, with file names escaped as
//! in directory listings:
//! - `HALT` stops the emulator.
//! - `IMAGE:<name>` switches to disk image `<name>` in the working
//!   directory, provided it is a plain file name with an image suffix and
//!   the file exists.
//!
//! Anything else, including an `IMAGE:` request that fails those checks,
//! carries on with the same image.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::names::decode_name;

/// File name suffixes accepted for `IMAGE:` requests.
pub const IMAGE_SUFFIXES: &[&str] = &[".image"];

/// Next step after a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Stop emulating.
    Halt,
    /// Start another session on this image.
    Continue(PathBuf),
}

/// Interpret a conclusion relative to the current directory.
pub fn interpret(previous: &Path, conclusion: &[u8]) -> Directive {
    interpret_in(Path::new(""), previous, conclusion)
}

/// Interpret a conclusion, resolving image names within `dir`.
pub fn interpret_in(dir: &Path, previous: &Path, conclusion: &[u8]) -> Directive {
    let text = conclusion_text(conclusion);
    if text == "HALT" {
        info!("Conclusion: halting the emulator.");
        return Directive::Halt;
    }

    let Some(name) = text.strip_prefix("IMAGE:") else {
        return Directive::Continue(previous.to_path_buf());
    };
    match image_in(dir, name) {
        Some(path) => {
            info!("Conclusion: switching to {}.", path.display());
            Directive::Continue(path)
        }
        None => {
            warn!("Conclusion: can't switch to image {:?}; keeping the current one.", name);
            Directive::Continue(previous.to_path_buf())
        }
    }
}

/// Conclusion bytes up to the first NUL, decoded like listed file names.
fn conclusion_text(conclusion: &[u8]) -> String {
    let end = conclusion.iter().position(|&b| b == 0).unwrap_or(conclusion.len());
    decode_name(&conclusion[..end])
}

fn image_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let bare = !name.is_empty() && !name.contains('/') && name != "." && name != "..";
    let suffix_ok = IMAGE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix));
    if !(bare && suffix_ok) {
        return None;
    }
    let path = dir.join(name);
    path.is_file().then_some(path)
}
