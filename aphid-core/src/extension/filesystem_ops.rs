//! Filesystem operations block (conventionally `$FFFEFE`).
//!
//! Lets the Apple list and manage disk image files in the working
//! directory. Only files ending in the current suffix (`.image` at first)
//! are listed or touched, and a few files are never modified.
//!
//! Reads return entry `n` of the listing, where `n` is the parameter word:
//!
//! | Bytes   | Contents                                            |
//! |---------|-----------------------------------------------------|
//! | 0-3     | nonce; changes when the directory contents change   |
//! | 4-5     | number of listed files                              |
//! | 6-19    | `YYYYMMDDHHMMSS` UTC modification time              |
//! | 20-29   | file size, right-aligned                            |
//! | 30-275  | reserved                                            |
//! | 276-    | NUL-terminated file name                            |
//!
//! Entries past the end describe an empty file with an empty name.
//!
//! Writes run the command named by the parameter word (two ASCII letters)
//! with NUL-separated arguments from the payload:
//! `cp src dst`, `mv src dst`, `mk name`, `mx size name`, `rm name`, and
//! `sx suffix`. No result is reported; the Apple can watch the nonce.
//!
//! File names travel as described in [`crate::names`].

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use nix::sys::statvfs::statvfs;
use tracing::{info, warn};

use super::key_value::STORE_FILE;
use super::{Extension, ExtensionContext, Output, Request};
use crate::error::AphidResult;
use crate::names::{decode_name, encode_name};
use crate::store::IMAGE_SIZE_P5;

/// Files this handler never creates, replaces, or deletes.
pub const PROTECTED_FILES: &[&str] = &[
    "profile.image",
    STORE_FILE,
    "profile_key_value_store.json.new",
];

/// Suffix in effect when the handler starts.
pub const DEFAULT_SUFFIX: &str = ".image";

const RESERVED_LEN: usize = 246;
const MAX_NAME_LEN: usize = 255;

const COPY: u16 = u16::from_be_bytes(*b"cp");
const MOVE: u16 = u16::from_be_bytes(*b"mv");
const CREATE: u16 = u16::from_be_bytes(*b"mk");
const CREATE_SIZED: u16 = u16::from_be_bytes(*b"mx");
const DELETE: u16 = u16::from_be_bytes(*b"rm");
const SET_SUFFIX: u16 = u16::from_be_bytes(*b"sx");

pub(super) fn plugin(context: &ExtensionContext) -> AphidResult<Box<dyn Extension>> {
    Ok(Box::new(FilesystemOps::new(&context.working_dir)))
}

struct Listing {
    modified: SystemTime,
    files: Vec<String>,
}

/// Directory listing and file management for the Apple.
pub struct FilesystemOps {
    dir: PathBuf,
    suffix: String,
    protected: HashSet<String>,
    listing: Option<Listing>,
}

impl FilesystemOps {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            suffix: DEFAULT_SUFFIX.to_string(),
            protected: PROTECTED_FILES.iter().map(|s| s.to_string()).collect(),
            listing: None,
        }
    }

    /// Current file suffix.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Rescan the directory if it changed since the last scan.
    fn refresh(&mut self) -> AphidResult<&Listing> {
        let modified = fs::metadata(&self.dir)?.modified()?;
        let stale = !matches!(&self.listing, Some(l) if l.modified == modified);
        if stale {
            let mut files = Vec::new();
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type()?.is_file() && name.ends_with(&self.suffix) {
                    files.push(name);
                }
            }
            files.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then(a.cmp(b)));
            self.listing = Some(Listing { modified, files });
        }
        Ok(self.listing.get_or_insert_with(|| Listing {
            modified,
            files: Vec::new(),
        }))
    }

    fn entry(&mut self, index: u16) -> AphidResult<Vec<u8>> {
        let dir = self.dir.clone();
        let listing = self.refresh()?;
        let nonce = listing
            .modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as u32;

        let mut data = Vec::new();
        data.extend(nonce.to_be_bytes());
        data.extend((listing.files.len() as u16).to_be_bytes());

        match listing.files.get(index as usize) {
            Some(name) => {
                let metadata = fs::metadata(dir.join(name))?;
                let modified: DateTime<Utc> = metadata.modified()?.into();
                data.extend(modified.format("%Y%m%d%H%M%S").to_string().into_bytes());
                data.extend(format!("{:10}", metadata.len()).into_bytes());
                data.extend([0u8; RESERVED_LEN]);
                data.extend(encode_name(name));
            }
            None => {
                data.extend(b"19700101000000");
                data.extend(b"         0");
                data.extend([0u8; RESERVED_LEN]);
            }
        }
        Ok(data)
    }

    fn run(&mut self, command: u16, args: &[String]) -> AphidResult<()> {
        let done = match command {
            COPY => self.copy(args)?,
            MOVE => self.rename(args)?,
            CREATE => self.create(args, None)?,
            CREATE_SIZED => self.create(&args[1.min(args.len())..], args.first())?,
            DELETE => self.delete(args)?,
            SET_SUFFIX => self.set_suffix(args),
            _ => {
                warn!("Filesystem ops: ignoring unrecognised command {:04X}", command);
                false
            }
        };
        if done {
            self.listing = None;
        }
        Ok(())
    }

    fn copy(&self, args: &[String]) -> AphidResult<bool> {
        let [source, target] = self.two_names(args)?;
        let Some((source, target)) = source.zip(target) else {
            return Ok(false);
        };
        if !self.have_room(fs::metadata(&source)?.len())? {
            return Ok(false);
        }
        info!("Filesystem ops: copying {} to {}", source.display(), target.display());
        fs::copy(source, target)?;
        Ok(true)
    }

    fn rename(&self, args: &[String]) -> AphidResult<bool> {
        let [source, target] = self.two_names(args)?;
        let Some((source, target)) = source.zip(target) else {
            return Ok(false);
        };
        info!("Filesystem ops: moving {} to {}", source.display(), target.display());
        fs::rename(source, target)?;
        Ok(true)
    }

    /// Validated source and target paths for `cp` and `mv`.
    fn two_names(&self, args: &[String]) -> AphidResult<[Option<PathBuf>; 2]> {
        let (Some(source), Some(target)) = (args.first(), args.get(1)) else {
            return Ok([None, None]);
        };
        Ok([self.existing(source), self.new_target(target)])
    }

    fn create(&self, args: &[String], size: Option<&String>) -> AphidResult<bool> {
        let Some(target) = args.first().and_then(|name| self.new_target(name)) else {
            return Ok(false);
        };
        let size = match size {
            None => IMAGE_SIZE_P5,
            Some(text) if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => {
                match text.parse() {
                    Ok(size) => size,
                    Err(_) => return Ok(false),
                }
            }
            Some(_) => return Ok(false),
        };
        if !self.have_room(size)? {
            return Ok(false);
        }

        info!("Filesystem ops: creating {}-byte {}", size, target.display());
        let file = OpenOptions::new().write(true).create_new(true).open(&target)?;
        file.set_len(size)?;
        Ok(true)
    }

    fn delete(&self, args: &[String]) -> AphidResult<bool> {
        let Some(target) = args
            .first()
            .filter(|name| !self.protected.contains(name.as_str()))
            .and_then(|name| self.existing(name))
        else {
            return Ok(false);
        };
        info!("Filesystem ops: removing {}", target.display());
        fs::remove_file(target)?;
        Ok(true)
    }

    fn set_suffix(&mut self, args: &[String]) -> bool {
        let suffix = args.first().map(String::as_str).unwrap_or_default();
        if !suffix.is_empty() && !name_ok(suffix) {
            return false;
        }
        info!("Filesystem ops: suffix is now {:?}", suffix);
        self.suffix = suffix.to_string();
        true
    }

    /// Path of an existing listed file called `name`.
    fn existing(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        (self.listable(name) && path.is_file()).then_some(path)
    }

    /// Path for a new file called `name`, if that name may be created.
    fn new_target(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        let ok = self.listable(name)
            && name_ok(name)
            && !self.protected.contains(name)
            && !path.exists()
            && path.symlink_metadata().is_err();
        ok.then_some(path)
    }

    fn listable(&self, name: &str) -> bool {
        !name.is_empty() && !name.contains('/') && name.ends_with(&self.suffix)
    }

    fn have_room(&self, bytes: u64) -> AphidResult<bool> {
        let stats = statvfs(self.dir.as_path())?;
        let free = stats.block_size() as u64 * stats.blocks_available() as u64;
        if bytes > free {
            warn!("Filesystem ops: not enough room for {} more bytes", bytes);
        }
        Ok(bytes <= free)
    }
}

impl Extension for FilesystemOps {
    fn handle(&mut self, request: &Request<'_>) -> AphidResult<Output> {
        let word = request.parameter_word();
        match request.payload {
            None => Ok(Output::data(self.entry(word)?)),
            Some(data) => {
                let args: Vec<String> = data.split(|&b| b == 0).map(decode_name).collect();
                self.run(word, &args)?;
                Ok(Output::None)
            }
        }
    }
}

fn name_ok(name: &str) -> bool {
    !name.contains('/') && !name.chars().any(char::is_control) && name.len() <= MAX_NAME_LEN
}
