//! System information block (conventionally `$FFFEFD`).
//!
//! Reads return:
//!
//! | Bytes | Contents                                              |
//! |-------|-------------------------------------------------------|
//! | 0-9   | uptime as `DDDDHHMMSS`, days right-aligned            |
//! | 10-24 | filesystem bytes free, right-aligned                  |
//! | 25-45 | 1, 5 and 15 minute load averages, 7 bytes each, NUL-padded |
//! | 46-55 | running and total processes, 5 bytes each, NUL-padded |
//!
//! Writes are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use tracing::warn;

use super::{Extension, ExtensionContext, Output, Request};
use crate::error::{AphidError, AphidResult};

const ADDRESS: u32 = 0xFFFEFD;

pub(super) fn plugin(context: &ExtensionContext) -> AphidResult<Box<dyn Extension>> {
    Ok(Box::new(SystemInfo::new(&context.working_dir)))
}

/// Reports uptime, free space, load and process counts.
pub struct SystemInfo {
    proc_dir: PathBuf,
    fs_dir: PathBuf,
}

impl SystemInfo {
    /// Report free space on the filesystem holding `fs_dir`.
    pub fn new(fs_dir: impl Into<PathBuf>) -> Self {
        Self::with_proc_dir("/proc", fs_dir)
    }

    /// Read `uptime` and `loadavg` from somewhere other than `/proc`.
    pub fn with_proc_dir(proc_dir: impl Into<PathBuf>, fs_dir: impl Into<PathBuf>) -> Self {
        Self {
            proc_dir: proc_dir.into(),
            fs_dir: fs_dir.into(),
        }
    }

    fn read_proc(&self, name: &str) -> AphidResult<String> {
        fs::read_to_string(self.proc_dir.join(name))
            .map_err(|e| AphidError::extension(ADDRESS, format!("reading {name}: {e}")))
    }
}

impl Extension for SystemInfo {
    fn handle(&mut self, request: &Request<'_>) -> AphidResult<Output> {
        if !request.is_read() {
            warn!(
                "System info: ignoring non-read operation {:02X}",
                request.operation as u8
            );
            return Ok(Output::None);
        }

        let uptime = self.read_proc("uptime")?;
        let loadavg = self.read_proc("loadavg")?;
        let free = bytes_free(&self.fs_dir)?;
        Ok(Output::data(format_info(&uptime, free, &loadavg)?))
    }
}

fn bytes_free(dir: &Path) -> AphidResult<u64> {
    let stats = statvfs(dir)?;
    Ok(stats.block_size() as u64 * stats.blocks_available() as u64)
}

/// Lay out the info block from `/proc/uptime` text, free bytes, and
/// `/proc/loadavg` text.
fn format_info(uptime: &str, bytes_free: u64, loadavg: &str) -> AphidResult<Vec<u8>> {
    let malformed = |what: &str| AphidError::extension(ADDRESS, format!("malformed {what}"));

    let seconds: f64 = uptime
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("uptime"))?;
    let seconds = seconds.round() as u64;
    let (days, rest) = (seconds / 86400, seconds % 86400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    let fields: Vec<&str> = loadavg.split_whitespace().collect();
    let &[one, five, fifteen, processes, ..] = fields.as_slice() else {
        return Err(malformed("loadavg"));
    };
    let (running, total) = processes.split_once('/').ok_or_else(|| malformed("loadavg"))?;

    let mut data = format!("{days:4}{hours:02}{minutes:02}{seconds:02}{bytes_free:15}").into_bytes();
    for (field, width) in [(one, 7), (five, 7), (fifteen, 7), (running, 5), (total, 5)] {
        data.extend(nul_padded(field, width));
    }
    Ok(data)
}

/// `s` cut to `width - 1` bytes, then NUL-padded to `width`.
fn nul_padded(s: &str, width: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes()[..s.len().min(width - 1)].to_vec();
    bytes.resize(width, 0);
    bytes
}
