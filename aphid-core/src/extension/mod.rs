//! "Magic block" extensions.
//!
//! Software on the Apple never expects a disk bigger than a few megabytes,
//! so blocks in `addr::EXTENSIONS` are free for other uses. This module
//! provides:
//! - `Extension`: the handler capability (`handle`, optional `close`)
//! - `ExtensionRegistry`: handlers keyed by block address for one session
//! - `DebounceTimer`: deferred flushing for handlers with durable state
//! - The built-in handlers, listed in `BUILTIN`

mod debounce;
mod filesystem_ops;
mod key_value;
mod registry;
mod selector_rescue;
mod system_info;

pub use debounce::DebounceTimer;
pub use filesystem_ops::FilesystemOps;
pub use key_value::KeyValueStore;
pub use registry::{ExtensionContext, ExtensionEntry, ExtensionFactory, ExtensionRegistry};
pub use selector_rescue::SelectorRescue;
pub use system_info::SystemInfo;

use crate::command::Operation;
use crate::error::AphidResult;
use crate::store::{to_sector, Sector};

/// Handlers compiled into the emulator.
pub const BUILTIN: &[ExtensionEntry] = &[
    ExtensionEntry {
        address: 0xFFFEFC,
        name: "selector rescue",
        factory: selector_rescue::plugin,
    },
    ExtensionEntry {
        address: 0xFFFEFD,
        name: "system info",
        factory: system_info::plugin,
    },
    ExtensionEntry {
        address: 0xFFFEFE,
        name: "filesystem ops",
        factory: filesystem_ops::plugin,
    },
    ExtensionEntry {
        address: 0xFFFEFF,
        name: "key/value store",
        factory: key_value::plugin,
    },
];

/// One ProFile command addressed to an extension.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub operation: Operation,
    pub address: u32,
    pub retry_count: u8,
    pub sparing_threshold: u8,
    /// Data the Apple is writing; `None` for reads.
    pub payload: Option<&'a Sector>,
}

impl Request<'_> {
    /// Retry count and sparing threshold as one 16-bit parameter.
    pub fn parameter_word(&self) -> u16 {
        u16::from_be_bytes([self.retry_count, self.sparing_threshold])
    }

    pub fn is_read(&self) -> bool {
        !self.operation.is_write()
    }
}

/// What a handler wants the emulator to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Sector for the Apple to read. Ignored for writes.
    Data(Sector),
    /// Nothing to report; reads receive zeros.
    None,
    /// End the emulation session with this conclusion.
    EndSession(Sector),
}

impl Output {
    /// Data output, zero-padded or truncated to one sector.
    pub fn data(bytes: impl AsRef<[u8]>) -> Self {
        Self::Data(to_sector(bytes.as_ref()))
    }

    /// Session-ending output, zero-padded or truncated to one sector.
    pub fn end_session(bytes: impl AsRef<[u8]>) -> Self {
        Self::EndSession(to_sector(bytes.as_ref()))
    }
}

/// A handler for one magic block.
///
/// Handlers are created once per emulation session and closed when it
/// ends. Any resources (open files, caches) belong to the handler.
pub trait Extension: Send {
    /// Handle a command addressed to this handler's block.
    fn handle(&mut self, request: &Request<'_>) -> AphidResult<Output>;

    /// Save essential state and release resources. Called once, at the end
    /// of the session.
    fn close(&mut self) -> AphidResult<()> {
        Ok(())
    }
}
