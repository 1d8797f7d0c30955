//! Handlers for one emulation session, keyed by block address.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{Extension, Output, Request};
use crate::command::addr;
use crate::error::{AphidError, AphidResult};

/// Everything a handler factory may need to set itself up.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    /// Directory holding disk images and handler data files.
    pub working_dir: PathBuf,
    /// Directory holding the zipped Selector images.
    pub selector_dir: PathBuf,
    /// Default delay before a handler's deferred flush.
    pub flush_delay: Duration,
}

impl Default for ExtensionContext {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            selector_dir: PathBuf::from("/home/debian/aphid/selector"),
            flush_delay: Duration::from_secs(4),
        }
    }
}

/// Builds a handler for one session.
pub type ExtensionFactory = fn(&ExtensionContext) -> AphidResult<Box<dyn Extension>>;

/// A row in a static handler table.
#[derive(Clone, Copy)]
pub struct ExtensionEntry {
    pub address: u32,
    pub name: &'static str,
    pub factory: ExtensionFactory,
}

struct Loaded {
    name: &'static str,
    extension: Box<dyn Extension>,
}

/// The handlers live for one session.
///
/// Every handler is closed exactly once, by `close` or on drop.
#[derive(Default)]
pub struct ExtensionRegistry {
    handlers: BTreeMap<u32, Loaded>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every handler in `table`. Handlers that fail to load are
    /// logged and left out.
    pub fn load(table: &[ExtensionEntry], context: &ExtensionContext) -> Self {
        let mut registry = Self::new();
        for entry in table {
            info!("Extensions: loading {} at ${:06X}...", entry.name, entry.address);
            let loaded = (entry.factory)(context)
                .and_then(|extension| registry.insert(entry.address, entry.name, extension));
            if let Err(e) = loaded {
                error!(
                    "While loading the extension for block ${:06X}: {}",
                    entry.address, e
                );
            }
        }
        registry
    }

    /// Add a handler for `address`, replacing (and closing) any previous
    /// handler there.
    pub fn register(&mut self, address: u32, extension: Box<dyn Extension>) -> AphidResult<()> {
        self.insert(address, "custom", extension)
    }

    fn insert(
        &mut self,
        address: u32,
        name: &'static str,
        extension: Box<dyn Extension>,
    ) -> AphidResult<()> {
        if !addr::EXTENSIONS.contains(&address) {
            return Err(AphidError::ReservedAddress(address));
        }
        if let Some(mut previous) = self.handlers.insert(address, Loaded { name, extension }) {
            close_one(address, &mut previous);
        }
        Ok(())
    }

    /// Whether a handler is registered for `address`.
    pub fn contains(&self, address: u32) -> bool {
        self.handlers.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered block addresses, ascending.
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.handlers.keys().copied()
    }

    /// Pass `request` to the handler for its address.
    ///
    /// Returns `None` when no handler owns the address. A handler error is
    /// logged and reported as `Output::None`.
    pub fn dispatch(&mut self, request: &Request<'_>) -> Option<Output> {
        let loaded = self.handlers.get_mut(&request.address)?;
        match loaded.extension.handle(request) {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(
                    "Extension {} at ${:06X} failed: {}",
                    loaded.name, request.address, e
                );
                Some(Output::None)
            }
        }
    }

    /// Close and remove every handler. Failures are logged.
    pub fn close(&mut self) {
        for (address, mut loaded) in std::mem::take(&mut self.handlers) {
            close_one(address, &mut loaded);
        }
    }
}

impl Drop for ExtensionRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_one(address: u32, loaded: &mut Loaded) {
    if let Err(e) = loaded.extension.close() {
        error!("While closing the extension for block ${:06X}: {}", address, e);
    }
}
