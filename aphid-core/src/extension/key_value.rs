//! Durable key/value store (conventionally `$FFFEFF`).
//!
//! Keys are 20 bytes and values 512 bytes, so a key and its value fill one
//! sector. The Apple works through a volatile cache of 65,536 sectors
//! indexed by the command's parameter word:
//!
//! - Reads return the cache entry for the parameter word (all zeros if
//!   never filled).
//! - Writes with parameter word `$FFFF` load entries into the cache. Byte 0
//!   is how many to load (at most 24); each following 22-byte record holds a
//!   2-byte cache index and the 20-byte store key to load there.
//! - Other writes put the sector into the cache entry for the parameter word
//!   and store its value under its key.
//!
//! Unknown keys read as 512 zero bytes. The store is saved as JSON, a few
//! seconds after the last write and again on close.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{DebounceTimer, Extension, ExtensionContext, Output, Request};
use crate::error::{AphidError, AphidResult};
use crate::store::{Sector, SECTOR_SIZE};

/// Store key length in bytes.
pub const KEY_LEN: usize = 20;
/// Store value length in bytes.
pub const VALUE_LEN: usize = SECTOR_SIZE - KEY_LEN;

const LOAD_WORD: u16 = 0xFFFF;
const MAX_LOADS: usize = 24;
const LOAD_RECORD_LEN: usize = 2 + KEY_LEN;

/// Default store file name, in the working directory.
pub const STORE_FILE: &str = "profile_key_value_store.json";

pub(super) fn plugin(context: &ExtensionContext) -> AphidResult<Box<dyn Extension>> {
    let store = KeyValueStore::open(context.working_dir.join(STORE_FILE), context)?;
    Ok(Box::new(store))
}

#[derive(Serialize, Deserialize)]
struct StoredPair {
    key: String,
    value: String,
}

struct StoreState {
    path: PathBuf,
    durable: BTreeMap<Vec<u8>, Vec<u8>>,
    cache: HashMap<u16, Sector>,
    unsaved: bool,
}

impl StoreState {
    fn save(&mut self) -> AphidResult<()> {
        if !self.unsaved {
            return Ok(());
        }
        let pairs: Vec<StoredPair> = self
            .durable
            .iter()
            .map(|(key, value)| StoredPair {
                key: to_hex(key),
                value: to_hex(value),
            })
            .collect();

        let scratch = self.path.with_extension("json.new");
        fs::write(&scratch, serde_json::to_vec_pretty(&pairs)?)?;
        fs::rename(&scratch, &self.path)?;
        self.unsaved = false;
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> Sector {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..KEY_LEN].copy_from_slice(key);
        if let Some(value) = self.durable.get(key) {
            sector[KEY_LEN..].copy_from_slice(value);
        }
        sector
    }
}

/// Key/value store with an Apple-managed cache.
pub struct KeyValueStore {
    state: Arc<Mutex<StoreState>>,
    timer: DebounceTimer,
}

impl KeyValueStore {
    /// Open (or start) the store kept in `path`.
    pub fn open(path: impl AsRef<Path>, context: &ExtensionContext) -> AphidResult<Self> {
        let path = path.as_ref();
        info!("Key/value store: opening {}...", path.display());
        let durable = load(path)?;

        let state = Arc::new(Mutex::new(StoreState {
            path: path.to_path_buf(),
            durable,
            cache: HashMap::new(),
            unsaved: false,
        }));
        let flushed = Arc::clone(&state);
        let timer = DebounceTimer::spawn("key/value", context.flush_delay, move || {
            flushed.lock().map_err(|_| AphidError::LockPoisoned)?.save()
        })?;

        Ok(Self { state, timer })
    }

    /// Number of keys in the durable store.
    pub fn len(&self) -> AphidResult<usize> {
        Ok(self.lock()?.durable.len())
    }

    pub fn is_empty(&self) -> AphidResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> AphidResult<std::sync::MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| AphidError::LockPoisoned)
    }
}

impl Extension for KeyValueStore {
    fn handle(&mut self, request: &Request<'_>) -> AphidResult<Output> {
        let word = request.parameter_word();
        let mut state = self.lock()?;

        let Some(data) = request.payload else {
            let sector = state.cache.get(&word).copied().unwrap_or([0; SECTOR_SIZE]);
            return Ok(Output::Data(sector));
        };

        if word == LOAD_WORD {
            let count = (data[0] as usize).min(MAX_LOADS);
            for record in data[1..].chunks_exact(LOAD_RECORD_LEN).take(count) {
                let index = u16::from_be_bytes([record[0], record[1]]);
                let entry = state.lookup(&record[2..]);
                state.cache.insert(index, entry);
            }
            return Ok(Output::None);
        }

        state.cache.insert(word, *data);
        state
            .durable
            .insert(data[..KEY_LEN].to_vec(), data[KEY_LEN..].to_vec());
        state.unsaved = true;
        drop(state);
        self.timer.mark_dirty(None);
        Ok(Output::None)
    }

    fn close(&mut self) -> AphidResult<()> {
        self.timer.shutdown();
        info!("Key/value store: closing");
        self.lock()?.save()
    }
}

fn load(path: &Path) -> AphidResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let pairs: Vec<StoredPair> = serde_json::from_slice(&fs::read(path)?)?;

    let mut durable = BTreeMap::new();
    for pair in pairs {
        match (from_hex(&pair.key), from_hex(&pair.value)) {
            (Some(key), Some(value)) if key.len() == KEY_LEN && value.len() == VALUE_LEN => {
                durable.insert(key, value);
            }
            _ => warn!("Key/value store: skipping malformed entry {:?}", pair.key),
        }
    }
    Ok(durable)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}
