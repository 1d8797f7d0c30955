//! Error types for the ProFile emulator.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while emulating a ProFile.
#[derive(Error, Debug)]
pub enum AphidError {
    #[error("Timed out waiting for {waiting_for} on the co-processor channel")]
    ChannelTimeout { waiting_for: &'static str },

    #[error("Sector fetch assembled {actual} bytes; expected {expected}")]
    Framing { expected: usize, actual: usize },

    #[error("Sector data for sector ${sector:06X} was {length} bytes long; it should be 532 bytes")]
    InvalidSectorLength { sector: u32, length: usize },

    #[error("Gave up after {attempts} attempts to read a 6-byte command")]
    CommandUnavailable { attempts: usize },

    #[error("Extension at ${address:06X} failed: {message}")]
    Extension { address: u32, message: String },

    #[error("Address ${0:06X} is outside the extension range")]
    ReservedAddress(u32),

    #[error("File {0} already exists; won't overwrite it with a new disk image")]
    ImageExists(PathBuf),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AphidError {
    /// Shorthand for an extension failure at `address`.
    pub fn extension(address: u32, message: impl Into<String>) -> Self {
        Self::Extension {
            address,
            message: message.into(),
        }
    }

    /// Whether this error ends the current emulation session.
    ///
    /// Extension failures are logged and skipped; everything else escaping
    /// the transaction loop is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Extension { .. })
    }
}

/// Result type for emulator operations.
pub type AphidResult<T> = Result<T, AphidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_errors_are_not_fatal() {
        assert!(!AphidError::extension(0xFFFEFF, "boom").is_fatal());
        assert!(AphidError::ChannelTimeout { waiting_for: "data" }.is_fatal());
        assert!(AphidError::Framing {
            expected: 532,
            actual: 266
        }
        .is_fatal());
    }

    #[test]
    fn test_messages_name_addresses_in_hex() {
        let err = AphidError::ReservedAddress(0xFFFFFF);
        assert_eq!(err.to_string(), "Address $FFFFFF is outside the extension range");
    }
}
