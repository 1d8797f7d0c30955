//! Cameo/Aphid ProFile hard drive emulator core
//!
//! This crate serves ProFile disk I/O for an Apple II, Apple III, or Lisa,
//! relayed by a PRU co-processor over an RPMsg channel:
//! - Channel to the co-processor, with bounded-timeout reads and writes
//! - Memory-mapped disk images with debounced background flushing
//! - Sector transfers split to fit the co-processor's message size
//! - "Magic block" extensions at reserved block addresses
//!
//! # Architecture
//!
//! The emulator uses a layered design:
//! - `Channel` trait: byte transport to the co-processor
//! - `SectorStore` trait: 532-byte sector storage
//! - `Extension` trait: handlers for magic blocks
//! - `ProfileEmulator`: the transaction loop tying them together
//! - `run_sessions`: back-to-back sessions steered by their conclusions

pub mod cancel;
pub mod channel;
pub mod command;
pub mod conclusion;
pub mod engine;
pub mod error;
pub mod extension;
pub mod framer;
pub mod names;
pub mod session;
pub mod store;

pub use cancel::CancelToken;
pub use channel::{Channel, PollChannel, ScriptedChannel};
pub use command::{addr, Command, Operation};
pub use conclusion::{interpret, interpret_in, Directive};
pub use engine::{EngineConfig, ProfileEmulator, SessionEnd};
pub use error::{AphidError, AphidResult};
pub use extension::{Extension, ExtensionContext, ExtensionRegistry, Output, Request};
pub use session::{run_session, run_sessions, SessionConfig};
pub use store::{Image, MemoryImage, Sector, SectorStore, SECTOR_SIZE};

/// Why the emulator stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Interrupted from outside (Ctrl-C or SIGTERM)
    Interrupted,
    /// A session concluded with `HALT`
    Halted,
    /// Error occurred
    Error(String),
}

impl ExitReason {
    /// Whether the emulator stopped on purpose rather than by failure.
    pub fn is_intentional(&self) -> bool {
        !matches!(self, Self::Error(_))
    }
}
