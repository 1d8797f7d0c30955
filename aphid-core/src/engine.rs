//! ProFile emulator - the transaction loop.
//!
//! Each transaction is one command from the Apple, relayed by PRU 1:
//! await the 6-byte command, route it, move one sector in the right
//! direction, then tell PRU 1 to resume.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::channel::{Channel, DEFAULT_TIMEOUT};
use crate::command::{addr, hex, Command, DecodeError, COMMAND_LEN};
use crate::error::{AphidError, AphidResult};
use crate::extension::{ExtensionRegistry, Output, Request};
use crate::framer;
use crate::store::{Sector, SectorStore, SECTOR_SIZE};

/// Timing for the transaction loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for each fetch, delivery, and resume. `None` waits forever.
    pub io_timeout: Option<Duration>,
    /// How long each wait for a command lasts before checking for
    /// cancellation.
    pub command_poll: Duration,
    /// Short command reads tolerated in a row before giving up.
    pub max_command_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_timeout: Some(DEFAULT_TIMEOUT),
            command_poll: Duration::from_millis(250),
            max_command_attempts: 600,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The Apple (or an extension) wrote a conclusion.
    Concluded(Sector),
    /// The cancel token was set.
    Interrupted,
}

/// ProFile emulator state for one session.
pub struct ProfileEmulator<C: Channel, S: SectorStore> {
    /// Link to PRU 1.
    channel: C,
    /// Disk image being served.
    store: S,
    /// Magic block handlers.
    extensions: ExtensionRegistry,
    /// The last sector read or written.
    last_buffer: Sector,
    config: EngineConfig,
}

impl<C: Channel, S: SectorStore> ProfileEmulator<C, S> {
    /// Create an emulator with no extensions and default timing.
    pub fn new(channel: C, store: S) -> Self {
        Self {
            channel,
            store,
            extensions: ExtensionRegistry::new(),
            last_buffer: [0; SECTOR_SIZE],
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    /// The last sector transferred (what `$FFFFFE` reads return).
    pub fn last_buffer(&self) -> &Sector {
        &self.last_buffer
    }

    /// Take the emulator apart once the session is over.
    pub fn into_parts(self) -> (C, S, ExtensionRegistry) {
        (self.channel, self.store, self.extensions)
    }

    /// Serve transactions until the session concludes or `cancel` is set.
    pub fn run(&mut self, cancel: &CancelToken) -> AphidResult<SessionEnd> {
        info!("Cameo/Aphid ProFile emulator ready.");
        loop {
            let Some(raw) = self.await_command(cancel)? else {
                info!("Emulation interrupted.");
                return Ok(SessionEnd::Interrupted);
            };
            if let Some(conclusion) = self.transact(&raw)? {
                return Ok(SessionEnd::Concluded(conclusion));
            }
        }
    }

    /// Wait for a whole command. `None` means cancelled.
    fn await_command(&mut self, cancel: &CancelToken) -> AphidResult<Option<Vec<u8>>> {
        let mut short_reads = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.channel.read(COMMAND_LEN, Some(self.config.command_poll)) {
                Ok(raw) if raw.len() == COMMAND_LEN => return Ok(Some(raw)),
                Ok(raw) => {
                    debug!("Ignoring {}-byte command fragment [{}]", raw.len(), hex(&raw));
                    short_reads += 1;
                    if short_reads >= self.config.max_command_attempts {
                        return Err(AphidError::CommandUnavailable {
                            attempts: short_reads,
                        });
                    }
                }
                // Nothing from the Apple yet.
                Err(AphidError::ChannelTimeout { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Carry out one command. Returns the conclusion if the session ends.
    fn transact(&mut self, raw: &[u8]) -> AphidResult<Option<Sector>> {
        let timeout = self.config.io_timeout;
        let command = match Command::decode(raw) {
            Ok(command) => command,
            Err(DecodeError::UnknownOperation(op)) => {
                warn!("[{}] Unrecognised command {:02X}, ignoring!", hex(raw), op);
                framer::resume(&mut self.channel, timeout)?;
                return Ok(None);
            }
            Err(DecodeError::Truncated(_)) => return Ok(None),
        };
        info!("[{}] {}", hex(raw), command);

        let (data, conclusion) = if command.operation.is_write() {
            self.write(&command)?
        } else {
            self.read(&command)?
        };
        framer::resume(&mut self.channel, timeout)?;

        if conclusion.is_none() {
            self.last_buffer = data;
        }
        Ok(conclusion)
    }

    /// Serve a read. Returns the sector delivered and any conclusion.
    fn read(&mut self, command: &Command) -> AphidResult<(Sector, Option<Sector>)> {
        let mut conclusion = None;
        let data = match command.address {
            addr::SPARE_TABLE => *self.store.spare_table(),
            addr::LAST_BUFFER => self.last_buffer,
            address => match self.call_extension(command, None) {
                Some(Output::Data(data)) => data,
                Some(Output::None) => [0; SECTOR_SIZE],
                Some(Output::EndSession(payload)) => {
                    conclusion = Some(payload);
                    [0; SECTOR_SIZE]
                }
                None => self.store.get_sector(address),
            },
        };
        framer::deliver_sector(&mut self.channel, &data, self.config.io_timeout)?;
        Ok((data, conclusion))
    }

    /// Serve a write. Returns the sector fetched and any conclusion.
    fn write(&mut self, command: &Command) -> AphidResult<(Sector, Option<Sector>)> {
        let data = framer::fetch_sector(&mut self.channel, self.config.io_timeout)?;
        if command.is_conclusion() {
            info!("Received the session conclusion.");
            return Ok((data, Some(data)));
        }

        let mut conclusion = None;
        match command.address {
            addr::SPARE_TABLE | addr::LAST_BUFFER => {
                debug!("Ignoring write to read-only block ${:06X}", command.address);
            }
            address => match self.call_extension(command, Some(&data)) {
                Some(Output::EndSession(payload)) => conclusion = Some(payload),
                Some(_) => {}
                None => self.store.put_sector(address, &data)?,
            },
        }
        Ok((data, conclusion))
    }

    /// Hand the command to its extension, if one owns the address.
    fn call_extension(&mut self, command: &Command, payload: Option<&Sector>) -> Option<Output> {
        if !addr::EXTENSIONS.contains(&command.address) {
            return None;
        }
        let request = Request {
            operation: command.operation,
            address: command.address,
            retry_count: command.retry_count,
            sparing_threshold: command.sparing_threshold,
            payload,
        };
        self.extensions.dispatch(&request)
    }
}
