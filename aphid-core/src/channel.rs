//! Duplex byte channel to the PRU 1 co-processor.
//!
//! The `Channel` trait provides bounded-timeout reads and writes that work
//! identically for the RPMsg device file (`PollChannel`) and for testing
//! (`ScriptedChannel`).

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{AphidError, AphidResult};

/// Default deadline for a single channel operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes requested from the descriptor per read while draining it.
const DRAIN_CHUNK: usize = 2048;

/// Byte channel to the remote peer.
///
/// A `timeout` of `None` waits indefinitely.
pub trait Channel: Send {
    /// Wait for data, then drain everything available and return the most
    /// recent `length` bytes of it.
    ///
    /// The protocol is fully synchronous, so anything beyond `length` bytes
    /// is left over from an earlier failed transaction and is discarded.
    fn read(&mut self, length: usize, timeout: Option<Duration>) -> AphidResult<Vec<u8>>;

    /// Write all of `data`, waiting for writability whenever the descriptor
    /// accepts nothing.
    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> AphidResult<()>;
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn read(&mut self, length: usize, timeout: Option<Duration>) -> AphidResult<Vec<u8>> {
        (**self).read(length, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> AphidResult<()> {
        (**self).write(data, timeout)
    }
}

/// Channel over a non-blocking descriptor, driven by `poll(2)`.
pub struct PollChannel<F> {
    inner: F,
}

impl PollChannel<File> {
    /// Open an RPMsg device file for non-blocking, synchronous I/O.
    pub fn open(path: impl AsRef<Path>) -> AphidResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NONBLOCK | OFlag::O_DSYNC).bits())
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl<F: AsRawFd + Read + Write> PollChannel<F> {
    /// Wrap a descriptor that is already in non-blocking mode.
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    /// Get the underlying descriptor back.
    pub fn into_inner(self) -> F {
        self.inner
    }

    /// Block until the descriptor reports `events`. Returns false on timeout.
    fn wait_for(&self, events: PollFlags, timeout: Option<Duration>) -> AphidResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fds = [PollFd::new(self.inner.as_raw_fd(), events)];

        loop {
            let millis = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    left.as_millis().min(i32::MAX as u128) as i32
                }
            };

            match poll(&mut fds, millis) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                    if revents.intersects(events) {
                        return Ok(true);
                    }
                    return Err(io::Error::new(
                        ErrorKind::BrokenPipe,
                        format!("channel reported {revents:?} while waiting for {events:?}"),
                    )
                    .into());
                }
                // A signal arrived; go round again with whatever time is left.
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<F: AsRawFd + Read + Write + Send> Channel for PollChannel<F> {
    fn read(&mut self, length: usize, timeout: Option<Duration>) -> AphidResult<Vec<u8>> {
        if !self.wait_for(PollFlags::POLLIN, timeout)? {
            return Err(AphidError::ChannelTimeout {
                waiting_for: "data from PRU 1",
            });
        }

        let mut all = Vec::new();
        let mut chunk = [0u8; DRAIN_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    all.extend_from_slice(&chunk[..n]);
                    if n < DRAIN_CHUNK {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if all.len() != length {
            warn!(
                "Expected to read {} bytes from PRU 1; read {} instead.",
                length,
                all.len()
            );
        }
        let start = all.len().saturating_sub(length);
        Ok(all.split_off(start))
    }

    fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> AphidResult<()> {
        let mut written = 0;
        while written < data.len() {
            let stalled = match self.inner.write(&data[written..]) {
                Ok(0) => true,
                Ok(n) => {
                    written += n;
                    false
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => true,
                Err(e) if e.kind() == ErrorKind::Interrupted => false,
                Err(e) => return Err(e.into()),
            };

            if stalled && !self.wait_for(PollFlags::POLLOUT, timeout)? {
                return Err(AphidError::ChannelTimeout {
                    waiting_for: "PRU 1 to accept data",
                });
            }
        }
        Ok(())
    }
}

/// Scripted channel for testing - replays queued messages, captures writes.
///
/// Each queued message answers exactly one `read`. Reading with nothing
/// queued times out immediately, and trips the token given to
/// `cancel_when_drained` if there is one.
#[derive(Default)]
pub struct ScriptedChannel {
    incoming: VecDeque<Vec<u8>>,
    outgoing: Vec<Vec<u8>>,
    on_drained: Option<CancelToken>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-queued messages.
    pub fn with_messages<I, M>(messages: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self {
            incoming: messages.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Cancel `token` once every queued message has been read.
    pub fn cancel_when_drained(&mut self, token: &CancelToken) {
        self.on_drained = Some(token.clone());
    }

    /// Queue a message for a future read.
    pub fn queue(&mut self, message: impl Into<Vec<u8>>) {
        self.incoming.push_back(message.into());
    }

    /// Number of queued messages not yet read.
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    /// Every message written so far, in order.
    pub fn written(&self) -> &[Vec<u8>] {
        &self.outgoing
    }

    /// Clear captured writes.
    pub fn clear_written(&mut self) {
        self.outgoing.clear();
    }
}

impl Channel for ScriptedChannel {
    fn read(&mut self, length: usize, _timeout: Option<Duration>) -> AphidResult<Vec<u8>> {
        let Some(mut message) = self.incoming.pop_front() else {
            if let Some(token) = &self.on_drained {
                token.cancel();
            }
            return Err(AphidError::ChannelTimeout {
                waiting_for: "scripted data",
            });
        };
        let start = message.len().saturating_sub(length);
        Ok(message.split_off(start))
    }

    fn write(&mut self, data: &[u8], _timeout: Option<Duration>) -> AphidResult<()> {
        self.outgoing.push(data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (PollChannel<UnixStream>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (PollChannel::new(ours), theirs)
    }

    #[test]
    fn test_read_returns_requested_bytes() {
        let (mut channel, mut peer) = pair();
        peer.write_all(b"\x00\x00\x12\x34\x00\x00").unwrap();

        let data = channel.read(6, Some(DEFAULT_TIMEOUT)).unwrap();
        assert_eq!(data, b"\x00\x00\x12\x34\x00\x00");
    }

    #[test]
    fn test_read_discards_stale_bytes() {
        let (mut channel, mut peer) = pair();
        peer.write_all(b"stale").unwrap();
        peer.write_all(b"fresh!").unwrap();

        let data = channel.read(6, None).unwrap();
        assert_eq!(data, b"fresh!");
    }

    #[test]
    fn test_short_read_is_returned_as_is() {
        let (mut channel, mut peer) = pair();
        peer.write_all(b"abc").unwrap();

        assert_eq!(channel.read(6, Some(DEFAULT_TIMEOUT)).unwrap(), b"abc");
    }

    #[test]
    fn test_read_times_out_within_bound() {
        let (mut channel, _peer) = pair();

        let started = Instant::now();
        let result = channel.read(6, Some(DEFAULT_TIMEOUT));
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(AphidError::ChannelTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(4900), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(8), "returned after {elapsed:?}");
    }

    #[test]
    fn test_write_reaches_peer() {
        let (mut channel, mut peer) = pair();
        channel.write(b"hello", Some(DEFAULT_TIMEOUT)).unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_scripted_channel() {
        let mut channel = ScriptedChannel::with_messages([b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(channel.pending(), 2);
        assert_eq!(channel.read(5, None).unwrap(), b"first");
        assert_eq!(channel.read(3, None).unwrap(), b"ond");
        assert!(matches!(
            channel.read(1, None),
            Err(AphidError::ChannelTimeout { .. })
        ));

        let token = CancelToken::new();
        channel.cancel_when_drained(&token);
        assert!(channel.read(1, None).is_err());
        assert!(token.is_cancelled());

        channel.write(b"out", None).unwrap();
        assert_eq!(channel.written(), &[b"out".to_vec()]);
        channel.clear_written();
        assert!(channel.written().is_empty());
    }
}
