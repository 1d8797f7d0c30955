//! Background disk-syncing for mapped disk images.
//!
//! Code that changes mapped data calls `ImageFlusher::dirty`. The flusher
//! thread wakes, flushes once, then sleeps for the debounce delay before it
//! will consider flushing again, so bursts of writes cost at most one flush
//! per delay period on the storage media.
//!
//! Stopping the flusher does not flush. The image's own unmap-time flush
//! covers that.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::error::AphidResult;

#[derive(Default)]
struct FlushState {
    /// Data changed since the last flush began.
    dirty: bool,
    /// Time to quit.
    cease: bool,
}

type Shared = Arc<(Mutex<FlushState>, Condvar)>;

/// Debounced background flusher thread.
pub struct ImageFlusher {
    shared: Shared,
    thread: Option<JoinHandle<()>>,
}

impl ImageFlusher {
    /// Start a flusher thread that calls `flush` at most once per `delay`.
    pub fn spawn<F>(delay: Duration, flush: F) -> AphidResult<Self>
    where
        F: FnMut() -> io::Result<()> + Send + 'static,
    {
        let shared: Shared = Arc::new((Mutex::new(FlushState::default()), Condvar::new()));
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("flusher".to_string())
            .spawn(move || run(thread_shared, delay, flush))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Note that mapped data has changed and should reach the disk.
    pub fn dirty(&self) {
        let (lock, wake) = &*self.shared;
        lock.lock().unwrap_or_else(PoisonError::into_inner).dirty = true;
        wake.notify_one();
    }

    /// Stop the flusher thread and wait for it to exit.
    ///
    /// A flush already underway completes; no new flush starts.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let (lock, wake) = &*self.shared;
            lock.lock().unwrap_or_else(PoisonError::into_inner).cease = true;
            wake.notify_one();
        }
        if thread.join().is_err() {
            error!("Disk image flusher thread panicked.");
        }
    }
}

impl Drop for ImageFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F>(shared: Shared, delay: Duration, mut flush: F)
where
    F: FnMut() -> io::Result<()>,
{
    let (lock, wake) = &*shared;
    loop {
        {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            while !state.dirty && !state.cease {
                state = wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            if state.cease {
                return;
            }
            // Cleared before flushing: writes landing mid-flush re-arm us.
            state.dirty = false;
        }

        match flush() {
            Ok(()) => info!("Disk image data flushed to the disk image file."),
            Err(e) => error!("Failed to flush disk image data: {}", e),
        }

        // Debounce, but wake now if it's time to quit.
        let state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = wake
            .wait_timeout_while(state, delay, |s| !s.cease)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
