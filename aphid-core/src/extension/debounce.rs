//! Deferred, coalescing flushes for handlers that own durable state.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::AphidResult;

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

type Shared = Arc<(Mutex<TimerState>, Condvar)>;

/// Calls a flush function once things have been quiet for a while.
///
/// Every `mark_dirty` (re)schedules a single flush; calling it again before
/// the deadline pushes the deadline back, so a burst of writes costs one
/// flush. Dropping the timer discards any pending flush without running it.
pub struct DebounceTimer {
    shared: Shared,
    default_delay: Duration,
    thread: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    /// Start a timer thread that runs `flush` when a scheduled deadline
    /// passes. Flush failures are logged.
    pub fn spawn<F>(name: &str, default_delay: Duration, flush: F) -> AphidResult<Self>
    where
        F: FnMut() -> AphidResult<()> + Send + 'static,
    {
        let shared: Shared = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("{name} flush"))
            .spawn(move || run(worker, flush))?;

        Ok(Self {
            shared,
            default_delay,
            thread: Some(thread),
        })
    }

    /// Schedule a flush after `delay` (or the default delay), replacing any
    /// flush already scheduled.
    pub fn mark_dirty(&self, delay: Option<Duration>) {
        let (lock, wake) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.deadline = Some(Instant::now() + delay.unwrap_or(self.default_delay));
        wake.notify_one();
    }

    /// Forget the scheduled flush, if any.
    pub fn cancel(&self) {
        let (lock, wake) = &*self.shared;
        lock.lock().unwrap_or_else(PoisonError::into_inner).deadline = None;
        wake.notify_one();
    }

    /// Whether a flush is scheduled and has not started yet.
    pub fn is_pending(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadline
            .is_some()
    }

    /// Stop the timer thread without flushing. A flush that has already
    /// started is allowed to finish.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let (lock, wake) = &*self.shared;
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            state.deadline = None;
            state.shutdown = true;
            wake.notify_one();
        }
        if thread.join().is_err() {
            warn!("Debounce timer thread panicked");
        }
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(shared: Shared, mut flush: F)
where
    F: FnMut() -> AphidResult<()>,
{
    let (lock, wake) = &*shared;
    loop {
        {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if state.shutdown {
                    return;
                }
                match state.deadline {
                    None => {
                        state = wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            state.deadline = None;
                            break;
                        }
                        state = wake
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        }

        if let Err(e) = flush() {
            warn!("Deferred flush failed: {}", e);
        }
    }
}
