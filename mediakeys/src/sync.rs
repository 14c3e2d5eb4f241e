//! Key wait shared between the streaming thread and the control thread.

use crate::{Error, Result};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long a transform waits for a key before failing the buffer.
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(6);

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `Instant::now() + timeout`, saturating instead of overflowing.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Why a wait returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    KeyReceived,
    Flushing,
    /// A CDM instance was attached, detached or a system was selected.
    InstanceChanged,
    TimedOut,
}

#[derive(Debug, Default)]
struct WaitState {
    key_received: bool,
    flushing: bool,
    epoch: u64,
}

/// Mutex, condition variable and the flags it guards.
///
/// All flags change under the one mutex so a waiter can never miss a
/// transition between checking its predicate and going to sleep.
#[derive(Debug, Default)]
pub struct KeyWait {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl KeyWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a key is received, flushing starts, the instance epoch
    /// moves past `seen_epoch`, or `deadline` passes.
    pub fn wait_for_key(&self, deadline: Instant, seen_epoch: u64) -> WaitOutcome {
        self.wait_until(deadline, seen_epoch, true)
    }

    /// Like [`KeyWait::wait_for_key`] but ignores the key flag.
    pub fn wait_for_change(&self, deadline: Instant, seen_epoch: u64) -> WaitOutcome {
        self.wait_until(deadline, seen_epoch, false)
    }

    fn wait_until(&self, deadline: Instant, seen_epoch: u64, want_key: bool) -> WaitOutcome {
        let mut state = self.state.lock();

        loop {
            if state.flushing {
                return WaitOutcome::Flushing;
            }

            if want_key && state.key_received {
                return WaitOutcome::KeyReceived;
            }

            if state.epoch != seen_epoch {
                return WaitOutcome::InstanceChanged;
            }

            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }

            self.cond.wait_until(&mut state, deadline);
        }
    }

    /// Mark a key as usable and wake every waiter.
    pub fn key_received(&self) {
        let mut state = self.state.lock();
        if !state.key_received {
            state.key_received = true;
            trace!("key received, waking waiters");
            self.cond.notify_all();
        }
    }

    pub fn reset_key(&self) {
        self.state.lock().key_received = false;
    }

    pub fn has_key(&self) -> bool {
        self.state.lock().key_received
    }

    /// Start flushing and wake every waiter.
    ///
    /// Starting a flush twice without stopping it is a protocol error.
    pub fn flush_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.flushing {
            return Err(Error::InvalidState("flush already in progress"));
        }

        state.flushing = true;
        trace!("flush started, waking waiters");
        self.cond.notify_all();
        Ok(())
    }

    pub fn flush_stop(&self) {
        self.state.lock().flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    /// Bump the instance epoch and wake every waiter.
    pub fn instance_changed(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        self.cond.notify_all();
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }
}
