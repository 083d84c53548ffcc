//! Single-slot, most-recent-wins hand-off cell.
//!
//! A [`Mailbox`] holds at most one value behind a mutex. Producers overwrite,
//! consumers either peek ([`Mailbox::get`]) or consume-and-clear
//! ([`Mailbox::take`]). It is the shared primitive behind clock-offset
//! estimates, voice-activity hand-off and per-track "latest decoded image"
//! slots.

use parking_lot::Mutex;

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Mailbox<T> {
    // ---
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Replaces any pending value.
    pub fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    /// Removes and returns the pending value, if any.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Runs `f` with exclusive access to the slot.
    ///
    /// Used for conditional consumption, e.g. clearing the slot only when it
    /// still holds the value a caller previously observed.
    pub fn update<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        // ---
        let mut slot = self.slot.lock();
        f(&mut slot)
    }
}

impl<T: Clone> Mailbox<T> {
    // ---
    /// Returns a copy of the pending value without consuming it.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
