//! Cooperative scheduling. Every resumable state machine — the socket
//! reader, each connection, each transfer — is a [`Pollable`] unit the
//! dispatcher drives once per tick. Nothing blocks; waiting is "do
//! nothing this tick".

use std::sync::Mutex;

/// Result of one poll of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Did work this tick; poll again soon.
    Running,
    /// Nothing to do this tick.
    Sleeping,
    /// Done; drop the unit from the schedule.
    Finished,
}

pub trait Pollable: Send {
    fn poll(&mut self) -> PollStatus;
}

/// Registration queue feeding the dispatcher. New units (an explicit
/// connect, a connection lazily created for an inbound datagram) land
/// here and are adopted at the top of the next tick.
#[derive(Default)]
pub struct UnitQueue {
    inner: Mutex<Vec<Box<dyn Pollable>>>,
}

impl UnitQueue {
    pub fn new() -> UnitQueue {
        UnitQueue::default()
    }

    pub fn push(&self, unit: Box<dyn Pollable>) {
        self.lock().push(unit);
    }

    /// Take everything queued since the last drain.
    pub fn drain(&self) -> Vec<Box<dyn Pollable>> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn Pollable>>> {
        // A poisoned queue still holds valid units; keep the loop alive.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
