//! Per-transaction mutual exclusion gate
//!
//! Not reentrant: an action holding the gate must call the unguarded internals
//! rather than another guarded entry point of the same transaction.
//!
//! Locking steps (begin, prepare, commit, rollback, recovery) enter with
//! [`TransactionGate::try_enter`] or [`TransactionGate::enter_within`]. Operations enter with
//! [`TransactionGate::enter_operation`], which queues behind a running operation but is
//! turned away while a locking step holds the gate.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Holder {
    #[default]
    Free,
    Step,
    Operation,
}

/// Admits one unit of work at a time
#[derive(Debug, Default)]
pub struct TransactionGate {
    holder: Mutex<Holder>,
    released: Condvar,
}

/// Held while a unit of work runs; releases the gate on drop
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a TransactionGate,
}

impl TransactionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter if free, otherwise return immediately
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if *holder != Holder::Free {
            return None;
        }
        *holder = Holder::Step;
        Some(GateGuard { gate: self })
    }

    /// Enter, waiting at most `timeout` for the current holder to leave
    pub fn enter_within(&self, timeout: Duration) -> Option<GateGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);

        while *holder != Holder::Free {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(holder, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            holder = guard;
        }

        *holder = Holder::Step;
        Some(GateGuard { gate: self })
    }

    /// Enter for an operation. Waits at most `timeout` behind earlier operations and
    /// returns `None` at once if a locking step holds the gate.
    pub fn enter_operation(&self, timeout: Duration) -> Option<GateGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            match *holder {
                Holder::Free => break,
                Holder::Step => return None,
                Holder::Operation => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(holder, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    holder = guard;
                }
            }
        }

        *holder = Holder::Operation;
        Some(GateGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) != Holder::Free
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.gate.holder.lock().unwrap_or_else(PoisonError::into_inner);
        *holder = Holder::Free;
        // Waiters of both kinds share the condvar
        self.gate.released.notify_all();
    }
}
