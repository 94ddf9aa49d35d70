//! One-shot rendezvous between a submitter and the producer loop.
//!
//! Mirrors the "latch" idiom the design notes call for: a condition
//! variable guarding a flag, never reused across cycles. Each update that
//! needs to signal completion (`Start`, `DumpKeys`, `CloseConnections`,
//! `StopSelector`) is built with a fresh pair.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    lock: Mutex<bool>,
    cond: Condvar,
}

/// The write half of a latch; held by the update that must report
/// completion back to whoever submitted it.
#[derive(Clone)]
pub struct LatchSignal {
    inner: Arc<Inner>,
}

/// The read half of a latch; held by the submitter.
#[derive(Clone)]
pub struct LatchWaiter {
    inner: Arc<Inner>,
}

pub fn latch() -> (LatchSignal, LatchWaiter) {
    let inner = Arc::new(Inner {
        lock: Mutex::new(false),
        cond: Condvar::new(),
    });
    (
        LatchSignal {
            inner: inner.clone(),
        },
        LatchWaiter { inner },
    )
}

impl LatchSignal {
    pub fn signal(self) {
        let mut done = self.inner.lock.lock().unwrap();
        *done = true;
        self.inner.cond.notify_all();
    }
}

impl LatchWaiter {
    /// Blocks until `signal` is called, however long that takes (spec §5:
    /// shutdown latches are bounded only by the multiplexer's ability to
    /// make progress; the caller supplies an outer timeout if it wants one).
    pub fn wait(&self) {
        let mut done = self.inner.lock.lock().unwrap();
        while !*done {
            done = self.inner.cond.wait(done).unwrap();
        }
    }

    /// Blocks until `signal` is called or `timeout` elapses, returning
    /// whether the latch was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.lock.lock().unwrap();
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self.inner.cond.wait_timeout(done, remaining).unwrap();
            done = guard;
        }
        true
    }
}
