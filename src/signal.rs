use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A binary signal that threads and pollers can wait on.
///
/// Used as the "established" signal of a context: raised once when a
/// handshake completes, cleared when the context is reset.
#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake all waiters.
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until raised. `None` waits forever.
    ///
    /// Returns whether the signal was raised before the timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);

        while !*raised {
            match deadline {
                None => {
                    raised = self.cond.wait(raised).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    raised = self
                        .cond
                        .wait_timeout(raised, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        true
    }
}
