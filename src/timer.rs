use std::time::{Duration, Instant};

/// State reported by [`DtlsTimer::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No timer armed.
    Cancelled,
    /// Armed, neither delay passed.
    Running,
    /// The intermediate delay passed. The engine should retransmit.
    IntermediateExpired,
    /// The final delay passed. The engine should give up.
    Expired,
}

/// The set-delay / get-delay timer pair the engine uses to detect DTLS
/// handshake retransmission timeouts.
///
/// Delays are measured from the wall-clock snapshot taken when the timer is
/// armed.
#[derive(Debug)]
pub struct DtlsTimer {
    intermediate: Duration,
    fin: Duration,
    snapshot: Instant,
}

impl Default for DtlsTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DtlsTimer {
    pub fn new() -> Self {
        Self {
            intermediate: Duration::ZERO,
            fin: Duration::ZERO,
            snapshot: Instant::now(),
        }
    }

    /// Arm the timer. A zero `fin` cancels it.
    pub fn set(&mut self, intermediate: Duration, fin: Duration) {
        self.intermediate = intermediate;
        self.fin = fin;

        if !fin.is_zero() {
            self.snapshot = Instant::now();
        }
    }

    pub fn cancel(&mut self) {
        self.set(Duration::ZERO, Duration::ZERO);
    }

    pub fn state(&self) -> TimerState {
        if self.fin.is_zero() {
            return TimerState::Cancelled;
        }

        let elapsed = self.snapshot.elapsed();

        if elapsed >= self.fin {
            TimerState::Expired
        } else if elapsed >= self.intermediate {
            TimerState::IntermediateExpired
        } else {
            TimerState::Running
        }
    }

    /// Time left until the final delay. `None` when cancelled.
    pub fn remaining(&self) -> Option<Duration> {
        if self.fin.is_zero() {
            return None;
        }

        Some(self.fin.saturating_sub(self.snapshot.elapsed()))
    }
}
