//! Idle debounce as an explicit state machine
//!
//! `Settled` → `arm` → `PendingIdle{generation}` → either `cancel` (new work
//! arrived) or `fire(generation)` once the window has elapsed. Each arm gets a
//! fresh generation, so a timer callback that raced with a cancel-and-rearm
//! presents a stale generation and is ignored.

use tokio::time::Instant;

/// Debounce state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Settled,
    PendingIdle { armed_at: Instant, generation: u64 },
}

/// Idle debounce tracker
#[derive(Debug)]
pub struct IdleDebounce {
    state: DebounceState,
    next_generation: u64,
}

impl Default for IdleDebounce {
    fn default() -> Self {
        Self {
            state: DebounceState::Settled,
            next_generation: 1,
        }
    }
}

impl IdleDebounce {
    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::PendingIdle { .. })
    }

    /// Start (or restart) the window; returns the generation the timer must present
    pub fn arm(&mut self, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.state = DebounceState::PendingIdle {
            armed_at: now,
            generation,
        };
        generation
    }

    /// Abandon a pending window; returns whether one was pending
    pub fn cancel(&mut self) -> bool {
        let was_pending = self.is_pending();
        self.state = DebounceState::Settled;
        was_pending
    }

    /// Complete the window for `generation`
    ///
    /// Returns the arm instant when `generation` is the one pending, and
    /// settles; a stale or cancelled generation returns `None` and changes
    /// nothing.
    pub fn fire(&mut self, generation: u64) -> Option<Instant> {
        match self.state {
            DebounceState::PendingIdle {
                armed_at,
                generation: pending,
            } if pending == generation => {
                self.state = DebounceState::Settled;
                Some(armed_at)
            }
            _ => None,
        }
    }
}
