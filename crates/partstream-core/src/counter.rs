//! Completion counting.
//!
//! Each session counts pieces in (`inc`, on arrival) and out (`dec`, once the
//! ledger consumed them). A session is done when nothing counted is
//! outstanding *and* the stream is no longer blocked, i.e. the closing
//! delimiter was confirmed or the connection went away.

use serde::Serialize;

/// Position of a decrement within the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Order {
    /// Nothing was outstanding; the counter did not move.
    Unordered,
    /// The first consumed piece of the session.
    First,
    /// Neither first nor last.
    Intermediate,
    /// The last consumed piece; the session can be purged.
    Last,
    /// First and last at once (single-piece upload).
    FirstAndLast,
}

impl Order {
    /// Returns true if this decrement exhausted the counter.
    #[must_use]
    pub fn is_last(self) -> bool {
        matches!(self, Self::Last | Self::FirstAndLast)
    }
}

/// Outstanding piece accounting for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionCounter {
    max: u64,
    cur: u64,
    started: bool,
    blocked: bool,
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCounter {
    /// A fresh, blocked counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max: 0,
            cur: 0,
            started: false,
            blocked: true,
        }
    }

    /// Total pieces ever counted in.
    #[must_use]
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Pieces counted in but not yet consumed.
    #[must_use]
    pub fn cur(&self) -> u64 {
        self.cur
    }

    /// Returns true once any piece was consumed.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns true while more pieces may arrive.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Returns true when the session can be purged.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cur == 0 && !self.blocked
    }

    /// Count `n` arriving pieces.
    pub fn inc(&mut self, n: u64) {
        self.max = self.max.saturating_add(n);
        self.cur = self.cur.saturating_add(n);
    }

    /// Count one consumed piece.
    pub fn dec(&mut self) -> Order {
        if self.cur == 0 {
            return Order::Unordered;
        }
        self.cur -= 1;
        let first = !self.started;
        self.started = true;
        match (first, self.is_exhausted()) {
            (true, true) => Order::FirstAndLast,
            (true, false) => Order::First,
            (false, true) => Order::Last,
            (false, false) => Order::Intermediate,
        }
    }

    /// Mark the stream as ended.
    pub fn unblock(&mut self) {
        self.blocked = false;
    }
}
