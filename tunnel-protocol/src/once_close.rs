//! Single-shot close primitive (spec §4.4 step 5, §5 "Cancellation & timeouts").
//!
//! The Go original guards its `Close` methods with `sync.Once`; `sync::Once`
//! in std can't be driven from async code without blocking a worker thread,
//! so this is a lock-free `AtomicBool` instead. Whichever caller flips it
//! from false to true is the one responsible for actually closing the
//! sockets and cancelling the session.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct OnceClose {
    closed: AtomicBool,
}

impl OnceClose {
    pub fn new() -> Self {
        OnceClose {
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` exactly once, for the first caller. Every later caller
    /// (including concurrent ones) gets `false`.
    pub fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_close_wins() {
        let once = OnceClose::new();
        assert!(once.close());
        assert!(!once.close());
        assert!(!once.close());
        assert!(once.is_closed());
    }
}
