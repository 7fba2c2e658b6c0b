//! Cooperative cancellation for transfers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-use, broadcast-once cancellation signal.
///
/// Every stage of the transfer pipeline polls the token between
/// chunks; a stage mid-chunk completes that chunk before honoring the
/// signal. Cancellation is "stop sending more", not "undo what was
/// sent" - there is no way to reset a fired token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, unfired token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. All clones observe it on their next poll.
    pub fn cancel(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    /// Poll the signal without blocking.
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unfired() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn broadcast_to_clones() {
        let token = CancelToken::new();
        let observer = token.clone();

        token.cancel();
        assert!(observer.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn observed_across_threads() {
        let token = CancelToken::new();
        let remote = token.clone();

        let handle = std::thread::spawn(move || {
            remote.cancel();
        });
        handle.join().unwrap();

        assert!(token.is_cancelled());
    }
}
