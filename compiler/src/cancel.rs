// cancel.rs — Cooperative cancellation for compilation stages
//
// Every stage checks the token at entry and inside per-node loops, so a
// cancelled compile returns promptly without producing a partial allocation.
//
// Preconditions: none.
// Postconditions: `check()` returns `Err(Cancelled)` once `cancel()` ran.
// Failure modes: none.
// Side effects: none beyond the shared flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marker returned when a stage observes cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Cheap clonable cancellation handle shared between a compile task and its
/// initiator.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Stage-side check: `token.check()?` at stage entry and loop steps.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        let t = CancellationToken::new();
        assert!(t.check().is_ok());
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let t = CancellationToken::new();
        let c = t.clone();
        t.cancel();
        assert_eq!(c.check(), Err(Cancelled));
        assert!(c.is_cancelled());
    }
}
