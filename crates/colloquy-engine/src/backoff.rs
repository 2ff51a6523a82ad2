//! Per-conversation reconnection backoff.

use colloquy_types::ErrorCode;

/// Backoff state of one conversation.
///
/// The slot indexes the configured delay table. Link terminations drive
/// it: transient closes reset it, connectivity errors advance one slot,
/// hard failures jump straight to the last slot.
#[derive(Clone, Debug, Default)]
pub struct Backoff {
    slot: Option<usize>,
    /// Earliest time the next outgoing attempt may start.
    next_attempt: i64,
}

impl Backoff {
    /// Fresh state: the next attempt may start immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current slot index, when backed off.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Earliest time the next outgoing attempt may start.
    pub fn next_attempt(&self) -> i64 {
        self.next_attempt
    }

    /// Whether an outgoing attempt may start at `now`.
    pub fn ready(&self, now: i64) -> bool {
        now >= self.next_attempt
    }

    /// Clear the backoff (a link opened, or the conversation was reset).
    pub fn reset(&mut self) {
        self.slot = None;
        self.next_attempt = 0;
    }

    /// Apply a link termination reason at `now`.
    pub fn on_terminated(&mut self, reason: ErrorCode, now: i64, delays: &[i64]) {
        if delays.is_empty() {
            return;
        }
        if reason.resets_backoff() {
            self.reset();
            return;
        }
        let slot = if reason.is_fatal() {
            delays.len() - 1
        } else {
            match self.slot {
                None => 0,
                Some(slot) => (slot + 1).min(delays.len() - 1),
            }
        };
        self.slot = Some(slot);
        self.next_attempt = now + delays[slot];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::BACKOFF_DELAYS_MS;

    #[test]
    fn test_fresh_backoff_is_ready() {
        let backoff = Backoff::new();
        assert!(backoff.ready(0));
        assert_eq!(backoff.slot(), None);
    }

    #[test]
    fn test_connectivity_errors_walk_the_table() {
        let mut backoff = Backoff::new();
        for (round, delay) in BACKOFF_DELAYS_MS.iter().enumerate() {
            backoff.on_terminated(ErrorCode::ConnectivityError, 1_000, &BACKOFF_DELAYS_MS);
            assert_eq!(backoff.slot(), Some(round));
            assert_eq!(backoff.next_attempt(), 1_000 + delay);
            assert!(!backoff.ready(1_000));
            assert!(backoff.ready(1_000 + delay));
        }
        // Saturates at the last slot.
        backoff.on_terminated(ErrorCode::ConnectivityError, 1_000, &BACKOFF_DELAYS_MS);
        assert_eq!(backoff.slot(), Some(BACKOFF_DELAYS_MS.len() - 1));
    }

    #[test]
    fn test_five_connectivity_errors_reach_32_minutes() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.on_terminated(ErrorCode::ConnectivityError, 0, &BACKOFF_DELAYS_MS);
        }
        assert!(backoff.next_attempt() >= 32 * 60_000);
    }

    #[test]
    fn test_hard_error_jumps_to_last_slot() {
        let mut backoff = Backoff::new();
        backoff.on_terminated(ErrorCode::Gone, 500, &BACKOFF_DELAYS_MS);
        assert_eq!(backoff.slot(), Some(BACKOFF_DELAYS_MS.len() - 1));
        assert_eq!(
            backoff.next_attempt(),
            500 + BACKOFF_DELAYS_MS[BACKOFF_DELAYS_MS.len() - 1]
        );
    }

    #[test]
    fn test_transient_close_resets() {
        let mut backoff = Backoff::new();
        backoff.on_terminated(ErrorCode::ConnectivityError, 0, &BACKOFF_DELAYS_MS);
        backoff.on_terminated(ErrorCode::Busy, 1_000, &BACKOFF_DELAYS_MS);
        assert_eq!(backoff.slot(), None);
        assert!(backoff.ready(1_000));

        backoff.on_terminated(ErrorCode::ConnectivityError, 0, &BACKOFF_DELAYS_MS);
        backoff.on_terminated(ErrorCode::Success, 1_000, &BACKOFF_DELAYS_MS);
        assert!(backoff.ready(1_000));
    }
}
