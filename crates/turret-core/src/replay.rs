//! Sliding anti-replay window.
//!
//! Accepts an envelope only when its timestamp is within the tolerance of
//! the gate's wall clock and its `(principal, nonce)` pair has not been
//! seen inside the window. Entries age out lazily on insert. The window is
//! purely in-memory and is constructed fresh at each engage.

use std::collections::{HashMap, VecDeque};

/// Timestamp tolerance and nonce retention, in milliseconds.
pub const REPLAY_WINDOW_MS: u64 = 120_000;

/// Hard cap on retained `(principal, nonce)` entries.
///
/// The window is a bounded in-memory store; hitting the cap after the lazy
/// sweep rejects the offending request rather than growing without limit.
pub const MAX_REPLAY_ENTRIES: usize = 65_536;

/// Replay-window rejections.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Timestamp skew exceeded the window.
    #[error("timestamp skew {skew_ms} ms exceeds window of {window_ms} ms")]
    SkewExceeded {
        /// Absolute difference between gate clock and envelope timestamp.
        skew_ms: u64,
        /// Configured window.
        window_ms: u64,
    },

    /// The `(principal, nonce)` pair was already seen inside the window.
    #[error("replayed nonce")]
    Duplicate,

    /// The window is at capacity even after sweeping.
    #[error("replay window at capacity ({max} entries)")]
    CapacityExceeded {
        /// Configured entry cap.
        max: usize,
    },
}

type ReplayKey = (Vec<u8>, Vec<u8>);

/// Sliding `(principal, nonce)` dedup window.
#[derive(Debug)]
pub struct ReplayWindow {
    window_ms: u64,
    max_entries: usize,
    seen: HashMap<ReplayKey, u64>,
    /// Insertion order for eviction: (recorded_at_ms, key).
    queue: VecDeque<(u64, ReplayKey)>,
}

impl ReplayWindow {
    /// Creates a window with the given tolerance and entry cap.
    #[must_use]
    pub fn new(window_ms: u64, max_entries: usize) -> Self {
        Self {
            window_ms,
            max_entries,
            seen: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the window holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Checks an envelope against the window and records its nonce.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::SkewExceeded`] when `|now_ms - ts_ms|` exceeds the
    ///   window
    /// - [`ReplayError::Duplicate`] when the pair was already recorded
    /// - [`ReplayError::CapacityExceeded`] when the store is full after the
    ///   sweep
    pub fn check_and_record(
        &mut self,
        now_ms: u64,
        ts_ms: u64,
        principal: &[u8],
        nonce: &[u8],
    ) -> Result<(), ReplayError> {
        let skew_ms = now_ms.abs_diff(ts_ms);
        if skew_ms > self.window_ms {
            return Err(ReplayError::SkewExceeded {
                skew_ms,
                window_ms: self.window_ms,
            });
        }

        self.sweep(now_ms);

        let key = (principal.to_vec(), nonce.to_vec());
        if self.seen.contains_key(&key) {
            return Err(ReplayError::Duplicate);
        }
        if self.seen.len() >= self.max_entries {
            return Err(ReplayError::CapacityExceeded {
                max: self.max_entries,
            });
        }

        self.seen.insert(key.clone(), now_ms);
        self.queue.push_back((now_ms, key));
        Ok(())
    }

    /// Drops entries recorded more than one window ago.
    fn sweep(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some((recorded_at, _)) = self.queue.front() {
            if *recorded_at >= cutoff {
                break;
            }
            let (_, key) = self.queue.pop_front().expect("front checked above");
            self.seen.remove(&key);
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW_MS, MAX_REPLAY_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn accepts_fresh_nonce() {
        let mut window = ReplayWindow::default();
        window.check_and_record(T0, T0, b"corvus", b"n1").unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn rejects_duplicate_nonce_within_window() {
        let mut window = ReplayWindow::default();
        window.check_and_record(T0, T0, b"corvus", b"n1").unwrap();
        assert!(matches!(
            window.check_and_record(T0 + 5_000, T0 + 5_000, b"corvus", b"n1"),
            Err(ReplayError::Duplicate)
        ));
    }

    #[test]
    fn same_nonce_different_principal_is_fresh() {
        let mut window = ReplayWindow::default();
        window.check_and_record(T0, T0, b"corvus", b"n1").unwrap();
        window.check_and_record(T0, T0, b"pica", b"n1").unwrap();
    }

    #[test]
    fn rejects_skew_in_both_directions() {
        let mut window = ReplayWindow::default();
        assert!(matches!(
            window.check_and_record(T0, T0 + REPLAY_WINDOW_MS + 1, b"a", b"n"),
            Err(ReplayError::SkewExceeded { .. })
        ));
        assert!(matches!(
            window.check_and_record(T0, T0 - REPLAY_WINDOW_MS - 1, b"a", b"n"),
            Err(ReplayError::SkewExceeded { .. })
        ));
        // Exactly at the boundary is accepted.
        window
            .check_and_record(T0, T0 - REPLAY_WINDOW_MS, b"a", b"n")
            .unwrap();
    }

    #[test]
    fn sweep_frees_expired_entries() {
        let mut window = ReplayWindow::new(REPLAY_WINDOW_MS, 2);
        window.check_and_record(T0, T0, b"a", b"n1").unwrap();
        window.check_and_record(T0, T0, b"a", b"n2").unwrap();
        assert!(matches!(
            window.check_and_record(T0 + 1, T0 + 1, b"a", b"n3"),
            Err(ReplayError::CapacityExceeded { max: 2 })
        ));

        // One window later the old entries are swept and capacity returns.
        let later = T0 + REPLAY_WINDOW_MS + 1;
        window.check_and_record(later, later, b"a", b"n3").unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn nonce_is_reusable_after_expiry() {
        let mut window = ReplayWindow::default();
        window.check_and_record(T0, T0, b"a", b"n1").unwrap();
        let later = T0 + REPLAY_WINDOW_MS + 1;
        window.check_and_record(later, later, b"a", b"n1").unwrap();
    }

    // ========================================================================
    // Proptest Fuzz Tests
    // ========================================================================

    mod fuzz {
        use proptest::collection::vec;
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// Property: within the window the second occurrence of a pair
            /// is rejected; outside it, the skew check fires.
            #[test]
            fn prop_second_occurrence_rejected(
                principal in vec(any::<u8>(), 1..16),
                nonce in vec(any::<u8>(), 1..16),
                delay in 0u64..300_000,
            ) {
                let mut window = ReplayWindow::default();
                window.check_and_record(T0, T0, &principal, &nonce).unwrap();

                let now = T0 + delay;
                let result = window.check_and_record(now, T0, &principal, &nonce);
                if delay <= REPLAY_WINDOW_MS {
                    prop_assert!(matches!(result, Err(ReplayError::Duplicate)));
                } else {
                    let is_skew_exceeded = matches!(result, Err(ReplayError::SkewExceeded { .. }));
                    prop_assert!(is_skew_exceeded);
                }
            }

            /// Property: the store never exceeds its cap.
            #[test]
            fn prop_bounded_cardinality(nonces in vec(vec(any::<u8>(), 1..8), 1..64)) {
                let mut window = ReplayWindow::new(REPLAY_WINDOW_MS, 16);
                for nonce in &nonces {
                    let _ = window.check_and_record(T0, T0, b"a", nonce);
                    prop_assert!(window.len() <= 16);
                }
            }
        }
    }
}
