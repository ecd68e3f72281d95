//! Adaptive question sizing.
//!
//! Encrypted queries are padded to a moving target so their length says as
//! little as possible about the question while staying under UDP
//! fragmentation limits. The target only moves in whole 64-byte blocks.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cloakdns_crypto::{round_up_to_block, PAD_BLOCK_SIZE};

use crate::dns::MAX_PACKET_SIZE;

/// Starting and floor padding target for outgoing questions.
pub const MIN_QUESTION_SIZE: usize = 256;

/// Consecutive small observations before the target decays by one block.
const DECAY_AFTER: u32 = 128;

/// Concurrent-safe padding-size estimator. `adjust` follows observed
/// response sizes upward, `blind_adjust` reacts to UDP truncation, and a
/// slow decay walks the target back down after a sustained run of
/// responses at least one block below it.
#[derive(Debug)]
pub struct SizeEstimator {
    current: AtomicUsize,
    small_streak: AtomicU32,
}

impl SizeEstimator {
    pub fn new() -> Self {
        Self {
            current: AtomicUsize::new(MIN_QUESTION_SIZE),
            small_streak: AtomicU32::new(0),
        }
    }

    /// Current padding target in bytes.
    pub fn question_size(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Feed one observed response size (framing overhead included).
    pub fn adjust(&self, observed: usize) {
        let target = round_up_to_block(observed).min(MAX_PACKET_SIZE);
        let before = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (target > cur).then_some(target)
            });
        match before {
            Ok(_) => {
                // Grew; any decay run is over.
                self.small_streak.store(0, Ordering::Relaxed);
            }
            Err(cur) if observed + PAD_BLOCK_SIZE <= cur => {
                let streak = self.small_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= DECAY_AFTER {
                    self.small_streak.store(0, Ordering::Relaxed);
                    let _ = self
                        .current
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                            Some(cur.saturating_sub(PAD_BLOCK_SIZE).max(MIN_QUESTION_SIZE))
                        });
                }
            }
            Err(_) => {}
        }
    }

    /// A UDP reply came back truncated: grow one block, conservatively.
    pub fn blind_adjust(&self) {
        self.small_streak.store(0, Ordering::Relaxed);
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some((cur + PAD_BLOCK_SIZE).min(MAX_PACKET_SIZE))
            });
    }
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self::new()
    }
}
