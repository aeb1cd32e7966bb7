//! Local nonce tracking for the signing wallet on one chain
//!
//! Handles:
//! - Sequential allocation without round trips
//! - Reuse of a nonce whose transaction never left the process
//! - Resync when the node reports the local view is stale

use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Last nonce known mined
    confirmed: Option<u64>,
    /// Submitted but not yet mined: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

/// Nonce allocator for a single (wallet, chain) pair
pub struct NonceTracker {
    state: Mutex<NonceState>,
}

impl NonceTracker {
    /// Start from the on-chain transaction count
    pub fn new(on_chain_nonce: u64) -> Self {
        Self {
            state: Mutex::new(NonceState {
                current: on_chain_nonce,
                confirmed: on_chain_nonce.checked_sub(1),
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Get the next nonce
    pub async fn allocate(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {}", nonce);
        nonce
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        self.state
            .lock()
            .await
            .pending
            .insert(nonce, tx_hash.to_string());
    }

    /// Give back a nonce whose transaction was never broadcast
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be rewound
        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Mark the transaction with this hash as mined
    pub async fn confirm_hash(&self, tx_hash: &str) {
        let mut state = self.state.lock().await;
        let mined: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, hash)| hash.as_str() == tx_hash)
            .map(|(nonce, _)| *nonce)
            .collect();

        for nonce in mined {
            state.pending.remove(&nonce);
            if state.confirmed.map_or(true, |c| nonce > c) {
                state.confirmed = Some(nonce);
            }
        }
    }

    /// Sync with the on-chain transaction count
    pub async fn sync(&self, on_chain_nonce: u64) {
        let mut state = self.state.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain_nonce > expected {
            warn!(
                "Nonce gap detected: expected {}, got {}",
                expected, on_chain_nonce
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain_nonce);
        state.confirmed = on_chain_nonce.checked_sub(1);

        if state.current < on_chain_nonce {
            state.current = on_chain_nonce;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_and_release_last() {
        let tracker = NonceTracker::new(7);
        assert_eq!(tracker.allocate().await, 7);
        assert_eq!(tracker.allocate().await, 8);

        tracker.release(8).await;
        assert_eq!(tracker.allocate().await, 8);

        // Releasing an older nonce does not rewind
        tracker.release(7).await;
        assert_eq!(tracker.allocate().await, 9);
    }

    #[tokio::test]
    async fn test_sync_skips_forward_and_clears_mined() {
        let tracker = NonceTracker::new(0);
        let n0 = tracker.allocate().await;
        let n1 = tracker.allocate().await;
        tracker.mark_pending(n0, "0xaa").await;
        tracker.mark_pending(n1, "0xbb").await;

        tracker.sync(5).await;
        assert_eq!(tracker.pending_count().await, 0);
        assert_eq!(tracker.allocate().await, 5);
    }

    #[tokio::test]
    async fn test_confirm_hash_removes_pending() {
        let tracker = NonceTracker::new(3);
        let n = tracker.allocate().await;
        tracker.mark_pending(n, "0xcc").await;
        tracker.confirm_hash("0xcc").await;
        assert_eq!(tracker.pending_count().await, 0);
    }
}
