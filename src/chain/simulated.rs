//! In-process ledger for custom chains without a live SDK
//!
//! Entries finalize after a configurable number of polls. Availability,
//! outcome and transient post failures can be switched at runtime.

use super::custom::{CustomChainClient, EntryState, LedgerEntry};
use crate::error::{MediatorError, MediatorResult};
use crate::types::ChainId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::debug;

/// What happens to entries posted from now on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedOutcome {
    Finalize,
    Reject,
    /// Never leaves the queue
    Stall,
}

impl SimulatedOutcome {
    fn to_u8(self) -> u8 {
        match self {
            SimulatedOutcome::Finalize => 0,
            SimulatedOutcome::Reject => 1,
            SimulatedOutcome::Stall => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SimulatedOutcome::Reject,
            2 => SimulatedOutcome::Stall,
            _ => SimulatedOutcome::Finalize,
        }
    }
}

struct SimulatedEntry {
    entry: LedgerEntry,
    outcome: SimulatedOutcome,
    polls_remaining: u32,
}

pub struct SimulatedLedger {
    chain: ChainId,
    available: AtomicBool,
    outcome: AtomicU8,
    polls_to_finality: AtomicU32,
    failing_posts: AtomicU32,
    post_delay_ms: AtomicU64,
    sequence: AtomicU64,
    entries: DashMap<String, SimulatedEntry>,
}

impl SimulatedLedger {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            available: AtomicBool::new(true),
            outcome: AtomicU8::new(SimulatedOutcome::Finalize.to_u8()),
            polls_to_finality: AtomicU32::new(1),
            failing_posts: AtomicU32::new(0),
            post_delay_ms: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            entries: DashMap::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_outcome(&self, outcome: SimulatedOutcome) {
        self.outcome.store(outcome.to_u8(), Ordering::SeqCst);
    }

    /// Polls an entry spends queued before reaching its outcome
    pub fn set_polls_to_finality(&self, polls: u32) {
        self.polls_to_finality.store(polls.max(1), Ordering::SeqCst);
    }

    /// Make the next `count` posts fail as unavailable
    pub fn fail_next_posts(&self, count: u32) {
        self.failing_posts.store(count, Ordering::SeqCst);
    }

    /// Delay every post, for exercising caller timeouts
    pub fn set_post_delay(&self, delay: Duration) {
        self.post_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Entries posted so far, in no particular order
    pub fn posted(&self) -> Vec<LedgerEntry> {
        self.entries.iter().map(|e| e.value().entry.clone()).collect()
    }

    fn unavailable(&self) -> MediatorError {
        MediatorError::AdapterUnavailable {
            chain: self.chain,
            message: "simulated ledger offline".to_string(),
        }
    }

    fn take_failure(&self) -> bool {
        self.failing_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CustomChainClient for SimulatedLedger {
    async fn post_entry(&self, entry: LedgerEntry) -> MediatorResult<String> {
        let delay = self.post_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.available.load(Ordering::SeqCst) || self.take_failure() {
            return Err(self.unavailable());
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", self.chain.name(), seq);
        debug!("Simulated {} accepted entry {} for {}", self.chain, id, entry.tx_id);

        self.entries.insert(
            id.clone(),
            SimulatedEntry {
                entry,
                outcome: SimulatedOutcome::from_u8(self.outcome.load(Ordering::SeqCst)),
                polls_remaining: self.polls_to_finality.load(Ordering::SeqCst),
            },
        );
        Ok(id)
    }

    async fn entry_state(&self, entry_id: &str) -> MediatorResult<EntryState> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }

        let Some(mut entry) = self.entries.get_mut(entry_id) else {
            return Ok(EntryState::Unknown);
        };

        entry.polls_remaining = entry.polls_remaining.saturating_sub(1);
        if entry.polls_remaining > 0 {
            return Ok(EntryState::Queued);
        }

        Ok(match entry.outcome {
            SimulatedOutcome::Finalize => EntryState::Final,
            SimulatedOutcome::Reject => EntryState::Rejected("rejected by ledger".to_string()),
            SimulatedOutcome::Stall => EntryState::Queued,
        })
    }

    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
