//! Transaction lifecycle events
//!
//! Every status change of a transaction is published on a broadcast
//! channel. Subscribers that fall behind lose the oldest events.

use crate::coordination::{Transaction, TransactionStatus};
use crate::error::FailureReason;
use crate::types::{AccountId, ChainId, TransactionId, TxKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub tx_id: TransactionId,
    pub kind: TxKind,
    pub account: AccountId,
    pub dest_chain: ChainId,
    pub status: TransactionStatus,
    pub reason: Option<FailureReason>,
    pub at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.id,
            kind: tx.kind,
            account: tx.account.clone(),
            dest_chain: tx.dest_chain,
            status: tx.status,
            reason: tx.failure_reason(),
            at: tx.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransactionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, tx: &Transaction) {
        let event = TransactionEvent::from_transaction(tx);
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("No subscribers for event on {}", tx.id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
