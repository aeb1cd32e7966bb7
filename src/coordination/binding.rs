//! Device to chain bindings
//!
//! A device has at most one active chain. Switching replaces the binding
//! in a single step under the registry lock: either the new chain is
//! bound, or the switch fails and the old binding stays.

use crate::chain::AdapterRegistry;
use crate::error::{MediatorError, MediatorResult};
use crate::types::{ChainId, DeviceId};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// External source of the active chain per device
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn active_chain(&self, device: &DeviceId) -> Option<ChainId>;
}

/// In-memory binding table
#[derive(Default)]
pub struct ChainBindings {
    bindings: RwLock<HashMap<DeviceId, ChainId>>,
}

impl ChainBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a device to a chain, returning the previous binding
    pub async fn switch(
        &self,
        device: &DeviceId,
        chain: ChainId,
        adapters: &AdapterRegistry,
    ) -> MediatorResult<Option<ChainId>> {
        let mut bindings = self.bindings.write().await;

        if !adapters.contains(chain) {
            return Err(MediatorError::AdapterUnavailable {
                chain,
                message: format!("cannot bind {} to a chain without an adapter", device),
            });
        }

        let previous = bindings.insert(device.clone(), chain);
        info!(
            "Device {} switched from {:?} to {}",
            device, previous, chain
        );
        Ok(previous)
    }

    pub async fn unbind(&self, device: &DeviceId) -> Option<ChainId> {
        self.bindings.write().await.remove(device)
    }
}

#[async_trait]
impl DeviceRegistry for ChainBindings {
    async fn active_chain(&self, device: &DeviceId) -> Option<ChainId> {
        self.bindings.read().await.get(device).copied()
    }
}
