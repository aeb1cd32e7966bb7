#![allow(dead_code)]

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

use zeropoint_mediator::chain::{AdapterRegistry, CustomAdapter, SimulatedLedger};
use zeropoint_mediator::config::{AuthConfig, CoordinatorConfig, MediatorConfig};
use zeropoint_mediator::coordination::{
    ChainBindings, ChainSource, OperationRequest, TransactionCoordinator,
};
use zeropoint_mediator::ledger::AssetLedger;
use zeropoint_mediator::mediator::{Mediator, StaticRateSource};
use zeropoint_mediator::session::{AuthToken, Authorizer};
use zeropoint_mediator::state::{MemoryStore, Store};
use zeropoint_mediator::types::{AccountId, Asset, ChainId, TxKind};

pub const PIN: &str = "4821";

/// Two simulated custom chains, static rates, in-memory store
pub struct Harness {
    pub ledger: Arc<AssetLedger>,
    pub rates: Arc<StaticRateSource>,
    pub adapters: Arc<AdapterRegistry>,
    pub bindings: Arc<ChainBindings>,
    pub authorizer: Arc<Authorizer>,
    pub store: Arc<dyn Store>,
    pub zeropoint: Arc<SimulatedLedger>,
    pub pi: Arc<SimulatedLedger>,
    pub coordinator: Arc<TransactionCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let zeropoint = Arc::new(SimulatedLedger::new(ChainId::Zeropoint));
        let pi = Arc::new(SimulatedLedger::new(ChainId::PiNetwork));
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(Arc::new(CustomAdapter::new(
            ChainId::Zeropoint,
            zeropoint.clone(),
            10,
        )));
        adapters.register(Arc::new(CustomAdapter::new(ChainId::PiNetwork, pi.clone(), 100)));

        let rates = Arc::new(StaticRateSource::new());
        rates.set_rate(
            Asset::Zpe,
            ChainId::Zeropoint,
            ChainId::PiNetwork,
            Decimal::from_str("0.98").unwrap(),
        );

        let authorizer = Arc::new(Authorizer::new(&AuthConfig::default()));
        let bindings = Arc::new(ChainBindings::new());
        let ledger = Arc::new(AssetLedger::new());

        let coordinator = Self::coordinator_over(
            ledger.clone(),
            rates.clone(),
            adapters.clone(),
            bindings.clone(),
            authorizer.clone(),
            store.clone(),
        );

        Self {
            ledger,
            rates,
            adapters,
            bindings,
            authorizer,
            store,
            zeropoint,
            pi,
            coordinator,
        }
    }

    /// A fresh process over the same chains and store: empty ledger and
    /// quote book, nothing in flight.
    pub fn restarted(&self) -> Self {
        let ledger = Arc::new(AssetLedger::new());
        let coordinator = Self::coordinator_over(
            ledger.clone(),
            self.rates.clone(),
            self.adapters.clone(),
            self.bindings.clone(),
            self.authorizer.clone(),
            self.store.clone(),
        );

        Self {
            ledger,
            rates: self.rates.clone(),
            adapters: self.adapters.clone(),
            bindings: self.bindings.clone(),
            authorizer: self.authorizer.clone(),
            store: self.store.clone(),
            zeropoint: self.zeropoint.clone(),
            pi: self.pi.clone(),
            coordinator,
        }
    }

    fn coordinator_over(
        ledger: Arc<AssetLedger>,
        rates: Arc<StaticRateSource>,
        adapters: Arc<AdapterRegistry>,
        bindings: Arc<ChainBindings>,
        authorizer: Arc<Authorizer>,
        store: Arc<dyn Store>,
    ) -> Arc<TransactionCoordinator> {
        let mediator_config = MediatorConfig::default();
        let mediator = Arc::new(Mediator::new(rates, &mediator_config));

        Arc::new(TransactionCoordinator::new(
            ledger,
            mediator,
            adapters,
            bindings,
            authorizer,
            store,
            CoordinatorConfig::default(),
        ))
    }

    pub async fn fund(&self, account: &str, asset: Asset, amount: i64) {
        self.coordinator
            .credit(&AccountId::new(account), asset, amount)
            .await
            .unwrap();
    }

    pub fn login(&self, account: &str) -> AuthToken {
        let account = AccountId::new(account);
        if !self.authorizer.has_pin(&account) {
            self.authorizer.set_pin(&account, PIN).unwrap();
        }
        let session = self.authorizer.open_session(&account);
        self.authorizer.authorize(session, PIN).unwrap()
    }

    /// Total, available, pending out, pending in
    pub async fn balance(&self, account: &str, asset: Asset) -> (i64, i64, i64, i64) {
        let b = self.ledger.balance(&AccountId::new(account), asset).await;
        assert!(b.pending_out >= 0 && b.pending_in >= 0);
        assert!(b.pending_out <= b.total, "pending out exceeds total: {:?}", b);
        assert_eq!(b.available() + b.pending_out, b.total);
        (b.total, b.available(), b.pending_out, b.pending_in)
    }
}

pub fn request(kind: TxKind, account: &str, chain: ChainId, amount: i64) -> OperationRequest {
    OperationRequest {
        kind,
        account: AccountId::new(account),
        source: ChainSource::Chain(chain),
        dest_chain: None,
        recipient: None,
        asset: Asset::Zpe,
        amount,
    }
}
