//! Per chain health counters.
//!
//! A single [`NetworkStats`] is created at start-up and handed to every component that reports
//! into it. Readers take a [`NetworkStats::snapshot`] rather than holding the lock.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use guardian_vaa::Chain;
use serde::Serialize;

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainStats {
    /// Last block height the watcher fully processed.
    pub height: u64,
    pub contract_address: String,
    pub error_count: u64,
    /// Observations emitted by the watcher.
    pub messages_observed: u64,
    /// VAAs finalized for messages emitted on this chain.
    pub messages_confirmed: u64,
    /// Set once the watcher has caught up with the chain head.
    pub ready: bool,
}

#[derive(Debug, Default)]
pub struct NetworkStats {
    chains: RwLock<BTreeMap<Chain, ChainStats>>,
}

impl NetworkStats {
    pub fn new() -> NetworkStats {
        NetworkStats::default()
    }

    fn update<F: FnOnce(&mut ChainStats)>(&self, chain: Chain, f: F) {
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        f(chains.entry(chain).or_default());
    }

    pub fn set_contract(&self, chain: Chain, contract: &str) {
        self.update(chain, |s| s.contract_address = contract.to_owned());
    }

    pub fn set_height(&self, chain: Chain, height: u64) {
        self.update(chain, |s| s.height = height);
    }

    pub fn add_error_count(&self, chain: Chain, n: u64) {
        self.update(chain, |s| s.error_count += n);
    }

    pub fn add_observed(&self, chain: Chain, n: u64) {
        self.update(chain, |s| s.messages_observed += n);
    }

    pub fn inc_confirmed(&self, chain: Chain) {
        self.update(chain, |s| s.messages_confirmed += 1);
    }

    pub fn set_ready(&self, chain: Chain, ready: bool) {
        self.update(chain, |s| s.ready = ready);
    }

    pub fn get(&self, chain: Chain) -> Option<ChainStats> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Chain, ChainStats> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
