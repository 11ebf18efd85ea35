use crate::error::StoreError;
use crate::store::{StateStore, read_state};
use std::collections::BTreeSet;

/// Registers the device has refused; excluded from every future batch.
///
/// Each mutation bumps `generation` so planners can tell when a cached plan is stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedRegisterCache {
    addresses: BTreeSet<u16>,
    generation: u64,
}

impl FailedRegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the address was not already marked.
    pub fn insert(&mut self, address: u16) -> bool {
        let inserted = self.addresses.insert(address);
        if inserted {
            self.generation += 1;
            tracing::warn!("Register {:04X}h marked unsupported", address);
        }
        inserted
    }

    pub fn contains(&self, address: u16) -> bool {
        self.addresses.contains(&address)
    }

    pub fn clear(&mut self) {
        if !self.addresses.is_empty() {
            tracing::info!("Clearing {} failed registers", self.addresses.len());
            self.addresses.clear();
            self.generation += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.addresses.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn to_set(&self) -> BTreeSet<u16> {
        self.addresses.clone()
    }
}

impl FromIterator<u16> for FailedRegisterCache {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
            generation: 0,
        }
    }
}

pub fn load(store: &dyn StateStore) -> FailedRegisterCache {
    read_state(store).failed_registers.into_iter().collect()
}

pub fn save(store: &dyn StateStore, cache: &FailedRegisterCache) -> Result<(), StoreError> {
    let mut state = read_state(store);
    state.failed_registers = cache.to_set();
    store.write(&state)
}
