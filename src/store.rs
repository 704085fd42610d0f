//! Persistence boundary.
//!
//! The engine persists a channel snapshot exactly once per completed protocol
//! step, never mid-step. The backend only needs get/set by namespaced string
//! key with read-your-writes consistency per key; no cross-key transactions
//! are assumed (on-chain atomicity comes from the multi-send commitment
//! pattern instead).

use std::collections::BTreeMap;

use crate::abiencode::types::Address;

pub trait Store: core::fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
}

/// `<prefix>/channel/<multisigAddress>`
pub fn channel_key(prefix: &str, multisig_address: Address) -> String {
    format!("{prefix}/channel/{multisig_address:?}")
}

/// `<prefix>/channels`, the index listing every persisted channel address.
pub fn index_key(prefix: &str) -> String {
    format!("{prefix}/channels")
}

/// In-memory store used by the tests and as reference behavior for real
/// backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }
}
