//! Pluggable key/value persistence for optimistic state. The interface is
//! deliberately tiny so the core runs against an in-memory fake in tests and
//! against whatever the embedding application provides in production.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;

/// Scoped key/value store surviving across sessions.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Scope key for a persisted value: purpose, chain, contract, account.
/// Addresses render as lowercase hex so keys are stable regardless of how
/// the caller checksums them.
pub fn scope_key(purpose: &str, chain_id: u64, contract: Address, account: Address) -> String {
    format!("{purpose}:{chain_id}:{contract:#x}:{account:#x}")
}

/// In-memory store. The reference fake for tests, also usable when an
/// application does not want reload survival.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}
