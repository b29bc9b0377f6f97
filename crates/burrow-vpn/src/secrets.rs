//! Secret storage seam.
//!
//! The orchestrator reads API keys and tunnel key material through this
//! trait so platform backends (keychain, keyring, files) can be swapped
//! in without touching connection logic.

use std::collections::HashMap;
use std::sync::Mutex;

/// Well-known secret names.
pub mod names {
    pub const PROVISIONER_API_KEY: &str = "provisioner-api-key";
    pub const COORDINATOR_API_KEY: &str = "coordinator-api-key";
    pub const TUNNEL_PRIVATE_KEY: &str = "tunnel-private-key";
    pub const PRE_AUTH_KEY: &str = "mesh-pre-auth-key";
}

pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str);
    fn delete(&self, name: &str);
}

/// In-memory store for tests and ephemeral use.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(name.to_string(), value.to_string());
        }
    }

    fn delete(&self, name: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get(names::PROVISIONER_API_KEY), None);

        store.set(names::PROVISIONER_API_KEY, "k-123");
        assert_eq!(
            store.get(names::PROVISIONER_API_KEY),
            Some("k-123".to_string())
        );

        store.delete(names::PROVISIONER_API_KEY);
        assert_eq!(store.get(names::PROVISIONER_API_KEY), None);
    }

    #[test]
    fn test_set_overwrites() {
        let store = MemorySecretStore::new();
        store.set(names::PRE_AUTH_KEY, "old");
        store.set(names::PRE_AUTH_KEY, "new");
        assert_eq!(store.get(names::PRE_AUTH_KEY), Some("new".to_string()));
    }
}
