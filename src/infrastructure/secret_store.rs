//! Credential secret access.
//!
//! Secret storage and encryption are owned by the host application; the sync
//! engine only resolves an API key id to its secret through this seam.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, api_key_id: &str) -> Result<Option<String>>;
}

/// Process-local secret store, useful for tests and single-shot CLI runs
/// where the host hands secrets in directly.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, api_key_id: &str, secret: &str) {
        self.secrets
            .write()
            .await
            .insert(api_key_id.to_string(), secret.to_string());
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, api_key_id: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().await.get(api_key_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_secret_is_none_not_error() {
        let store = InMemorySecretStore::new();
        assert!(store.get_secret("nope").await.unwrap().is_none());

        store.insert("k1", "SECRET").await;
        assert_eq!(store.get_secret("k1").await.unwrap().as_deref(), Some("SECRET"));
    }
}
