//! In-memory credential and settings stores.
//!
//! Used by tests and by hosts that do not need persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collaborators::{CredentialStore, SettingsStore};
use crate::errors::StoreError;
use crate::types::{ConnectionParams, DeviceIdentity, PinnedCertificate};

#[derive(Default)]
struct CredentialState {
    identity: Option<DeviceIdentity>,
    certs: HashMap<String, PinnedCertificate>,
}

/// In-memory implementation of [`CredentialStore`].
#[derive(Default, Clone)]
pub struct InMemoryCredentialStore {
    inner: Arc<RwLock<CredentialState>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of pinned certificates.
    pub async fn certificate_count(&self) -> usize {
        self.inner.read().await.certs.len()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn device_identity(&self) -> Result<DeviceIdentity, StoreError> {
        let mut state = self.inner.write().await;
        if let Some(identity) = &state.identity {
            return Ok(identity.clone());
        }
        let identity = DeviceIdentity::generate()
            .map_err(|e| StoreError::OperationFailed(format!("identity generation: {e}")))?;
        state.identity = Some(identity.clone());
        Ok(identity)
    }

    async fn certificate(&self, host: &str) -> Result<Option<PinnedCertificate>, StoreError> {
        Ok(self.inner.read().await.certs.get(host).cloned())
    }

    async fn put_certificate(
        &self,
        host: &str,
        cert: PinnedCertificate,
    ) -> Result<(), StoreError> {
        self.inner.write().await.certs.insert(host.to_string(), cert);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        state.identity = None;
        state.certs.clear();
        Ok(())
    }
}

/// In-memory implementation of [`SettingsStore`].
#[derive(Default, Clone)]
pub struct InMemorySettingsStore {
    last: Arc<RwLock<Option<ConnectionParams>>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn last_connection(&self) -> Result<Option<ConnectionParams>, StoreError> {
        Ok(self.last.read().await.clone())
    }

    async fn save_last_connection(&self, params: &ConnectionParams) -> Result<(), StoreError> {
        *self.last.write().await = Some(params.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_is_created_once() {
        let store = InMemoryCredentialStore::new();
        let first = store.device_identity().await.unwrap();
        let second = store.device_identity().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_certificates_are_keyed_by_host() {
        let store = InMemoryCredentialStore::new();
        store
            .put_certificate("10.0.0.2", PinnedCertificate::from_der(vec![1]))
            .await
            .unwrap();

        assert!(store.certificate("10.0.0.2").await.unwrap().is_some());
        assert!(store.certificate("10.0.0.3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_resets_identity() {
        let store = InMemoryCredentialStore::new();
        let before = store.device_identity().await.unwrap();
        store
            .put_certificate("pc", PinnedCertificate::from_der(vec![9]))
            .await
            .unwrap();

        store.clear_all().await.unwrap();

        assert_eq!(store.certificate_count().await, 0);
        assert_ne!(store.device_identity().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_last_connection_round_trip() {
        let store = InMemorySettingsStore::new();
        assert!(store.last_connection().await.unwrap().is_none());

        let params = ConnectionParams::new("pc", 47989, 0);
        store.save_last_connection(&params).await.unwrap();
        assert_eq!(store.last_connection().await.unwrap(), Some(params));
    }
}
