//! In-memory [`KeyStore`] for embedding and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IdentityRecord, KeyStore, StoreError, TrustStatus};

/// Identity records held in a process-local map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyStore {
    records: Arc<RwLock<HashMap<String, IdentityRecord>>>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn upsert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn revoke(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) => {
                record.status = TrustStatus::Revoked;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let records = self.records.read().await;
        let mut out: Vec<IdentityRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
