use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use agbot_common::agreement::Agreement;

use super::{record_key, AgreementFilter, AgreementStore, StoreError};

/// In-memory provider, used by tests and dev mode.
#[derive(Default)]
pub struct MemoryAgreementStore {
    records: RwLock<HashMap<String, Agreement>>,
}

impl MemoryAgreementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgreementStore for MemoryAgreementStore {
    async fn save_new(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let key = record_key(&agreement.protocol, &agreement.id);
        let mut records = self.records.write().expect("store lock poisoned");
        if let Some(existing) = records.get(&key) {
            if !existing.archived {
                return Err(StoreError::Duplicate {
                    protocol: agreement.protocol.clone(),
                    id: agreement.id.clone(),
                });
            }
        }
        records.insert(key, agreement.clone());
        Ok(())
    }

    async fn persist(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let key = record_key(&agreement.protocol, &agreement.id);
        let mut records = self.records.write().expect("store lock poisoned");
        if let Some(existing) = records.get(&key) {
            if existing.archived && existing != agreement {
                return Err(StoreError::Immutable {
                    id: agreement.id.clone(),
                });
            }
        }
        records.insert(key, agreement.clone());
        Ok(())
    }

    async fn get(&self, protocol: &str, id: &str) -> Result<Option<Agreement>, StoreError> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records.get(&record_key(protocol, id)).cloned())
    }

    async fn find(&self, filter: &AgreementFilter) -> Result<Vec<Agreement>, StoreError> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records
            .values()
            .filter(|ag| filter.matches(ag))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agbot_common::agreement::new_agreement_id;
    use agbot_common::policy::Policy;

    fn agreement(version: u32) -> Agreement {
        Agreement::new(
            new_agreement_id(),
            "standard".to_string(),
            version,
            "device-1".to_string(),
            Policy::default(),
            100,
        )
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let store = MemoryAgreementStore::new();
        let ag = agreement(1);
        store.save_new(&ag).await.expect("save");
        let loaded = store
            .get(&ag.protocol, &ag.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded, ag);
    }

    #[tokio::test]
    async fn test_duplicate_unarchived_rejected() {
        let store = MemoryAgreementStore::new();
        let ag = agreement(1);
        store.save_new(&ag).await.expect("save");
        assert!(matches!(
            store.save_new(&ag).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_archived_records_are_immutable() {
        let store = MemoryAgreementStore::new();
        let mut ag = agreement(1);
        store.save_new(&ag).await.expect("save");
        ag.archived = true;
        store.persist(&ag).await.expect("archive");

        ag.device_id = "tampered".to_string();
        assert!(matches!(
            store.persist(&ag).await,
            Err(StoreError::Immutable { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_with_filters() {
        let store = MemoryAgreementStore::new();
        let mut v2 = agreement(2);
        v2.ledger_type = "ethereum".to_string();
        v2.ledger_name = "bc1".to_string();
        v2.ledger_org = "acme".to_string();
        let mut archived = agreement(1);
        archived.archived = true;
        store.save_new(&agreement(1)).await.expect("save");
        store.save_new(&v2).await.expect("save");
        store.save_new(&archived).await.expect("save");

        let unarchived = store
            .find(&AgreementFilter::unarchived())
            .await
            .expect("find");
        assert_eq!(unarchived.len(), 2);

        let v2_on_ledger = store
            .find(
                &AgreementFilter::unarchived()
                    .version(2)
                    .ledger("ethereum", "bc1", "acme"),
            )
            .await
            .expect("find");
        assert_eq!(v2_on_ledger.len(), 1);
        assert_eq!(v2_on_ledger[0].id, v2.id);
    }
}
