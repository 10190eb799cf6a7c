use std::path::Path;

use async_trait::async_trait;
use sled::Tree;

use agbot_common::agreement::Agreement;

use super::{record_key, AgreementFilter, AgreementStore, StoreError};

const AGREEMENTS_TREE: &str = "agreements";

/// Sled-backed provider, the production default. Records are stored as
/// JSON under `protocol:id` keys.
pub struct SledAgreementStore {
    tree: Tree,
}

impl SledAgreementStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        let tree = db
            .open_tree(AGREEMENTS_TREE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { tree })
    }

    fn read(&self, key: &str) -> Result<Option<Agreement>, StoreError> {
        let raw = self
            .tree
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, agreement: &Agreement) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(agreement)?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.tree
            .flush()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AgreementStore for SledAgreementStore {
    async fn save_new(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let key = record_key(&agreement.protocol, &agreement.id);
        if let Some(existing) = self.read(&key)? {
            if !existing.archived {
                return Err(StoreError::Duplicate {
                    protocol: agreement.protocol.clone(),
                    id: agreement.id.clone(),
                });
            }
        }
        self.write(&key, agreement)
    }

    async fn persist(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let key = record_key(&agreement.protocol, &agreement.id);
        if let Some(existing) = self.read(&key)? {
            if existing.archived && &existing != agreement {
                return Err(StoreError::Immutable {
                    id: agreement.id.clone(),
                });
            }
        }
        self.write(&key, agreement)
    }

    async fn get(&self, protocol: &str, id: &str) -> Result<Option<Agreement>, StoreError> {
        self.read(&record_key(protocol, id))
    }

    async fn find(&self, filter: &AgreementFilter) -> Result<Vec<Agreement>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            let agreement: Agreement = serde_json::from_slice(&bytes)?;
            if filter.matches(&agreement) {
                out.push(agreement);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agbot_common::agreement::new_agreement_id;
    use agbot_common::policy::Policy;
    use tempdir::TempDir;

    fn agreement() -> Agreement {
        Agreement::new(
            new_agreement_id(),
            "standard".to_string(),
            1,
            "device-1".to_string(),
            Policy::default(),
            100,
        )
    }

    #[tokio::test]
    async fn test_sled_roundtrip_and_find() {
        let dir = TempDir::new("agbot-store").expect("tempdir");
        let store = SledAgreementStore::open(dir.path()).expect("open store");

        let ag = agreement();
        store.save_new(&ag).await.expect("save");
        let loaded = store
            .get(&ag.protocol, &ag.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded, ag);

        let mut archived = agreement();
        archived.archived = true;
        store.save_new(&archived).await.expect("save");

        let unarchived = store
            .find(&AgreementFilter::unarchived().protocol("standard"))
            .await
            .expect("find");
        assert_eq!(unarchived.len(), 1);
        assert_eq!(unarchived[0].id, ag.id);
    }

    #[tokio::test]
    async fn test_sled_duplicate_rejected() {
        let dir = TempDir::new("agbot-store").expect("tempdir");
        let store = SledAgreementStore::open(dir.path()).expect("open store");
        let ag = agreement();
        store.save_new(&ag).await.expect("save");
        assert!(matches!(
            store.save_new(&ag).await,
            Err(StoreError::Duplicate { .. })
        ));
    }
}
