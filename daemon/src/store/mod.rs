//! Agreement persistence.
//!
//! The store is an opaque keyed collection of `Agreement` records with
//! filtered queries and whole-record atomic writes. Workers are serialized
//! per agreement id by the lock manager, so read-modify-persist through this
//! interface is race-free for a single agreement.

mod memory;
mod sled;

pub use self::memory::MemoryAgreementStore;
pub use self::sled::SledAgreementStore;

use async_trait::async_trait;
use thiserror::Error;

use agbot_common::agreement::Agreement;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Agreement {id} already exists for protocol {protocol}")]
    Duplicate { protocol: String, id: String },

    #[error("Agreement {id} is archived and immutable")]
    Immutable { id: String },
}

/// Composable record filter for `find`.
#[derive(Clone, Debug, Default)]
pub struct AgreementFilter {
    pub protocol: Option<String>,
    pub archived: Option<bool>,
    pub protocol_version: Option<u32>,
    pub finalized: Option<bool>,
    /// `(type, name, org)` of the bound ledger instance.
    pub ledger: Option<(String, String, String)>,
}

impl AgreementFilter {
    pub fn unarchived() -> Self {
        AgreementFilter {
            archived: Some(false),
            ..AgreementFilter::default()
        }
    }

    pub fn protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.protocol_version = Some(version);
        self
    }

    pub fn finalized(mut self, finalized: bool) -> Self {
        self.finalized = Some(finalized);
        self
    }

    pub fn ledger(mut self, chain_type: &str, name: &str, org: &str) -> Self {
        self.ledger = Some((chain_type.to_string(), name.to_string(), org.to_string()));
        self
    }

    pub fn matches(&self, agreement: &Agreement) -> bool {
        if let Some(protocol) = &self.protocol {
            if &agreement.protocol != protocol {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if agreement.archived != archived {
                return false;
            }
        }
        if let Some(version) = self.protocol_version {
            if agreement.protocol_version != version {
                return false;
            }
        }
        if let Some(finalized) = self.finalized {
            if (agreement.finalized_time > 0) != finalized {
                return false;
            }
        }
        if let Some((chain_type, name, org)) = &self.ledger {
            if &agreement.ledger_type != chain_type
                || &agreement.ledger_name != name
                || &agreement.ledger_org != org
            {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait AgreementStore: Send + Sync {
    /// Insert a brand-new agreement. Fails with `Duplicate` if an
    /// unarchived record with the same protocol and id already exists.
    async fn save_new(&self, agreement: &Agreement) -> Result<(), StoreError>;

    /// Atomically overwrite one record. Archived records are immutable:
    /// rewriting one with different contents is rejected.
    async fn persist(&self, agreement: &Agreement) -> Result<(), StoreError>;

    async fn get(&self, protocol: &str, id: &str) -> Result<Option<Agreement>, StoreError>;

    async fn find(&self, filter: &AgreementFilter) -> Result<Vec<Agreement>, StoreError>;
}

pub(crate) fn record_key(protocol: &str, id: &str) -> String {
    format!("{}:{}", protocol, id)
}
