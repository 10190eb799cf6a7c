//! Ledger client registry.
//!
//! A three-level directory `org -> type -> name -> ClientState` guarded by
//! one mutex. Readiness here gates which agreements may progress: the
//! command router drops ledger events for instances that are not ready and
//! the protocol handler defers work destined for ledgers that are not yet
//! writable. The lock is never held across a suspension point; callers get
//! `Arc` clones out, never references into the map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agbot_common::crypto::AccountKeys;

use crate::handler::ProtocolHandler;
use crate::ledger::LedgerClient;

/// Builds the RPC client for a newly ready ledger instance:
/// `(org, type, name, service_endpoint, service_port)`.
pub type ClientFactory =
    Box<dyn Fn(&str, &str, &str, &str, u16) -> Arc<dyn LedgerClient> + Send + Sync>;

/// State of one ledger client instance.
pub struct ClientState {
    pub ready: bool,
    pub writable: bool,
    pub service_endpoint: String,
    pub service_port: u16,
    pub local_dir: PathBuf,
    handler: Option<Arc<ProtocolHandler>>,
}

type Directory = HashMap<String, HashMap<String, HashMap<String, ClientState>>>;

pub struct ClientRegistry {
    inner: Mutex<Directory>,
    generic: Arc<ProtocolHandler>,
    keys: Arc<AccountKeys>,
    protocol: String,
    factory: ClientFactory,
}

impl ClientRegistry {
    pub fn new(protocol: &str, keys: Arc<AccountKeys>, factory: ClientFactory) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            generic: Arc::new(ProtocolHandler::generic(protocol, keys.clone())),
            keys,
            protocol: protocol.to_string(),
            factory,
        }
    }

    /// The handler with no ledger binding, used to classify messages whose
    /// agreement is not yet known.
    pub fn generic_handler(&self) -> Arc<ProtocolHandler> {
        self.generic.clone()
    }

    /// Upsert an instance as ready (client initialized, not yet funded).
    /// Instantiates the bound handler, which performs its ledger
    /// initialization inline.
    pub fn set_ready(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
        endpoint: &str,
        port: u16,
        dir: &Path,
    ) {
        self.upsert(org, chain_type, name, endpoint, port, dir, false);
    }

    /// Upsert an instance as ready and writable (account funded).
    pub fn set_writable(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
        endpoint: &str,
        port: u16,
        dir: &Path,
    ) {
        self.upsert(org, chain_type, name, endpoint, port, dir, true);
    }

    fn upsert(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
        endpoint: &str,
        port: u16,
        dir: &Path,
        writable: bool,
    ) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let state = inner
            .entry(org.to_string())
            .or_default()
            .entry(chain_type.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| ClientState {
                ready: false,
                writable: false,
                service_endpoint: endpoint.to_string(),
                service_port: port,
                local_dir: dir.to_path_buf(),
                handler: None,
            });

        state.service_endpoint = endpoint.to_string();
        state.service_port = port;
        state.local_dir = dir.to_path_buf();
        if state.handler.is_none() {
            let client = (self.factory)(org, chain_type, name, endpoint, port);
            state.handler = Some(Arc::new(ProtocolHandler::bound(
                &self.protocol,
                self.keys.clone(),
                client,
            )));
        }
        state.ready = true;
        if writable {
            state.writable = true;
        }
        info!(
            "ledger client {}/{}/{} is {}",
            org,
            chain_type,
            name,
            if writable { "writable" } else { "ready" }
        );
    }

    /// Remove an instance entirely (client stopping or gone).
    pub fn set_not_available(&self, org: &str, chain_type: &str, name: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(types) = inner.get_mut(org) {
            if let Some(names) = types.get_mut(chain_type) {
                if names.remove(name).is_some() {
                    info!("ledger client {}/{}/{} is gone", org, chain_type, name);
                }
                if names.is_empty() {
                    types.remove(chain_type);
                }
            }
            if types.is_empty() {
                inner.remove(org);
            }
        }
    }

    fn with_state<T>(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
        f: impl FnOnce(&ClientState) -> T,
    ) -> Option<T> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .get(org)
            .and_then(|types| types.get(chain_type))
            .and_then(|names| names.get(name))
            .map(f)
    }

    pub fn is_ready(&self, org: &str, chain_type: &str, name: &str) -> bool {
        self.with_state(org, chain_type, name, |state| state.ready)
            .unwrap_or(false)
    }

    pub fn is_writable(&self, org: &str, chain_type: &str, name: &str) -> bool {
        self.with_state(org, chain_type, name, |state| state.writable)
            .unwrap_or(false)
    }

    /// Handler bound to a ready instance. The empty triple returns the
    /// generic handler.
    pub fn get_handler(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
    ) -> Option<Arc<ProtocolHandler>> {
        if org.is_empty() && chain_type.is_empty() && name.is_empty() {
            return Some(self.generic.clone());
        }
        self.with_state(org, chain_type, name, |state| {
            if state.ready {
                state.handler.clone()
            } else {
                None
            }
        })
        .flatten()
    }

    pub fn get_dir(&self, org: &str, chain_type: &str, name: &str) -> Option<PathBuf> {
        self.with_state(org, chain_type, name, |state| state.local_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use agbot_common::crypto::{Hash, Signature};

    use crate::ledger::{AgreementWrite, CanCancel, LedgerError};

    struct NullLedger;

    #[async_trait]
    impl LedgerClient for NullLedger {
        fn account(&self) -> String {
            "0xbot".to_string()
        }

        async fn sign(&self, _digest: &Hash) -> Result<Signature, LedgerError> {
            Err(LedgerError::NotReady)
        }

        async fn write_agreement(&self, _write: &AgreementWrite) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn cancel_agreement(
            &self,
            _agreement_id: &str,
            _reason: u32,
        ) -> Result<CanCancel, LedgerError> {
            Ok(CanCancel::Now)
        }

        async fn agreement_exists(&self, _agreement_id: &str) -> Result<bool, LedgerError> {
            Ok(false)
        }
    }

    fn registry() -> ClientRegistry {
        let keys = Arc::new(AccountKeys::generate());
        ClientRegistry::new(
            "standard",
            keys,
            Box::new(|_, _, _, _, _| Arc::new(NullLedger)),
        )
    }

    #[test]
    fn test_missing_entry_is_not_ready() {
        let registry = registry();
        assert!(!registry.is_ready("acme", "ethereum", "bc1"));
        assert!(!registry.is_writable("acme", "ethereum", "bc1"));
        assert!(registry.get_handler("acme", "ethereum", "bc1").is_none());
        assert!(registry.get_dir("acme", "ethereum", "bc1").is_none());
    }

    #[test]
    fn test_writable_implies_ready() {
        let registry = registry();
        registry.set_writable("acme", "ethereum", "bc1", "localhost", 8545, Path::new("/tmp"));
        assert!(registry.is_ready("acme", "ethereum", "bc1"));
        assert!(registry.is_writable("acme", "ethereum", "bc1"));
        let handler = registry
            .get_handler("acme", "ethereum", "bc1")
            .expect("bound handler");
        assert!(handler.is_bound());
    }

    #[test]
    fn test_ready_is_not_writable_until_funded() {
        let registry = registry();
        registry.set_ready("acme", "ethereum", "bc1", "localhost", 8545, Path::new("/tmp"));
        assert!(registry.is_ready("acme", "ethereum", "bc1"));
        assert!(!registry.is_writable("acme", "ethereum", "bc1"));

        registry.set_writable("acme", "ethereum", "bc1", "localhost", 8545, Path::new("/tmp"));
        assert!(registry.is_writable("acme", "ethereum", "bc1"));
    }

    #[test]
    fn test_empty_triple_returns_generic_handler() {
        let registry = registry();
        let handler = registry.get_handler("", "", "").expect("generic handler");
        assert!(!handler.is_bound());
    }

    #[test]
    fn test_set_not_available_removes_entry() {
        let registry = registry();
        registry.set_writable("acme", "ethereum", "bc1", "localhost", 8545, Path::new("/tmp"));
        registry.set_not_available("acme", "ethereum", "bc1");
        assert!(!registry.is_ready("acme", "ethereum", "bc1"));
        assert!(registry.get_handler("acme", "ethereum", "bc1").is_none());
    }
}
