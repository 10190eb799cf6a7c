//! Protocol handlers.
//!
//! `ProtocolHandler` is the protocol-specific capability surface: it can
//! classify inbound payloads, sign proposals, demux raw ledger events and
//! map termination reasons to wire codes. One *generic* instance exists
//! with no ledger binding (messages must be classified before their
//! agreement, and thus their ledger, is known); one *bound* instance is
//! created per ready ledger client by the registry.
//!
//! `ConsumerHandler` is the consumer-side state machine driver built on
//! top of these capabilities.

pub mod consumer;


pub use consumer::{ConsumerHandler, NewBCContainer};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use agbot_common::agreement::TerminationReason;
use agbot_common::crypto::{canonical_json, sha3_256, AccountKeys, Hash, Signature};
use agbot_common::messages::{MessageError, Proposal, ProtocolMessage};

use crate::error::BotError;
use crate::ledger::{LedgerClient, LedgerEvent};

#[async_trait]
pub trait ProtocolCapabilities: Send + Sync {
    fn protocol_name(&self) -> &str;

    /// Parse and validate an inbound payload before its agreement is known.
    fn classify_message(&self, payload: &Value) -> Result<ProtocolMessage, MessageError>;

    /// Hash the canonical proposal and sign the digest with the consumer's
    /// ledger account.
    async fn sign_proposal(&self, proposal: &Proposal) -> Result<(Hash, Signature), BotError>;

    /// Classify a raw ledger event. Unknown events demux to
    /// `LedgerEvent::Other` and are ignored.
    fn demux_event(&self, raw: &Value) -> LedgerEvent;

    /// Wire code for a termination reason.
    fn cancel_code(&self, reason: TerminationReason) -> u32;
}

pub struct ProtocolHandler {
    protocol: String,
    keys: Arc<AccountKeys>,
    ledger: Option<Arc<dyn LedgerClient>>,
}

impl ProtocolHandler {
    /// A handler with no ledger binding; classifies and signs with the
    /// bot's own account key.
    pub fn generic(protocol: &str, keys: Arc<AccountKeys>) -> Self {
        Self {
            protocol: protocol.to_string(),
            keys,
            ledger: None,
        }
    }

    /// A handler bound to one ready ledger client.
    pub fn bound(protocol: &str, keys: Arc<AccountKeys>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            protocol: protocol.to_string(),
            keys,
            ledger: Some(ledger),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.ledger.is_some()
    }

    pub fn ledger(&self) -> Option<&Arc<dyn LedgerClient>> {
        self.ledger.as_ref()
    }

    /// The consumer's address on the bound ledger, or the bot account
    /// address when unbound.
    pub fn account_address(&self) -> String {
        match &self.ledger {
            Some(ledger) => ledger.account(),
            None => self.keys.address(),
        }
    }
}

#[async_trait]
impl ProtocolCapabilities for ProtocolHandler {
    fn protocol_name(&self) -> &str {
        &self.protocol
    }

    fn classify_message(&self, payload: &Value) -> Result<ProtocolMessage, MessageError> {
        ProtocolMessage::classify(payload)
    }

    async fn sign_proposal(&self, proposal: &Proposal) -> Result<(Hash, Signature), BotError> {
        let value = serde_json::to_value(proposal)?;
        let digest = sha3_256(canonical_json(&value).as_bytes());
        let signature = match &self.ledger {
            Some(ledger) => ledger.sign(&digest).await?,
            None => self.keys.sign_digest(&digest),
        };
        Ok((digest, signature))
    }

    fn demux_event(&self, raw: &Value) -> LedgerEvent {
        let Some(agreement_id) = raw["agreementId"].as_str() else {
            return LedgerEvent::Other;
        };
        let agreement_id = agreement_id.to_string();
        match raw["event"].as_str() {
            Some("agreementCreated") => LedgerEvent::AgreementCreated { agreement_id },
            Some("producerTermination") => LedgerEvent::ProducerTermination { agreement_id },
            Some("consumerTermination") => LedgerEvent::ConsumerTermination { agreement_id },
            _ => LedgerEvent::Other,
        }
    }

    fn cancel_code(&self, reason: TerminationReason) -> u32 {
        reason.code()
    }
}

/// Typed registry of state machine drivers keyed by protocol name, owned
/// by the top-level process.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<ConsumerHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<ConsumerHandler>) {
        self.handlers
            .insert(handler.protocol().to_string(), handler);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<ConsumerHandler>> {
        self.handlers.get(protocol).cloned()
    }
}
