//! Protocol messages exchanged between the bot and producers.
//!
//! These are the inner payloads of the exchange envelope. Classification is
//! driven by the `type` tag so a message can be typed before its agreement
//! (and thus its ledger binding) is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::Signature;
use crate::policy::{BlockchainRef, Policy, PROTOCOL_VERSION_1, PROTOCOL_VERSION_2};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Unrecognized or malformed protocol message: {0}")]
    Malformed(serde_json::Error),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Agreement id must be 64 hex characters, got {0:?}")]
    BadAgreementId(String),
}

/// A consumer-initiated proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    pub consumer_id: String,
    /// The full matched policy the producer is being offered.
    pub tsandcs: Policy,
}

/// Producer's answer to a proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalReply {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    pub decision: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub producer_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainRef>,
}

/// Ledger address and proposal signature for one side (v2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainUpdate {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainRef>,
}

/// Bare acknowledgement of an update message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAck {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
}

/// Tells the producer its agreement is recorded on the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedNotification {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
}

/// A signed usage reading sent periodically while data is flowing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringNotification {
    pub agreement_id: String,
    pub protocol: String,
    pub version: u32,
    pub tokens: u64,
    pub per_time_unit: String,
    pub current_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// All protocol message kinds, tagged on the wire by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    #[serde(rename = "proposal")]
    Proposal(Proposal),
    #[serde(rename = "reply")]
    Reply(ProposalReply),
    /// Bot -> producer: the consumer's ledger address and signature.
    #[serde(rename = "consumerUpdate")]
    ConsumerUpdate(BlockchainUpdate),
    /// Producer -> bot: the producer's ledger address and signature.
    #[serde(rename = "producerUpdate")]
    ProducerUpdate(BlockchainUpdate),
    /// Producer -> bot: acknowledges the consumer update.
    #[serde(rename = "consumerUpdateAck")]
    ConsumerUpdateAck(UpdateAck),
    /// Bot -> producer: acknowledges the producer update.
    #[serde(rename = "producerUpdateAck")]
    ProducerUpdateAck(UpdateAck),
    #[serde(rename = "finalized")]
    Finalized(FinalizedNotification),
    #[serde(rename = "metering")]
    Metering(MeteringNotification),
}

impl ProtocolMessage {
    pub fn agreement_id(&self) -> &str {
        match self {
            ProtocolMessage::Proposal(m) => &m.agreement_id,
            ProtocolMessage::Reply(m) => &m.agreement_id,
            ProtocolMessage::ConsumerUpdate(m) => &m.agreement_id,
            ProtocolMessage::ProducerUpdate(m) => &m.agreement_id,
            ProtocolMessage::ConsumerUpdateAck(m) => &m.agreement_id,
            ProtocolMessage::ProducerUpdateAck(m) => &m.agreement_id,
            ProtocolMessage::Finalized(m) => &m.agreement_id,
            ProtocolMessage::Metering(m) => &m.agreement_id,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            ProtocolMessage::Proposal(m) => m.version,
            ProtocolMessage::Reply(m) => m.version,
            ProtocolMessage::ConsumerUpdate(m) => m.version,
            ProtocolMessage::ProducerUpdate(m) => m.version,
            ProtocolMessage::ConsumerUpdateAck(m) => m.version,
            ProtocolMessage::ProducerUpdateAck(m) => m.version,
            ProtocolMessage::Finalized(m) => m.version,
            ProtocolMessage::Metering(m) => m.version,
        }
    }

    /// Parse and validate an inbound payload. Unknown `type` tags and
    /// unsupported versions are rejected.
    pub fn classify(payload: &Value) -> Result<Self, MessageError> {
        let message: ProtocolMessage =
            serde_json::from_value(payload.clone()).map_err(MessageError::Malformed)?;
        match message.version() {
            PROTOCOL_VERSION_1 | PROTOCOL_VERSION_2 => {}
            other => return Err(MessageError::UnsupportedVersion(other)),
        }
        let id = message.agreement_id();
        if id.len() != crate::agreement::AGREEMENT_ID_LEN
            || !id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(MessageError::BadAgreementId(id.to_string()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agreement_id() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn test_classify_producer_update() {
        let payload = json!({
            "type": "producerUpdate",
            "agreementId": agreement_id(),
            "protocol": "standard",
            "version": 2,
            "address": "0xprod",
        });
        let message = ProtocolMessage::classify(&payload).expect("classify");
        assert!(matches!(message, ProtocolMessage::ProducerUpdate(_)));
        assert_eq!(message.agreement_id(), agreement_id());
    }

    #[test]
    fn test_classify_rejects_unknown_type() {
        let payload = json!({
            "type": "gossip",
            "agreementId": agreement_id(),
            "protocol": "standard",
            "version": 1,
        });
        assert!(matches!(
            ProtocolMessage::classify(&payload),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_classify_rejects_bad_version() {
        let payload = json!({
            "type": "consumerUpdateAck",
            "agreementId": agreement_id(),
            "protocol": "standard",
            "version": 7,
        });
        assert!(matches!(
            ProtocolMessage::classify(&payload),
            Err(MessageError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_classify_rejects_bad_agreement_id() {
        let payload = json!({
            "type": "consumerUpdateAck",
            "agreementId": "short",
            "protocol": "standard",
            "version": 1,
        });
        assert!(matches!(
            ProtocolMessage::classify(&payload),
            Err(MessageError::BadAgreementId(_))
        ));
    }

    #[test]
    fn test_reply_roundtrip_with_blockchain() {
        let reply = ProposalReply {
            agreement_id: agreement_id(),
            protocol: "standard".to_string(),
            version: 2,
            decision: true,
            producer_address: "0xprod".to_string(),
            signature: None,
            blockchain: Some(BlockchainRef {
                chain_type: "ethereum".to_string(),
                name: "bc1".to_string(),
                org: "acme".to_string(),
            }),
        };
        let value =
            serde_json::to_value(ProtocolMessage::Reply(reply.clone())).expect("serialize");
        assert_eq!(value["type"], "reply");
        assert_eq!(value["blockchain"]["type"], "ethereum");
        let back = ProtocolMessage::classify(&value).expect("classify reply");
        assert_eq!(back, ProtocolMessage::Reply(reply));
    }
}
