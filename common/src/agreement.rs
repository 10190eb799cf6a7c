//! The durable record of one negotiation between this bot (consumer) and a
//! producer node, plus the closed set of termination reason codes.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::EnumIter;

use crate::crypto::{Hash, Signature};
use crate::policy::{Policy, PROTOCOL_VERSION_2};
use crate::time::TimestampSeconds;

/// Agreement ids are 32 random bytes, 64 lowercase hex characters.
pub const AGREEMENT_ID_LEN: usize = 64;

/// Generate a fresh agreement id from the OS entropy source.
pub fn new_agreement_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Observable phase of an agreement, derived from its persisted fields so
/// the record and the state machine cannot disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgreementState {
    Proposed,
    Replied,
    AwaitingBCReady,
    ProducerUpdateSent,
    ProducerUpdateAcked,
    Recording,
    RecordingFailed,
    Finalized,
    DataFlowing,
    TimedOut,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub id: String,
    pub protocol: String,
    pub protocol_version: u32,
    pub device_id: String,
    pub policy: Policy,

    /// Producer's ledger address. v1: set when the reply is recorded.
    /// v2: set when the producer update arrives.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub counterparty_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ledger_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ledger_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ledger_org: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_hash: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_proposal_sig: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_proposal_sig: Option<Signature>,

    /// v2: the named ledger was observed writable and update work was queued.
    #[serde(default)]
    pub bc_ready_time: TimestampSeconds,
    /// v2: the consumer-side update was sent to the producer.
    #[serde(default)]
    pub update_sent_time: TimestampSeconds,
    /// v2: the producer acknowledged the consumer-side update.
    #[serde(default)]
    pub bc_update_ack_time: TimestampSeconds,
    /// A ledger write was attempted.
    #[serde(default)]
    pub bc_write_time: TimestampSeconds,
    #[serde(default)]
    pub bc_write_failed: bool,

    pub creation_time: TimestampSeconds,
    #[serde(default)]
    pub finalized_time: TimestampSeconds,
    #[serde(default)]
    pub data_received_time: TimestampSeconds,
    #[serde(default)]
    pub dv_missed_count: u32,
    #[serde(default)]
    pub dv_check_rate_sec: u64,
    #[serde(default)]
    pub last_metering_time: TimestampSeconds,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    #[serde(default)]
    pub archived: bool,
}

impl Agreement {
    pub fn new(
        id: String,
        protocol: String,
        protocol_version: u32,
        device_id: String,
        policy: Policy,
        creation_time: TimestampSeconds,
    ) -> Self {
        let dv_check_rate_sec = policy.data_verification.check_rate_sec;
        Agreement {
            id,
            protocol,
            protocol_version,
            device_id,
            policy,
            counterparty_address: String::new(),
            ledger_type: String::new(),
            ledger_name: String::new(),
            ledger_org: String::new(),
            proposal_hash: None,
            consumer_proposal_sig: None,
            producer_proposal_sig: None,
            bc_ready_time: 0,
            update_sent_time: 0,
            bc_update_ack_time: 0,
            bc_write_time: 0,
            bc_write_failed: false,
            creation_time,
            finalized_time: 0,
            data_received_time: 0,
            dv_missed_count: 0,
            dv_check_rate_sec,
            last_metering_time: 0,
            termination_reason: None,
            archived: false,
        }
    }

    pub fn is_version2(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION_2
    }

    /// Whether a positive reply has been recorded on this agreement.
    pub fn reply_recorded(&self) -> bool {
        if self.is_version2() {
            !self.ledger_type.is_empty()
        } else {
            !self.counterparty_address.is_empty()
        }
    }

    /// Both proposal signatures are present, as required before a ledger
    /// write and for metering.
    pub fn fully_signed(&self) -> bool {
        self.consumer_proposal_sig.is_some() && self.producer_proposal_sig.is_some()
    }

    pub fn state(&self) -> AgreementState {
        if self.archived {
            return AgreementState::Terminated;
        }
        if self.termination_reason.is_some() {
            return AgreementState::TimedOut;
        }
        if self.finalized_time > 0 {
            if self.data_received_time > 0 {
                return AgreementState::DataFlowing;
            }
            return AgreementState::Finalized;
        }
        if self.bc_write_failed {
            return AgreementState::RecordingFailed;
        }
        if self.is_version2() {
            if self.bc_write_time > 0 {
                AgreementState::Recording
            } else if self.bc_update_ack_time > 0 {
                AgreementState::ProducerUpdateAcked
            } else if self.update_sent_time > 0 {
                AgreementState::ProducerUpdateSent
            } else if self.bc_ready_time > 0 {
                AgreementState::AwaitingBCReady
            } else if self.reply_recorded() {
                AgreementState::Replied
            } else {
                AgreementState::Proposed
            }
        } else if self.reply_recorded() {
            AgreementState::Recording
        } else {
            AgreementState::Proposed
        }
    }
}

/// Why an agreement was terminated. The numeric codes are a stable wire
/// contract; every code round-trips through its symbolic form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum TerminationReason {
    /// Matching policy was updated incompatibly.
    PolicyChanged,
    /// Ledger did not record the agreement within the deadline.
    NotFinalizedTimeout,
    /// Data verification deadline exceeded.
    NoDataReceived,
    /// Producer did not answer the proposal.
    NoReply,
    /// Operator action.
    UserRequested,
    /// Producer returned `decision=false`.
    NegativeReply,
    /// Cancellation observed on the ledger.
    Discovered,
    /// Workload upgrade forced replacement.
    ForcedUpgrade,
    /// Ledger write exhausted retries.
    BcWriteFailed,
    /// Producer missed its heartbeat.
    NodeHeartbeat,
    /// Ledger polling showed the agreement absent.
    AgreementMissing,
    /// Fallback for any unrecognized code.
    Unknown,
}

impl TerminationReason {
    pub fn code(&self) -> u32 {
        match self {
            TerminationReason::PolicyChanged => 200,
            TerminationReason::NotFinalizedTimeout => 201,
            TerminationReason::NoDataReceived => 202,
            TerminationReason::NoReply => 203,
            TerminationReason::UserRequested => 204,
            TerminationReason::NegativeReply => 205,
            TerminationReason::Discovered => 206,
            TerminationReason::ForcedUpgrade => 207,
            TerminationReason::BcWriteFailed => 208,
            TerminationReason::NodeHeartbeat => 209,
            TerminationReason::AgreementMissing => 210,
            TerminationReason::Unknown => 999,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            200 => TerminationReason::PolicyChanged,
            201 => TerminationReason::NotFinalizedTimeout,
            202 => TerminationReason::NoDataReceived,
            203 => TerminationReason::NoReply,
            204 => TerminationReason::UserRequested,
            205 => TerminationReason::NegativeReply,
            206 => TerminationReason::Discovered,
            207 => TerminationReason::ForcedUpgrade,
            208 => TerminationReason::BcWriteFailed,
            209 => TerminationReason::NodeHeartbeat,
            210 => TerminationReason::AgreementMissing,
            _ => TerminationReason::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::PolicyChanged => "policy changed",
            TerminationReason::NotFinalizedTimeout => "agreement not finalized in time",
            TerminationReason::NoDataReceived => "no data received from producer",
            TerminationReason::NoReply => "no reply to proposal",
            TerminationReason::UserRequested => "user requested cancellation",
            TerminationReason::NegativeReply => "producer declined the proposal",
            TerminationReason::Discovered => "cancellation discovered on the ledger",
            TerminationReason::ForcedUpgrade => "workload upgrade forced replacement",
            TerminationReason::BcWriteFailed => "ledger write failed",
            TerminationReason::NodeHeartbeat => "producer heartbeat lost",
            TerminationReason::AgreementMissing => "agreement missing from the ledger",
            TerminationReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

// Stored and transmitted as the bare numeric code
impl Serialize for TerminationReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for TerminationReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        Ok(TerminationReason::from_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyHeader;
    use strum::IntoEnumIterator;

    fn test_policy(version: u32) -> Policy {
        use crate::policy::AgreementProtocol;
        Policy {
            header: PolicyHeader {
                name: "test policy".to_string(),
                version: "1.0".to_string(),
            },
            agreement_protocols: vec![AgreementProtocol {
                name: "standard".to_string(),
                protocol_version: version,
                blockchains: Vec::new(),
            }],
            ..Policy::default()
        }
    }

    fn test_agreement(version: u32) -> Agreement {
        Agreement::new(
            new_agreement_id(),
            "standard".to_string(),
            version,
            "device-1".to_string(),
            test_policy(version),
            100,
        )
    }

    #[test]
    fn test_agreement_id_format() {
        let id = new_agreement_id();
        assert_eq!(id.len(), AGREEMENT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_agreement_id());
    }

    #[test]
    fn test_reason_codes_roundtrip() {
        for code in 200..=210u32 {
            let reason = TerminationReason::from_code(code);
            assert_ne!(reason, TerminationReason::Unknown);
            assert_eq!(reason.code(), code);
        }
        assert_eq!(TerminationReason::from_code(999).code(), 999);
        // Anything outside the closed set maps to the fallback
        assert_eq!(
            TerminationReason::from_code(404),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_reason_strings_are_stable() {
        for reason in TerminationReason::iter() {
            assert!(!reason.as_str().is_empty());
        }
        assert_eq!(TerminationReason::Unknown.as_str(), "unknown");
    }

    #[test]
    fn test_reason_serialized_as_number() {
        let value =
            serde_json::to_value(TerminationReason::NegativeReply).expect("serialize reason");
        assert_eq!(value, serde_json::json!(205));
        let back: TerminationReason = serde_json::from_value(value).expect("deserialize reason");
        assert_eq!(back, TerminationReason::NegativeReply);
    }

    #[test]
    fn test_state_derivation_v1() {
        let mut ag = test_agreement(1);
        assert_eq!(ag.state(), AgreementState::Proposed);

        ag.counterparty_address = "0xprod".to_string();
        assert_eq!(ag.state(), AgreementState::Recording);

        ag.bc_write_failed = true;
        assert_eq!(ag.state(), AgreementState::RecordingFailed);
        ag.bc_write_failed = false;

        ag.finalized_time = 500;
        assert_eq!(ag.state(), AgreementState::Finalized);

        ag.data_received_time = 600;
        assert_eq!(ag.state(), AgreementState::DataFlowing);

        ag.termination_reason = Some(TerminationReason::NoDataReceived);
        assert_eq!(ag.state(), AgreementState::TimedOut);

        ag.archived = true;
        assert_eq!(ag.state(), AgreementState::Terminated);
    }

    #[test]
    fn test_state_derivation_v2() {
        let mut ag = test_agreement(2);
        assert_eq!(ag.state(), AgreementState::Proposed);

        ag.ledger_type = "ethereum".to_string();
        ag.ledger_name = "bc1".to_string();
        ag.ledger_org = "acme".to_string();
        assert_eq!(ag.state(), AgreementState::Replied);
        assert!(ag.reply_recorded());

        ag.bc_ready_time = 110;
        assert_eq!(ag.state(), AgreementState::AwaitingBCReady);

        ag.update_sent_time = 120;
        assert_eq!(ag.state(), AgreementState::ProducerUpdateSent);

        ag.bc_update_ack_time = 130;
        assert_eq!(ag.state(), AgreementState::ProducerUpdateAcked);

        ag.bc_write_time = 140;
        assert_eq!(ag.state(), AgreementState::Recording);

        ag.finalized_time = 150;
        assert_eq!(ag.state(), AgreementState::Finalized);
    }

    #[test]
    fn test_agreement_serde_roundtrip() {
        let mut ag = test_agreement(2);
        ag.ledger_type = "ethereum".to_string();
        ag.termination_reason = Some(TerminationReason::PolicyChanged);

        let value = serde_json::to_value(&ag).expect("serialize agreement");
        assert_eq!(value["protocolVersion"], 2);
        assert_eq!(value["terminationReason"], 200);
        let back: Agreement = serde_json::from_value(value).expect("deserialize agreement");
        assert_eq!(ag, back);
    }
}
