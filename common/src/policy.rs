//! Matched policy documents: the terms a proposal offers to a producer.
//!
//! A policy is generated from a pattern (one per workload) and travels
//! inside the proposal. The `agreementProtocols` section is authoritative
//! for the protocol name and version the agreement will run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol versions this bot can drive.
pub const PROTOCOL_VERSION_1: u32 = 1;
pub const PROTOCOL_VERSION_2: u32 = 2;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy has no agreement protocol section")]
    NoAgreementProtocol,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Escaped deployment is not valid JSON: {0}")]
    InvalidEscapedDeployment(serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyHeader {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Reference to one ledger instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainRef {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub name: String,
    #[serde(default)]
    pub org: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementProtocol {
    pub name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockchains: Vec<BlockchainRef>,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION_1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVerification {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between producer data checks.
    #[serde(default)]
    pub check_rate_sec: u64,
    /// Missed checks tolerated before the agreement is terminated.
    #[serde(default)]
    pub missed_interval_limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metering {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub per_time_unit: String,
    /// Seconds between metering notifications.
    #[serde(default)]
    pub notification_interval_sec: u64,
}

/// Workload deployment description. The wire form is either an inline
/// object or an escaped JSON string; `normalize` is the single boundary
/// that resolves the difference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Deployment {
    Escaped(String),
    Inline(Value),
}

impl Deployment {
    /// Resolve to the inline object form.
    pub fn normalize(&self) -> Result<Value, PolicyError> {
        match self {
            Deployment::Inline(value) => Ok(value.clone()),
            Deployment::Escaped(raw) => {
                serde_json::from_str(raw).map_err(PolicyError::InvalidEscapedDeployment)
            }
        }
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Deployment::Inline(Value::Null)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deployment: Deployment,
}

/// A full matched policy document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub header: PolicyHeader,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern_id: String,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocol>,
    #[serde(default)]
    pub data_verification: DataVerification,
    #[serde(default)]
    pub metering: Metering,
    #[serde(default)]
    pub workloads: Vec<Workload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agreements: Option<u32>,
}

impl Policy {
    /// The protocol the agreement will run. The policy is authoritative:
    /// the version recorded here is never downgraded by the handler.
    pub fn agreement_protocol(&self) -> Result<&AgreementProtocol, PolicyError> {
        self.agreement_protocols
            .first()
            .ok_or(PolicyError::NoAgreementProtocol)
    }

    pub fn protocol_version(&self) -> Result<u32, PolicyError> {
        let version = self.agreement_protocol()?.protocol_version;
        match version {
            PROTOCOL_VERSION_1 | PROTOCOL_VERSION_2 => Ok(version),
            other => Err(PolicyError::UnsupportedVersion(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_untagged_forms() {
        let inline: Deployment =
            serde_json::from_value(json!({"services": {"gps": {"image": "gps:1.2"}}}))
                .expect("inline deployment");
        assert!(matches!(inline, Deployment::Inline(_)));
        assert_eq!(
            inline.normalize().expect("normalize inline")["services"]["gps"]["image"],
            "gps:1.2"
        );

        let escaped: Deployment = serde_json::from_value(json!(
            "{\"services\":{\"gps\":{\"image\":\"gps:1.2\"}}}"
        ))
        .expect("escaped deployment");
        assert!(matches!(escaped, Deployment::Escaped(_)));
        assert_eq!(
            escaped.normalize().expect("normalize escaped"),
            inline.normalize().expect("normalize inline")
        );
    }

    #[test]
    fn test_deployment_escaped_invalid_json() {
        let escaped = Deployment::Escaped("{not json".to_string());
        assert!(escaped.normalize().is_err());
    }

    #[test]
    fn test_protocol_version_from_policy() {
        let policy: Policy = serde_json::from_value(json!({
            "header": {"name": "netspeed policy", "version": "1.0"},
            "agreementProtocols": [
                {"name": "standard", "protocolVersion": 2,
                 "blockchains": [{"type": "ethereum", "name": "bc1", "org": "acme"}]}
            ]
        }))
        .expect("parse policy");

        assert_eq!(policy.protocol_version().expect("version"), 2);
        let protocol = policy.agreement_protocol().expect("protocol");
        assert_eq!(protocol.blockchains[0].chain_type, "ethereum");
    }

    #[test]
    fn test_protocol_version_rejects_unknown() {
        let policy: Policy = serde_json::from_value(json!({
            "header": {"name": "p"},
            "agreementProtocols": [{"name": "standard", "protocolVersion": 9}]
        }))
        .expect("parse policy");
        assert!(matches!(
            policy.protocol_version(),
            Err(PolicyError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_policy_serde_camel_case() {
        let policy = Policy {
            header: PolicyHeader {
                name: "p1".to_string(),
                version: "1.0".to_string(),
            },
            data_verification: DataVerification {
                enabled: true,
                check_rate_sec: 15,
                missed_interval_limit: 3,
            },
            ..Policy::default()
        };
        let value = serde_json::to_value(&policy).expect("serialize policy");
        assert_eq!(value["dataVerification"]["checkRateSec"], 15);
    }
}
