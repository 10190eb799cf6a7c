//! Patterns: the declarative bundles of workloads and policies this bot is
//! configured to serve. Patterns are fetched from the exchange per org and
//! reconciled against generated policy files by the pattern manager.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{content_hash, Hash};
use crate::policy::{AgreementProtocol, DataVerification, Deployment, Metering};

/// One `(org, pattern)` pair from the bot's served-pattern configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServedPattern {
    pub org: String,
    pub pattern: String,
}

impl ServedPattern {
    pub fn new(org: &str, pattern: &str) -> Self {
        Self {
            org: org.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// A workload reference inside a pattern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternWorkload {
    pub workload_url: String,
    #[serde(default)]
    pub workload_org: String,
    #[serde(default)]
    pub workload_version: String,
    #[serde(default)]
    pub deployment: Deployment,
}

/// A pattern definition as published on the exchange.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub workloads: Vec<PatternWorkload>,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocol>,
    #[serde(default)]
    pub data_verification: DataVerification,
    #[serde(default)]
    pub metering: Metering,
}

impl Pattern {
    /// Content fingerprint used for change detection. Two patterns that
    /// serialize to the same canonical JSON always hash equal.
    pub fn fingerprint(&self) -> Result<Hash, serde_json::Error> {
        let value: Value = serde_json::to_value(self)?;
        Ok(content_hash(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(url: &str) -> PatternWorkload {
        PatternWorkload {
            workload_url: url.to_string(),
            workload_org: "acme".to_string(),
            workload_version: "1.0.0".to_string(),
            deployment: Deployment::Inline(serde_json::json!({"services": {}})),
        }
    }

    #[test]
    fn test_fingerprint_stable() {
        let pattern = Pattern {
            label: "netspeed".to_string(),
            workloads: vec![workload("https://exchange/wl/netspeed")],
            ..Pattern::default()
        };
        assert_eq!(
            pattern.fingerprint().expect("fingerprint"),
            pattern.clone().fingerprint().expect("fingerprint")
        );
    }

    #[test]
    fn test_fingerprint_detects_mutation() {
        let mut pattern = Pattern {
            label: "netspeed".to_string(),
            workloads: vec![workload("https://exchange/wl/netspeed")],
            ..Pattern::default()
        };
        let before = pattern.fingerprint().expect("fingerprint");
        pattern.workloads[0].workload_version = "1.0.1".to_string();
        assert_ne!(before, pattern.fingerprint().expect("fingerprint"));
    }
}
