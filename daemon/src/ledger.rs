//! Narrow interface onto a ledger client container.
//!
//! The bot never talks to a ledger directly: each ledger instance is served
//! by an external client process exposing a small local RPC surface. The
//! bot signs digests, writes finalized agreements, requests cancellations
//! and polls for presence through this trait; lifecycle events arrive
//! separately through the command router.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use agbot_common::crypto::{Hash, Signature};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger client is not ready")]
    NotReady,

    #[error("Ledger RPC failed: {0}")]
    Rpc(String),

    #[error("Ledger rejected the request: {0}")]
    Rejected(String),
}

/// A raw ledger event after demux. Anything the bot does not understand
/// demuxes to `Other` and is ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    AgreementCreated { agreement_id: String },
    ProducerTermination { agreement_id: String },
    ConsumerTermination { agreement_id: String },
    Other,
}

/// Everything a finalization write records on the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementWrite {
    pub agreement_id: String,
    pub proposal_hash: Hash,
    pub consumer_sig: Signature,
    pub producer_sig: Signature,
    pub consumer_address: String,
    pub producer_address: String,
}

/// Whether a cancellation could be submitted right away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanCancel {
    Now,
    /// Client not ready; the caller must defer and retry.
    Deferred,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// The bot's account address on this ledger.
    fn account(&self) -> String;

    /// Sign a message digest with the account key held by the client.
    async fn sign(&self, digest: &Hash) -> Result<Signature, LedgerError>;

    async fn write_agreement(&self, write: &AgreementWrite) -> Result<(), LedgerError>;

    async fn cancel_agreement(
        &self,
        agreement_id: &str,
        reason: u32,
    ) -> Result<CanCancel, LedgerError>;

    /// Poll whether an agreement with this id is recorded.
    async fn agreement_exists(&self, agreement_id: &str) -> Result<bool, LedgerError>;
}

/// HTTP adapter onto the client container's local RPC service.
pub struct RpcLedgerClient {
    http: reqwest::Client,
    endpoint: String,
    account: String,
}

impl RpcLedgerClient {
    pub fn new(service_endpoint: &str, service_port: u16, account: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("http://{}:{}/rpc", service_endpoint, service_port),
            account,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let body = json!({"method": method, "params": params});
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LedgerError::Rejected(format!(
                "{} returned {}",
                method,
                response.status()
            )));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(reply["result"].clone())
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    fn account(&self) -> String {
        self.account.clone()
    }

    async fn sign(&self, digest: &Hash) -> Result<Signature, LedgerError> {
        let result = self
            .call("sign", json!({"digest": digest.to_hex()}))
            .await?;
        let hex_sig = result
            .as_str()
            .ok_or_else(|| LedgerError::Rpc("sign returned no signature".to_string()))?;
        Signature::from_hex(hex_sig).map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn write_agreement(&self, write: &AgreementWrite) -> Result<(), LedgerError> {
        let params = serde_json::to_value(write).map_err(|e| LedgerError::Rpc(e.to_string()))?;
        self.call("writeAgreement", params).await?;
        Ok(())
    }

    async fn cancel_agreement(
        &self,
        agreement_id: &str,
        reason: u32,
    ) -> Result<CanCancel, LedgerError> {
        let result = self
            .call(
                "cancelAgreement",
                json!({"agreementId": agreement_id, "reason": reason}),
            )
            .await?;
        if result["canCancelNow"].as_bool().unwrap_or(false) {
            Ok(CanCancel::Now)
        } else {
            Ok(CanCancel::Deferred)
        }
    }

    async fn agreement_exists(&self, agreement_id: &str) -> Result<bool, LedgerError> {
        let result = self
            .call("agreementExists", json!({"agreementId": agreement_id}))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }
}
