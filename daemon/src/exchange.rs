//! Outbound adapter onto the exchange message bus.
//!
//! The exchange carries sealed envelopes between the bot and producer
//! nodes and answers a few queries about producers (public keys, posted
//! data, heartbeat liveness). The HTTP API itself is external; the bot
//! consumes it through this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use agbot_common::crypto::{AccountPublic, ExchangeEnvelope};
use agbot_common::pattern::Pattern;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Exchange request failed: {0}")]
    Http(String),

    #[error("Exchange returned status {0}")]
    Status(u16),

    #[error("No public key registered for device {0}")]
    MissingKey(String),
}

/// A sealed message waiting in the bot's exchange inbox.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub message_id: String,
    pub from: String,
    #[serde(default)]
    pub pub_key: String,
    pub envelope: ExchangeEnvelope,
}

#[async_trait]
pub trait ExchangeMessenger: Send + Sync {
    /// Public key material a producer registered with the exchange.
    async fn device_public(&self, device_id: &str) -> Result<AccountPublic, ExchangeError>;

    /// Sealed messages waiting in the bot's inbox.
    async fn poll_inbox(&self) -> Result<Vec<InboxMessage>, ExchangeError>;

    /// Remove a consumed message from the inbox.
    async fn delete_message(&self, message_id: &str) -> Result<(), ExchangeError>;

    /// Deliver a sealed envelope to a producer's inbox.
    async fn send(
        &self,
        device_id: &str,
        envelope: &ExchangeEnvelope,
    ) -> Result<(), ExchangeError>;

    /// Whether the producer has posted data for this agreement since the
    /// last check window.
    async fn data_received(
        &self,
        device_id: &str,
        agreement_id: &str,
    ) -> Result<bool, ExchangeError>;

    /// Whether the producer's heartbeat is current.
    async fn heartbeat_ok(&self, device_id: &str) -> Result<bool, ExchangeError>;

    /// Pattern definitions published under one org, keyed by pattern id.
    async fn patterns(&self, org: &str) -> Result<HashMap<String, Pattern>, ExchangeError>;
}

/// Thin reqwest-based implementation of the exchange API.
pub struct HttpExchangeMessenger {
    http: reqwest::Client,
    base_url: String,
    bot_id: String,
    token: String,
}

impl HttpExchangeMessenger {
    pub fn new(base_url: &str, bot_id: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_id: bot_id.to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl ExchangeMessenger for HttpExchangeMessenger {
    async fn poll_inbox(&self) -> Result<Vec<InboxMessage>, ExchangeError> {
        let response = self
            .http
            .get(self.url(&format!("bots/{}/msgs", self.bot_id)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ExchangeError> {
        let response = self
            .http
            .delete(self.url(&format!("bots/{}/msgs/{}", self.bot_id, message_id)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn device_public(&self, device_id: &str) -> Result<AccountPublic, ExchangeError> {
        let response = self
            .http
            .get(self.url(&format!("devices/{}/keys", device_id)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if response.status().as_u16() == 404 {
            return Err(ExchangeError::MissingKey(device_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))
    }

    async fn send(
        &self,
        device_id: &str,
        envelope: &ExchangeEnvelope,
    ) -> Result<(), ExchangeError> {
        let response = self
            .http
            .post(self.url(&format!("devices/{}/msgs", device_id)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .json(envelope)
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn data_received(
        &self,
        device_id: &str,
        agreement_id: &str,
    ) -> Result<bool, ExchangeError> {
        let response = self
            .http
            .get(self.url(&format!(
                "devices/{}/agreements/{}/data",
                device_id, agreement_id
            )))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn heartbeat_ok(&self, device_id: &str) -> Result<bool, ExchangeError> {
        let response = self
            .http
            .get(self.url(&format!("devices/{}/heartbeat", device_id)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn patterns(&self, org: &str) -> Result<HashMap<String, Pattern>, ExchangeError> {
        let response = self
            .http
            .get(self.url(&format!("orgs/{}/patterns", org)))
            .basic_auth(&self.bot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))
    }
}
