//! Command router: classifies inbound events, gates them on ledger
//! readiness and turns them into work items.
//!
//! The router runs as one cooperative task. It never touches agreement
//! state itself; everything flows through the work channel to the pool.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use agbot_common::agreement::TerminationReason;
use agbot_common::messages::ProtocolMessage;
use agbot_common::policy::Policy;

use crate::error::BotError;
use crate::handler::{ConsumerHandler, ProtocolCapabilities};
use crate::ledger::LedgerEvent;
use crate::worker::{WorkItem, WorkKind};

/// Everything the outside world can tell the bot.
#[derive(Clone, Debug)]
pub enum Event {
    /// A sealed protocol message arrived on the bot's inbox.
    NewProtocolMessage {
        from: String,
        pub_key: String,
        message_id: String,
        payload: Value,
    },
    /// A raw event from a ledger client.
    BlockchainEvent {
        chain_type: String,
        name: String,
        org: String,
        raw: Value,
    },
    AgreementTimeout {
        agreement_id: String,
        reason: TerminationReason,
    },
    PolicyChanged {
        agreement_id: String,
    },
    PolicyDeleted {
        agreement_id: String,
    },
    WorkloadUpgrade {
        agreement_id: String,
    },
    /// Start a negotiation with a producer for a matched policy.
    MakeAgreement {
        device_id: String,
        policy: Policy,
    },
    BlockchainClientInitialized {
        chain_type: String,
        name: String,
        org: String,
        service_endpoint: String,
        service_port: u16,
        local_dir: PathBuf,
    },
    ClientStopping {
        chain_type: String,
        name: String,
        org: String,
    },
    AccountFunded {
        chain_type: String,
        name: String,
        org: String,
        service_endpoint: String,
        service_port: u16,
        local_dir: PathBuf,
    },
}

pub struct CommandRouter {
    handler: Arc<ConsumerHandler>,
    rx: UnboundedReceiver<Event>,
}

impl CommandRouter {
    pub fn new(handler: Arc<ConsumerHandler>, rx: UnboundedReceiver<Event>) -> Self {
        Self { handler, rx }
    }

    /// Drain events until every sender is gone. Shutdown is cooperative:
    /// closing the event channel stops intake, already-queued events are
    /// still routed.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = self.route(event).await {
                debug!("dropping event: {}", e);
            }
        }
        debug!("command router stopped");
    }

    pub async fn route(&self, event: Event) -> Result<(), BotError> {
        match event {
            Event::NewProtocolMessage { from, payload, .. } => {
                self.route_protocol_message(&from, &payload)
            }
            Event::BlockchainEvent {
                chain_type,
                name,
                org,
                raw,
            } => self.route_blockchain_event(&chain_type, &name, &org, &raw),
            Event::AgreementTimeout {
                agreement_id,
                reason,
            } => {
                self.enqueue(&agreement_id, WorkKind::AgreementTimeout { reason });
                Ok(())
            }
            Event::PolicyChanged { agreement_id } => {
                self.enqueue(&agreement_id, WorkKind::PolicyChanged);
                Ok(())
            }
            Event::PolicyDeleted { agreement_id } => {
                self.enqueue(&agreement_id, WorkKind::PolicyDeleted);
                Ok(())
            }
            Event::WorkloadUpgrade { agreement_id } => {
                self.enqueue(&agreement_id, WorkKind::WorkloadUpgrade);
                Ok(())
            }
            Event::MakeAgreement { device_id, policy } => {
                let agreement_id = self.handler.initiate_agreement(&device_id, policy);
                debug!("initiating agreement {} with {}", agreement_id, device_id);
                Ok(())
            }
            Event::BlockchainClientInitialized {
                chain_type,
                name,
                org,
                service_endpoint,
                service_port,
                local_dir,
            } => {
                self.handler.registry().set_ready(
                    &org,
                    &chain_type,
                    &name,
                    &service_endpoint,
                    service_port,
                    &local_dir,
                );
                Ok(())
            }
            Event::ClientStopping {
                chain_type,
                name,
                org,
            } => {
                self.handler
                    .registry()
                    .set_not_available(&org, &chain_type, &name);
                Ok(())
            }
            Event::AccountFunded {
                chain_type,
                name,
                org,
                service_endpoint,
                service_port,
                local_dir,
            } => {
                self.handler
                    .on_client_funded(
                        &org,
                        &chain_type,
                        &name,
                        &service_endpoint,
                        service_port,
                        &local_dir,
                    )
                    .await
            }
        }
    }

    fn route_protocol_message(&self, from: &str, payload: &Value) -> Result<(), BotError> {
        // The generic handler classifies before the ledger binding is known
        let generic = self.handler.registry().generic_handler();
        let message = generic.classify_message(payload)?;
        let agreement_id = message.agreement_id().to_string();
        match message {
            ProtocolMessage::Reply(reply) => {
                self.enqueue(&agreement_id, WorkKind::ReplyReceived { reply });
            }
            ProtocolMessage::ProducerUpdate(update) => {
                self.enqueue(&agreement_id, WorkKind::ProducerUpdate { update });
            }
            ProtocolMessage::ConsumerUpdateAck(_) => {
                self.enqueue(&agreement_id, WorkKind::ConsumerUpdateAck);
            }
            other => {
                debug!(
                    "consumer-bound inbox got a {} message from {}, dropping",
                    serde_json::to_value(&other)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string()),
                    from
                );
            }
        }
        Ok(())
    }

    fn route_blockchain_event(
        &self,
        chain_type: &str,
        name: &str,
        org: &str,
        raw: &Value,
    ) -> Result<(), BotError> {
        let registry = self.handler.registry();
        if !registry.is_ready(org, chain_type, name) {
            debug!(
                "event from ledger {}/{}/{} which is not ready, dropping",
                org, chain_type, name
            );
            return Ok(());
        }
        let Some(handler) = registry.get_handler(org, chain_type, name) else {
            return Ok(());
        };
        match handler.demux_event(raw) {
            LedgerEvent::AgreementCreated { agreement_id } => {
                self.enqueue(&agreement_id, WorkKind::BCRecorded);
            }
            LedgerEvent::ProducerTermination { agreement_id }
            | LedgerEvent::ConsumerTermination { agreement_id } => {
                self.enqueue(
                    &agreement_id,
                    WorkKind::BCTerminated {
                        reason: TerminationReason::Discovered,
                    },
                );
            }
            LedgerEvent::Other => {
                trace!("unrecognized ledger event, ignoring");
            }
        }
        Ok(())
    }

    fn enqueue(&self, agreement_id: &str, kind: WorkKind) {
        self.handler.queue().enqueue(WorkItem::new(
            agreement_id,
            self.handler.protocol(),
            kind,
        ));
    }
}
