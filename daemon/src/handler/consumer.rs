//! Consumer-side protocol state machine driver.
//!
//! One instance drives every agreement of one protocol. Work items arrive
//! from the shared channel; each is processed under the agreement lock as a
//! read-decide-persist step, and any network follow-up (exchange sends,
//! ledger writes, cancellations) runs after the lock is released. A failed
//! follow-up leaves the persisted state behind for the periodic sweeps to
//! redrive.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use agbot_common::agreement::{new_agreement_id, Agreement, AgreementState, TerminationReason};
use agbot_common::crypto::{canonical_json, seal_message, sha3_256, AccountKeys};
use agbot_common::messages::{
    BlockchainUpdate, FinalizedNotification, MeteringNotification, ProposalReply, ProtocolMessage,
    Proposal, UpdateAck,
};
use agbot_common::policy::Policy;
use agbot_common::time::get_current_time_in_seconds;

use crate::config::{Config, DEFAULT_DV_CHECK_RATE_SECS};
use crate::error::BotError;
use crate::exchange::ExchangeMessenger;
use crate::ledger::{AgreementWrite, CanCancel, LedgerClient};
use crate::locks::AgreementLocks;
use crate::registry::ClientRegistry;
use crate::store::{AgreementFilter, AgreementStore};
use crate::worker::{WorkItem, WorkKind, WorkProcessor, WorkQueue};

use super::ProtocolCapabilities;

/// Request to instantiate a ledger client container for an instance the
/// bot does not have yet.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBCContainer {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub name: String,
    pub org: String,
    pub exchange_url: String,
    pub bot_id: String,
    pub token: String,
}

/// Network work produced by a dispatch step, run after the agreement lock
/// is released.
enum FollowUp {
    Send {
        device_id: String,
        message: ProtocolMessage,
        /// Archive with this reason if the send fails.
        failure_reason: Option<TerminationReason>,
    },
    LedgerWrite {
        write: AgreementWrite,
        ledger: Arc<dyn LedgerClient>,
    },
    LedgerCancel {
        reason: TerminationReason,
        ledger: Option<Arc<dyn LedgerClient>>,
    },
    RequestClient {
        chain_type: String,
        name: String,
        org: String,
    },
    Enqueue(WorkKind),
}

pub struct ConsumerHandler {
    config: Config,
    keys: Arc<AccountKeys>,
    store: Arc<dyn AgreementStore>,
    registry: Arc<ClientRegistry>,
    locks: AgreementLocks,
    messenger: Arc<dyn ExchangeMessenger>,
    queue: Arc<WorkQueue>,
    container_tx: UnboundedSender<NewBCContainer>,
}

impl ConsumerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        keys: Arc<AccountKeys>,
        store: Arc<dyn AgreementStore>,
        registry: Arc<ClientRegistry>,
        messenger: Arc<dyn ExchangeMessenger>,
        queue: Arc<WorkQueue>,
        container_tx: UnboundedSender<NewBCContainer>,
    ) -> Self {
        Self {
            config,
            keys,
            store,
            registry,
            locks: AgreementLocks::new(),
            messenger,
            queue,
            container_tx,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.config.protocol
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Start a new negotiation: pick an id and enqueue the proposal work.
    pub fn initiate_agreement(&self, device_id: &str, policy: Policy) -> String {
        let agreement_id = new_agreement_id();
        self.queue.enqueue(WorkItem::new(
            &agreement_id,
            self.protocol(),
            WorkKind::MakeProposal {
                device_id: device_id.to_string(),
                policy,
            },
        ));
        agreement_id
    }

    async fn handle_work_item(&self, item: WorkItem) -> Result<(), BotError> {
        counter!("agbot_work_items").increment(1);
        let guard = self.locks.lock(&item.agreement_id).await;
        let followups = self.dispatch(&item).await?;
        drop(guard);
        self.perform(&item, followups).await
    }

    async fn dispatch(&self, item: &WorkItem) -> Result<Vec<FollowUp>, BotError> {
        match &item.kind {
            WorkKind::MakeProposal { device_id, policy } => {
                self.make_proposal(item, device_id, policy.clone()).await
            }
            WorkKind::ReplyReceived { reply } => self.reply_received(item, reply).await,
            WorkKind::ProducerUpdate { update } => self.producer_update(item, update).await,
            WorkKind::ConsumerUpdateAck => self.consumer_update_ack(item).await,
            WorkKind::AsyncUpdate => self.async_update(item).await,
            WorkKind::AsyncWrite => self.async_write(item).await,
            WorkKind::BCRecorded => self.bc_recorded(item).await,
            WorkKind::BCTerminated { reason } => self.bc_terminated(item, *reason).await,
            WorkKind::AgreementTimeout { reason } => self.begin_termination(item, *reason).await,
            WorkKind::PolicyChanged | WorkKind::PolicyDeleted => {
                self.begin_termination(item, TerminationReason::PolicyChanged)
                    .await
            }
            WorkKind::WorkloadUpgrade => {
                self.begin_termination(item, TerminationReason::ForcedUpgrade)
                    .await
            }
        }
    }

    async fn perform(&self, item: &WorkItem, followups: Vec<FollowUp>) -> Result<(), BotError> {
        for followup in followups {
            match followup {
                FollowUp::Send {
                    device_id,
                    message,
                    failure_reason,
                } => {
                    if let Err(e) = self.send_message(&device_id, &message).await {
                        warn!(
                            "send to {} for agreement {} failed: {}",
                            device_id, item.agreement_id, e
                        );
                        if let Some(reason) = failure_reason {
                            self.archive_with(&item.agreement_id, reason).await?;
                        }
                    }
                }
                FollowUp::LedgerWrite { write, ledger } => {
                    if let Err(e) = ledger.write_agreement(&write).await {
                        warn!(
                            "ledger write for agreement {} failed: {}",
                            item.agreement_id, e
                        );
                        counter!("agbot_ledger_write_failures").increment(1);
                        self.mark_write_failed(&item.agreement_id).await?;
                    }
                }
                FollowUp::LedgerCancel { reason, ledger } => {
                    self.perform_cancel(&item.agreement_id, reason, ledger).await?;
                }
                FollowUp::RequestClient {
                    chain_type,
                    name,
                    org,
                } => {
                    self.request_client(&chain_type, &name, &org);
                }
                FollowUp::Enqueue(kind) => {
                    self.queue
                        .enqueue(WorkItem::new(&item.agreement_id, &item.protocol, kind));
                }
            }
        }
        Ok(())
    }

    async fn send_message(
        &self,
        device_id: &str,
        message: &ProtocolMessage,
    ) -> Result<(), BotError> {
        let payload = serde_json::to_value(message)?;
        let receiver = self.messenger.device_public(device_id).await?;
        let envelope = seal_message(&payload, &self.keys, &receiver)?;
        self.messenger.send(device_id, &envelope).await?;
        Ok(())
    }

    /// Emit a request for a ledger client the bot does not have yet.
    pub fn request_client(&self, chain_type: &str, name: &str, org: &str) {
        let request = NewBCContainer {
            chain_type: chain_type.to_string(),
            name: name.to_string(),
            org: org.to_string(),
            exchange_url: self.config.exchange_url.clone(),
            bot_id: self.config.bot_id.clone(),
            token: self.config.token.clone(),
        };
        if self.container_tx.send(request).is_err() {
            debug!("container channel closed, dropping client request");
        }
    }

    fn bound_ledger(&self, agreement: &Agreement) -> Option<Arc<dyn LedgerClient>> {
        self.registry
            .get_handler(
                &agreement.ledger_org,
                &agreement.ledger_type,
                &agreement.ledger_name,
            )
            .and_then(|handler| handler.ledger().cloned())
    }

    // ---- transitions, each under the agreement lock ----

    async fn make_proposal(
        &self,
        item: &WorkItem,
        device_id: &str,
        policy: Policy,
    ) -> Result<Vec<FollowUp>, BotError> {
        // The policy is authoritative for the version; never downgrade.
        let version = policy.protocol_version()?;
        if let Some(existing) = self.store.get(&item.protocol, &item.agreement_id).await? {
            if !existing.archived {
                debug!("agreement {} already exists, skipping proposal", item.agreement_id);
                return Ok(Vec::new());
            }
        }

        let proposal = Proposal {
            agreement_id: item.agreement_id.clone(),
            protocol: item.protocol.clone(),
            version,
            consumer_id: self.config.bot_id.clone(),
            tsandcs: policy.clone(),
        };
        let handler = self.registry.generic_handler();
        let (digest, signature) = handler.sign_proposal(&proposal).await?;

        let mut agreement = Agreement::new(
            item.agreement_id.clone(),
            item.protocol.clone(),
            version,
            device_id.to_string(),
            policy,
            get_current_time_in_seconds(),
        );
        agreement.proposal_hash = Some(digest);
        agreement.consumer_proposal_sig = Some(signature);
        if agreement.policy.data_verification.enabled && agreement.dv_check_rate_sec == 0 {
            agreement.dv_check_rate_sec = DEFAULT_DV_CHECK_RATE_SECS;
        }
        self.store.save_new(&agreement).await?;
        counter!("agbot_agreements_proposed").increment(1);
        info!(
            "proposing agreement {} (v{}) to {}",
            agreement.id, version, device_id
        );

        Ok(vec![FollowUp::Send {
            device_id: device_id.to_string(),
            message: ProtocolMessage::Proposal(proposal),
            failure_reason: Some(TerminationReason::NoReply),
        }])
    }

    async fn reply_received(
        &self,
        item: &WorkItem,
        reply: &ProposalReply,
    ) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            debug!("reply for unknown agreement {}", item.agreement_id);
            return Ok(Vec::new());
        };
        if agreement.archived || agreement.state() != AgreementState::Proposed {
            debug!(
                "late or duplicate reply for agreement {} in {:?}",
                agreement.id,
                agreement.state()
            );
            return Ok(Vec::new());
        }

        if !reply.decision {
            agreement.termination_reason = Some(TerminationReason::NegativeReply);
            agreement.archived = true;
            self.store.persist(&agreement).await?;
            counter!("agbot_agreements_terminated").increment(1);
            info!("agreement {} declined by producer", agreement.id);
            return Ok(Vec::new());
        }

        let Some(bc) = &reply.blockchain else {
            debug!("positive reply without a ledger reference, dropping");
            return Ok(Vec::new());
        };
        agreement.ledger_type = bc.chain_type.clone();
        agreement.ledger_name = bc.name.clone();
        agreement.ledger_org = bc.org.clone();
        agreement.producer_proposal_sig = reply.signature;

        if !agreement.is_version2() {
            if reply.producer_address.is_empty() {
                debug!("v1 reply without a producer address, dropping");
                return Ok(Vec::new());
            }
            // v1 records directly against the reply's ledger instance
            agreement.counterparty_address = reply.producer_address.clone();
            self.store.persist(&agreement).await?;
            return Ok(vec![FollowUp::Enqueue(WorkKind::AsyncWrite)]);
        }

        if self
            .registry
            .is_writable(&bc.org, &bc.chain_type, &bc.name)
        {
            agreement.bc_ready_time = get_current_time_in_seconds();
            self.store.persist(&agreement).await?;
            Ok(vec![
                FollowUp::Enqueue(WorkKind::AsyncUpdate),
                FollowUp::Enqueue(WorkKind::AsyncWrite),
            ])
        } else {
            self.store.persist(&agreement).await?;
            // Park the update work until the ledger is funded and ask for
            // the client to be brought up.
            self.queue.defer(WorkItem::new(
                &item.agreement_id,
                &item.protocol,
                WorkKind::AsyncUpdate,
            ));
            self.queue.defer(WorkItem::new(
                &item.agreement_id,
                &item.protocol,
                WorkKind::AsyncWrite,
            ));
            Ok(vec![FollowUp::RequestClient {
                chain_type: bc.chain_type.clone(),
                name: bc.name.clone(),
                org: bc.org.clone(),
            }])
        }
    }

    async fn producer_update(
        &self,
        item: &WorkItem,
        update: &BlockchainUpdate,
    ) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            debug!("producer update for unknown agreement {}", item.agreement_id);
            return Ok(Vec::new());
        };
        if agreement.archived || agreement.finalized_time > 0 || !agreement.is_version2() {
            debug!("ignoring producer update for agreement {}", agreement.id);
            return Ok(Vec::new());
        }
        let Some(signature) = update.signature else {
            debug!("producer update without a signature, dropping");
            return Ok(Vec::new());
        };
        if update.address.is_empty() {
            debug!("producer update without an address, dropping");
            return Ok(Vec::new());
        }

        agreement.counterparty_address = update.address.clone();
        agreement.producer_proposal_sig = Some(signature);
        if let Some(bc) = &update.blockchain {
            // The producer update is authoritative for the instance org
            agreement.ledger_org = bc.org.clone();
        }
        self.store.persist(&agreement).await?;

        let mut followups = vec![FollowUp::Send {
            device_id: agreement.device_id.clone(),
            message: ProtocolMessage::ProducerUpdateAck(UpdateAck {
                agreement_id: agreement.id.clone(),
                protocol: agreement.protocol.clone(),
                version: agreement.protocol_version,
            }),
            failure_reason: None,
        }];
        if agreement.bc_update_ack_time > 0 {
            followups.push(FollowUp::Enqueue(WorkKind::AsyncWrite));
        }
        Ok(followups)
    }

    async fn consumer_update_ack(&self, item: &WorkItem) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            debug!("update ack for unknown agreement {}", item.agreement_id);
            return Ok(Vec::new());
        };
        if agreement.archived || agreement.finalized_time > 0 || !agreement.is_version2() {
            return Ok(Vec::new());
        }
        if agreement.bc_update_ack_time == 0 {
            agreement.bc_update_ack_time = get_current_time_in_seconds();
            self.store.persist(&agreement).await?;
            debug!("consumer update acked for agreement {}", agreement.id);
        }
        if agreement.fully_signed() {
            return Ok(vec![FollowUp::Enqueue(WorkKind::AsyncWrite)]);
        }
        Ok(Vec::new())
    }

    /// Send the consumer's ledger address and proposal signature to the
    /// producer (v2).
    async fn async_update(&self, item: &WorkItem) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            return Ok(Vec::new());
        };
        // Duplicate deferrals for an already-progressed agreement are
        // dropped here, after the re-read under the lock.
        if agreement.archived
            || agreement.finalized_time > 0
            || agreement.termination_reason.is_some()
            || !agreement.is_version2()
            || agreement.bc_update_ack_time > 0
        {
            return Ok(Vec::new());
        }
        if !self.registry.is_writable(
            &agreement.ledger_org,
            &agreement.ledger_type,
            &agreement.ledger_name,
        ) {
            self.queue.defer(item.clone());
            return Ok(Vec::new());
        }
        let Some(handler) = self.registry.get_handler(
            &agreement.ledger_org,
            &agreement.ledger_type,
            &agreement.ledger_name,
        ) else {
            self.queue.defer(item.clone());
            return Ok(Vec::new());
        };

        let now = get_current_time_in_seconds();
        if agreement.bc_ready_time == 0 {
            agreement.bc_ready_time = now;
        }
        agreement.update_sent_time = now;
        self.store.persist(&agreement).await?;

        Ok(vec![FollowUp::Send {
            device_id: agreement.device_id.clone(),
            message: ProtocolMessage::ConsumerUpdate(BlockchainUpdate {
                agreement_id: agreement.id.clone(),
                protocol: agreement.protocol.clone(),
                version: agreement.protocol_version,
                address: handler.account_address(),
                signature: agreement.consumer_proposal_sig,
                blockchain: None,
            }),
            failure_reason: None,
        }])
    }

    /// Record the agreement on the ledger. A single writer per agreement:
    /// the write marker is set under the lock before the write runs.
    async fn async_write(&self, item: &WorkItem) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            return Ok(Vec::new());
        };
        if agreement.archived
            || agreement.finalized_time > 0
            || agreement.termination_reason.is_some()
        {
            return Ok(Vec::new());
        }
        if agreement.bc_write_time > 0 && !agreement.bc_write_failed {
            // Already written; waiting on the created event or the deadline
            return Ok(Vec::new());
        }
        let (Some(proposal_hash), Some(consumer_sig)) =
            (agreement.proposal_hash, agreement.consumer_proposal_sig)
        else {
            debug!("agreement {} has no signed proposal, cannot write", agreement.id);
            return Ok(Vec::new());
        };
        let Some(producer_sig) = agreement.producer_proposal_sig else {
            // Producer side not complete yet; a later event re-enqueues
            return Ok(Vec::new());
        };
        if agreement.counterparty_address.is_empty() {
            return Ok(Vec::new());
        }
        if agreement.is_version2() && agreement.bc_update_ack_time == 0 {
            // Both sides must agree the instance before the write
            return Ok(Vec::new());
        }

        let Some(handler) = self.registry.get_handler(
            &agreement.ledger_org,
            &agreement.ledger_type,
            &agreement.ledger_name,
        ) else {
            self.queue.defer(item.clone());
            return Ok(vec![FollowUp::RequestClient {
                chain_type: agreement.ledger_type.clone(),
                name: agreement.ledger_name.clone(),
                org: agreement.ledger_org.clone(),
            }]);
        };
        let Some(ledger) = handler.ledger().cloned() else {
            self.queue.defer(item.clone());
            return Ok(Vec::new());
        };

        agreement.bc_write_time = get_current_time_in_seconds();
        agreement.bc_write_failed = false;
        self.store.persist(&agreement).await?;

        Ok(vec![FollowUp::LedgerWrite {
            write: AgreementWrite {
                agreement_id: agreement.id.clone(),
                proposal_hash,
                consumer_sig,
                producer_sig,
                consumer_address: handler.account_address(),
                producer_address: agreement.counterparty_address.clone(),
            },
            ledger,
        }])
    }

    async fn bc_recorded(&self, item: &WorkItem) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            debug!("created event for unknown agreement {}", item.agreement_id);
            return Ok(Vec::new());
        };
        if agreement.archived
            || agreement.finalized_time > 0
            || agreement.termination_reason.is_some()
        {
            debug!("late created event for agreement {}, ignoring", agreement.id);
            return Ok(Vec::new());
        }
        if agreement.proposal_hash.is_none() || !agreement.fully_signed() {
            warn!(
                "created event for agreement {} without a fully signed proposal",
                agreement.id
            );
            return Ok(Vec::new());
        }

        agreement.finalized_time = get_current_time_in_seconds();
        agreement.bc_write_failed = false;
        self.store.persist(&agreement).await?;
        counter!("agbot_agreements_finalized").increment(1);
        info!("agreement {} finalized", agreement.id);

        Ok(vec![FollowUp::Send {
            device_id: agreement.device_id.clone(),
            message: ProtocolMessage::Finalized(FinalizedNotification {
                agreement_id: agreement.id.clone(),
                protocol: agreement.protocol.clone(),
                version: agreement.protocol_version,
            }),
            failure_reason: None,
        }])
    }

    async fn bc_terminated(
        &self,
        item: &WorkItem,
        reason: TerminationReason,
    ) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            return Ok(Vec::new());
        };
        if agreement.archived {
            return Ok(Vec::new());
        }
        // The cancellation is already on the ledger; nothing to write back
        agreement.termination_reason = Some(reason);
        agreement.archived = true;
        self.store.persist(&agreement).await?;
        counter!("agbot_agreements_terminated").increment(1);
        info!("agreement {} terminated: {}", agreement.id, reason);
        Ok(Vec::new())
    }

    /// Start (or redrive) termination. Persists the reason first so a
    /// failed cancellation write can be retried by the sweeps; the
    /// counterparty learns of the cancel through the ledger, never through
    /// a direct message.
    async fn begin_termination(
        &self,
        item: &WorkItem,
        reason: TerminationReason,
    ) -> Result<Vec<FollowUp>, BotError> {
        let Some(mut agreement) = self.store.get(&item.protocol, &item.agreement_id).await?
        else {
            return Ok(Vec::new());
        };
        if agreement.archived {
            return Ok(Vec::new());
        }
        let reason = *agreement.termination_reason.get_or_insert(reason);
        self.store.persist(&agreement).await?;

        let ledger = if agreement.bc_write_time > 0 || agreement.finalized_time > 0 {
            self.bound_ledger(&agreement)
        } else {
            // Nothing was ever recorded; archive without a ledger write
            None
        };
        Ok(vec![FollowUp::LedgerCancel { reason, ledger }])
    }

    async fn perform_cancel(
        &self,
        agreement_id: &str,
        reason: TerminationReason,
        ledger: Option<Arc<dyn LedgerClient>>,
    ) -> Result<(), BotError> {
        let Some(ledger) = ledger else {
            return self.archive_with(agreement_id, reason).await;
        };
        match ledger.cancel_agreement(agreement_id, reason.code()).await {
            Ok(CanCancel::Now) => self.archive_with(agreement_id, reason).await,
            Ok(CanCancel::Deferred) => {
                self.queue.defer(WorkItem::new(
                    agreement_id,
                    self.protocol(),
                    WorkKind::AgreementTimeout { reason },
                ));
                Ok(())
            }
            Err(e) => {
                // Reason is persisted; the finalization sweep redrives
                warn!("cancel write for agreement {} failed: {}", agreement_id, e);
                Ok(())
            }
        }
    }

    async fn archive_with(
        &self,
        agreement_id: &str,
        reason: TerminationReason,
    ) -> Result<(), BotError> {
        let _guard = self.locks.lock(agreement_id).await;
        let Some(mut agreement) = self.store.get(self.protocol(), agreement_id).await? else {
            return Ok(());
        };
        if agreement.archived {
            return Ok(());
        }
        agreement.termination_reason = Some(reason);
        agreement.archived = true;
        self.store.persist(&agreement).await?;
        counter!("agbot_agreements_terminated").increment(1);
        info!("agreement {} archived: {}", agreement_id, reason);
        Ok(())
    }

    async fn mark_write_failed(&self, agreement_id: &str) -> Result<(), BotError> {
        let _guard = self.locks.lock(agreement_id).await;
        let Some(mut agreement) = self.store.get(self.protocol(), agreement_id).await? else {
            return Ok(());
        };
        if agreement.archived || agreement.finalized_time > 0 {
            return Ok(());
        }
        agreement.bc_write_failed = true;
        self.store.persist(&agreement).await?;
        Ok(())
    }

    // ---- registry events ----

    /// A ledger account became funded: the instance is now writable and
    /// every v2 agreement still waiting on an update ack gets its update
    /// and write work re-enqueued. Idempotent; workers drop duplicates
    /// after the re-read under the agreement lock.
    pub async fn on_client_funded(
        &self,
        org: &str,
        chain_type: &str,
        name: &str,
        endpoint: &str,
        port: u16,
        dir: &std::path::Path,
    ) -> Result<(), BotError> {
        self.registry
            .set_writable(org, chain_type, name, endpoint, port, dir);
        let released = self.queue.release_deferred();
        if released > 0 {
            debug!("released {} deferred items after funding", released);
        }

        let filter = AgreementFilter::unarchived()
            .protocol(self.protocol())
            .version(2)
            .finalized(false)
            .ledger(chain_type, name, org);
        for agreement in self.store.find(&filter).await? {
            if agreement.bc_update_ack_time == 0 {
                self.queue.enqueue(WorkItem::new(
                    &agreement.id,
                    &agreement.protocol,
                    WorkKind::AsyncUpdate,
                ));
                self.queue.enqueue(WorkItem::new(
                    &agreement.id,
                    &agreement.protocol,
                    WorkKind::AsyncWrite,
                ));
            }
        }
        Ok(())
    }

    // ---- periodic sweeps, driven by the sweep driver ----

    /// Finalization-deadline sweep: poll the ledger for written agreements,
    /// terminate the ones past the deadline and redrive stuck cancels.
    pub async fn finalization_sweep(&self) -> Result<(), BotError> {
        let now = get_current_time_in_seconds();
        let filter = AgreementFilter::unarchived().protocol(self.protocol());
        for agreement in self.store.find(&filter).await? {
            if agreement.finalized_time > 0 {
                // Presence check: a recorded agreement that disappears from
                // the ledger is terminated as missing
                if let Some(ledger) = self.bound_ledger(&agreement) {
                    if let Ok(false) = ledger.agreement_exists(&agreement.id).await {
                        self.queue.enqueue(WorkItem::new(
                            &agreement.id,
                            &agreement.protocol,
                            WorkKind::AgreementTimeout {
                                reason: TerminationReason::AgreementMissing,
                            },
                        ));
                    }
                }
                continue;
            }
            if let Some(reason) = agreement.termination_reason {
                // Cancel write still pending; redrive it
                self.queue.enqueue(WorkItem::new(
                    &agreement.id,
                    &agreement.protocol,
                    WorkKind::AgreementTimeout { reason },
                ));
                continue;
            }
            if agreement.bc_write_time > 0 && !agreement.bc_write_failed {
                // Poll for the created event in case it was missed
                if let Some(ledger) = self.bound_ledger(&agreement) {
                    if let Ok(true) = ledger.agreement_exists(&agreement.id).await {
                        self.queue.enqueue(WorkItem::new(
                            &agreement.id,
                            &agreement.protocol,
                            WorkKind::BCRecorded,
                        ));
                        continue;
                    }
                }
            }
            if now.saturating_sub(agreement.creation_time) > self.config.agreement_timeout_secs {
                let reason = if !agreement.reply_recorded() {
                    TerminationReason::NoReply
                } else if agreement.bc_write_failed {
                    TerminationReason::BcWriteFailed
                } else {
                    TerminationReason::NotFinalizedTimeout
                };
                self.queue.enqueue(WorkItem::new(
                    &agreement.id,
                    &agreement.protocol,
                    WorkKind::AgreementTimeout { reason },
                ));
            }
        }
        Ok(())
    }

    /// Data-verification sweep over finalized agreements, plus metering.
    pub async fn data_verification_sweep(&self) -> Result<(), BotError> {
        let now = get_current_time_in_seconds();
        let filter = AgreementFilter::unarchived()
            .protocol(self.protocol())
            .finalized(true);
        for agreement in self.store.find(&filter).await? {
            if agreement.policy.data_verification.enabled && agreement.dv_check_rate_sec > 0 {
                let anchor = agreement
                    .data_received_time
                    .max(agreement.finalized_time);
                let due = anchor
                    + agreement.dv_check_rate_sec * (u64::from(agreement.dv_missed_count) + 1);
                if now >= due {
                    self.data_verification_check(&agreement.protocol, &agreement.id)
                        .await?;
                }
            }
            self.metering_check(&agreement.protocol, &agreement.id, now)
                .await?;
        }
        Ok(())
    }

    async fn data_verification_check(&self, protocol: &str, id: &str) -> Result<(), BotError> {
        // Exchange I/O happens before the lock is taken
        let Some(snapshot) = self.store.get(protocol, id).await? else {
            return Ok(());
        };
        let received = self
            .messenger
            .data_received(&snapshot.device_id, id)
            .await
            .unwrap_or(false);
        let heartbeat = self
            .messenger
            .heartbeat_ok(&snapshot.device_id)
            .await
            .unwrap_or(true);

        let _guard = self.locks.lock(id).await;
        let Some(mut agreement) = self.store.get(protocol, id).await? else {
            return Ok(());
        };
        if agreement.archived || agreement.finalized_time == 0 {
            return Ok(());
        }
        if !heartbeat {
            self.queue.enqueue(WorkItem::new(
                id,
                protocol,
                WorkKind::AgreementTimeout {
                    reason: TerminationReason::NodeHeartbeat,
                },
            ));
            return Ok(());
        }
        if received {
            agreement.data_received_time = get_current_time_in_seconds();
            agreement.dv_missed_count = 0;
            self.store.persist(&agreement).await?;
        } else {
            agreement.dv_missed_count += 1;
            self.store.persist(&agreement).await?;
            if agreement.dv_missed_count > agreement.policy.data_verification.missed_interval_limit
            {
                debug!(
                    "agreement {} missed {} data checks, terminating",
                    agreement.id, agreement.dv_missed_count
                );
                self.queue.enqueue(WorkItem::new(
                    id,
                    protocol,
                    WorkKind::AgreementTimeout {
                        reason: TerminationReason::NoDataReceived,
                    },
                ));
            }
        }
        Ok(())
    }

    /// Send a signed metering record when both signatures are present and
    /// the policy meters usage.
    async fn metering_check(
        &self,
        protocol: &str,
        id: &str,
        now: u64,
    ) -> Result<(), BotError> {
        let Some(snapshot) = self.store.get(protocol, id).await? else {
            return Ok(());
        };
        let metering = &snapshot.policy.metering;
        if !metering.enabled
            || !snapshot.fully_signed()
            || metering.notification_interval_sec == 0
            || now.saturating_sub(snapshot.last_metering_time) < metering.notification_interval_sec
        {
            return Ok(());
        }

        let mut notification = MeteringNotification {
            agreement_id: snapshot.id.clone(),
            protocol: snapshot.protocol.clone(),
            version: snapshot.protocol_version,
            tokens: metering.tokens,
            per_time_unit: metering.per_time_unit.clone(),
            current_time: now,
            signature: None,
        };
        let digest = sha3_256(canonical_json(&serde_json::to_value(&notification)?).as_bytes());
        notification.signature = Some(self.keys.sign_digest(&digest));

        {
            let _guard = self.locks.lock(id).await;
            let Some(mut agreement) = self.store.get(protocol, id).await? else {
                return Ok(());
            };
            if agreement.archived {
                return Ok(());
            }
            agreement.last_metering_time = now;
            self.store.persist(&agreement).await?;
        }

        let device_id = snapshot.device_id.clone();
        if let Err(e) = self
            .send_message(&device_id, &ProtocolMessage::Metering(notification))
            .await
        {
            warn!("metering notification for agreement {} failed: {}", id, e);
        }
        Ok(())
    }

    /// Ledger-presence sweep: ask for missing clients serving v2
    /// agreements and redrive consumer updates that were never acked.
    pub async fn client_presence_sweep(&self) -> Result<(), BotError> {
        let filter = AgreementFilter::unarchived()
            .protocol(self.protocol())
            .version(2)
            .finalized(false);
        for agreement in self.store.find(&filter).await? {
            if agreement.ledger_type.is_empty() || agreement.termination_reason.is_some() {
                continue;
            }
            if !self.registry.is_ready(
                &agreement.ledger_org,
                &agreement.ledger_type,
                &agreement.ledger_name,
            ) {
                self.request_client(
                    &agreement.ledger_type,
                    &agreement.ledger_name,
                    &agreement.ledger_org,
                );
            } else if agreement.update_sent_time > 0
                && agreement.bc_update_ack_time == 0
                && self.registry.is_writable(
                    &agreement.ledger_org,
                    &agreement.ledger_type,
                    &agreement.ledger_name,
                )
            {
                // The consumer update may have been lost; send it again
                self.queue.enqueue(WorkItem::new(
                    &agreement.id,
                    &agreement.protocol,
                    WorkKind::AsyncUpdate,
                ));
            }
        }
        self.locks.prune();
        Ok(())
    }
}

#[async_trait]
impl WorkProcessor for ConsumerHandler {
    async fn process(&self, item: WorkItem) -> Result<(), BotError> {
        self.handle_work_item(item).await
    }
}
