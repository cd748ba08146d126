//! Quota node: one party's flows, vault and responder
//!
//! # Example
//!
//! ```no_run
//! use quota_core::{spawn_notary, Identity, Network, NodeBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> quota_core::Result<()> {
//!     let network = Network::new();
//!     let notary = spawn_notary(Identity::generate("Notary"), 1000);
//!
//!     let mill = NodeBuilder::new(Identity::generate("Mill"), Arc::new(notary), network.clone())
//!         .start()?;
//!     let buyer = NodeBuilder::new(Identity::generate("Buyer"), mill.notary(), network.clone())
//!         .start()?;
//!
//!     mill.issue(100).await?;
//!     mill.transfer(mill.party(), 40, buyer.party()).await?;
//!     Ok(())
//! }
//! ```

use crate::builder::{assemble_issue, assemble_transfer, TransactionBuilder};
use crate::contract::checked_sum;
use crate::error::FinalityError;
use crate::flow::{
    CheckpointStore, CounterpartyState, FlowCheckpoint, FlowEvent, FlowState, FlowStep,
    InitiatorFlow, MemoryCheckpointStore,
};
use crate::identity::Identity;
use crate::metrics::{FlowOutcome, Metrics};
use crate::network::{Network, SignResponse};
use crate::notary::FinalityService;
use crate::responder::{AcceptAll, CounterpartyFlows, Responder, SigningPolicy};
use crate::storage::Storage;
use crate::types::{Party, SignedTransaction, StateAndRef, TxId};
use crate::vault::{MemoryVault, PersistentVault, SoftLockTable, VaultService};
use crate::{Config, Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Assembles a [`Node`]
pub struct NodeBuilder {
    identity: Identity,
    notary: Arc<dyn FinalityService>,
    network: Network,
    config: Config,
    vault: Option<Arc<dyn VaultService>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    policy: Arc<dyn SigningPolicy>,
}

impl NodeBuilder {
    /// Node for `identity`, finalizing through `notary`
    pub fn new(identity: Identity, notary: Arc<dyn FinalityService>, network: Network) -> Self {
        Self {
            identity,
            notary,
            network,
            config: Config::default(),
            vault: None,
            checkpoints: None,
            policy: Arc::new(AcceptAll),
        }
    }

    /// Use `config` instead of the defaults
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a specific vault
    pub fn vault(mut self, vault: Arc<dyn VaultService>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Use a specific checkpoint store
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Extra checks applied before signing as counterparty
    pub fn signing_policy(mut self, policy: Arc<dyn SigningPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Register on the network and start the responder
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Node> {
        let party = self.identity.party().clone();

        let (default_vault, default_checkpoints): (
            Arc<dyn VaultService>,
            Arc<dyn CheckpointStore>,
        ) = if self.config.persistent && (self.vault.is_none() || self.checkpoints.is_none()) {
            let storage = Arc::new(Storage::open(&self.config)?);
            let stats = storage.get_stats()?;
            tracing::info!(
                party = %party,
                unspent_records = stats.unspent_records,
                transactions = stats.total_transactions,
                in_flight_flows = stats.in_flight_flows,
                "Quota store opened"
            );
            (Arc::new(PersistentVault::new(party.clone(), storage.clone())), storage)
        } else {
            (
                Arc::new(MemoryVault::new(party.clone())),
                Arc::new(MemoryCheckpointStore::new()),
            )
        };
        let vault = self.vault.unwrap_or(default_vault);
        let checkpoints = self.checkpoints.unwrap_or(default_checkpoints);

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        let identity = Arc::new(self.identity);
        let counterparty_flows = Arc::new(CounterpartyFlows::new(
            self.config.flow.counterparty_retention,
        ));
        let (events, _) = broadcast::channel(self.config.flow.event_capacity.max(1));

        let responder = Responder::new(
            identity.clone(),
            self.notary.party().clone(),
            vault.clone(),
            self.policy,
            counterparty_flows.clone(),
            metrics.clone(),
        );

        let (tx, rx) = mpsc::channel(self.config.network.mailbox_capacity);
        self.network.register(party.clone(), tx);
        let responder = tokio::spawn(responder.run(rx));

        tracing::info!(
            party = %party,
            notary = %self.notary.party(),
            persistent = self.config.persistent,
            "Node started"
        );

        Ok(Node {
            identity,
            config: self.config,
            notary: self.notary,
            network: self.network,
            vault,
            checkpoints,
            locks: SoftLockTable::new(),
            counterparty_flows,
            metrics,
            events,
            responder,
        })
    }
}

/// A running party
pub struct Node {
    identity: Arc<Identity>,
    config: Config,
    notary: Arc<dyn FinalityService>,
    network: Network,
    vault: Arc<dyn VaultService>,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: SoftLockTable,
    counterparty_flows: Arc<CounterpartyFlows>,
    metrics: Metrics,
    events: broadcast::Sender<FlowEvent>,
    responder: JoinHandle<()>,
}

impl Node {
    /// This node's party
    pub fn party(&self) -> &Party {
        self.identity.party()
    }

    /// Finality service the node submits to
    pub fn notary(&self) -> Arc<dyn FinalityService> {
        self.notary.clone()
    }

    /// Network the node is registered on
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Node metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Subscribe to initiator flow transitions
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Issue `amount` of new quota owned by this node as mill
    pub async fn issue(&self, amount: u64) -> Result<TxId> {
        let me = self.party();
        let builder = assemble_issue(me, amount, self.notary.party()).map_err(|e| {
            self.metrics.verification_failures.inc();
            e
        })?;

        self.run_initiator(Uuid::now_v7(), builder).await
    }

    /// Move `amount` of `mill`'s quota held by this node to `new_owner`
    ///
    /// The selected records stay reserved until the flow ends or the
    /// returned future is dropped.
    pub async fn transfer(&self, mill: &Party, amount: u64, new_owner: &Party) -> Result<TxId> {
        let flow_id = Uuid::now_v7();
        let me = self.party();

        let reservation = self
            .locks
            .select_and_reserve(self.vault.as_ref(), flow_id, mill, me, amount)?;

        let notary = self.notary.party();
        match assemble_transfer(reservation.selection(), me, mill, amount, new_owner, notary) {
            Ok(builder) => self.run_initiator(flow_id, builder).await,
            Err(e) => {
                self.metrics.verification_failures.inc();
                Err(e)
            }
        }
    }

    /// Total quota of `mill` held by this node
    pub fn balance(&self, mill: &Party) -> Result<u64> {
        let held = self.vault.query_unspent(self.party())?;
        Ok(checked_sum(held.iter().map(|s| s.record()).filter(|r| r.mill == *mill))?)
    }

    /// Every unspent record this node participates in
    pub fn unspent(&self) -> Result<Vec<StateAndRef>> {
        self.vault.all_unspent()
    }

    /// Initiator flows that have not reached a terminal state
    pub fn in_flight_flows(&self) -> Result<Vec<FlowCheckpoint>> {
        self.checkpoints.list_checkpoints()
    }

    /// State of the flow `flow_id` started by `initiator` that this node
    /// answered as counterparty
    pub fn counterparty_state(
        &self,
        initiator: &Party,
        flow_id: Uuid,
    ) -> Option<CounterpartyState> {
        self.counterparty_flows.state(initiator, flow_id)
    }

    /// Records currently reserved by in-flight flows
    pub fn reserved_count(&self) -> usize {
        self.locks.len()
    }

    /// Leave the network and stop the responder
    pub async fn shutdown(self) -> Result<()> {
        self.network.deregister(self.identity.name());
        self.responder
            .await
            .map_err(|e| Error::Concurrency(format!("Responder task failed: {}", e)))?;

        tracing::info!(party = %self.identity.party(), "Node stopped");
        Ok(())
    }

    async fn run_initiator(&self, flow_id: Uuid, builder: TransactionBuilder) -> Result<TxId> {
        let mut guard = FlowGuard::new(self, flow_id);

        let mut flow = InitiatorFlow::new(flow_id);
        let result = self.drive(&mut flow, builder).await;

        guard.outcome = Some(match &result {
            Ok(_) => FlowOutcome::Finalized,
            Err(err) => {
                let terminal = match err {
                    Error::Rejected { .. } => FlowState::Rejected,
                    _ => FlowState::Failed,
                };
                if flow.advance(terminal).is_err() {
                    let _ = flow.advance(FlowState::Failed);
                }
                self.emit(&flow);

                if let Error::Finality(FinalityError::Conflict { .. }) = err {
                    self.metrics.notary_conflicts.inc();
                }
                tracing::warn!(
                    flow_id = %flow_id,
                    state = %flow.state(),
                    error = %err,
                    "Flow abandoned"
                );

                if flow.state() == FlowState::Rejected {
                    FlowOutcome::Rejected
                } else {
                    FlowOutcome::Failed
                }
            }
        });

        result
    }

    async fn drive(&self, flow: &mut InitiatorFlow, builder: TransactionBuilder) -> Result<TxId> {
        let flow_id = flow.flow_id();
        let me = self.identity.party();

        let mut stx = builder.sign_initial_transaction(&self.identity)?;
        self.transition(flow, FlowState::LocallySigned, &stx)?;

        let missing = stx.missing_signatures();
        if !missing.is_empty() {
            self.transition(flow, FlowState::AwaitingCounterpartySignatures, &stx)?;

            let timeout = Duration::from_millis(self.config.flow.session_timeout_ms);
            for key in missing {
                let counterparty = self.network.party_from_key(&key)?;
                tracing::debug!(
                    flow_id = %flow_id,
                    counterparty = %counterparty,
                    "Requesting signature"
                );

                match self
                    .network
                    .request_signature(&counterparty, flow_id, me, stx.clone(), timeout)
                    .await?
                {
                    SignResponse::Signed(signature) => {
                        if signature.by != key || !signature.is_valid_for(&stx.id()) {
                            return Err(Error::Signature(format!(
                                "{} returned an invalid signature",
                                counterparty
                            )));
                        }
                        stx.add_signature(signature);
                        self.checkpoint(flow, &stx)?;
                    }
                    SignResponse::Rejected(reason) => {
                        return Err(Error::Rejected {
                            flow_id,
                            party: counterparty.name,
                            reason,
                        });
                    }
                }
            }
        }

        stx.verify_required_signatures()?;
        self.transition(flow, FlowState::FullySigned, &stx)?;
        self.transition(flow, FlowState::SubmittedForFinality, &stx)?;

        let finality_timeout = Duration::from_millis(self.config.flow.finality_timeout_ms);
        let receipt = tokio::time::timeout(finality_timeout, self.notary.submit(stx.clone()))
            .await
            .map_err(|_| {
                Error::Session(format!("Notary did not answer within {:?}", finality_timeout))
            })??;

        if receipt.signature.by != self.notary.party().owning_key
            || !receipt.signature.is_valid_for(&stx.id())
        {
            return Err(Error::Signature("Notary returned an invalid signature".to_string()));
        }
        stx.add_signature(receipt.signature);

        self.vault.record_transaction(&stx)?;
        self.distribute(flow_id, &stx).await;

        flow.advance(FlowState::Finalized)?;
        self.emit(flow);

        tracing::info!(flow_id = %flow_id, tx_id = %stx.id(), "Flow finalized");
        Ok(stx.id())
    }

    /// Send the notarised transaction to every other participant
    ///
    /// The transaction is final once notarised, so a failed delivery is
    /// logged rather than failing the flow.
    async fn distribute(&self, flow_id: Uuid, stx: &SignedTransaction) {
        let me = self.party();
        let timeout = Duration::from_millis(self.config.flow.session_timeout_ms);

        for participant in stx.participants().into_iter().filter(|p| p != me) {
            if let Err(e) = self
                .network
                .send_finalized(&participant, flow_id, me, stx.clone(), timeout)
                .await
            {
                tracing::warn!(
                    flow_id = %flow_id,
                    participant = %participant,
                    error = %e,
                    "Finalized transaction not delivered"
                );
            }
        }
    }

    fn transition(
        &self,
        flow: &mut InitiatorFlow,
        next: FlowState,
        stx: &SignedTransaction,
    ) -> Result<()> {
        flow.advance(next)?;
        self.checkpoint(flow, stx)?;
        self.emit(flow);
        Ok(())
    }

    fn checkpoint(&self, flow: &InitiatorFlow, stx: &SignedTransaction) -> Result<()> {
        if self.config.flow.checkpoints_enabled && !flow.state().is_terminal() {
            self.checkpoints
                .save_checkpoint(&FlowCheckpoint::capture(flow, Some(stx)))?;
        }
        Ok(())
    }

    fn emit(&self, flow: &InitiatorFlow) {
        // No subscribers is fine
        let _ = self.events.send(FlowEvent {
            flow_id: flow.flow_id(),
            state: flow.state(),
        });
    }
}

/// Removes an initiator flow's checkpoint and closes its metrics when the
/// flow ends, including when its future is dropped mid-flight
struct FlowGuard<'a> {
    node: &'a Node,
    flow_id: Uuid,
    started: Instant,
    outcome: Option<FlowOutcome>,
}

impl<'a> FlowGuard<'a> {
    fn new(node: &'a Node, flow_id: Uuid) -> Self {
        node.metrics.record_flow_started();
        Self {
            node,
            flow_id,
            started: Instant::now(),
            outcome: None,
        }
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.node.checkpoints.remove_checkpoint(self.flow_id) {
            tracing::error!(flow_id = %self.flow_id, error = %e, "Failed to remove checkpoint");
        }

        let outcome = self.outcome.unwrap_or_else(|| {
            tracing::warn!(flow_id = %self.flow_id, "Flow cancelled");
            FlowOutcome::Failed
        });
        self.node
            .metrics
            .record_flow_finished(outcome, self.started.elapsed().as_secs_f64());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("party", self.identity.party())
            .field("notary", self.notary.party())
            .field("reserved", &self.locks.len())
            .finish()
    }
}
