//! Signature coordination state machines
//!
//! # Initiator
//!
//! ```text
//! Built ─► LocallySigned ─► AwaitingCounterpartySignatures ─► FullySigned
//!               │                    │            │               │
//!               │                    ▼            ▼               ▼
//!               │                 Rejected      Failed   SubmittedForFinality
//!               │                                             │        │
//!               └──────────────► FullySigned (no counterparty) ▼        ▼
//!                                                          Finalized  Failed
//! ```
//!
//! # Counterparty
//!
//! ```text
//! Received ─► Verified ─► Signed ─► Finalized
//!     └──────────┴──────► Rejected
//! ```
//!
//! Initiator transitions are checkpointed so in-flight flows can be listed
//! after a restart. Nothing is written to a vault before `Finalized`.

use crate::types::{SignedTransaction, TxId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A state in one of the flow state machines
pub trait FlowStep: Copy + Eq + fmt::Debug {
    /// State a new flow starts in
    fn initial() -> Self;

    /// No further transitions allowed
    fn is_terminal(&self) -> bool;

    /// Whether `self → next` is a legal move
    fn can_transition_to(&self, next: Self) -> bool;
}

/// Initiator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// Candidate transaction built and verified locally
    Built,
    /// Initiator signature attached
    LocallySigned,
    /// Sessions open, waiting for counterparties
    AwaitingCounterpartySignatures,
    /// Every required signer has signed
    FullySigned,
    /// Handed to the notary
    SubmittedForFinality,
    /// Notarised and recorded (terminal)
    Finalized,
    /// A counterparty declined (terminal)
    Rejected,
    /// Session or notary failure (terminal)
    Failed,
}

impl FlowStep for FlowState {
    fn initial() -> Self {
        FlowState::Built
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Finalized | FlowState::Rejected | FlowState::Failed
        )
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use FlowState::*;

        match (self, next) {
            (Built, LocallySigned) => true,
            (LocallySigned, AwaitingCounterpartySignatures) => true,
            (LocallySigned, FullySigned) => true,
            (AwaitingCounterpartySignatures, FullySigned) => true,
            (AwaitingCounterpartySignatures, Rejected) => true,
            (FullySigned, SubmittedForFinality) => true,
            (SubmittedForFinality, Finalized) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counterparty states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterpartyState {
    /// Signature request arrived
    Received,
    /// Own validation passed
    Verified,
    /// Signature returned to the initiator
    Signed,
    /// Finalized transaction recorded (terminal)
    Finalized,
    /// Validation failed, signature refused (terminal)
    Rejected,
}

impl FlowStep for CounterpartyState {
    fn initial() -> Self {
        CounterpartyState::Received
    }

    fn is_terminal(&self) -> bool {
        matches!(self, CounterpartyState::Finalized | CounterpartyState::Rejected)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use CounterpartyState::*;

        matches!(
            (self, next),
            (Received, Verified)
                | (Verified, Signed)
                | (Signed, Finalized)
                | (Received, Rejected)
                | (Verified, Rejected)
        )
    }
}

impl fmt::Display for CounterpartyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One flow instance and the path it has taken
#[derive(Debug, Clone)]
pub struct FlowStateMachine<S: FlowStep> {
    flow_id: Uuid,
    state: S,
    history: Vec<(S, DateTime<Utc>)>,
}

impl<S: FlowStep + fmt::Display> FlowStateMachine<S> {
    /// Start a new flow in the initial state
    pub fn new(flow_id: Uuid) -> Self {
        let state = S::initial();
        Self {
            flow_id,
            state,
            history: vec![(state, Utc::now())],
        }
    }

    /// Flow identifier
    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    /// Current state
    pub fn state(&self) -> S {
        self.state
    }

    /// States visited, oldest first
    pub fn history(&self) -> impl Iterator<Item = S> + '_ {
        self.history.iter().map(|(s, _)| *s)
    }

    /// Move to `next`, refusing illegal transitions
    pub fn advance(&mut self, next: S) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        tracing::debug!(flow_id = %self.flow_id, from = %self.state, to = %next, "Flow transition");
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }
}

/// Initiator state machine
pub type InitiatorFlow = FlowStateMachine<FlowState>;

/// Counterparty state machine
pub type CounterpartyFlow = FlowStateMachine<CounterpartyState>;

/// Persisted snapshot of an in-flight initiator flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    /// Flow identifier
    pub flow_id: Uuid,
    /// Current state
    pub state: FlowState,
    /// Transaction id, once signed
    pub tx_id: Option<TxId>,
    /// Transaction with the signatures collected so far
    pub transaction: Option<SignedTransaction>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl FlowCheckpoint {
    /// Snapshot a flow
    pub fn capture(flow: &InitiatorFlow, transaction: Option<&SignedTransaction>) -> Self {
        Self {
            flow_id: flow.flow_id(),
            state: flow.state(),
            tx_id: transaction.map(|t| t.id()),
            transaction: transaction.cloned(),
            updated_at: Utc::now(),
        }
    }
}

/// Where initiator checkpoints live
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for a flow
    fn save_checkpoint(&self, checkpoint: &FlowCheckpoint) -> Result<()>;

    /// Drop the checkpoint of a finished flow
    fn remove_checkpoint(&self, flow_id: Uuid) -> Result<()>;

    /// All in-flight flows
    fn list_checkpoints(&self) -> Result<Vec<FlowCheckpoint>>;
}

/// Non-durable checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<Uuid, FlowCheckpoint>,
}

impl MemoryCheckpointStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save_checkpoint(&self, checkpoint: &FlowCheckpoint) -> Result<()> {
        self.checkpoints.insert(checkpoint.flow_id, checkpoint.clone());
        Ok(())
    }

    fn remove_checkpoint(&self, flow_id: Uuid) -> Result<()> {
        self.checkpoints.remove(&flow_id);
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<FlowCheckpoint>> {
        let mut all: Vec<FlowCheckpoint> =
            self.checkpoints.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.flow_id);
        Ok(all)
    }
}

/// Flow progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    /// Flow identifier
    pub flow_id: Uuid,
    /// State just entered
    pub state: FlowState,
}
