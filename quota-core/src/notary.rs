//! Finality service
//!
//! The notary orders spends. It is a single-writer actor: every submission
//! goes through one mailbox, so two transactions racing for the same input
//! are decided in arrival order and the loser gets a conflict.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │         Initiator flows (any number of nodes)        │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ FinalityService::submit
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               NotaryHandle (Clone)                   │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              NotaryActor (Single Task)               │
//! │   unspent: StateRef → state                          │
//! │   consumed: StateRef → spending tx                   │
//! │   committed: tx id → receipt                         │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::contract::QuotaContract;
use crate::error::FinalityError;
use crate::identity::Identity;
use crate::types::{
    Party, SignedTransaction, StateRef, TransactionSignature, TransactionState, TxId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};

/// Proof that a transaction was notarised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotarisationReceipt {
    /// Notarised transaction
    pub tx_id: TxId,
    /// Notary signature over the transaction id
    pub signature: TransactionSignature,
    /// Commit time
    pub finalized_at: DateTime<Utc>,
}

/// Orders transactions and prevents double spends
#[async_trait]
pub trait FinalityService: Send + Sync {
    /// Notary identity transactions must name
    fn party(&self) -> &Party;

    /// Notarise a fully-signed transaction
    async fn submit(&self, stx: SignedTransaction) -> Result<NotarisationReceipt>;
}

/// Message sent to the notary actor
#[derive(Debug)]
pub enum NotaryMessage {
    /// Notarise a transaction
    Submit {
        transaction: SignedTransaction,
        response: oneshot::Sender<Result<NotarisationReceipt>>,
    },

    /// Which transaction consumed a state, if any
    ConsumedBy {
        reference: StateRef,
        response: oneshot::Sender<Option<TxId>>,
    },

    /// Number of states the notary knows to be unspent
    UnspentCount {
        response: oneshot::Sender<usize>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that decides every spend
pub struct NotaryActor {
    identity: Identity,
    mailbox: mpsc::Receiver<NotaryMessage>,
    unspent: HashMap<StateRef, TransactionState>,
    consumed: HashMap<StateRef, TxId>,
    committed: HashMap<TxId, NotarisationReceipt>,
}

impl NotaryActor {
    /// Create new actor
    pub fn new(identity: Identity, mailbox: mpsc::Receiver<NotaryMessage>) -> Self {
        Self {
            identity,
            mailbox,
            unspent: HashMap::new(),
            consumed: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                NotaryMessage::Submit { transaction, response } => {
                    let result = self.notarise(transaction);
                    let _ = response.send(result);
                }
                NotaryMessage::ConsumedBy { reference, response } => {
                    let _ = response.send(self.consumed.get(&reference).copied());
                }
                NotaryMessage::UnspentCount { response } => {
                    let _ = response.send(self.unspent.len());
                }
                NotaryMessage::Shutdown => break,
            }
        }

        tracing::info!(notary = %self.identity.party(), "Notary stopped");
    }

    fn notarise(&mut self, stx: SignedTransaction) -> Result<NotarisationReceipt> {
        let tx_id = stx.id();
        let reject = |reason: String| -> Error {
            tracing::warn!(tx_id = %tx_id, reason = %reason, "Notarisation refused");
            FinalityError::Rejected { tx_id, reason }.into()
        };

        if let Some(receipt) = self.committed.get(&tx_id) {
            tracing::debug!(tx_id = %tx_id, "Transaction already notarised");
            return Ok(receipt.clone());
        }

        if stx.tx.notary != *self.identity.party() {
            return Err(reject(format!(
                "Transaction names notary {}, not {}",
                stx.tx.notary,
                self.identity.party()
            )));
        }

        stx.verify_required_signatures()
            .map_err(|e| reject(e.to_string()))?;

        let ltx = stx.to_ledger_transaction().map_err(|e| reject(e.to_string()))?;
        QuotaContract.verify(&ltx).map_err(|e| reject(e.to_string()))?;

        let mut seen = HashSet::with_capacity(ltx.inputs.len());
        let mut conflicts = Vec::new();
        for input in &ltx.inputs {
            if !seen.insert(input.reference) {
                return Err(reject(format!("Input {} is spent twice", input.reference)));
            }
            if self.consumed.contains_key(&input.reference) {
                conflicts.push(input.reference);
                continue;
            }
            match self.unspent.get(&input.reference) {
                Some(state) if *state == input.state => {}
                Some(_) => {
                    return Err(reject(format!(
                        "Input {} does not match the recorded state",
                        input.reference
                    )))
                }
                None => return Err(reject(format!("Input {} is unknown", input.reference))),
            }
        }

        if !conflicts.is_empty() {
            tracing::warn!(tx_id = %tx_id, conflicts = conflicts.len(), "Double spend refused");
            return Err(FinalityError::Conflict { refs: conflicts }.into());
        }

        for input in &ltx.inputs {
            self.unspent.remove(&input.reference);
            self.consumed.insert(input.reference, tx_id);
        }
        for (index, state) in ltx.outputs.iter().enumerate() {
            self.unspent.insert(StateRef::new(tx_id, index as u32), state.clone());
        }

        let receipt = NotarisationReceipt {
            tx_id,
            signature: self.identity.sign_transaction(&tx_id),
            finalized_at: Utc::now(),
        };
        self.committed.insert(tx_id, receipt.clone());

        tracing::info!(
            tx_id = %tx_id,
            inputs = ltx.inputs.len(),
            outputs = ltx.outputs.len(),
            "Transaction notarised"
        );
        Ok(receipt)
    }
}

/// Handle for sending messages to the notary
#[derive(Clone, Debug)]
pub struct NotaryHandle {
    party: Party,
    sender: mpsc::Sender<NotaryMessage>,
}

impl NotaryHandle {
    /// Create new handle
    pub fn new(party: Party, sender: mpsc::Sender<NotaryMessage>) -> Self {
        Self { party, sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NotaryMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Notary mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Transaction that consumed `reference`, if any
    pub async fn consumed_by(&self, reference: StateRef) -> Result<Option<TxId>> {
        self.request(|response| NotaryMessage::ConsumedBy { reference, response })
            .await
    }

    /// Number of unspent states known to the notary
    pub async fn unspent_count(&self) -> Result<usize> {
        self.request(|response| NotaryMessage::UnspentCount { response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NotaryMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Notary mailbox closed".to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl FinalityService for NotaryHandle {
    fn party(&self) -> &Party {
        &self.party
    }

    async fn submit(&self, stx: SignedTransaction) -> Result<NotarisationReceipt> {
        self.request(|response| NotaryMessage::Submit {
            transaction: stx,
            response,
        })
        .await?
    }
}

/// Spawn the notary actor
pub fn spawn_notary(identity: Identity, mailbox_capacity: usize) -> NotaryHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let party = identity.party().clone();
    let actor = NotaryActor::new(identity, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    NotaryHandle::new(party, tx)
}
