//! Counterparty side of signature coordination
//!
//! The responder drains a node's session mailbox. Every request is checked
//! independently of what the initiator claims: signatures already present,
//! required-signer membership, the notary named, and the quota contract.
//! Only then is a signature returned.

use crate::contract::QuotaContract;
use crate::flow::{CounterpartyFlow, CounterpartyState};
use crate::identity::Identity;
use crate::metrics::Metrics;
use crate::network::{SessionMessage, SignResponse};
use crate::types::{LedgerTransaction, Party, PublicKey, SignedTransaction};
use crate::vault::VaultService;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Extra business checks a counterparty applies before signing
pub trait SigningPolicy: Send + Sync {
    /// `Err(reason)` to refuse the signature
    fn check(&self, signer: &Party, ltx: &LedgerTransaction) -> std::result::Result<(), String>;
}

/// Signs anything that passes contract verification
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SigningPolicy for AcceptAll {
    fn check(&self, _signer: &Party, _ltx: &LedgerTransaction) -> std::result::Result<(), String> {
        Ok(())
    }
}

type FlowKey = (PublicKey, Uuid);

/// Counterparty flows this node has taken part in, keyed by initiator and
/// flow id
///
/// At most `capacity` flows are retained. The oldest is evicted first.
#[derive(Debug)]
pub struct CounterpartyFlows {
    retained: Mutex<Retained>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Retained {
    flows: HashMap<FlowKey, CounterpartyFlow>,
    order: VecDeque<FlowKey>,
}

impl CounterpartyFlows {
    /// Empty registry holding at most `capacity` flows
    pub fn new(capacity: usize) -> Self {
        Self {
            retained: Mutex::new(Retained::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record `flow` answered for `initiator`
    pub fn insert(&self, initiator: &Party, flow: CounterpartyFlow) {
        let key = (initiator.owning_key, flow.flow_id());
        let mut retained = self.retained.lock();

        if retained.flows.insert(key, flow).is_some() {
            retained.order.retain(|k| *k != key);
        }
        retained.order.push_back(key);

        while retained.order.len() > self.capacity {
            if let Some(oldest) = retained.order.pop_front() {
                retained.flows.remove(&oldest);
                tracing::debug!(flow_id = %oldest.1, "Counterparty flow evicted");
            }
        }
    }

    /// State of the flow `flow_id` started by `initiator`
    pub fn state(&self, initiator: &Party, flow_id: Uuid) -> Option<CounterpartyState> {
        self.retained
            .lock()
            .flows
            .get(&(initiator.owning_key, flow_id))
            .map(|flow| flow.state())
    }

    /// Move a signed flow to `Finalized`; unknown or unsigned flows are left alone
    fn finalize(&self, initiator: &Party, flow_id: Uuid) -> Result<()> {
        let mut retained = self.retained.lock();
        if let Some(flow) = retained.flows.get_mut(&(initiator.owning_key, flow_id)) {
            if flow.state() == CounterpartyState::Signed {
                flow.advance(CounterpartyState::Finalized)?;
            }
        }
        Ok(())
    }

    /// Number of retained flows
    pub fn len(&self) -> usize {
        self.retained.lock().flows.len()
    }

    /// No flows retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers signature requests and records finalized transactions
pub struct Responder {
    identity: Arc<Identity>,
    notary: Party,
    vault: Arc<dyn VaultService>,
    policy: Arc<dyn SigningPolicy>,
    flows: Arc<CounterpartyFlows>,
    metrics: Metrics,
}

impl Responder {
    /// Create new responder
    pub fn new(
        identity: Arc<Identity>,
        notary: Party,
        vault: Arc<dyn VaultService>,
        policy: Arc<dyn SigningPolicy>,
        flows: Arc<CounterpartyFlows>,
        metrics: Metrics,
    ) -> Self {
        Self {
            identity,
            notary,
            vault,
            policy,
            flows,
            metrics,
        }
    }

    /// Run until the mailbox closes
    pub async fn run(self, mut mailbox: mpsc::Receiver<SessionMessage>) {
        while let Some(msg) = mailbox.recv().await {
            match msg {
                SessionMessage::SignRequest {
                    flow_id,
                    from,
                    transaction,
                    reply,
                } => {
                    let response = self.handle_sign_request(flow_id, &from, &transaction);
                    if reply.send(response).is_err() {
                        tracing::warn!(
                            flow_id = %flow_id,
                            initiator = %from,
                            "Initiator left before the reply"
                        );
                    }
                }
                SessionMessage::Finalized {
                    flow_id,
                    from,
                    transaction,
                    ack,
                } => {
                    let result = self.handle_finalized(flow_id, &from, &transaction);
                    if let Err(e) = &result {
                        tracing::error!(
                            flow_id = %flow_id,
                            error = %e,
                            "Failed to record finalized transaction"
                        );
                    }
                    let _ = ack.send(result);
                }
            }
        }

        tracing::debug!(party = %self.identity.party(), "Responder stopped");
    }

    fn handle_sign_request(
        &self,
        flow_id: Uuid,
        from: &Party,
        stx: &SignedTransaction,
    ) -> SignResponse {
        self.metrics.signature_requests.inc();
        let mut flow = CounterpartyFlow::new(flow_id);

        let response = match self.validate(from, stx) {
            Ok(()) => {
                let signature = self.identity.sign_transaction(&stx.id());
                match flow
                    .advance(CounterpartyState::Verified)
                    .and_then(|_| flow.advance(CounterpartyState::Signed))
                {
                    Ok(()) => SignResponse::Signed(signature),
                    Err(e) => SignResponse::Rejected(e.to_string()),
                }
            }
            Err(reason) => {
                self.metrics.verification_failures.inc();
                tracing::warn!(
                    flow_id = %flow_id,
                    initiator = %from,
                    tx_id = %stx.id(),
                    reason = %reason,
                    "Signature refused"
                );
                let _ = flow.advance(CounterpartyState::Rejected);
                SignResponse::Rejected(reason)
            }
        };

        tracing::debug!(flow_id = %flow_id, state = %flow.state(), "Signature request handled");
        self.flows.insert(from, flow);
        response
    }

    fn validate(&self, from: &Party, stx: &SignedTransaction) -> std::result::Result<(), String> {
        let me = self.identity.party();

        if !stx.tx.required_signing_keys().contains(&me.owning_key) {
            return Err(format!("{} is not a required signer", me));
        }

        if !stx.is_signed_by(&from.owning_key) {
            return Err(format!("Transaction is not signed by initiator {}", from));
        }

        stx.verify_signatures_except(&stx.missing_signatures())
            .map_err(|e| e.to_string())?;

        if stx.tx.notary != self.notary {
            return Err(format!("Transaction names unexpected notary {}", stx.tx.notary));
        }

        let ltx = stx.to_ledger_transaction().map_err(|e| e.to_string())?;
        QuotaContract.verify(&ltx).map_err(|e| e.to_string())?;

        self.policy.check(me, &ltx)
    }

    fn handle_finalized(&self, flow_id: Uuid, from: &Party, stx: &SignedTransaction) -> Result<()> {
        stx.verify_required_signatures()?;
        if !stx.is_signed_by(&self.notary.owning_key) {
            return Err(crate::Error::Signature(format!(
                "Transaction {} from {} carries no notary signature",
                stx.id(),
                from
            )));
        }

        let recorded = self.vault.record_transaction(stx)?;

        self.flows.finalize(from, flow_id)?;

        tracing::info!(
            flow_id = %flow_id,
            tx_id = %stx.id(),
            recorded,
            "Finalized transaction received"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("party", self.identity.party())
            .field("flows", &self.flows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(flow_id: Uuid) -> CounterpartyFlow {
        let mut flow = CounterpartyFlow::new(flow_id);
        flow.advance(CounterpartyState::Verified).unwrap();
        flow.advance(CounterpartyState::Signed).unwrap();
        flow
    }

    #[test]
    fn test_flows_keyed_by_initiator() {
        let alice = Identity::from_seed("Alice", &[3u8; 32]).party().clone();
        let mallory = Identity::from_seed("Mallory", &[6u8; 32]).party().clone();
        let flows = CounterpartyFlows::new(16);
        let flow_id = Uuid::now_v7();

        flows.insert(&alice, signed(flow_id));

        // Same flow id from another initiator does not touch Alice's flow
        let mut forged = CounterpartyFlow::new(flow_id);
        forged.advance(CounterpartyState::Rejected).unwrap();
        flows.insert(&mallory, forged);

        assert_eq!(flows.state(&alice, flow_id), Some(CounterpartyState::Signed));
        assert_eq!(flows.state(&mallory, flow_id), Some(CounterpartyState::Rejected));

        flows.finalize(&mallory, flow_id).unwrap();
        assert_eq!(flows.state(&alice, flow_id), Some(CounterpartyState::Signed));

        flows.finalize(&alice, flow_id).unwrap();
        assert_eq!(flows.state(&alice, flow_id), Some(CounterpartyState::Finalized));
        assert_eq!(flows.len(), 2);
    }

    #[test]
    fn test_oldest_flow_evicted() {
        let alice = Identity::from_seed("Alice", &[3u8; 32]).party().clone();
        let flows = CounterpartyFlows::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();

        for id in &ids {
            flows.insert(&alice, signed(*id));
        }

        assert_eq!(flows.len(), 2);
        assert_eq!(flows.state(&alice, ids[0]), None);
        assert_eq!(flows.state(&alice, ids[2]), Some(CounterpartyState::Signed));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let alice = Identity::from_seed("Alice", &[3u8; 32]).party().clone();
        let flows = CounterpartyFlows::new(2);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        flows.insert(&alice, signed(a));
        flows.insert(&alice, signed(b));
        flows.insert(&alice, signed(a));
        flows.insert(&alice, signed(c));

        assert_eq!(flows.len(), 2);
        assert!(flows.state(&alice, a).is_some());
        assert_eq!(flows.state(&alice, b), None);
    }
}
