//! Party directory and request/response sessions
//!
//! Each node registers a bounded mailbox under its party name. Sessions are
//! a message into that mailbox plus a oneshot reply, bounded by a timeout.

use crate::types::{Party, PublicKey, SignedTransaction, TransactionSignature};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message delivered to a node's mailbox
#[derive(Debug)]
pub enum SessionMessage {
    /// Ask the receiver to check and sign a transaction
    SignRequest {
        flow_id: Uuid,
        from: Party,
        transaction: SignedTransaction,
        reply: oneshot::Sender<SignResponse>,
    },

    /// A notarised transaction the receiver participates in
    Finalized {
        flow_id: Uuid,
        from: Party,
        transaction: SignedTransaction,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Counterparty answer to a signature request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignResponse {
    /// Validation passed; the counterparty signature
    Signed(TransactionSignature),
    /// Validation failed
    Rejected(String),
}

#[derive(Debug, Clone)]
struct Peer {
    party: Party,
    mailbox: mpsc::Sender<SessionMessage>,
}

/// Directory of reachable parties
#[derive(Debug, Clone, Default)]
pub struct Network {
    peers: Arc<DashMap<String, Peer>>,
}

impl Network {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `party` reachable through `mailbox`
    pub fn register(&self, party: Party, mailbox: mpsc::Sender<SessionMessage>) {
        let name = party.name.clone();
        if self.peers.insert(name.clone(), Peer { party, mailbox }).is_some() {
            tracing::warn!(party = %name, "Party re-registered, previous mailbox replaced");
        } else {
            tracing::debug!(party = %name, "Party registered");
        }
    }

    /// Remove a party; its mailbox closes once in-flight sends finish
    pub fn deregister(&self, name: &str) -> Option<Party> {
        self.peers.remove(name).map(|(_, peer)| peer.party)
    }

    /// Look up a party by name
    pub fn resolve(&self, name: &str) -> Result<Party> {
        self.peers
            .get(name)
            .map(|peer| peer.party.clone())
            .ok_or_else(|| Error::UnknownParty(name.to_string()))
    }

    /// Look up a party by signing key
    pub fn party_from_key(&self, key: &PublicKey) -> Result<Party> {
        self.peers
            .iter()
            .find(|peer| peer.party.owning_key == *key)
            .map(|peer| peer.party.clone())
            .ok_or_else(|| Error::UnknownParty(key.to_string()))
    }

    fn mailbox(&self, party: &Party) -> Result<mpsc::Sender<SessionMessage>> {
        match self.peers.get(&party.name) {
            Some(peer) if peer.party == *party => Ok(peer.mailbox.clone()),
            Some(_) => Err(Error::UnknownParty(format!(
                "{} (registered under a different key)",
                party.name
            ))),
            None => Err(Error::UnknownParty(party.name.clone())),
        }
    }

    /// Open a session with `to` and wait for its signature or rejection
    pub async fn request_signature(
        &self,
        to: &Party,
        flow_id: Uuid,
        from: &Party,
        transaction: SignedTransaction,
        timeout: Duration,
    ) -> Result<SignResponse> {
        let mailbox = self.mailbox(to)?;
        let (reply, response) = oneshot::channel();
        let message = SessionMessage::SignRequest {
            flow_id,
            from: from.clone(),
            transaction,
            reply,
        };

        exchange(to, &mailbox, message, response, timeout).await
    }

    /// Deliver a notarised transaction to `to` and wait for it to be recorded
    pub async fn send_finalized(
        &self,
        to: &Party,
        flow_id: Uuid,
        from: &Party,
        transaction: SignedTransaction,
        timeout: Duration,
    ) -> Result<()> {
        let mailbox = self.mailbox(to)?;
        let (ack, response) = oneshot::channel();
        let message = SessionMessage::Finalized {
            flow_id,
            from: from.clone(),
            transaction,
            ack,
        };

        exchange(to, &mailbox, message, response, timeout).await?
    }
}

async fn exchange<T>(
    to: &Party,
    mailbox: &mpsc::Sender<SessionMessage>,
    message: SessionMessage,
    response: oneshot::Receiver<T>,
    timeout: Duration,
) -> Result<T> {
    let session = async {
        mailbox
            .send(message)
            .await
            .map_err(|_| Error::Session(format!("Mailbox of {} is closed", to)))?;
        let value = response
            .await
            .map_err(|_| Error::Session(format!("{} closed the session", to)))?;
        Ok::<T, Error>(value)
    };

    tokio::time::timeout(timeout, session)
        .await
        .map_err(|_| Error::Session(format!("{} did not answer within {:?}", to, timeout)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_resolve() {
        let network = Network::new();
        let alice = Identity::from_seed("Alice", &[3u8; 32]);
        let (tx, _rx) = mpsc::channel(4);
        network.register(alice.party().clone(), tx);

        assert_eq!(network.resolve("Alice").unwrap(), *alice.party());
        assert_eq!(network.party_from_key(&alice.owning_key()).unwrap(), *alice.party());
        assert!(matches!(network.resolve("Bob"), Err(Error::UnknownParty(_))));

        network.deregister("Alice");
        assert!(matches!(network.resolve("Alice"), Err(Error::UnknownParty(_))));
    }

    #[tokio::test]
    async fn test_session_timeout() {
        let network = Network::new();
        let alice = Identity::from_seed("Alice", &[3u8; 32]);
        let bob = Identity::from_seed("Bob", &[4u8; 32]);
        let (tx, _rx) = mpsc::channel(4);
        network.register(bob.party().clone(), tx);

        let stx = crate::builder::assemble_issue(alice.party(), 1, alice.party())
            .unwrap()
            .sign_initial_transaction(&alice)
            .unwrap();

        // Nobody drains Bob's mailbox
        let timeout = Duration::from_millis(20);
        let err = network
            .request_signature(bob.party(), Uuid::now_v7(), alice.party(), stx, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_closed_session() {
        let network = Network::new();
        let alice = Identity::from_seed("Alice", &[3u8; 32]);
        let bob = Identity::from_seed("Bob", &[4u8; 32]);
        let (tx, mut rx) = mpsc::channel(4);
        network.register(bob.party().clone(), tx);

        // Bob drops every request without answering
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let stx = crate::builder::assemble_issue(alice.party(), 1, alice.party())
            .unwrap()
            .sign_initial_transaction(&alice)
            .unwrap();
        let timeout = Duration::from_secs(1);
        let err = network
            .request_signature(bob.party(), Uuid::now_v7(), alice.party(), stx, timeout)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed the session"));
    }
}
