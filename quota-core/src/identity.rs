//! Party identities
//!
//! Every component that signs is handed an [`Identity`] explicitly; there is
//! no process-wide signer.

use crate::crypto::KeyPair;
use crate::types::{Party, PublicKey, TransactionSignature, TxId};

/// A party together with its private signing key
#[derive(Debug)]
pub struct Identity {
    party: Party,
    keypair: KeyPair,
}

impl Identity {
    /// Bind a name to a key pair
    pub fn new(name: impl Into<String>, keypair: KeyPair) -> Self {
        let party = Party::new(name, keypair.public_key());
        Self { party, keypair }
    }

    /// Fresh random identity
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, KeyPair::generate())
    }

    /// Deterministic identity, for tests and fixed deployments
    pub fn from_seed(name: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self::new(name, KeyPair::from_seed(seed))
    }

    /// Public view of this identity
    pub fn party(&self) -> &Party {
        &self.party
    }

    /// Party name
    pub fn name(&self) -> &str {
        &self.party.name
    }

    /// Signing key
    pub fn owning_key(&self) -> PublicKey {
        self.party.owning_key
    }

    /// Sign a transaction id
    pub fn sign_transaction(&self, tx_id: &TxId) -> TransactionSignature {
        TransactionSignature {
            by: self.owning_key(),
            signature: self.keypair.sign(tx_id.as_bytes()),
        }
    }
}
