//! Core types for the quota ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Immutability once built (records are consumed, never edited)
//! - Exact integer arithmetic for quota amounts

use crate::contract::{ContractViolation, ViolationKind, QUOTA_CONTRACT_ID};
use crate::crypto::{hash_bytes, merkle_root, verify_signature};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Write a byte slice as lowercase hex
fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// Ed25519 public key of a party
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        write_hex(f, &self.0[..8])?;
        write!(f, ")")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// A well-known identity on the network: a name bound to a signing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party {
    /// Human-readable name, unique on the network
    pub name: String,
    /// Key the party signs with
    pub owning_key: PublicKey,
}

impl Party {
    /// Create new party
    pub fn new(name: impl Into<String>, owning_key: PublicKey) -> Self {
        Self {
            name: name.into(),
            owning_key,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Transaction identifier (Merkle root of the transaction components)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl TxId {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0[..8])
    }
}

/// A unit of quota ownership
///
/// Records are never mutated. Spending consumes a record and produces new
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Issuing party
    pub mill: Party,
    /// Holding party
    pub owner: Party,
    /// Number of quota units
    pub amount: u64,
}

impl QuotaRecord {
    /// Create new record
    pub fn new(mill: Party, owner: Party, amount: u64) -> Self {
        Self {
            mill,
            owner,
            amount,
        }
    }

    /// Parties that store this record
    pub fn participants(&self) -> [&Party; 2] {
        [&self.mill, &self.owner]
    }

    /// Whether `party` stores this record
    pub fn is_participant(&self, party: &Party) -> bool {
        self.mill == *party || self.owner == *party
    }
}

/// An output as it appears in a transaction: the record, the contract that
/// governs it and the notary that orders its spends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    /// Record payload
    pub data: QuotaRecord,
    /// Contract identifier
    pub contract: String,
    /// Notary responsible for this state
    pub notary: Party,
}

impl TransactionState {
    /// Wrap a record under the quota contract
    pub fn quota(data: QuotaRecord, notary: Party) -> Self {
        Self {
            data,
            contract: QUOTA_CONTRACT_ID.to_string(),
            notary,
        }
    }

    /// Whether the state is governed by the quota contract
    pub fn is_quota(&self) -> bool {
        self.contract == QUOTA_CONTRACT_ID
    }
}

/// Pointer to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    /// Producing transaction
    pub tx_id: TxId,
    /// Output position
    pub index: u32,
}

impl StateRef {
    /// Create new reference
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }

    /// Storage key: tx id followed by big-endian index
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.tx_id.as_bytes());
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tx_id, self.index)
    }
}

/// A state together with its ledger reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    /// The state
    pub state: TransactionState,
    /// Where it lives on the ledger
    pub reference: StateRef,
}

impl StateAndRef {
    /// Quota record carried by the state
    pub fn record(&self) -> &QuotaRecord {
        &self.state.data
    }
}

/// Command attached to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandData {
    /// Create new quota
    Issue,
    /// Move quota between owners
    Transfer,
    /// Retire quota (reserved)
    Exit,
    /// Command belonging to some other contract
    Other(String),
}

impl fmt::Display for CommandData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandData::Issue => write!(f, "Issue"),
            CommandData::Transfer => write!(f, "Transfer"),
            CommandData::Exit => write!(f, "Exit"),
            CommandData::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A command and the keys that must sign for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// What the transaction does
    pub value: CommandData,
    /// Required signers
    pub signers: Vec<PublicKey>,
}

impl Command {
    /// Create new command
    pub fn new(value: CommandData, signers: Vec<PublicKey>) -> Self {
        Self { value, signers }
    }
}

/// Unsigned transaction as it travels between parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// Consumed outputs of earlier transactions
    pub inputs: Vec<StateRef>,
    /// Produced states
    pub outputs: Vec<TransactionState>,
    /// Commands with their signers
    pub commands: Vec<Command>,
    /// Ordering service
    pub notary: Party,
    /// Random salt so identical contents still get distinct ids
    pub privacy_salt: [u8; 32],
}

impl WireTransaction {
    /// Transaction id: Merkle root over the component group hashes
    pub fn id(&self) -> TxId {
        let leaves = [
            hash_component(&self.inputs),
            hash_component(&self.outputs),
            hash_component(&self.commands),
            hash_component(&self.notary),
            hash_component(&self.privacy_salt),
        ];
        TxId::from_bytes(merkle_root(&leaves))
    }

    /// Union of all command signers
    pub fn required_signing_keys(&self) -> BTreeSet<PublicKey> {
        self.commands
            .iter()
            .flat_map(|c| c.signers.iter().copied())
            .collect()
    }

    /// Reference to output `index` of this transaction
    pub fn out_ref(&self, index: usize) -> Option<StateAndRef> {
        let state = self.outputs.get(index)?.clone();
        Some(StateAndRef {
            state,
            reference: StateRef::new(self.id(), index as u32),
        })
    }
}

fn hash_component<T: Serialize + ?Sized>(component: &T) -> [u8; 32] {
    // Deterministic serialization; plain data structs cannot fail to encode
    let bytes = bincode::serialize(component).expect("serialization cannot fail");
    hash_bytes(&bytes)
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> bool {
        verify_signature(message, self, public_key)
    }
}

/// A signature over a transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    /// Signing key
    pub by: PublicKey,
    /// Signature over the transaction id bytes
    pub signature: Signature,
}

impl TransactionSignature {
    /// Check the signature against a transaction id
    pub fn is_valid_for(&self, tx_id: &TxId) -> bool {
        self.signature.verify(tx_id.as_bytes(), &self.by)
    }
}

/// A transaction with the signatures gathered so far
///
/// Resolved input states travel with the transaction so every party can run
/// the contract without a store lookup. The notary checks them against the
/// ledger before committing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The transaction
    pub tx: WireTransaction,
    /// Input states, in the same order as `tx.inputs`
    pub resolved_inputs: Vec<StateAndRef>,
    /// Signatures collected so far
    pub sigs: Vec<TransactionSignature>,
}

impl SignedTransaction {
    /// Wrap an unsigned transaction
    pub fn new(tx: WireTransaction, resolved_inputs: Vec<StateAndRef>) -> Self {
        Self {
            tx,
            resolved_inputs,
            sigs: Vec::new(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxId {
        self.tx.id()
    }

    /// Attach a signature (ignored if the key already signed)
    pub fn add_signature(&mut self, sig: TransactionSignature) {
        if !self.is_signed_by(&sig.by) {
            self.sigs.push(sig);
        }
    }

    /// Whether `key` has attached a signature
    pub fn is_signed_by(&self, key: &PublicKey) -> bool {
        self.sigs.iter().any(|s| s.by == *key)
    }

    /// Required signers that have not signed yet
    pub fn missing_signatures(&self) -> BTreeSet<PublicKey> {
        self.tx
            .required_signing_keys()
            .into_iter()
            .filter(|k| !self.is_signed_by(k))
            .collect()
    }

    /// Check every attached signature and that all required signers other
    /// than `allowed_missing` have signed
    pub fn verify_signatures_except(&self, allowed_missing: &BTreeSet<PublicKey>) -> Result<()> {
        let id = self.id();

        if let Some(bad) = self.sigs.iter().find(|s| !s.is_valid_for(&id)) {
            return Err(Error::Signature(format!(
                "Invalid signature by {} on transaction {}",
                bad.by, id
            )));
        }

        let missing: Vec<String> = self
            .missing_signatures()
            .iter()
            .filter(|k| !allowed_missing.contains(k))
            .map(|k| k.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(Error::Signature(format!(
                "Transaction {} is missing signatures from: {}",
                id,
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Check all signatures are valid and every required signer has signed
    pub fn verify_required_signatures(&self) -> Result<()> {
        self.verify_signatures_except(&BTreeSet::new())
    }

    /// Pair the wire transaction with its resolved inputs
    ///
    /// Fails if the resolved inputs do not line up with the referenced ones.
    pub fn to_ledger_transaction(
        &self,
    ) -> std::result::Result<LedgerTransaction, ContractViolation> {
        let refs: Vec<StateRef> = self.resolved_inputs.iter().map(|s| s.reference).collect();
        if refs != self.tx.inputs {
            return Err(ContractViolation::new(
                ViolationKind::Shape,
                "Resolved inputs do not match transaction inputs",
            ));
        }

        Ok(LedgerTransaction {
            id: self.id(),
            inputs: self.resolved_inputs.clone(),
            outputs: self.tx.outputs.clone(),
            commands: self.tx.commands.clone(),
            notary: self.tx.notary.clone(),
        })
    }

    /// Every party that stores an input or output of this transaction
    pub fn participants(&self) -> BTreeSet<Party> {
        self.resolved_inputs
            .iter()
            .map(|s| &s.state.data)
            .chain(self.tx.outputs.iter().map(|s| &s.data))
            .flat_map(|r| r.participants())
            .cloned()
            .collect()
    }
}

/// Fully resolved transaction, the input to contract verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    /// Transaction id
    pub id: TxId,
    /// Consumed states
    pub inputs: Vec<StateAndRef>,
    /// Produced states
    pub outputs: Vec<TransactionState>,
    /// Commands
    pub commands: Vec<Command>,
    /// Notary
    pub notary: Party,
}

impl LedgerTransaction {
    /// Quota records among the inputs
    pub fn quota_inputs(&self) -> impl Iterator<Item = &QuotaRecord> {
        self.inputs
            .iter()
            .filter(|s| s.state.is_quota())
            .map(|s| &s.state.data)
    }

    /// Quota records among the outputs
    pub fn quota_outputs(&self) -> impl Iterator<Item = &QuotaRecord> {
        self.outputs.iter().filter(|s| s.is_quota()).map(|s| &s.data)
    }
}
