//! Error types for the quota ledger

use crate::contract::ContractViolation;
use crate::types::{StateRef, TxId};
use thiserror::Error;
use uuid::Uuid;

/// Result type for quota operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the finality service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FinalityError {
    /// One or more inputs were already consumed by another transaction
    #[error("Notarisation conflict on {} input(s): {}", .refs.len(), format_refs(.refs))]
    Conflict {
        /// Conflicting input references
        refs: Vec<StateRef>,
    },

    /// The notary refused the transaction
    #[error("Notary rejected transaction {tx_id}: {reason}")]
    Rejected {
        /// Transaction that was refused
        tx_id: TxId,
        /// Human-readable reason
        reason: String,
    },
}

fn format_refs(refs: &[StateRef]) -> String {
    refs.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quota ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Transaction breaks a contract rule (shape, arithmetic or authorization)
    #[error("Invalid transaction: {0}")]
    Contract(#[from] ContractViolation),

    /// Not enough unreserved quota to cover a transfer
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Amount the caller asked to move
        requested: u64,
        /// Unreserved amount held for the mill
        available: u64,
    },

    /// A counterparty declined to sign after its own validation
    #[error("Flow {flow_id} rejected by {party}: {reason}")]
    Rejected {
        /// Flow that was abandoned
        flow_id: Uuid,
        /// Declining party
        party: String,
        /// Reason given by the counterparty
        reason: String,
    },

    /// The finality service refused or conflicted
    #[error(transparent)]
    Finality(#[from] FinalityError),

    /// Signature missing or invalid
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Session could not be opened or timed out
    #[error("Session error: {0}")]
    Session(String),

    /// Party name or key is not known to the network
    #[error("Unknown party: {0}")]
    UnknownParty(String),

    /// Flow state machine was asked to make an illegal move
    #[error("Illegal flow transition from {from} to {to}")]
    IllegalTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a caller may re-attempt with a fresh input selection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Finality(FinalityError::Conflict { .. }) | Error::Session(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
